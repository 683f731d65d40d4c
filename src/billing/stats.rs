use std::sync::Arc;

use tracing::debug;

use super::enrollment::EnrollmentDirectory;
use super::models::{BillingPeriod, FinancialStats, Money, SchoolId};
use super::store::LedgerStore;
use crate::error::AppResult;

/// `numerator / denominator`; zero when there is nothing to divide by.
pub fn rate(numerator: i64, denominator: i64) -> f64 {
    if denominator <= 0 {
        return 0.0;
    }
    numerator as f64 / denominator as f64
}

/// key: delinquency-aggregator -> read-only dashboard rollups
#[derive(Clone)]
pub struct DelinquencyAggregator {
    store: Arc<dyn LedgerStore>,
    enrollment: Arc<dyn EnrollmentDirectory>,
}

impl DelinquencyAggregator {
    pub fn new(store: Arc<dyn LedgerStore>, enrollment: Arc<dyn EnrollmentDirectory>) -> Self {
        Self { store, enrollment }
    }

    pub async fn compute_financial_stats(
        &self,
        school_id: SchoolId,
        period: BillingPeriod,
    ) -> AppResult<FinancialStats> {
        let snapshot = self.store.period_snapshot(school_id, period).await?;
        let active_students = self
            .enrollment
            .list_actively_enrolled_students(school_id, period)
            .await?
            .len() as i64;

        let pending_amount = snapshot.outstanding_amount.max(Money::ZERO);
        let paid_amount = snapshot.paid_amount;
        let collectible = paid_amount.minor().saturating_add(pending_amount.minor());

        let stats = FinancialStats {
            period,
            monthly_revenue: snapshot.revenue,
            pending_count: snapshot.pending_count,
            pending_amount,
            overdue_count: snapshot.overdue_count,
            overdue_amount: snapshot.overdue_amount,
            paid_amount,
            delinquent_students: snapshot.delinquent_students,
            delinquency_rate: rate(snapshot.overdue_count, active_students),
            collection_rate: rate(paid_amount.minor(), collectible),
            active_students,
        };
        debug!(%school_id, %period, ?stats, "financial stats computed");
        Ok(stats)
    }
}
