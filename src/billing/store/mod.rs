//! Ledger store seam. Every mutation of invoices, payments, orders and tokens goes through
//! [`LedgerStore`]; the cross-entity invariants live in its implementations, not in callers.

mod memory;
mod postgres;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::time::{sleep, timeout};
use tracing::warn;
use uuid::Uuid;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

use super::models::{
    BillingPeriod, DownloadToken, Invoice, LedgerSnapshot, ListedAsset, Money, OrderStatus,
    Payment, RetailOrder, SchoolId,
};
use crate::config::BillingConfig;
use crate::error::{AppError, AppResult};
use crate::telemetry::BillingEvent;

#[derive(Debug, Clone)]
pub enum InsertInvoiceOutcome {
    Created(Invoice),
    /// The (student, month, year) slot is taken, possibly by a cancelled invoice.
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetConflict {
    pub asset_id: Uuid,
    pub paid_order_id: Uuid,
}

#[derive(Debug, Clone)]
pub enum OrderSettlement {
    Paid {
        order: RetailOrder,
        payment: Payment,
    },
    /// Another paid order already owns some of the assets; the order was marked `failed`.
    InventoryConflict {
        order: RetailOrder,
        conflicts: Vec<AssetConflict>,
    },
    /// A charge for the order was already on the ledger; the order was marked `failed`
    /// without recording a second payment.
    AlreadyCharged { order: RetailOrder },
    /// The order left `awaiting_payment` before this settlement got the row.
    NotAwaiting(RetailOrder),
}

/// Status compare-and-set for a retail order.
#[derive(Debug, Clone)]
pub struct OrderTransition {
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub payment_intent_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn insert_invoice(&self, invoice: &Invoice) -> AppResult<InsertInvoiceOutcome>;
    async fn find_invoice(&self, school_id: SchoolId, invoice_id: Uuid)
        -> AppResult<Option<Invoice>>;
    async fn list_invoices(
        &self,
        school_id: SchoolId,
        period: BillingPeriod,
    ) -> AppResult<Vec<Invoice>>;
    async fn cancel_invoice(
        &self,
        school_id: SchoolId,
        invoice_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Invoice>;
    async fn mark_overdue(
        &self,
        school_id: SchoolId,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> AppResult<u64>;

    /// Inserts the payment and recomputes the invoice status in one atomic unit.
    async fn record_invoice_payment(
        &self,
        payment: &Payment,
        tolerance: Money,
    ) -> AppResult<(Payment, Invoice)>;
    async fn record_ad_hoc_payment(&self, payment: &Payment) -> AppResult<Payment>;
    /// Inserts an offsetting payment and reopens the invoice if it no longer covers its amount.
    async fn record_reversal(
        &self,
        reversal: &Payment,
        today: NaiveDate,
    ) -> AppResult<(Payment, Option<Invoice>)>;
    async fn find_payment(&self, school_id: SchoolId, payment_id: Uuid)
        -> AppResult<Option<Payment>>;
    async fn list_payments(&self, school_id: SchoolId, invoice_id: Uuid) -> AppResult<Vec<Payment>>;

    async fn period_snapshot(
        &self,
        school_id: SchoolId,
        period: BillingPeriod,
    ) -> AppResult<LedgerSnapshot>;

    async fn listed_assets(
        &self,
        school_id: SchoolId,
        asset_ids: &[Uuid],
    ) -> AppResult<Vec<ListedAsset>>;
    async fn insert_order(&self, order: &RetailOrder) -> AppResult<()>;
    async fn find_order(&self, school_id: SchoolId, order_id: Uuid)
        -> AppResult<Option<RetailOrder>>;
    async fn find_order_by_intent(
        &self,
        school_id: SchoolId,
        intent_ref: &str,
    ) -> AppResult<Option<RetailOrder>>;
    /// Returns `None` when the order was not in `transition.from`.
    async fn transition_order(
        &self,
        school_id: SchoolId,
        order_id: Uuid,
        transition: OrderTransition,
    ) -> AppResult<Option<RetailOrder>>;
    /// Claims the order's assets, writes its payment and marks it paid, or marks it failed on an
    /// inventory conflict. Never leaves a partial state behind.
    async fn settle_order(
        &self,
        school_id: SchoolId,
        order_id: Uuid,
        payment: &Payment,
        now: DateTime<Utc>,
    ) -> AppResult<OrderSettlement>;
    async fn awaiting_orders(&self, school_id: SchoolId, limit: i64) -> AppResult<Vec<RetailOrder>>;
    /// Schools with pending invoices or orders awaiting payment; drives the scheduler.
    async fn schools_with_open_work(&self) -> AppResult<Vec<SchoolId>>;

    /// Revokes any live token of the order and stores the new one atomically.
    async fn replace_download_token(&self, token: &DownloadToken) -> AppResult<()>;
    async fn consume_download_token(
        &self,
        school_id: SchoolId,
        secret_hash: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Uuid>;

    async fn record_billing_event(&self, event: &BillingEvent) -> AppResult<bool>;
    async fn list_billing_events(&self, school_id: SchoolId) -> AppResult<Vec<BillingEvent>>;
}

/// key: ledger-retry -> bounded optimistic retry for store calls
///
/// Each attempt is bounded by `store_timeout`; transient failures (serialization conflicts,
/// deadlocks, timeouts) are retried up to `store_retry_attempts`, everything else is returned
/// as-is.
pub async fn with_store_retry<T, F, Fut>(
    config: &BillingConfig,
    operation: &'static str,
    mut op: F,
) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let attempts = config.store_retry_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match timeout(config.store_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout { operation }),
        };
        match result {
            Err(err) if err.is_transient() && attempt < attempts => {
                warn!(
                    operation,
                    attempt,
                    retry_limit = attempts,
                    error = %err,
                    "transient ledger conflict, retrying"
                );
                sleep(Duration::from_millis(25 * attempt as u64)).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let config = BillingConfig::default();
        let value = with_store_retry(&config, "test", || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    Err(AppError::Db(sqlx::Error::PoolTimedOut))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn domain_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let config = BillingConfig::default();
        let err = with_store_retry(&config, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(AppError::not_found("invoice", "x")) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_stop_at_the_configured_limit() {
        let calls = AtomicU32::new(0);
        let config = BillingConfig {
            store_retry_attempts: 2,
            ..BillingConfig::default()
        };
        let err = with_store_retry(&config, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(AppError::Timeout { operation: "test" }) }
        })
        .await
        .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
