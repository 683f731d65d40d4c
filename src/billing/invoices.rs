use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use futures_util::{stream, StreamExt};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::enrollment::EnrollmentDirectory;
use super::models::{BillingPeriod, Invoice, InvoiceStatus, Money, Payment, SchoolId, StudentRef};
use super::store::{with_store_retry, InsertInvoiceOutcome, LedgerStore};
use crate::config::BillingConfig;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GenerationSummary {
    pub created_count: u32,
    pub skipped_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvoiceDetail {
    pub invoice: Invoice,
    pub payments: Vec<Payment>,
    pub paid_amount: Money,
    pub outstanding_amount: Money,
}

enum StudentOutcome {
    Created(Invoice),
    Skipped,
}

/// `n`-th Monday-to-Friday day of the period, clamped to the last business day of the month.
pub fn nth_business_day(period: BillingPeriod, n: u32) -> NaiveDate {
    let mut last_business_day = period.start();
    let mut seen = 0;
    let mut day = period.start();
    while day < period.end() {
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            seen += 1;
            last_business_day = day;
            if seen >= n.max(1) {
                return day;
            }
        }
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    last_business_day
}

/// key: invoice-generator -> one invoice per enrolled student per period
#[derive(Clone)]
pub struct InvoiceGenerator {
    store: Arc<dyn LedgerStore>,
    enrollment: Arc<dyn EnrollmentDirectory>,
    config: BillingConfig,
}

impl InvoiceGenerator {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        enrollment: Arc<dyn EnrollmentDirectory>,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            enrollment,
            config,
        }
    }

    /// Safe to re-run and to run concurrently: the store's uniqueness on
    /// (school, student, month, year) turns every repeat into a skip.
    pub async fn generate_invoices(
        &self,
        school_id: SchoolId,
        period: BillingPeriod,
        now: DateTime<Utc>,
    ) -> AppResult<GenerationSummary> {
        period.validate_for_generation(now.date_naive())?;
        let students = self
            .enrollment
            .list_actively_enrolled_students(school_id, period)
            .await?;
        let due_date = nth_business_day(period, self.config.due_business_day);

        let outcomes = stream::iter(students)
            .map(|student| self.invoice_student(school_id, period, due_date, student, now))
            .buffer_unordered(self.config.worker_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut summary = GenerationSummary::default();
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(StudentOutcome::Created(_)) => summary.created_count += 1,
                Ok(StudentOutcome::Skipped) => summary.skipped_count += 1,
                Err(err) => {
                    error!(%school_id, %period, error = %err, "invoice generation failed for a student");
                    first_error.get_or_insert(err);
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        info!(
            %school_id,
            %period,
            %due_date,
            created = summary.created_count,
            skipped = summary.skipped_count,
            "invoice generation finished"
        );
        Ok(summary)
    }

    async fn invoice_student(
        &self,
        school_id: SchoolId,
        period: BillingPeriod,
        due_date: NaiveDate,
        student: StudentRef,
        now: DateTime<Utc>,
    ) -> AppResult<StudentOutcome> {
        let amount = match self.enrollment.tuition_plan(school_id, student.id).await? {
            Some(amount) if amount.is_positive() => amount,
            _ => {
                warn!(%school_id, student_id = %student.id, "student has no billable tuition plan");
                return Ok(StudentOutcome::Skipped);
            }
        };

        let invoice = Invoice {
            id: Uuid::new_v4(),
            school_id,
            student_id: student.id,
            amount,
            due_date,
            billing_month: period.month as i32,
            billing_year: period.year,
            status: InvoiceStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        let store = &self.store;
        let invoice = &invoice;
        let outcome = with_store_retry(&self.config, "insert_invoice", move || {
            store.insert_invoice(invoice)
        })
        .await?;

        Ok(match outcome {
            InsertInvoiceOutcome::Created(invoice) => StudentOutcome::Created(invoice),
            InsertInvoiceOutcome::AlreadyExists => StudentOutcome::Skipped,
        })
    }

    /// Flips unpaid invoices whose due date has passed to `overdue`.
    pub async fn sweep_overdue(&self, school_id: SchoolId, now: DateTime<Utc>) -> AppResult<u64> {
        let store = &self.store;
        let today = now.date_naive();
        let flipped = with_store_retry(&self.config, "mark_overdue", move || {
            store.mark_overdue(school_id, today, now)
        })
        .await?;
        if flipped > 0 {
            info!(%school_id, %today, flipped, "invoices marked overdue");
        }
        Ok(flipped)
    }

    pub async fn cancel_invoice(
        &self,
        school_id: SchoolId,
        invoice_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Invoice> {
        let store = &self.store;
        let invoice = with_store_retry(&self.config, "cancel_invoice", move || {
            store.cancel_invoice(school_id, invoice_id, now)
        })
        .await?;
        info!(%school_id, %invoice_id, "invoice cancelled");
        Ok(invoice)
    }

    pub async fn list_invoices(
        &self,
        school_id: SchoolId,
        period: BillingPeriod,
    ) -> AppResult<Vec<Invoice>> {
        self.store.list_invoices(school_id, period).await
    }

    pub async fn invoice_detail(&self, school_id: SchoolId, invoice_id: Uuid) -> AppResult<InvoiceDetail> {
        let invoice = self
            .store
            .find_invoice(school_id, invoice_id)
            .await?
            .ok_or_else(|| AppError::not_found("invoice", invoice_id))?;
        let payments = self.store.list_payments(school_id, invoice_id).await?;
        let paid_amount: Money = payments.iter().map(|payment| payment.amount).sum();
        let outstanding_amount = match invoice.status {
            InvoiceStatus::Paid | InvoiceStatus::Cancelled => Money::ZERO,
            InvoiceStatus::Pending | InvoiceStatus::Overdue => invoice.amount - paid_amount,
        };

        Ok(InvoiceDetail {
            invoice,
            payments,
            paid_amount,
            outstanding_amount,
        })
    }
}
