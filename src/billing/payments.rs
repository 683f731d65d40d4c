use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::models::{Invoice, InvoiceStatus, Money, Payment, PaymentMethod, RetailOrder, SchoolId};
use super::store::{with_store_retry, LedgerStore, OrderSettlement};
use crate::config::BillingConfig;
use crate::error::{AppError, AppResult};

/// What a payment is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentTarget {
    Invoice(Uuid),
    /// A charge outside the tuition schedule, optionally tied to a retail order.
    AdHoc { order_id: Option<Uuid> },
}

#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub target: PaymentTarget,
    pub amount: Money,
    pub method: PaymentMethod,
    pub paid_at: DateTime<Utc>,
    pub recorded_by: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordedPayment {
    pub payment: Payment,
    /// The invoice as it stands after the payment, for invoice-bound payments.
    pub invoice: Option<Invoice>,
}

/// Status an invoice moves to once `amount` is added to `paid_so_far`.
///
/// Rejects cancelled and settled invoices and any payment that would overshoot
/// `invoice.amount + tolerance`.
pub(crate) fn status_after_payment(
    invoice: &Invoice,
    paid_so_far: Money,
    amount: Money,
    tolerance: Money,
) -> AppResult<InvoiceStatus> {
    match invoice.status {
        InvoiceStatus::Cancelled => return Err(AppError::not_found("invoice", invoice.id)),
        InvoiceStatus::Paid => {
            return Err(AppError::AlreadySettled {
                invoice_id: invoice.id,
            })
        }
        InvoiceStatus::Pending | InvoiceStatus::Overdue => {}
    }

    let overflow = || AppError::Validation {
        message: "payment amount overflows the ledger".to_string(),
        offending: vec!["amount".to_string()],
    };
    let new_total = paid_so_far.checked_add(amount).ok_or_else(overflow)?;
    let ceiling = invoice.amount.checked_add(tolerance).ok_or_else(overflow)?;
    if new_total > ceiling {
        return Err(AppError::Validation {
            message: format!(
                "payment of {amount} would bring invoice {} to {new_total}, above its amount {} plus tolerance {tolerance}",
                invoice.id, invoice.amount
            ),
            offending: vec!["amount".to_string()],
        });
    }

    if new_total >= invoice.amount {
        Ok(InvoiceStatus::Paid)
    } else {
        Ok(invoice.status)
    }
}

/// New status for a paid invoice whose net payments dropped to `net_paid`, if it changes.
pub(crate) fn status_after_reversal(
    invoice: &Invoice,
    net_paid: Money,
    today: NaiveDate,
) -> Option<InvoiceStatus> {
    (invoice.status == InvoiceStatus::Paid && net_paid < invoice.amount)
        .then(|| InvoiceStatus::unpaid_on(invoice.due_date, today))
}

/// key: payment-recorder -> the only writer of payments
#[derive(Clone)]
pub struct PaymentRecorder {
    store: Arc<dyn LedgerStore>,
    config: BillingConfig,
}

impl PaymentRecorder {
    pub fn new(store: Arc<dyn LedgerStore>, config: BillingConfig) -> Self {
        Self { store, config }
    }

    pub async fn register_payment(
        &self,
        school_id: SchoolId,
        request: PaymentRequest,
        now: DateTime<Utc>,
    ) -> AppResult<RecordedPayment> {
        if !request.amount.is_positive() {
            return Err(AppError::Validation {
                message: format!("payment amount must be positive, got {}", request.amount),
                offending: vec!["amount".to_string()],
            });
        }
        if request.recorded_by.trim().is_empty() {
            return Err(AppError::Validation {
                message: "payments must name who recorded them".to_string(),
                offending: vec!["recorded_by".to_string()],
            });
        }

        let (invoice_id, order_id) = match request.target {
            PaymentTarget::Invoice(invoice_id) => (Some(invoice_id), None),
            PaymentTarget::AdHoc { order_id } => (None, order_id),
        };
        if let Some(order_id) = order_id {
            // Retail orders are charged only by settlement, which also claims their assets.
            let order = self
                .store
                .find_order(school_id, order_id)
                .await?
                .ok_or_else(|| AppError::not_found("retail_order", order_id))?;
            return Err(AppError::conflict(
                "retail_order",
                order_id,
                format!(
                    "order is {}; retail orders are charged through gateway settlement",
                    order.status.as_str()
                ),
            ));
        }
        // The id is fixed before the first attempt so a retried insert cannot double count.
        let payment = Payment {
            id: Uuid::new_v4(),
            school_id,
            invoice_id,
            order_id,
            amount: request.amount,
            method: request.method,
            paid_at: request.paid_at,
            recorded_by: request.recorded_by,
            reverses_payment_id: None,
            created_at: now,
        };

        let store = &self.store;
        let payment = &payment;
        let recorded = match invoice_id {
            Some(invoice_id) => {
                let tolerance = self.config.overpayment_tolerance;
                let (payment, invoice) = with_store_retry(&self.config, "record_invoice_payment", move || {
                    store.record_invoice_payment(payment, tolerance)
                })
                .await?;
                info!(
                    %school_id,
                    %invoice_id,
                    payment_id = %payment.id,
                    amount = %payment.amount,
                    status = invoice.status.as_str(),
                    "payment applied to invoice"
                );
                RecordedPayment {
                    payment,
                    invoice: Some(invoice),
                }
            }
            None => {
                let payment = with_store_retry(&self.config, "record_ad_hoc_payment", move || {
                    store.record_ad_hoc_payment(payment)
                })
                .await?;
                info!(
                    %school_id,
                    payment_id = %payment.id,
                    amount = %payment.amount,
                    "ad-hoc payment recorded"
                );
                RecordedPayment {
                    payment,
                    invoice: None,
                }
            }
        };

        Ok(recorded)
    }

    /// Writes an offsetting entry for `payment_id`; the original row is never edited.
    pub async fn reverse_payment(
        &self,
        school_id: SchoolId,
        payment_id: Uuid,
        recorded_by: &str,
        now: DateTime<Utc>,
    ) -> AppResult<RecordedPayment> {
        let original = self
            .store
            .find_payment(school_id, payment_id)
            .await?
            .ok_or_else(|| AppError::not_found("payment", payment_id))?;
        if original.reverses_payment_id.is_some() {
            return Err(AppError::conflict(
                "payment",
                payment_id,
                "reversal entries cannot themselves be reversed",
            ));
        }
        if original.order_id.is_some() {
            warn!(
                %school_id,
                %payment_id,
                "reversing a retail order payment; the order stays paid"
            );
        }

        let reversal = Payment {
            id: Uuid::new_v4(),
            school_id,
            invoice_id: original.invoice_id,
            order_id: original.order_id,
            amount: original.amount.negate(),
            method: original.method,
            paid_at: now,
            recorded_by: recorded_by.to_string(),
            reverses_payment_id: Some(original.id),
            created_at: now,
        };

        let store = &self.store;
        let reversal = &reversal;
        let today = now.date_naive();
        let (payment, invoice) = with_store_retry(&self.config, "record_reversal", move || {
            store.record_reversal(reversal, today)
        })
        .await?;
        info!(
            %school_id,
            original_payment_id = %payment_id,
            reversal_id = %payment.id,
            invoice_status = invoice.as_ref().map(|invoice| invoice.status.as_str()),
            "payment reversed"
        );

        Ok(RecordedPayment { payment, invoice })
    }

    /// Logs the gateway settlement of a retail order as an ad-hoc charge and marks it paid,
    /// unless another paid order already owns one of its assets.
    pub async fn settle_order_payment(
        &self,
        order: &RetailOrder,
        now: DateTime<Utc>,
    ) -> AppResult<OrderSettlement> {
        let payment = Payment {
            id: Uuid::new_v4(),
            school_id: order.school_id,
            invoice_id: None,
            order_id: Some(order.id),
            amount: order.total_amount,
            method: PaymentMethod::InstantTransfer,
            paid_at: now,
            recorded_by: match &order.payment_intent_ref {
                Some(intent_ref) => format!("gateway:{intent_ref}"),
                None => "gateway".to_string(),
            },
            reverses_payment_id: None,
            created_at: now,
        };

        let store = &self.store;
        let payment = &payment;
        let (school_id, order_id) = (order.school_id, order.id);
        with_store_retry(&self.config, "settle_order", move || {
            store.settle_order(school_id, order_id, payment, now)
        })
        .await
    }

    pub async fn list_payments(&self, school_id: SchoolId, invoice_id: Uuid) -> AppResult<Vec<Payment>> {
        self.store.list_payments(school_id, invoice_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoice(amount: i64, status: InvoiceStatus) -> Invoice {
        let now = Utc::now();
        Invoice {
            id: Uuid::new_v4(),
            school_id: SchoolId(Uuid::new_v4()),
            student_id: Uuid::new_v4(),
            amount: Money::from_minor(amount),
            due_date: NaiveDate::from_ymd_opt(2025, 3, 7).unwrap(),
            billing_month: 3,
            billing_year: 2025,
            status,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn full_payment_settles_invoice() {
        let invoice = invoice(50_000, InvoiceStatus::Pending);
        let status =
            status_after_payment(&invoice, Money::ZERO, Money::from_minor(50_000), Money::ZERO).unwrap();
        assert_eq!(status, InvoiceStatus::Paid);
    }

    #[test]
    fn partial_payment_keeps_overdue_status() {
        let invoice = invoice(50_000, InvoiceStatus::Overdue);
        let status =
            status_after_payment(&invoice, Money::ZERO, Money::from_minor(20_000), Money::ZERO).unwrap();
        assert_eq!(status, InvoiceStatus::Overdue);
    }

    #[test]
    fn overpayment_beyond_tolerance_is_rejected() {
        let invoice = invoice(50_000, InvoiceStatus::Pending);
        let err = status_after_payment(
            &invoice,
            Money::from_minor(40_000),
            Money::from_minor(10_050),
            Money::from_minor(49),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "validation_error");

        let within = status_after_payment(
            &invoice,
            Money::from_minor(40_000),
            Money::from_minor(10_049),
            Money::from_minor(49),
        )
        .unwrap();
        assert_eq!(within, InvoiceStatus::Paid);
    }

    #[test]
    fn paid_and_cancelled_invoices_refuse_payments() {
        let paid = invoice(100, InvoiceStatus::Paid);
        assert!(matches!(
            status_after_payment(&paid, Money::from_minor(100), Money::from_minor(1), Money::ZERO),
            Err(AppError::AlreadySettled { .. })
        ));

        let cancelled = invoice(100, InvoiceStatus::Cancelled);
        assert!(matches!(
            status_after_payment(&cancelled, Money::ZERO, Money::from_minor(1), Money::ZERO),
            Err(AppError::NotFound { .. })
        ));
    }

    #[test]
    fn reversal_reopens_by_due_date() {
        let paid = invoice(100, InvoiceStatus::Paid);
        let before_due = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let after_due = NaiveDate::from_ymd_opt(2025, 3, 20).unwrap();
        assert_eq!(
            status_after_reversal(&paid, Money::ZERO, before_due),
            Some(InvoiceStatus::Pending)
        );
        assert_eq!(
            status_after_reversal(&paid, Money::ZERO, after_due),
            Some(InvoiceStatus::Overdue)
        );
        assert_eq!(status_after_reversal(&paid, Money::from_minor(100), after_due), None);
    }
}
