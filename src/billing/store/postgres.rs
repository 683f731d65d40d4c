use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{AssetConflict, InsertInvoiceOutcome, LedgerStore, OrderSettlement, OrderTransition};
use crate::billing::models::{
    BillingPeriod, DownloadToken, Invoice, InvoiceStatus, LedgerSnapshot, ListedAsset, Money,
    OrderStatus, Payment, RetailOrder, SchoolId,
};
use crate::billing::payments::{status_after_payment, status_after_reversal};
use crate::db;
use crate::error::{is_foreign_key_violation, is_unique_violation, AppError, AppResult};
use crate::telemetry::BillingEvent;

pub(crate) const ASSET_ALREADY_SOLD: &str = "asset_already_sold";
pub(crate) const ORDER_ALREADY_CHARGED: &str = "order_already_charged";

/// key: ledger-store-postgres -> constraints and row locks carry the invariants
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fail_for_conflict(
        &self,
        school_id: SchoolId,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<OrderSettlement> {
        let mut tx = self.pool.begin().await?;
        let order = db::orders::get(&mut tx, school_id, order_id, true)
            .await?
            .ok_or_else(|| AppError::not_found("retail_order", order_id))?;
        if order.status != OrderStatus::AwaitingPayment {
            return Ok(OrderSettlement::NotAwaiting(order));
        }
        let conflicts = db::orders::sold_elsewhere(&mut tx, school_id, order_id, &order.asset_ids())
            .await?
            .into_iter()
            .map(|(asset_id, paid_order_id)| AssetConflict {
                asset_id,
                paid_order_id,
            })
            .collect::<Vec<_>>();
        let failed = db::orders::transition(
            &mut tx,
            school_id,
            order_id,
            OrderStatus::AwaitingPayment,
            OrderStatus::Failed,
            None,
            Some(ASSET_ALREADY_SOLD),
            now,
        )
        .await?
        .ok_or_else(|| AppError::conflict("retail_order", order_id, "status changed during settlement"))?;
        tx.commit().await?;

        Ok(OrderSettlement::InventoryConflict {
            order: failed,
            conflicts,
        })
    }

    /// Second half of a settlement whose payment insert hit `payments_one_per_order_idx`.
    async fn fail_already_charged(
        &self,
        school_id: SchoolId,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<OrderSettlement> {
        let mut tx = self.pool.begin().await?;
        let failed = db::orders::transition(
            &mut tx,
            school_id,
            order_id,
            OrderStatus::AwaitingPayment,
            OrderStatus::Failed,
            None,
            Some(ORDER_ALREADY_CHARGED),
            now,
        )
        .await?;
        let settlement = match failed {
            Some(order) => OrderSettlement::AlreadyCharged { order },
            None => OrderSettlement::NotAwaiting(
                db::orders::get(&mut tx, school_id, order_id, false)
                    .await?
                    .ok_or_else(|| AppError::not_found("retail_order", order_id))?,
            ),
        };
        tx.commit().await?;
        Ok(settlement)
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn insert_invoice(&self, invoice: &Invoice) -> AppResult<InsertInvoiceOutcome> {
        match db::invoices::insert(&self.pool, invoice).await {
            Ok(created) => Ok(InsertInvoiceOutcome::Created(created)),
            Err(err) if is_unique_violation(&err) => Ok(InsertInvoiceOutcome::AlreadyExists),
            Err(err) => Err(err.into()),
        }
    }

    async fn find_invoice(
        &self,
        school_id: SchoolId,
        invoice_id: Uuid,
    ) -> AppResult<Option<Invoice>> {
        Ok(db::invoices::get(&self.pool, school_id, invoice_id).await?)
    }

    async fn list_invoices(
        &self,
        school_id: SchoolId,
        period: BillingPeriod,
    ) -> AppResult<Vec<Invoice>> {
        Ok(db::invoices::list_for_period(&self.pool, school_id, period).await?)
    }

    async fn cancel_invoice(
        &self,
        school_id: SchoolId,
        invoice_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Invoice> {
        let mut tx = self.pool.begin().await?;
        let invoice = db::invoices::get_for_update(&mut *tx, school_id, invoice_id)
            .await?
            .ok_or_else(|| AppError::not_found("invoice", invoice_id))?;
        let invoice = match invoice.status {
            InvoiceStatus::Cancelled => invoice,
            InvoiceStatus::Paid => {
                return Err(AppError::conflict(
                    "invoice",
                    invoice_id,
                    "paid invoices cannot be cancelled",
                ))
            }
            InvoiceStatus::Pending | InvoiceStatus::Overdue => {
                let has_payments =
                    db::payments::sum_for_invoice(&mut *tx, invoice_id).await? != Money::ZERO;
                if has_payments {
                    return Err(AppError::conflict(
                        "invoice",
                        invoice_id,
                        "invoice carries partial payments; reverse them first",
                    ));
                }
                db::invoices::set_status(&mut *tx, school_id, invoice_id, InvoiceStatus::Cancelled, now)
                    .await?
            }
        };
        tx.commit().await?;
        Ok(invoice)
    }

    async fn mark_overdue(
        &self,
        school_id: SchoolId,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> AppResult<u64> {
        Ok(db::invoices::mark_overdue(&self.pool, school_id, today, now).await?)
    }

    async fn record_invoice_payment(
        &self,
        payment: &Payment,
        tolerance: Money,
    ) -> AppResult<(Payment, Invoice)> {
        let invoice_id = payment
            .invoice_id
            .ok_or_else(|| AppError::validation("payment is not bound to an invoice"))?;
        let mut tx = self.pool.begin().await?;
        let invoice = db::invoices::get_for_update(&mut *tx, payment.school_id, invoice_id)
            .await?
            .ok_or_else(|| AppError::not_found("invoice", invoice_id))?;
        let paid_so_far = db::payments::sum_for_invoice(&mut *tx, invoice_id).await?;
        let next_status = status_after_payment(&invoice, paid_so_far, payment.amount, tolerance)?;

        let stored = match db::payments::insert(&mut *tx, payment).await {
            Ok(stored) => stored,
            Err(err) if is_unique_violation(&err) => {
                return Err(AppError::conflict(
                    "payment",
                    payment.id,
                    "payment is already recorded",
                ))
            }
            Err(err) => return Err(err.into()),
        };
        let invoice = if next_status != invoice.status {
            db::invoices::set_status(
                &mut *tx,
                payment.school_id,
                invoice_id,
                next_status,
                payment.created_at,
            )
            .await?
        } else {
            invoice
        };
        tx.commit().await?;

        Ok((stored, invoice))
    }

    async fn record_ad_hoc_payment(&self, payment: &Payment) -> AppResult<Payment> {
        match db::payments::insert(&self.pool, payment).await {
            Ok(stored) => Ok(stored),
            Err(err) if is_unique_violation(&err) => Err(AppError::conflict(
                "payment",
                payment.id,
                "a payment is already recorded for this charge",
            )),
            Err(err) if is_foreign_key_violation(&err) => match payment.order_id {
                Some(order_id) => Err(AppError::not_found("retail_order", order_id)),
                None => Err(err.into()),
            },
            Err(err) => Err(err.into()),
        }
    }

    async fn record_reversal(
        &self,
        reversal: &Payment,
        today: NaiveDate,
    ) -> AppResult<(Payment, Option<Invoice>)> {
        let original_id = reversal
            .reverses_payment_id
            .ok_or_else(|| AppError::validation("reversal does not reference a payment"))?;
        let mut tx = self.pool.begin().await?;
        let invoice = match reversal.invoice_id {
            Some(invoice_id) => {
                db::invoices::get_for_update(&mut *tx, reversal.school_id, invoice_id).await?
            }
            None => None,
        };

        let stored = match db::payments::insert(&mut *tx, reversal).await {
            Ok(stored) => stored,
            Err(err) if is_unique_violation(&err) => {
                return Err(AppError::conflict(
                    "payment",
                    original_id,
                    "payment has already been reversed",
                ))
            }
            Err(err) => return Err(err.into()),
        };

        let invoice = match invoice {
            Some(invoice) => {
                let net = db::payments::sum_for_invoice(&mut *tx, invoice.id).await?;
                match status_after_reversal(&invoice, net, today) {
                    Some(status) => Some(
                        db::invoices::set_status(
                            &mut *tx,
                            reversal.school_id,
                            invoice.id,
                            status,
                            reversal.created_at,
                        )
                        .await?,
                    ),
                    None => Some(invoice),
                }
            }
            None => None,
        };
        tx.commit().await?;

        Ok((stored, invoice))
    }

    async fn find_payment(
        &self,
        school_id: SchoolId,
        payment_id: Uuid,
    ) -> AppResult<Option<Payment>> {
        let payment = db::payments::get(&self.pool, school_id, payment_id).await?;
        Ok(payment)
    }

    async fn list_payments(&self, school_id: SchoolId, invoice_id: Uuid) -> AppResult<Vec<Payment>> {
        Ok(db::payments::list_for_invoice(&self.pool, school_id, invoice_id).await?)
    }

    async fn period_snapshot(
        &self,
        school_id: SchoolId,
        period: BillingPeriod,
    ) -> AppResult<LedgerSnapshot> {
        Ok(db::invoices::period_snapshot(&self.pool, school_id, period).await?)
    }

    async fn listed_assets(
        &self,
        school_id: SchoolId,
        asset_ids: &[Uuid],
    ) -> AppResult<Vec<ListedAsset>> {
        let mut conn = self.pool.acquire().await?;
        Ok(db::orders::listed_assets(&mut conn, school_id, asset_ids).await?)
    }

    async fn insert_order(&self, order: &RetailOrder) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        db::orders::insert(&mut tx, order).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_order(
        &self,
        school_id: SchoolId,
        order_id: Uuid,
    ) -> AppResult<Option<RetailOrder>> {
        let mut conn = self.pool.acquire().await?;
        Ok(db::orders::get(&mut conn, school_id, order_id, false).await?)
    }

    async fn find_order_by_intent(
        &self,
        school_id: SchoolId,
        intent_ref: &str,
    ) -> AppResult<Option<RetailOrder>> {
        let mut conn = self.pool.acquire().await?;
        Ok(db::orders::get_by_intent(&mut conn, school_id, intent_ref).await?)
    }

    async fn transition_order(
        &self,
        school_id: SchoolId,
        order_id: Uuid,
        transition: OrderTransition,
    ) -> AppResult<Option<RetailOrder>> {
        let mut conn = self.pool.acquire().await?;
        Ok(db::orders::transition(
            &mut conn,
            school_id,
            order_id,
            transition.from,
            transition.to,
            transition.payment_intent_ref.as_deref(),
            transition.failure_reason.as_deref(),
            transition.at,
        )
        .await?)
    }

    async fn settle_order(
        &self,
        school_id: SchoolId,
        order_id: Uuid,
        payment: &Payment,
        now: DateTime<Utc>,
    ) -> AppResult<OrderSettlement> {
        let mut tx = self.pool.begin().await?;
        let order = db::orders::get(&mut tx, school_id, order_id, true)
            .await?
            .ok_or_else(|| AppError::not_found("retail_order", order_id))?;
        if order.status != OrderStatus::AwaitingPayment {
            return Ok(OrderSettlement::NotAwaiting(order));
        }

        let asset_ids = order.asset_ids();
        let taken = db::orders::sold_elsewhere(&mut tx, school_id, order_id, &asset_ids).await?;
        if taken.is_empty() {
            // Blocks on any concurrent claimant until it commits or rolls back.
            let claimed = db::orders::claim_assets(&mut tx, school_id, order_id, &asset_ids, now).await?;
            if claimed.len() == asset_ids.len() {
                let stored = match db::payments::insert(&mut *tx, payment).await {
                    Ok(stored) => stored,
                    Err(err) if is_unique_violation(&err) => {
                        tx.rollback().await?;
                        return self.fail_already_charged(school_id, order_id, now).await;
                    }
                    Err(err) => return Err(err.into()),
                };
                let paid = db::orders::transition(
                    &mut tx,
                    school_id,
                    order_id,
                    OrderStatus::AwaitingPayment,
                    OrderStatus::Paid,
                    None,
                    None,
                    now,
                )
                .await?
                .ok_or_else(|| {
                    AppError::conflict("retail_order", order_id, "status changed during settlement")
                })?;
                tx.commit().await?;
                return Ok(OrderSettlement::Paid {
                    order: paid,
                    payment: stored,
                });
            }
        }

        tx.rollback().await?;
        self.fail_for_conflict(school_id, order_id, now).await
    }

    async fn awaiting_orders(&self, school_id: SchoolId, limit: i64) -> AppResult<Vec<RetailOrder>> {
        let mut conn = self.pool.acquire().await?;
        Ok(db::orders::awaiting_payment(&mut conn, school_id, limit).await?)
    }

    async fn schools_with_open_work(&self) -> AppResult<Vec<SchoolId>> {
        Ok(db::invoices::schools(&self.pool).await?)
    }

    async fn replace_download_token(&self, token: &DownloadToken) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        db::tokens::revoke_live(&mut *tx, token.school_id, token.order_id, token.created_at).await?;
        db::tokens::insert(&mut *tx, token).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn consume_download_token(
        &self,
        school_id: SchoolId,
        secret_hash: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Uuid> {
        if let Some(order_id) = db::tokens::consume(&self.pool, school_id, secret_hash, now).await? {
            return Ok(order_id);
        }
        if db::tokens::exists(&self.pool, school_id, secret_hash).await? {
            Err(AppError::expired("download_token", token_label(secret_hash)))
        } else {
            Err(AppError::not_found("download_token", token_label(secret_hash)))
        }
    }

    async fn record_billing_event(&self, event: &BillingEvent) -> AppResult<bool> {
        Ok(db::events::insert(&self.pool, event).await?)
    }

    async fn list_billing_events(&self, school_id: SchoolId) -> AppResult<Vec<BillingEvent>> {
        Ok(db::events::list_open(&self.pool, school_id).await?)
    }
}

/// Short digest prefix used to identify a token in errors and logs without echoing it.
pub(crate) fn token_label(secret_hash: &str) -> String {
    secret_hash.chars().take(12).collect()
}
