use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::postgres::{token_label, ASSET_ALREADY_SOLD, ORDER_ALREADY_CHARGED};
use super::{AssetConflict, InsertInvoiceOutcome, LedgerStore, OrderSettlement, OrderTransition};
use crate::billing::models::{
    BillingPeriod, DownloadToken, Invoice, InvoiceStatus, LedgerSnapshot, ListedAsset, Money,
    OrderStatus, Payment, RetailOrder, SchoolId,
};
use crate::billing::payments::{status_after_payment, status_after_reversal};
use crate::error::{AppError, AppResult};
use crate::telemetry::BillingEvent;

type InvoiceSlot = (SchoolId, Uuid, i32, i32);

#[derive(Default)]
struct LedgerState {
    invoices: HashMap<Uuid, Invoice>,
    invoice_slots: HashSet<InvoiceSlot>,
    payments: Vec<Payment>,
    assets: HashMap<(SchoolId, Uuid), ListedAsset>,
    orders: HashMap<Uuid, RetailOrder>,
    sold_assets: HashMap<(SchoolId, Uuid), Uuid>,
    tokens: Vec<DownloadToken>,
    events: Vec<BillingEvent>,
}

impl LedgerState {
    fn invoice(&self, school_id: SchoolId, invoice_id: Uuid) -> Option<&Invoice> {
        self.invoices
            .get(&invoice_id)
            .filter(|invoice| invoice.school_id == school_id)
    }

    fn order(&self, school_id: SchoolId, order_id: Uuid) -> Option<&RetailOrder> {
        self.orders
            .get(&order_id)
            .filter(|order| order.school_id == school_id)
    }

    fn net_paid(&self, invoice_id: Uuid) -> Money {
        self.payments
            .iter()
            .filter(|payment| payment.invoice_id == Some(invoice_id))
            .map(|payment| payment.amount)
            .sum()
    }

    fn set_invoice_status(
        &mut self,
        invoice_id: Uuid,
        status: InvoiceStatus,
        now: DateTime<Utc>,
    ) -> Option<Invoice> {
        let invoice = self.invoices.get_mut(&invoice_id)?;
        invoice.status = status;
        invoice.updated_at = now;
        Some(invoice.clone())
    }

    fn order_charged(&self, order_id: Uuid) -> bool {
        self.payments.iter().any(|payment| {
            payment.order_id == Some(order_id) && payment.reverses_payment_id.is_none()
        })
    }

    fn conflicts_for(&self, order: &RetailOrder) -> Vec<AssetConflict> {
        order
            .asset_ids()
            .into_iter()
            .filter_map(|asset_id| {
                self.sold_assets
                    .get(&(order.school_id, asset_id))
                    .filter(|owner| **owner != order.id)
                    .map(|owner| AssetConflict {
                        asset_id,
                        paid_order_id: *owner,
                    })
            })
            .collect()
    }
}

/// key: ledger-store-memory -> single-process store for tests and local runs
///
/// Every operation takes the state lock for its whole duration, which gives the same atomicity
/// the Postgres store gets from transactions and row locks.
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: RwLock<LedgerState>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts an asset up for sale.
    pub async fn list_asset(&self, school_id: SchoolId, asset: ListedAsset) {
        let mut state = self.state.write().await;
        state.assets.insert((school_id, asset.asset_id), asset);
    }

    pub async fn set_album_active(&self, school_id: SchoolId, album_id: Uuid, active: bool) {
        let mut state = self.state.write().await;
        for ((school, _), asset) in state.assets.iter_mut() {
            if *school == school_id && asset.album_id == album_id {
                asset.sale_active = active;
            }
        }
    }

    /// Paid order owning the asset, if any.
    pub async fn asset_owner(&self, school_id: SchoolId, asset_id: Uuid) -> Option<Uuid> {
        self.state
            .read()
            .await
            .sold_assets
            .get(&(school_id, asset_id))
            .copied()
    }

    pub async fn payments_for_order(&self, school_id: SchoolId, order_id: Uuid) -> Vec<Payment> {
        self.state
            .read()
            .await
            .payments
            .iter()
            .filter(|payment| payment.school_id == school_id && payment.order_id == Some(order_id))
            .cloned()
            .collect()
    }

    pub async fn tokens_for_order(&self, school_id: SchoolId, order_id: Uuid) -> Vec<DownloadToken> {
        self.state
            .read()
            .await
            .tokens
            .iter()
            .filter(|token| token.school_id == school_id && token.order_id == order_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert_invoice(&self, invoice: &Invoice) -> AppResult<InsertInvoiceOutcome> {
        let mut state = self.state.write().await;
        let slot = (
            invoice.school_id,
            invoice.student_id,
            invoice.billing_month,
            invoice.billing_year,
        );
        if !state.invoice_slots.insert(slot) {
            return Ok(InsertInvoiceOutcome::AlreadyExists);
        }
        state.invoices.insert(invoice.id, invoice.clone());
        Ok(InsertInvoiceOutcome::Created(invoice.clone()))
    }

    async fn find_invoice(
        &self,
        school_id: SchoolId,
        invoice_id: Uuid,
    ) -> AppResult<Option<Invoice>> {
        Ok(self.state.read().await.invoice(school_id, invoice_id).cloned())
    }

    async fn list_invoices(
        &self,
        school_id: SchoolId,
        period: BillingPeriod,
    ) -> AppResult<Vec<Invoice>> {
        let state = self.state.read().await;
        let mut invoices = state
            .invoices
            .values()
            .filter(|invoice| invoice.school_id == school_id && invoice.period() == period)
            .cloned()
            .collect::<Vec<_>>();
        invoices.sort_by(|a, b| a.due_date.cmp(&b.due_date).then(a.student_id.cmp(&b.student_id)));
        Ok(invoices)
    }

    async fn cancel_invoice(
        &self,
        school_id: SchoolId,
        invoice_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Invoice> {
        let mut state = self.state.write().await;
        let invoice = state
            .invoice(school_id, invoice_id)
            .cloned()
            .ok_or_else(|| AppError::not_found("invoice", invoice_id))?;
        match invoice.status {
            InvoiceStatus::Cancelled => Ok(invoice),
            InvoiceStatus::Paid => Err(AppError::conflict(
                "invoice",
                invoice_id,
                "paid invoices cannot be cancelled",
            )),
            InvoiceStatus::Pending | InvoiceStatus::Overdue => {
                if state.net_paid(invoice_id) != Money::ZERO {
                    return Err(AppError::conflict(
                        "invoice",
                        invoice_id,
                        "invoice carries partial payments; reverse them first",
                    ));
                }
                state
                    .set_invoice_status(invoice_id, InvoiceStatus::Cancelled, now)
                    .ok_or_else(|| AppError::not_found("invoice", invoice_id))
            }
        }
    }

    async fn mark_overdue(
        &self,
        school_id: SchoolId,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> AppResult<u64> {
        let mut state = self.state.write().await;
        let mut flipped = 0;
        for invoice in state.invoices.values_mut() {
            if invoice.school_id == school_id
                && invoice.status == InvoiceStatus::Pending
                && invoice.due_date < today
            {
                invoice.status = InvoiceStatus::Overdue;
                invoice.updated_at = now;
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    async fn record_invoice_payment(
        &self,
        payment: &Payment,
        tolerance: Money,
    ) -> AppResult<(Payment, Invoice)> {
        let invoice_id = payment
            .invoice_id
            .ok_or_else(|| AppError::validation("payment is not bound to an invoice"))?;
        let mut state = self.state.write().await;
        if state.payments.iter().any(|existing| existing.id == payment.id) {
            return Err(AppError::conflict("payment", payment.id, "payment is already recorded"));
        }
        let invoice = state
            .invoice(payment.school_id, invoice_id)
            .cloned()
            .ok_or_else(|| AppError::not_found("invoice", invoice_id))?;
        let paid_so_far = state.net_paid(invoice_id);
        let next_status = status_after_payment(&invoice, paid_so_far, payment.amount, tolerance)?;

        state.payments.push(payment.clone());
        let invoice = if next_status != invoice.status {
            state
                .set_invoice_status(invoice_id, next_status, payment.created_at)
                .unwrap_or(invoice)
        } else {
            invoice
        };
        Ok((payment.clone(), invoice))
    }

    async fn record_ad_hoc_payment(&self, payment: &Payment) -> AppResult<Payment> {
        let mut state = self.state.write().await;
        if let Some(order_id) = payment.order_id {
            if state.order(payment.school_id, order_id).is_none() {
                return Err(AppError::not_found("retail_order", order_id));
            }
            if state.order_charged(order_id) {
                return Err(AppError::conflict(
                    "payment",
                    payment.id,
                    "a payment is already recorded for this charge",
                ));
            }
        }
        state.payments.push(payment.clone());
        Ok(payment.clone())
    }

    async fn record_reversal(
        &self,
        reversal: &Payment,
        today: NaiveDate,
    ) -> AppResult<(Payment, Option<Invoice>)> {
        let original_id = reversal
            .reverses_payment_id
            .ok_or_else(|| AppError::validation("reversal does not reference a payment"))?;
        let mut state = self.state.write().await;
        if state
            .payments
            .iter()
            .any(|payment| payment.reverses_payment_id == Some(original_id))
        {
            return Err(AppError::conflict(
                "payment",
                original_id,
                "payment has already been reversed",
            ));
        }
        state.payments.push(reversal.clone());

        let invoice = match reversal.invoice_id {
            Some(invoice_id) => match state.invoice(reversal.school_id, invoice_id).cloned() {
                Some(invoice) => {
                    let net = state.net_paid(invoice_id);
                    match status_after_reversal(&invoice, net, today) {
                        Some(status) => state.set_invoice_status(invoice_id, status, reversal.created_at),
                        None => Some(invoice),
                    }
                }
                None => None,
            },
            None => None,
        };
        Ok((reversal.clone(), invoice))
    }

    async fn find_payment(
        &self,
        school_id: SchoolId,
        payment_id: Uuid,
    ) -> AppResult<Option<Payment>> {
        Ok(self
            .state
            .read()
            .await
            .payments
            .iter()
            .find(|payment| payment.school_id == school_id && payment.id == payment_id)
            .cloned())
    }

    async fn list_payments(&self, school_id: SchoolId, invoice_id: Uuid) -> AppResult<Vec<Payment>> {
        let state = self.state.read().await;
        let mut payments = state
            .payments
            .iter()
            .filter(|payment| payment.school_id == school_id && payment.invoice_id == Some(invoice_id))
            .cloned()
            .collect::<Vec<_>>();
        payments.sort_by_key(|payment| (payment.paid_at, payment.created_at));
        Ok(payments)
    }

    async fn period_snapshot(
        &self,
        school_id: SchoolId,
        period: BillingPeriod,
    ) -> AppResult<LedgerSnapshot> {
        let state = self.state.read().await;
        let (start, end) = (period.start_utc(), period.end_utc());
        let revenue = state
            .payments
            .iter()
            .filter(|payment| {
                payment.school_id == school_id && payment.paid_at >= start && payment.paid_at < end
            })
            .map(|payment| payment.amount)
            .sum();

        let mut snapshot = LedgerSnapshot {
            revenue,
            ..LedgerSnapshot::default()
        };
        let mut delinquent = HashSet::new();
        for invoice in state
            .invoices
            .values()
            .filter(|invoice| invoice.school_id == school_id && invoice.period() == period)
        {
            let outstanding = invoice.amount - state.net_paid(invoice.id);
            match invoice.status {
                InvoiceStatus::Pending => {
                    snapshot.pending_count += 1;
                    snapshot.outstanding_amount += outstanding;
                }
                InvoiceStatus::Overdue => {
                    snapshot.overdue_count += 1;
                    snapshot.outstanding_amount += outstanding;
                    snapshot.overdue_amount += outstanding;
                    delinquent.insert(invoice.student_id);
                }
                InvoiceStatus::Paid => snapshot.paid_amount += invoice.amount,
                InvoiceStatus::Cancelled => {}
            }
        }
        snapshot.delinquent_students = delinquent.len() as i64;
        Ok(snapshot)
    }

    async fn listed_assets(
        &self,
        school_id: SchoolId,
        asset_ids: &[Uuid],
    ) -> AppResult<Vec<ListedAsset>> {
        let state = self.state.read().await;
        Ok(asset_ids
            .iter()
            .filter_map(|asset_id| state.assets.get(&(school_id, *asset_id)).cloned())
            .collect())
    }

    async fn insert_order(&self, order: &RetailOrder) -> AppResult<()> {
        let mut state = self.state.write().await;
        if state.orders.contains_key(&order.id) {
            return Err(AppError::conflict("retail_order", order.id, "order already exists"));
        }
        state.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn find_order(
        &self,
        school_id: SchoolId,
        order_id: Uuid,
    ) -> AppResult<Option<RetailOrder>> {
        Ok(self.state.read().await.order(school_id, order_id).cloned())
    }

    async fn find_order_by_intent(
        &self,
        school_id: SchoolId,
        intent_ref: &str,
    ) -> AppResult<Option<RetailOrder>> {
        Ok(self
            .state
            .read()
            .await
            .orders
            .values()
            .find(|order| {
                order.school_id == school_id && order.payment_intent_ref.as_deref() == Some(intent_ref)
            })
            .cloned())
    }

    async fn transition_order(
        &self,
        school_id: SchoolId,
        order_id: Uuid,
        transition: OrderTransition,
    ) -> AppResult<Option<RetailOrder>> {
        let mut state = self.state.write().await;
        let Some(order) = state
            .orders
            .get_mut(&order_id)
            .filter(|order| order.school_id == school_id)
        else {
            return Ok(None);
        };
        if order.status != transition.from {
            return Ok(None);
        }
        order.status = transition.to;
        if transition.payment_intent_ref.is_some() {
            order.payment_intent_ref = transition.payment_intent_ref;
        }
        if transition.failure_reason.is_some() {
            order.failure_reason = transition.failure_reason;
        }
        order.updated_at = transition.at;
        Ok(Some(order.clone()))
    }

    async fn settle_order(
        &self,
        school_id: SchoolId,
        order_id: Uuid,
        payment: &Payment,
        now: DateTime<Utc>,
    ) -> AppResult<OrderSettlement> {
        let mut state = self.state.write().await;
        let order = state
            .order(school_id, order_id)
            .cloned()
            .ok_or_else(|| AppError::not_found("retail_order", order_id))?;
        if order.status != OrderStatus::AwaitingPayment {
            return Ok(OrderSettlement::NotAwaiting(order));
        }

        let already_charged = state.order_charged(order_id);
        let conflicts = state.conflicts_for(&order);
        let Some(stored) = state.orders.get_mut(&order_id) else {
            return Err(AppError::not_found("retail_order", order_id));
        };
        stored.updated_at = now;
        if already_charged {
            stored.status = OrderStatus::Failed;
            stored.failure_reason = Some(ORDER_ALREADY_CHARGED.to_string());
            return Ok(OrderSettlement::AlreadyCharged {
                order: stored.clone(),
            });
        }
        if !conflicts.is_empty() {
            stored.status = OrderStatus::Failed;
            stored.failure_reason = Some(ASSET_ALREADY_SOLD.to_string());
            return Ok(OrderSettlement::InventoryConflict {
                order: stored.clone(),
                conflicts,
            });
        }

        stored.status = OrderStatus::Paid;
        let paid = stored.clone();
        for asset_id in paid.asset_ids() {
            state.sold_assets.insert((school_id, asset_id), order_id);
        }
        state.payments.push(payment.clone());
        Ok(OrderSettlement::Paid {
            order: paid,
            payment: payment.clone(),
        })
    }

    async fn awaiting_orders(&self, school_id: SchoolId, limit: i64) -> AppResult<Vec<RetailOrder>> {
        let state = self.state.read().await;
        let mut orders = state
            .orders
            .values()
            .filter(|order| order.school_id == school_id && order.status == OrderStatus::AwaitingPayment)
            .cloned()
            .collect::<Vec<_>>();
        orders.sort_by_key(|order| order.expires_at);
        orders.truncate(limit.max(0) as usize);
        Ok(orders)
    }

    async fn schools_with_open_work(&self) -> AppResult<Vec<SchoolId>> {
        let state = self.state.read().await;
        let mut schools = state
            .invoices
            .values()
            .filter(|invoice| invoice.status == InvoiceStatus::Pending)
            .map(|invoice| invoice.school_id)
            .chain(
                state
                    .orders
                    .values()
                    .filter(|order| order.status == OrderStatus::AwaitingPayment)
                    .map(|order| order.school_id),
            )
            .collect::<Vec<_>>();
        schools.sort();
        schools.dedup();
        Ok(schools)
    }

    async fn replace_download_token(&self, token: &DownloadToken) -> AppResult<()> {
        let mut state = self.state.write().await;
        for existing in state.tokens.iter_mut() {
            if existing.school_id == token.school_id
                && existing.order_id == token.order_id
                && existing.consumed_at.is_none()
                && existing.revoked_at.is_none()
            {
                existing.revoked_at = Some(token.created_at);
            }
        }
        state.tokens.push(token.clone());
        Ok(())
    }

    async fn consume_download_token(
        &self,
        school_id: SchoolId,
        secret_hash: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Uuid> {
        let mut state = self.state.write().await;
        let Some(token) = state
            .tokens
            .iter_mut()
            .find(|token| token.school_id == school_id && token.secret_hash == secret_hash)
        else {
            return Err(AppError::not_found("download_token", token_label(secret_hash)));
        };
        if !token.is_live(now) {
            return Err(AppError::expired("download_token", token_label(secret_hash)));
        }
        token.consumed_at = Some(now);
        Ok(token.order_id)
    }

    async fn record_billing_event(&self, event: &BillingEvent) -> AppResult<bool> {
        let mut state = self.state.write().await;
        let duplicate = state.events.iter().any(|existing| {
            existing.school_id == event.school_id
                && existing.order_id == event.order_id
                && existing.event_type == event.event_type
        });
        if duplicate {
            return Ok(false);
        }
        state.events.push(event.clone());
        Ok(true)
    }

    async fn list_billing_events(&self, school_id: SchoolId) -> AppResult<Vec<BillingEvent>> {
        let state = self.state.read().await;
        let mut events = state
            .events
            .iter()
            .filter(|event| event.school_id == school_id)
            .cloned()
            .collect::<Vec<_>>();
        events.sort_by_key(|event| event.created_at);
        Ok(events)
    }
}
