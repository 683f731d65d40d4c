use std::cmp::min;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc::{channel, Sender};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::gateway::{bounded, PaymentGateway};
use super::models::{IntentStatus, IssuedToken, OrderStatus, RetailOrder, SchoolId};
use super::notify::{notify_detached, GuardianNotifier};
use super::payments::PaymentRecorder;
use super::store::{with_store_retry, AssetConflict, LedgerStore, OrderSettlement, OrderTransition};
use super::tokens::DownloadTokenIssuer;
use crate::config::BillingConfig;
use crate::error::{AppError, AppResult};
use crate::telemetry::{BillingEvent, BillingEventType};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Result of running the settlement routine once for an order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettlementOutcome {
    Paid {
        order: RetailOrder,
        /// `None` when minting failed; the token can be re-issued for the paid order.
        /// Only the buyer sees the secret, through the guardian notification.
        #[serde(skip_serializing)]
        token: Option<IssuedToken>,
    },
    Expired {
        order: RetailOrder,
    },
    Failed {
        order: RetailOrder,
        conflicts: Vec<AssetConflict>,
    },
    Pending {
        order: RetailOrder,
    },
    AlreadyTerminal {
        order: RetailOrder,
    },
}

impl SettlementOutcome {
    pub fn order(&self) -> &RetailOrder {
        match self {
            SettlementOutcome::Paid { order, .. }
            | SettlementOutcome::Expired { order }
            | SettlementOutcome::Failed { order, .. }
            | SettlementOutcome::Pending { order }
            | SettlementOutcome::AlreadyTerminal { order } => order,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SettlementOutcome::Pending { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SettlementOutcome::Paid { .. } => "paid",
            SettlementOutcome::Expired { .. } => "expired",
            SettlementOutcome::Failed { .. } => "failed",
            SettlementOutcome::Pending { .. } => "pending",
            SettlementOutcome::AlreadyTerminal { .. } => "already_terminal",
        }
    }
}

/// Exponential backoff for consecutive gateway errors, capped at 30 seconds.
pub fn gateway_backoff(base: Duration, consecutive_errors: u32) -> Duration {
    let exponent = consecutive_errors.saturating_sub(1).min(16);
    min(base.saturating_mul(1 << exponent), MAX_BACKOFF)
}

/// key: billing-reconciliation -> settlement of retail orders against the gateway
pub struct Reconciler {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    recorder: PaymentRecorder,
    issuer: DownloadTokenIssuer,
    notifier: Arc<dyn GuardianNotifier>,
    config: BillingConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        recorder: PaymentRecorder,
        issuer: DownloadTokenIssuer,
        notifier: Arc<dyn GuardianNotifier>,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            recorder,
            issuer,
            notifier,
            config,
        }
    }

    /// The one settlement routine behind both the poller and gateway callbacks. Running it again
    /// for an order that already reached a terminal state changes nothing.
    pub async fn settle(
        &self,
        school_id: SchoolId,
        order_id: Uuid,
        observed: IntentStatus,
        now: DateTime<Utc>,
    ) -> AppResult<SettlementOutcome> {
        let order = self
            .store
            .find_order(school_id, order_id)
            .await?
            .ok_or_else(|| AppError::not_found("retail_order", order_id))?;
        if order.status.is_terminal() {
            return self.already_terminal(order, observed, now).await;
        }

        match observed {
            IntentStatus::Settled if order.status == OrderStatus::AwaitingPayment => {
                if order.is_past_expiry(now) {
                    self.expire_settled_late(order, now).await
                } else {
                    self.finalize(order, now).await
                }
            }
            IntentStatus::Settled | IntentStatus::Pending => {
                if order.is_past_expiry(now) {
                    self.expire(order, now).await
                } else {
                    Ok(SettlementOutcome::Pending { order })
                }
            }
            IntentStatus::Expired => self.expire(order, now).await,
            IntentStatus::Failed => {
                self.fail(order, "gateway_reported_failure".to_string(), now)
                    .await
            }
        }
    }

    async fn finalize(&self, order: RetailOrder, now: DateTime<Utc>) -> AppResult<SettlementOutcome> {
        let school_id = order.school_id;
        let order_id = order.id;
        match self.recorder.settle_order_payment(&order, now).await? {
            OrderSettlement::Paid { order, payment } => {
                info!(
                    %school_id,
                    %order_id,
                    payment_id = %payment.id,
                    amount = %payment.amount,
                    "retail order paid"
                );
                let token = match self.issuer.issue_token(school_id, order_id, now).await {
                    Ok(token) => {
                        notify_detached(
                            self.notifier.clone(),
                            "retail_order.download_ready",
                            json!({
                                "school_id": school_id,
                                "order_id": order_id,
                                "buyer_name": order.buyer.name,
                                "buyer_email": order.buyer.email,
                                "token": token.token,
                                "expires_at": token.expires_at,
                            }),
                        );
                        Some(token)
                    }
                    Err(err) => {
                        error!(%school_id, %order_id, error = %err, "paid order left without a download token");
                        None
                    }
                };
                Ok(SettlementOutcome::Paid { order, token })
            }
            OrderSettlement::InventoryConflict { order, conflicts } => {
                error!(
                    %school_id,
                    %order_id,
                    conflicts = conflicts.len(),
                    "payment collected for assets already sold; manual refund required"
                );
                self.flag(
                    &order,
                    BillingEventType::RefundRequired,
                    json!({
                        "reason": "asset_already_sold",
                        "amount_cents": order.total_amount,
                        "payment_intent_ref": order.payment_intent_ref,
                        "conflicts": conflicts,
                    }),
                    now,
                )
                .await;
                Ok(SettlementOutcome::Failed { order, conflicts })
            }
            OrderSettlement::AlreadyCharged { order } => {
                error!(
                    %school_id,
                    %order_id,
                    "gateway settled an order that already carries a payment; manual refund required"
                );
                self.flag(
                    &order,
                    BillingEventType::RefundRequired,
                    json!({
                        "reason": "order_already_charged",
                        "amount_cents": order.total_amount,
                        "payment_intent_ref": order.payment_intent_ref,
                    }),
                    now,
                )
                .await;
                Ok(SettlementOutcome::Failed {
                    order,
                    conflicts: Vec::new(),
                })
            }
            OrderSettlement::NotAwaiting(order) => {
                self.already_terminal(order, IntentStatus::Settled, now).await
            }
        }
    }

    async fn already_terminal(
        &self,
        order: RetailOrder,
        observed: IntentStatus,
        now: DateTime<Utc>,
    ) -> AppResult<SettlementOutcome> {
        if observed == IntentStatus::Settled
            && matches!(order.status, OrderStatus::Expired | OrderStatus::Failed)
        {
            self.flag_late_settlement(&order, now).await;
        } else {
            debug!(
                school_id = %order.school_id,
                order_id = %order.id,
                status = order.status.as_str(),
                "settlement skipped for terminal order"
            );
        }
        Ok(SettlementOutcome::AlreadyTerminal { order })
    }

    async fn flag_late_settlement(&self, order: &RetailOrder, now: DateTime<Utc>) {
        warn!(
            school_id = %order.school_id,
            order_id = %order.id,
            status = order.status.as_str(),
            "gateway settled an order that is no longer payable; manual refund required"
        );
        self.flag(
            order,
            BillingEventType::RefundRequired,
            json!({
                "reason": format!("settled_after_{}", order.status.as_str()),
                "amount_cents": order.total_amount,
                "payment_intent_ref": order.payment_intent_ref,
            }),
            now,
        )
        .await;
    }

    /// Funds cleared after the order's window closed: the order expires instead of selling
    /// its assets, and the collected amount is flagged for refund.
    async fn expire_settled_late(
        &self,
        order: RetailOrder,
        now: DateTime<Utc>,
    ) -> AppResult<SettlementOutcome> {
        match self
            .close(&order, OrderStatus::Expired, None, now)
            .await?
        {
            Some(expired) => {
                info!(
                    school_id = %expired.school_id,
                    order_id = %expired.id,
                    expires_at = %expired.expires_at,
                    "retail order settled after its expiry"
                );
                self.flag_late_settlement(&expired, now).await;
                Ok(SettlementOutcome::Expired { order: expired })
            }
            None => {
                let current = self
                    .store
                    .find_order(order.school_id, order.id)
                    .await?
                    .unwrap_or(order);
                if current.status.is_terminal() {
                    self.already_terminal(current, IntentStatus::Settled, now).await
                } else {
                    Ok(SettlementOutcome::Pending { order: current })
                }
            }
        }
    }

    async fn expire(&self, order: RetailOrder, now: DateTime<Utc>) -> AppResult<SettlementOutcome> {
        match self
            .close(&order, OrderStatus::Expired, None, now)
            .await?
        {
            Some(order) => {
                info!(school_id = %order.school_id, order_id = %order.id, "retail order expired");
                Ok(SettlementOutcome::Expired { order })
            }
            None => self.reload_terminal(order, now).await,
        }
    }

    async fn fail(
        &self,
        order: RetailOrder,
        reason: String,
        now: DateTime<Utc>,
    ) -> AppResult<SettlementOutcome> {
        match self
            .close(&order, OrderStatus::Failed, Some(reason), now)
            .await?
        {
            Some(order) => {
                warn!(
                    school_id = %order.school_id,
                    order_id = %order.id,
                    reason = order.failure_reason.as_deref().unwrap_or_default(),
                    "retail order failed"
                );
                Ok(SettlementOutcome::Failed {
                    order,
                    conflicts: Vec::new(),
                })
            }
            None => self.reload_terminal(order, now).await,
        }
    }

    async fn close(
        &self,
        order: &RetailOrder,
        to: OrderStatus,
        failure_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> AppResult<Option<RetailOrder>> {
        let store = &self.store;
        let transition = OrderTransition {
            from: order.status,
            to,
            payment_intent_ref: None,
            failure_reason,
            at: now,
        };
        let transition = &transition;
        let (school_id, order_id) = (order.school_id, order.id);
        with_store_retry(&self.config, "transition_order", move || {
            store.transition_order(school_id, order_id, transition.clone())
        })
        .await
    }

    /// Another path moved the order first; report where it ended up.
    async fn reload_terminal(
        &self,
        order: RetailOrder,
        now: DateTime<Utc>,
    ) -> AppResult<SettlementOutcome> {
        let current = self
            .store
            .find_order(order.school_id, order.id)
            .await?
            .unwrap_or(order);
        if current.status.is_terminal() {
            self.already_terminal(current, IntentStatus::Pending, now).await
        } else {
            Ok(SettlementOutcome::Pending { order: current })
        }
    }

    async fn flag(
        &self,
        order: &RetailOrder,
        event_type: BillingEventType,
        details: serde_json::Value,
        now: DateTime<Utc>,
    ) {
        let event = match BillingEvent::new(order.school_id, order.id, event_type, details, now) {
            Ok(event) => event,
            Err(err) => {
                error!(order_id = %order.id, error = %err, "billing event rejected");
                return;
            }
        };
        match self.store.record_billing_event(&event).await {
            Ok(true) => info!(
                school_id = %order.school_id,
                order_id = %order.id,
                event_type = event_type.as_str(),
                "billing event recorded"
            ),
            Ok(false) => debug!(order_id = %order.id, event_type = event_type.as_str(), "billing event already open"),
            Err(err) => error!(order_id = %order.id, error = %err, "failed to persist billing event"),
        }
    }

    /// Asks the gateway once and settles on the answer.
    pub async fn poll_once(
        &self,
        school_id: SchoolId,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<SettlementOutcome> {
        let order = self
            .store
            .find_order(school_id, order_id)
            .await?
            .ok_or_else(|| AppError::not_found("retail_order", order_id))?;
        if order.status.is_terminal() {
            return Ok(SettlementOutcome::AlreadyTerminal { order });
        }
        let Some(intent_ref) = order.payment_intent_ref.clone() else {
            // Never got an intent; nothing to ask the gateway about.
            return if order.is_past_expiry(now) {
                self.expire(order, now).await
            } else {
                Ok(SettlementOutcome::Pending { order })
            };
        };

        let observed = bounded(self.config.gateway_timeout, self.gateway.intent_status(&intent_ref))
            .await
            .map_err(|err| AppError::Gateway {
                order_id,
                message: err.to_string(),
            })?;
        self.settle(school_id, order_id, observed, now).await
    }

    /// Scheduled check: one more gateway question, and an order past its expiry is expired even
    /// when the gateway cannot be reached.
    pub async fn sweep_order(
        &self,
        school_id: SchoolId,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<SettlementOutcome> {
        match self.poll_once(school_id, order_id, now).await {
            Err(AppError::Gateway { message, .. }) => {
                warn!(%school_id, %order_id, error = %message, "gateway unavailable during order sweep");
                self.settle(school_id, order_id, IntentStatus::Pending, now)
                    .await
            }
            other => other,
        }
    }

    /// Polls until the order is terminal, its attempt budget runs out, or the gateway keeps
    /// failing; in the last case the order is failed and flagged for an operator.
    pub async fn watch(&self, school_id: SchoolId, order_id: Uuid) {
        let max_attempts = self.config.max_poll_attempts.max(1);
        let mut consecutive_errors = 0u32;
        for attempt in 1..=max_attempts {
            match self.poll_once(school_id, order_id, Utc::now()).await {
                Ok(outcome) if outcome.is_terminal() => {
                    debug!(%school_id, %order_id, attempt, "reconciliation finished");
                    return;
                }
                Ok(_) => {
                    consecutive_errors = 0;
                    sleep(self.config.poll_interval).await;
                }
                Err(AppError::Gateway { message, .. }) => {
                    consecutive_errors += 1;
                    warn!(
                        %school_id,
                        %order_id,
                        attempt,
                        consecutive_errors,
                        error = %message,
                        "gateway status check failed"
                    );
                    if consecutive_errors >= self.config.max_gateway_errors {
                        self.give_up(school_id, order_id, attempt, &message).await;
                        return;
                    }
                    sleep(gateway_backoff(self.config.backoff_base, consecutive_errors)).await;
                }
                Err(AppError::NotFound { .. }) => {
                    warn!(%school_id, %order_id, "watched order disappeared");
                    return;
                }
                Err(err) => {
                    warn!(%school_id, %order_id, attempt, error = %err, "reconciliation attempt failed");
                    sleep(self.config.poll_interval).await;
                }
            }
        }
        warn!(
            %school_id,
            %order_id,
            max_attempts,
            "poll budget exhausted; the scheduler will expire the order once past expiry"
        );
    }

    async fn give_up(&self, school_id: SchoolId, order_id: Uuid, attempts: u32, last_error: &str) {
        let now = Utc::now();
        let order = match self.store.find_order(school_id, order_id).await {
            Ok(Some(order)) if !order.status.is_terminal() => order,
            Ok(_) => return,
            Err(err) => {
                error!(%school_id, %order_id, error = %err, "could not load order to mark it failed");
                return;
            }
        };
        match self.fail(order, "gateway_unreachable".to_string(), now).await {
            Ok(SettlementOutcome::Failed { order, .. }) => {
                self.flag(
                    &order,
                    BillingEventType::OperatorReview,
                    json!({
                        "reason": "gateway_unreachable",
                        "attempts": attempts,
                        "last_error": last_error,
                        "payment_intent_ref": order.payment_intent_ref,
                    }),
                    now,
                )
                .await;
            }
            Ok(_) => {}
            Err(err) => error!(%school_id, %order_id, error = %err, "could not mark order failed"),
        }
    }

    /// Settles the order a gateway callback refers to.
    pub async fn handle_callback(
        &self,
        school_id: SchoolId,
        intent_ref: &str,
        observed: IntentStatus,
        now: DateTime<Utc>,
    ) -> AppResult<SettlementOutcome> {
        let order = self
            .store
            .find_order_by_intent(school_id, intent_ref)
            .await?
            .ok_or_else(|| AppError::not_found("payment_intent", intent_ref))?;
        self.settle(school_id, order.id, observed, now).await
    }
}

#[derive(Debug)]
pub enum ReconciliationJob {
    Watch {
        school_id: SchoolId,
        order_id: Uuid,
    },
    GatewayCallback {
        school_id: SchoolId,
        intent_ref: String,
        status: IntentStatus,
    },
}

#[derive(Debug, Error)]
#[error("reconciliation worker is not running")]
pub struct WorkerStopped;

/// key: billing-reconciliation-handle -> enqueue interface
#[derive(Clone)]
pub struct ReconciliationHandle {
    sender: Sender<ReconciliationJob>,
    pollers: Arc<DashMap<Uuid, AbortHandle>>,
}

impl ReconciliationHandle {
    pub async fn dispatch(&self, job: ReconciliationJob) -> Result<(), WorkerStopped> {
        self.sender.send(job).await.map_err(|_| WorkerStopped)
    }

    pub fn is_watching(&self, order_id: Uuid) -> bool {
        self.pollers.contains_key(&order_id)
    }

    pub fn active_pollers(&self) -> usize {
        self.pollers.len()
    }
}

pub fn start_reconciliation_worker(reconciler: Arc<Reconciler>) -> ReconciliationHandle {
    let (tx, mut rx) = channel(256);
    let pollers: Arc<DashMap<Uuid, AbortHandle>> = Arc::new(DashMap::new());
    let handle = ReconciliationHandle {
        sender: tx,
        pollers: pollers.clone(),
    };

    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job {
                ReconciliationJob::Watch {
                    school_id,
                    order_id,
                } => spawn_poller(&reconciler, &pollers, school_id, order_id),
                ReconciliationJob::GatewayCallback {
                    school_id,
                    intent_ref,
                    status,
                } => {
                    let reconciler = reconciler.clone();
                    let pollers = pollers.clone();
                    tokio::spawn(async move {
                        match reconciler
                            .handle_callback(school_id, &intent_ref, status, Utc::now())
                            .await
                        {
                            Ok(outcome) if outcome.is_terminal() => {
                                let order_id = outcome.order().id;
                                if let Some((_, poller)) = pollers.remove(&order_id) {
                                    poller.abort();
                                    debug!(%school_id, %order_id, "poller stopped by gateway callback");
                                }
                            }
                            Ok(_) => {}
                            Err(err) => error!(
                                %school_id,
                                %intent_ref,
                                error = %err,
                                "failed to settle gateway callback"
                            ),
                        }
                    });
                }
            }
        }
    });

    handle
}

fn spawn_poller(
    reconciler: &Arc<Reconciler>,
    pollers: &Arc<DashMap<Uuid, AbortHandle>>,
    school_id: SchoolId,
    order_id: Uuid,
) {
    let dashmap::mapref::entry::Entry::Vacant(slot) = pollers.entry(order_id) else {
        debug!(%school_id, %order_id, "order already watched");
        return;
    };

    // The task waits until its abort handle is registered so its own cleanup cannot race it.
    let (registered_tx, registered_rx) = oneshot::channel::<()>();
    let task_reconciler = reconciler.clone();
    let task_pollers = pollers.clone();
    let task = tokio::spawn(async move {
        if registered_rx.await.is_err() {
            return;
        }
        task_reconciler.watch(school_id, order_id).await;
        task_pollers.remove(&order_id);
    });
    slot.insert(task.abort_handle());
    let _ = registered_tx.send(());
    info!(%school_id, %order_id, "watching order for settlement");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        assert_eq!(gateway_backoff(base, 1), Duration::from_millis(500));
        assert_eq!(gateway_backoff(base, 2), Duration::from_secs(1));
        assert_eq!(gateway_backoff(base, 4), Duration::from_secs(4));
        assert_eq!(gateway_backoff(base, 12), MAX_BACKOFF);
    }
}
