use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::gateway::{bounded, IntentRequest, PaymentGateway};
use super::models::{Buyer, LineItem, Money, OrderStatus, PaymentIntent, RetailOrder, SchoolId};
use super::reconciliation::{ReconciliationHandle, ReconciliationJob};
use super::store::{with_store_retry, LedgerStore, OrderTransition};
use crate::config::BillingConfig;
use crate::error::{AppError, AppResult};

pub(crate) const GATEWAY_UNAVAILABLE: &str = "gateway_unavailable";

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrderRequest {
    pub buyer: Buyer,
    pub asset_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedOrder {
    pub order: RetailOrder,
    pub payment_intent: PaymentIntent,
}

fn validate_buyer(buyer: &Buyer) -> AppResult<()> {
    let mut offending = Vec::new();
    if buyer.name.trim().is_empty() {
        offending.push("buyer.name".to_string());
    }
    let email = buyer.email.trim();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {}
        _ => offending.push("buyer.email".to_string()),
    }
    if buyer.phone.chars().filter(char::is_ascii_digit).count() < 8 {
        offending.push("buyer.phone".to_string());
    }

    if offending.is_empty() {
        Ok(())
    } else {
        Err(AppError::Validation {
            message: "buyer details are incomplete".to_string(),
            offending,
        })
    }
}

/// key: retail-order-service -> photo bundle checkout
#[derive(Clone)]
pub struct RetailOrderService {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    watcher: Option<ReconciliationHandle>,
    config: BillingConfig,
}

impl RetailOrderService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            watcher: None,
            config,
        }
    }

    /// Hands every order that reaches `awaiting_payment` to the reconciliation worker.
    pub fn with_watcher(mut self, watcher: ReconciliationHandle) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub async fn create_order(
        &self,
        school_id: SchoolId,
        request: CreateOrderRequest,
        now: DateTime<Utc>,
    ) -> AppResult<CreatedOrder> {
        validate_buyer(&request.buyer)?;

        let mut seen = HashSet::new();
        let asset_ids = request
            .asset_ids
            .into_iter()
            .filter(|asset_id| seen.insert(*asset_id))
            .collect::<Vec<_>>();
        if asset_ids.is_empty() {
            return Err(AppError::Validation {
                message: "an order needs at least one item".to_string(),
                offending: vec!["asset_ids".to_string()],
            });
        }

        let listed = self.store.listed_assets(school_id, &asset_ids).await?;
        let mut line_items = Vec::with_capacity(asset_ids.len());
        let mut offending = Vec::new();
        for asset_id in &asset_ids {
            match listed.iter().find(|asset| asset.asset_id == *asset_id) {
                Some(asset) if asset.sale_active => line_items.push(LineItem {
                    asset_id: asset.asset_id,
                    album_id: asset.album_id,
                    unit_price: asset.price,
                }),
                _ => offending.push(asset_id.to_string()),
            }
        }
        if !offending.is_empty() {
            return Err(AppError::Validation {
                message: format!("{} item(s) are not for sale", offending.len()),
                offending,
            });
        }

        let total_amount = line_items
            .iter()
            .try_fold(Money::ZERO, |total, item| total.checked_add(item.unit_price))
            .ok_or_else(|| AppError::validation("order total overflows"))?;

        let order = RetailOrder {
            id: Uuid::new_v4(),
            school_id,
            buyer: request.buyer,
            line_items,
            total_amount,
            status: OrderStatus::Created,
            payment_intent_ref: None,
            failure_reason: None,
            created_at: now,
            expires_at: now + self.config.order_ttl,
            updated_at: now,
        };
        let store = &self.store;
        let created = &order;
        with_store_retry(&self.config, "insert_order", move || store.insert_order(created)).await?;
        let order_id = order.id;

        let intent_request = IntentRequest {
            reference: order_id,
            amount_cents: order.total_amount,
            buyer: order.buyer.clone(),
            expires_at: order.expires_at,
        };
        let intent = match bounded(
            self.config.gateway_timeout,
            self.gateway.request_payment_intent(&intent_request),
        )
        .await
        {
            Ok(intent) => intent,
            Err(err) => {
                error!(%school_id, %order_id, error = %err, "payment intent request failed");
                let reason = format!("{GATEWAY_UNAVAILABLE}: {err}");
                self.transition(
                    school_id,
                    order_id,
                    OrderStatus::Failed,
                    None,
                    Some(reason),
                    Utc::now(),
                )
                .await?;
                return Err(AppError::Gateway {
                    order_id,
                    message: err.to_string(),
                });
            }
        };

        let order = self
            .transition(
                school_id,
                order_id,
                OrderStatus::AwaitingPayment,
                Some(intent.intent_ref.clone()),
                None,
                Utc::now(),
            )
            .await?
            .ok_or_else(|| {
                AppError::conflict("retail_order", order_id, "order left `created` before its intent was recorded")
            })?;
        info!(
            %school_id,
            %order_id,
            intent_ref = %intent.intent_ref,
            total = %order.total_amount,
            items = order.line_items.len(),
            "retail order awaiting payment"
        );

        if let Some(watcher) = &self.watcher {
            if let Err(err) = watcher
                .dispatch(ReconciliationJob::Watch {
                    school_id,
                    order_id,
                })
                .await
            {
                warn!(%school_id, %order_id, error = %err, "order not handed to reconciliation; the scheduler will pick it up");
            }
        }

        Ok(CreatedOrder {
            order,
            payment_intent: intent,
        })
    }

    async fn transition(
        &self,
        school_id: SchoolId,
        order_id: Uuid,
        to: OrderStatus,
        payment_intent_ref: Option<String>,
        failure_reason: Option<String>,
        at: DateTime<Utc>,
    ) -> AppResult<Option<RetailOrder>> {
        let store = &self.store;
        let transition = OrderTransition {
            from: OrderStatus::Created,
            to,
            payment_intent_ref,
            failure_reason,
            at,
        };
        let transition = &transition;
        with_store_retry(&self.config, "transition_order", move || {
            store.transition_order(school_id, order_id, transition.clone())
        })
        .await
    }

    /// Read-only view for the checkout page.
    pub async fn order_status(&self, school_id: SchoolId, order_id: Uuid) -> AppResult<RetailOrder> {
        self.store
            .find_order(school_id, order_id)
            .await?
            .ok_or_else(|| AppError::not_found("retail_order", order_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buyer(name: &str, email: &str, phone: &str) -> Buyer {
        Buyer {
            name: name.into(),
            email: email.into(),
            phone: phone.into(),
        }
    }

    #[test]
    fn complete_buyer_passes() {
        assert!(validate_buyer(&buyer("Ana", "ana@example.com", "(11) 9 8765-4321")).is_ok());
    }

    #[test]
    fn every_bad_buyer_field_is_reported() {
        match validate_buyer(&buyer(" ", "ana.example.com", "1234")) {
            Err(AppError::Validation { offending, .. }) => assert_eq!(
                offending,
                vec!["buyer.name", "buyer.email", "buyer.phone"]
            ),
            other => panic!("unexpected result {other:?}"),
        }
    }
}
