mod common;

use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use common::{at, harness, harness_with, order_for, test_config};
use tuition_ledger::billing::{
    IntentStatus, LedgerStore, Money, OrderStatus, Payment, PaymentMethod, ReconciliationJob,
    SettlementOutcome,
};
use tuition_ledger::error::AppError;
use tuition_ledger::telemetry::BillingEventType;

#[tokio::test]
async fn checkout_prices_items_from_the_listing() {
    let h = harness(0);
    let first = h.list_photo(1_500).await;
    let second = h.list_photo(2_250).await;

    let created = h
        .context
        .orders
        .create_order(h.school, order_for(&[first, second, first]), at(3, 12, 0))
        .await
        .unwrap();

    let order = &created.order;
    assert_eq!(order.status, OrderStatus::AwaitingPayment);
    assert_eq!(order.line_items.len(), 2);
    assert_eq!(order.total_amount, Money::from_minor(3_750));
    assert_eq!(order.expires_at, at(3, 12, 30));
    assert_eq!(
        order.payment_intent_ref.as_deref(),
        Some(created.payment_intent.intent_ref.as_str())
    );

    let requested = h.gateway.requested();
    assert_eq!(requested.len(), 1);
    assert_eq!(requested[0].amount_cents, Money::from_minor(3_750));
    assert_eq!(requested[0].reference, order.id);
}

#[tokio::test]
async fn unlisted_or_inactive_items_are_named_in_the_error() {
    let h = harness(0);
    let album = Uuid::new_v4();
    let on_sale = h.list_photo(1_000).await;
    let withdrawn = h.list_photo_in(album, 1_000).await;
    h.store.set_album_active(h.school, album, false).await;
    let unknown = Uuid::new_v4();

    let err = h
        .context
        .orders
        .create_order(h.school, order_for(&[on_sale, withdrawn, unknown]), at(3, 12, 0))
        .await
        .unwrap_err();
    match err {
        AppError::Validation { offending, .. } => {
            assert_eq!(offending, vec![withdrawn.to_string(), unknown.to_string()]);
        }
        other => panic!("expected a validation error, got {other:?}"),
    }

    let err = h
        .context
        .orders
        .create_order(h.school, order_for(&[]), at(3, 12, 0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_error");
}

#[tokio::test]
async fn gateway_refusal_leaves_an_auditable_failed_order() {
    let h = harness(0);
    let photo = h.list_photo(1_000).await;
    h.gateway.refuse_intents(true);

    let err = h
        .context
        .orders
        .create_order(h.school, order_for(&[photo]), at(3, 12, 0))
        .await
        .unwrap_err();
    let AppError::Gateway { order_id, .. } = err else {
        panic!("expected a gateway error, got {err:?}");
    };

    let order = h.context.orders.order_status(h.school, order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Failed);
    assert!(order
        .failure_reason
        .as_deref()
        .unwrap_or_default()
        .starts_with("gateway_unavailable"));
}

#[tokio::test]
async fn settlement_records_payment_and_mints_a_token() {
    let h = harness(0);
    let photo = h.list_photo(2_000).await;
    let created = h
        .context
        .orders
        .create_order(h.school, order_for(&[photo]), at(3, 12, 0))
        .await
        .unwrap();
    let order_id = created.order.id;

    let outcome = h
        .context
        .reconciler
        .settle(h.school, order_id, IntentStatus::Settled, at(3, 12, 5))
        .await
        .unwrap();
    let SettlementOutcome::Paid { order, token } = outcome else {
        panic!("expected the order to be paid");
    };
    assert_eq!(order.status, OrderStatus::Paid);
    let token = token.expect("a download token");
    assert_eq!(token.order_id, order_id);

    let payments = h.store.payments_for_order(h.school, order_id).await;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].amount, Money::from_minor(2_000));
    assert_eq!(payments[0].invoice_id, None);
    assert_eq!(h.store.asset_owner(h.school, photo).await, Some(order_id));

    let ready = h.notifier.wait_for("retail_order.download_ready").await;
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0]["token"], token.token.as_str());
}

#[tokio::test]
async fn settling_twice_changes_nothing() {
    let h = harness(0);
    let photo = h.list_photo(2_000).await;
    let created = h
        .context
        .orders
        .create_order(h.school, order_for(&[photo]), at(3, 12, 0))
        .await
        .unwrap();
    let order_id = created.order.id;
    let intent_ref = created.payment_intent.intent_ref.clone();

    h.context
        .reconciler
        .settle(h.school, order_id, IntentStatus::Settled, at(3, 12, 5))
        .await
        .unwrap();
    let again = h
        .context
        .reconciler
        .handle_callback(h.school, &intent_ref, IntentStatus::Settled, at(3, 12, 6))
        .await
        .unwrap();

    assert!(matches!(again, SettlementOutcome::AlreadyTerminal { .. }));
    assert_eq!(again.order().status, OrderStatus::Paid);
    assert_eq!(h.store.payments_for_order(h.school, order_id).await.len(), 1);
    assert_eq!(h.store.tokens_for_order(h.school, order_id).await.len(), 1);
    assert!(h.context.store.list_billing_events(h.school).await.unwrap().is_empty());
}

#[tokio::test]
async fn a_photo_sold_once_fails_the_second_order_and_flags_a_refund() {
    let h = harness(0);
    let shared = h.list_photo(1_000).await;
    let extra = h.list_photo(500).await;
    let first = h
        .context
        .orders
        .create_order(h.school, order_for(&[shared]), at(3, 12, 0))
        .await
        .unwrap()
        .order;
    let second = h
        .context
        .orders
        .create_order(h.school, order_for(&[shared, extra]), at(3, 12, 1))
        .await
        .unwrap()
        .order;

    let paid = h
        .context
        .reconciler
        .settle(h.school, first.id, IntentStatus::Settled, at(3, 12, 5))
        .await
        .unwrap();
    assert_eq!(paid.order().status, OrderStatus::Paid);

    let outcome = h
        .context
        .reconciler
        .settle(h.school, second.id, IntentStatus::Settled, at(3, 12, 6))
        .await
        .unwrap();
    let SettlementOutcome::Failed { order, conflicts } = outcome else {
        panic!("expected the second order to fail");
    };
    assert_eq!(order.status, OrderStatus::Failed);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].asset_id, shared);
    assert_eq!(conflicts[0].paid_order_id, first.id);

    assert_eq!(h.store.asset_owner(h.school, shared).await, Some(first.id));
    assert_eq!(h.store.asset_owner(h.school, extra).await, None);
    assert!(h.store.payments_for_order(h.school, second.id).await.is_empty());

    let events = h.context.store.list_billing_events(h.school).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].order_id, second.id);
    assert_eq!(events[0].event_type, BillingEventType::RefundRequired);
    assert_eq!(events[0].details["amount_cents"], 1_500);
}

#[tokio::test]
async fn pending_order_past_expiry_is_expired_by_a_poll() {
    let h = harness(0);
    let photo = h.list_photo(1_000).await;
    let order = h
        .context
        .orders
        .create_order(h.school, order_for(&[photo]), at(3, 12, 0))
        .await
        .unwrap()
        .order;

    let early = h
        .context
        .reconciler
        .poll_once(h.school, order.id, at(3, 12, 10))
        .await
        .unwrap();
    assert!(matches!(early, SettlementOutcome::Pending { .. }));

    let late = h
        .context
        .reconciler
        .poll_once(h.school, order.id, at(3, 12, 31))
        .await
        .unwrap();
    assert!(matches!(late, SettlementOutcome::Expired { .. }));
    assert_eq!(late.order().status, OrderStatus::Expired);
}

#[tokio::test]
async fn settlement_after_expiry_is_flagged_not_collected() {
    let h = harness(0);
    let photo = h.list_photo(1_000).await;
    let created = h
        .context
        .orders
        .create_order(h.school, order_for(&[photo]), at(3, 12, 0))
        .await
        .unwrap();
    h.gateway
        .report(&created.payment_intent.intent_ref, IntentStatus::Expired);
    let expired = h
        .context
        .reconciler
        .poll_once(h.school, created.order.id, at(3, 12, 10))
        .await
        .unwrap();
    assert_eq!(expired.order().status, OrderStatus::Expired);

    let late = h
        .context
        .reconciler
        .handle_callback(
            h.school,
            &created.payment_intent.intent_ref,
            IntentStatus::Settled,
            at(3, 12, 40),
        )
        .await
        .unwrap();
    assert!(matches!(late, SettlementOutcome::AlreadyTerminal { .. }));
    assert!(h.store.payments_for_order(h.school, created.order.id).await.is_empty());
    assert_eq!(h.store.asset_owner(h.school, photo).await, None);

    let events = h.context.store.list_billing_events(h.school).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, BillingEventType::RefundRequired);
}

#[tokio::test]
async fn settlement_observed_after_the_window_expires_the_order() {
    let h = harness(0);
    let photo = h.list_photo(1_000).await;
    let order = h
        .context
        .orders
        .create_order(h.school, order_for(&[photo]), at(3, 12, 0))
        .await
        .unwrap()
        .order;

    // still awaiting_payment, two hours past its 30 minute window
    let outcome = h
        .context
        .reconciler
        .settle(h.school, order.id, IntentStatus::Settled, at(3, 14, 0))
        .await
        .unwrap();
    assert!(matches!(outcome, SettlementOutcome::Expired { .. }));
    assert_eq!(outcome.order().status, OrderStatus::Expired);
    assert!(h.store.payments_for_order(h.school, order.id).await.is_empty());
    assert_eq!(h.store.asset_owner(h.school, photo).await, None);
    assert!(h.store.tokens_for_order(h.school, order.id).await.is_empty());

    let events = h.context.store.list_billing_events(h.school).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, BillingEventType::RefundRequired);
    assert_eq!(events[0].details["reason"], "settled_after_expired");
    assert_eq!(events[0].details["amount_cents"], 1_000);

    let again = h
        .context
        .reconciler
        .settle(h.school, order.id, IntentStatus::Settled, at(3, 14, 5))
        .await
        .unwrap();
    assert!(matches!(again, SettlementOutcome::AlreadyTerminal { .. }));
    assert_eq!(h.context.store.list_billing_events(h.school).await.unwrap().len(), 1);
}

#[tokio::test]
async fn a_charged_order_is_never_charged_twice_by_settlement() {
    let h = harness(0);
    let photo = h.list_photo(1_000).await;
    let order = h
        .context
        .orders
        .create_order(h.school, order_for(&[photo]), at(3, 12, 0))
        .await
        .unwrap()
        .order;
    let manual = Payment {
        id: Uuid::new_v4(),
        school_id: h.school,
        invoice_id: None,
        order_id: Some(order.id),
        amount: Money::from_minor(1_000),
        method: PaymentMethod::Cash,
        paid_at: at(3, 12, 2),
        recorded_by: "secretaria".into(),
        reverses_payment_id: None,
        created_at: at(3, 12, 2),
    };
    h.store.record_ad_hoc_payment(&manual).await.unwrap();

    let outcome = h
        .context
        .reconciler
        .settle(h.school, order.id, IntentStatus::Settled, at(3, 12, 5))
        .await
        .unwrap();
    assert!(matches!(outcome, SettlementOutcome::Failed { .. }));
    assert_eq!(outcome.order().status, OrderStatus::Failed);
    assert_eq!(
        outcome.order().failure_reason.as_deref(),
        Some("order_already_charged")
    );

    let payments = h.store.payments_for_order(h.school, order.id).await;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].id, manual.id);
    assert_eq!(h.store.asset_owner(h.school, photo).await, None);

    let events = h.context.store.list_billing_events(h.school).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, BillingEventType::RefundRequired);
    assert_eq!(events[0].details["reason"], "order_already_charged");
}

#[tokio::test]
async fn serialized_outcomes_never_carry_the_download_secret() {
    let h = harness(0);
    let photo = h.list_photo(1_000).await;
    let order_id = h
        .context
        .orders
        .create_order(h.school, order_for(&[photo]), at(3, 12, 0))
        .await
        .unwrap()
        .order
        .id;
    let outcome = h
        .context
        .reconciler
        .settle(h.school, order_id, IntentStatus::Settled, at(3, 12, 5))
        .await
        .unwrap();
    let SettlementOutcome::Paid { token: Some(token), .. } = &outcome else {
        panic!("expected a paid order with a token");
    };

    let body = serde_json::to_value(&outcome).unwrap();
    assert_eq!(body["outcome"], "paid");
    assert!(body.get("token").is_none());
    assert!(!body.to_string().contains(token.token.as_str()));
}

#[tokio::test]
async fn sweep_expires_orders_even_when_the_gateway_is_down() {
    let h = harness(0);
    let photo = h.list_photo(1_000).await;
    let order = h
        .context
        .orders
        .create_order(h.school, order_for(&[photo]), at(3, 12, 0))
        .await
        .unwrap()
        .order;
    h.gateway.set_unreachable(true);

    let err = h
        .context
        .reconciler
        .poll_once(h.school, order.id, at(3, 12, 10))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "external_gateway_error");

    let swept = h
        .context
        .reconciler
        .sweep_order(h.school, order.id, at(3, 13, 0))
        .await
        .unwrap();
    assert_eq!(swept.order().status, OrderStatus::Expired);
}

#[tokio::test]
async fn tokens_redeem_once_and_reissue_revokes_the_previous_one() {
    let h = harness(0);
    let photo = h.list_photo(1_000).await;
    let order_id = h
        .context
        .orders
        .create_order(h.school, order_for(&[photo]), at(3, 12, 0))
        .await
        .unwrap()
        .order
        .id;

    let err = h
        .context
        .tokens
        .issue_token(h.school, order_id, at(3, 12, 1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "conflict");

    let SettlementOutcome::Paid { token: Some(first), .. } = h
        .context
        .reconciler
        .settle(h.school, order_id, IntentStatus::Settled, at(3, 12, 5))
        .await
        .unwrap()
    else {
        panic!("expected a paid order with a token");
    };

    let reissued = h
        .context
        .tokens
        .issue_token(h.school, order_id, at(3, 13, 0))
        .await
        .unwrap();
    let err = h
        .context
        .tokens
        .consume_token(h.school, &first.token, at(3, 13, 1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "expired");

    let redeemed = h
        .context
        .tokens
        .consume_token(h.school, &reissued.token, at(3, 13, 2))
        .await
        .unwrap();
    assert_eq!(redeemed, order_id);

    let err = h
        .context
        .tokens
        .consume_token(h.school, &reissued.token, at(3, 13, 3))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "expired");

    let err = h
        .context
        .tokens
        .consume_token(h.school, "not-a-token", at(3, 13, 3))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn tokens_lapse_after_their_ttl() {
    let h = harness(0);
    let photo = h.list_photo(1_000).await;
    let order_id = h
        .context
        .orders
        .create_order(h.school, order_for(&[photo]), at(3, 12, 0))
        .await
        .unwrap()
        .order
        .id;
    let SettlementOutcome::Paid { token: Some(token), .. } = h
        .context
        .reconciler
        .settle(h.school, order_id, IntentStatus::Settled, at(3, 12, 5))
        .await
        .unwrap()
    else {
        panic!("expected a paid order with a token");
    };

    // 48 hours later
    let err = h
        .context
        .tokens
        .consume_token(h.school, &token.token, at(5, 12, 6))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "expired");
}

#[tokio::test]
async fn unreachable_gateway_fails_the_order_for_operator_review() {
    let config = tuition_ledger::config::BillingConfig {
        max_gateway_errors: 3,
        ..test_config()
    };
    let h = harness_with(0, config);
    let photo = h.list_photo(1_000).await;
    let order = h
        .context
        .orders
        .create_order(h.school, order_for(&[photo]), Utc::now())
        .await
        .unwrap()
        .order;
    h.gateway.set_unreachable(true);

    h.context.reconciler.watch(h.school, order.id).await;

    let order = h.context.orders.order_status(h.school, order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Failed);
    assert_eq!(order.failure_reason.as_deref(), Some("gateway_unreachable"));
    let events = h.context.store.list_billing_events(h.school).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, BillingEventType::OperatorReview);
    assert_eq!(events[0].details["attempts"], 3);
}

#[tokio::test]
async fn callback_settles_a_watched_order_and_stops_its_poller() {
    let h = harness(0);
    let context = h.context.clone().with_reconciliation_worker();
    let handle = context.reconciliation.clone().expect("worker handle");
    let photo = h.list_photo(1_000).await;

    let created = context
        .orders
        .create_order(h.school, order_for(&[photo]), Utc::now())
        .await
        .unwrap();
    let order_id = created.order.id;

    let mut watched = false;
    for _ in 0..100 {
        if handle.is_watching(order_id) {
            watched = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(watched, "order should be watched after checkout");

    handle
        .dispatch(ReconciliationJob::GatewayCallback {
            school_id: h.school,
            intent_ref: created.payment_intent.intent_ref.clone(),
            status: IntentStatus::Settled,
        })
        .await
        .unwrap();

    let mut status = OrderStatus::AwaitingPayment;
    for _ in 0..200 {
        status = context.orders.order_status(h.school, order_id).await.unwrap().status;
        if status == OrderStatus::Paid && !handle.is_watching(order_id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(status, OrderStatus::Paid);
    assert!(!handle.is_watching(order_id));
    assert_eq!(handle.active_pollers(), 0);
    assert_eq!(h.store.payments_for_order(h.school, order_id).await.len(), 1);
}
