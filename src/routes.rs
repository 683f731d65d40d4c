use axum::{
    routing::{get, post},
    Router,
};

use crate::billing::api;
use crate::webhooks;

pub fn api_routes() -> Router {
    Router::new()
        .route(
            "/api/schools/:school_id/invoices/generate",
            post(api::generate_invoices),
        )
        .route("/api/schools/:school_id/invoices", get(api::list_invoices))
        .route(
            "/api/schools/:school_id/invoices/:invoice_id",
            get(api::invoice_detail),
        )
        .route(
            "/api/schools/:school_id/invoices/:invoice_id/cancel",
            post(api::cancel_invoice),
        )
        .route("/api/schools/:school_id/payments", post(api::register_payment))
        .route(
            "/api/schools/:school_id/payments/:payment_id/reverse",
            post(api::reverse_payment),
        )
        .route("/api/schools/:school_id/stats", get(api::financial_stats))
        .route(
            "/api/schools/:school_id/retail/orders",
            post(api::create_order),
        )
        .route(
            "/api/schools/:school_id/retail/orders/:order_id",
            get(api::order_status),
        )
        .route(
            "/api/schools/:school_id/retail/orders/:order_id/token",
            post(api::reissue_token),
        )
        .route(
            "/api/schools/:school_id/retail/gateway-callback",
            post(webhooks::gateway_callback),
        )
        .route(
            "/api/schools/:school_id/downloads/redeem",
            post(api::redeem_token),
        )
        .route(
            "/api/schools/:school_id/billing-events",
            get(api::list_billing_events),
        )
}
