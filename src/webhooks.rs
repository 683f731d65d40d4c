use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};
use uuid::Uuid;

use crate::billing::{
    BillingContext, IntentStatus, OrderStatus, ReconciliationJob, SchoolId, SettlementOutcome,
};
use crate::error::{AppError, AppResult};

pub const SIGNATURE_HEADER: &str = "x-gateway-signature";

/// Shared secret the payment gateway signs callbacks with.
#[derive(Clone, Default)]
pub struct GatewayWebhookSecret(pub Option<String>);

impl GatewayWebhookSecret {
    pub fn from_env() -> Self {
        Self((*crate::config::PAYMENT_GATEWAY_WEBHOOK_SECRET).clone())
    }
}

#[derive(Debug, Deserialize)]
pub struct GatewayCallbackRequest {
    pub intent_ref: String,
    pub status: String,
}

/// What the gateway learns about an inline settlement: the order and where it ended up.
#[derive(Debug, Serialize)]
pub struct CallbackReceipt {
    pub outcome: &'static str,
    pub order_id: Uuid,
    pub status: OrderStatus,
}

impl From<&SettlementOutcome> for CallbackReceipt {
    fn from(outcome: &SettlementOutcome) -> Self {
        Self {
            outcome: outcome.kind(),
            order_id: outcome.order().id,
            status: outcome.order().status,
        }
    }
}

/// Renders the `sha256=<hex>` header value for `body`.
pub fn sign_body(secret: &str, body: &[u8]) -> AppResult<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|_| {
        AppError::Unauthorized {
            reason: "webhook secret is unusable",
        }
    })?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

pub fn verify_signature(secret: &str, headers: &HeaderMap, body: &[u8]) -> AppResult<()> {
    let header = headers
        .get(SIGNATURE_HEADER)
        .ok_or(AppError::Unauthorized {
            reason: "missing signature",
        })?
        .to_str()
        .map_err(|_| AppError::Unauthorized {
            reason: "unreadable signature",
        })?;
    let provided = header
        .strip_prefix("sha256=")
        .and_then(|digest| hex::decode(digest).ok())
        .ok_or(AppError::Unauthorized {
            reason: "malformed signature",
        })?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|_| {
        AppError::Unauthorized {
            reason: "webhook secret is unusable",
        }
    })?;
    mac.update(body);
    mac.verify_slice(&provided).map_err(|_| AppError::Unauthorized {
        reason: "bad signature",
    })
}

/// key: webhooks-gateway -> signed settlement callbacks
pub async fn gateway_callback(
    Extension(context): Extension<BillingContext>,
    Extension(secret): Extension<GatewayWebhookSecret>,
    Path(school_id): Path<SchoolId>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let Some(secret) = secret.0.as_deref() else {
        warn!(%school_id, "gateway callback refused: no webhook secret configured");
        return Err(AppError::Unauthorized {
            reason: "callbacks are disabled",
        });
    };
    verify_signature(secret, &headers, &body)?;

    let payload: GatewayCallbackRequest = serde_json::from_slice(&body).map_err(|err| {
        AppError::Validation {
            message: format!("callback body is not valid JSON: {err}"),
            offending: vec!["body".to_string()],
        }
    })?;
    let status = IntentStatus::parse(&payload.status).ok_or_else(|| AppError::Validation {
        message: format!("unknown intent status {}", payload.status),
        offending: vec!["status".to_string()],
    })?;
    info!(%school_id, intent_ref = %payload.intent_ref, ?status, "gateway callback received");

    if let Some(handle) = &context.reconciliation {
        let job = ReconciliationJob::GatewayCallback {
            school_id,
            intent_ref: payload.intent_ref.clone(),
            status,
        };
        if handle.dispatch(job).await.is_ok() {
            return Ok(StatusCode::ACCEPTED.into_response());
        }
        warn!(%school_id, intent_ref = %payload.intent_ref, "reconciliation worker gone; settling inline");
    }

    let outcome = context
        .reconciler
        .handle_callback(school_id, &payload.intent_ref, status, Utc::now())
        .await?;
    Ok((StatusCode::OK, Json(CallbackReceipt::from(&outcome))).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn accepts_matching_signature() {
        let body = br#"{"intent_ref":"pi_1","status":"settled"}"#;
        let signature = sign_body("s3cret", body).unwrap();
        assert!(verify_signature("s3cret", &headers_with(&signature), body).is_ok());
    }

    #[test]
    fn rejects_signature_from_another_secret() {
        let body = br#"{"intent_ref":"pi_1","status":"settled"}"#;
        let signature = sign_body("other", body).unwrap();
        let err = verify_signature("s3cret", &headers_with(&signature), body).unwrap_err();
        assert_eq!(err.kind(), "unauthorized");
    }

    #[test]
    fn rejects_missing_or_malformed_headers() {
        let body = b"{}";
        assert!(verify_signature("s3cret", &HeaderMap::new(), body).is_err());
        assert!(verify_signature("s3cret", &headers_with("md5=abcd"), body).is_err());
        assert!(verify_signature("s3cret", &headers_with("sha256=zz"), body).is_err());
    }
}
