use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::models::{Buyer, IntentStatus, Money, PaymentIntent};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to reach payment gateway: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("payment gateway answered {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("payment gateway reported unknown intent status `{0}`")]
    UnknownStatus(String),
    #[error("payment gateway did not answer within {0:?}")]
    Timeout(Duration),
}

/// What the gateway needs to open an instant-payment intent.
#[derive(Debug, Clone, Serialize)]
pub struct IntentRequest {
    pub reference: Uuid,
    pub amount_cents: Money,
    pub buyer: Buyer,
    pub expires_at: DateTime<Utc>,
}

/// key: payment-gateway -> external instant-payment provider
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn request_payment_intent(
        &self,
        request: &IntentRequest,
    ) -> Result<PaymentIntent, GatewayError>;
    async fn intent_status(&self, intent_ref: &str) -> Result<IntentStatus, GatewayError>;
}

/// Bounds a gateway call by `limit` on top of the client's own timeout.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, GatewayError>
where
    F: std::future::Future<Output = Result<T, GatewayError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(GatewayError::Timeout(limit)))
}

#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IntentResponse {
    id: String,
    qr_payload: String,
    copy_paste_code: String,
}

#[derive(Debug, Deserialize)]
struct IntentStatusResponse {
    status: String,
}

impl HttpPaymentGateway {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(key) = &self.api_key {
            request.bearer_auth(key)
        } else {
            request
        }
    }

    async fn checked(response: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(GatewayError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn request_payment_intent(
        &self,
        request: &IntentRequest,
    ) -> Result<PaymentIntent, GatewayError> {
        let response = self
            .auth(self.client.post(self.endpoint("v1/intents")))
            .json(request)
            .send()
            .await?;
        let parsed: IntentResponse = Self::checked(response).await?.json().await?;

        Ok(PaymentIntent {
            intent_ref: parsed.id,
            qr_payload: parsed.qr_payload,
            copy_paste_code: parsed.copy_paste_code,
        })
    }

    async fn intent_status(&self, intent_ref: &str) -> Result<IntentStatus, GatewayError> {
        let response = self
            .auth(
                self.client
                    .get(self.endpoint(&format!("v1/intents/{intent_ref}"))),
            )
            .send()
            .await?;
        let parsed: IntentStatusResponse = Self::checked(response).await?.json().await?;

        IntentStatus::parse(&parsed.status).ok_or(GatewayError::UnknownStatus(parsed.status))
    }
}
