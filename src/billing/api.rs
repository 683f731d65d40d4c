use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::notify::notify_detached;
use super::{
    BillingContext, BillingPeriod, CreateOrderRequest, CreatedOrder, FinancialStats,
    GenerationSummary, Invoice, InvoiceDetail, IssuedToken, Money, PaymentMethod, PaymentRequest,
    PaymentTarget, RecordedPayment, RetailOrder, SchoolId,
};
use crate::error::{AppError, AppResult};
use crate::job_queue::{Job, JobQueue};
use crate::telemetry::BillingEvent;

#[derive(Debug, Deserialize)]
pub struct PeriodQuery {
    pub month: u32,
    pub year: i32,
}

impl PeriodQuery {
    fn period(&self) -> AppResult<BillingPeriod> {
        BillingPeriod::new(self.month, self.year)
    }
}

#[derive(Debug, Deserialize)]
pub struct GenerateInvoicesRequest {
    pub month: u32,
    pub year: i32,
    /// Queue the run on the worker pool instead of waiting for it.
    #[serde(default)]
    pub defer: bool,
}

#[derive(Debug, Serialize)]
pub struct GenerateInvoicesResponse {
    pub queued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<GenerationSummary>,
}

/// key: billing-api -> rest endpoints
pub async fn generate_invoices(
    Extension(context): Extension<BillingContext>,
    Extension(jobs): Extension<JobQueue>,
    Path(school_id): Path<SchoolId>,
    Json(payload): Json<GenerateInvoicesRequest>,
) -> AppResult<(StatusCode, Json<GenerateInvoicesResponse>)> {
    let now = Utc::now();
    let period = BillingPeriod::new(payload.month, payload.year)?;

    if payload.defer {
        period.validate_for_generation(now.date_naive())?;
        if !jobs.submit(Job::GenerateInvoices { school_id, period }).await {
            return Err(AppError::Timeout {
                operation: "enqueue_generate_invoices",
            });
        }
        return Ok((
            StatusCode::ACCEPTED,
            Json(GenerateInvoicesResponse {
                queued: true,
                summary: None,
            }),
        ));
    }

    let summary = context
        .invoices
        .generate_invoices(school_id, period, now)
        .await?;
    if summary.created_count > 0 {
        notify_detached(
            context.notifier.clone(),
            "invoices.generated",
            json!({
                "school_id": school_id,
                "period": period.to_string(),
                "created_count": summary.created_count,
            }),
        );
    }

    Ok((
        StatusCode::OK,
        Json(GenerateInvoicesResponse {
            queued: false,
            summary: Some(summary),
        }),
    ))
}

pub async fn list_invoices(
    Extension(context): Extension<BillingContext>,
    Path(school_id): Path<SchoolId>,
    Query(query): Query<PeriodQuery>,
) -> AppResult<Json<Vec<Invoice>>> {
    let invoices = context
        .invoices
        .list_invoices(school_id, query.period()?)
        .await?;
    Ok(Json(invoices))
}

pub async fn invoice_detail(
    Extension(context): Extension<BillingContext>,
    Path((school_id, invoice_id)): Path<(SchoolId, Uuid)>,
) -> AppResult<Json<InvoiceDetail>> {
    Ok(Json(context.invoices.invoice_detail(school_id, invoice_id).await?))
}

pub async fn cancel_invoice(
    Extension(context): Extension<BillingContext>,
    Path((school_id, invoice_id)): Path<(SchoolId, Uuid)>,
) -> AppResult<Json<Invoice>> {
    let invoice = context
        .invoices
        .cancel_invoice(school_id, invoice_id, Utc::now())
        .await?;
    Ok(Json(invoice))
}

#[derive(Debug, Deserialize)]
pub struct RegisterPaymentRequest {
    #[serde(default)]
    pub invoice_id: Option<Uuid>,
    #[serde(default)]
    pub order_id: Option<Uuid>,
    /// Decimal string, e.g. `"450.00"`.
    pub amount: String,
    pub method: String,
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
    pub recorded_by: String,
}

impl RegisterPaymentRequest {
    fn into_request(self, now: DateTime<Utc>) -> AppResult<PaymentRequest> {
        let mut offending = Vec::new();
        let amount = Money::parse_decimal(&self.amount);
        if amount.is_none() {
            offending.push("amount".to_string());
        }
        let method = PaymentMethod::parse(&self.method);
        if method.is_none() {
            offending.push("method".to_string());
        }
        let target = match (self.invoice_id, self.order_id) {
            (Some(invoice_id), None) => Some(PaymentTarget::Invoice(invoice_id)),
            (None, order_id) => Some(PaymentTarget::AdHoc { order_id }),
            (Some(_), Some(_)) => {
                offending.push("invoice_id".to_string());
                offending.push("order_id".to_string());
                None
            }
        };

        match (amount, method, target) {
            (Some(amount), Some(method), Some(target)) => Ok(PaymentRequest {
                target,
                amount,
                method,
                paid_at: self.paid_at.unwrap_or(now),
                recorded_by: self.recorded_by,
            }),
            _ => Err(AppError::Validation {
                message: "payment request is malformed".to_string(),
                offending,
            }),
        }
    }
}

pub async fn register_payment(
    Extension(context): Extension<BillingContext>,
    Path(school_id): Path<SchoolId>,
    Json(payload): Json<RegisterPaymentRequest>,
) -> AppResult<(StatusCode, Json<RecordedPayment>)> {
    let now = Utc::now();
    let request = payload.into_request(now)?;
    let recorded = context
        .payments
        .register_payment(school_id, request, now)
        .await?;
    Ok((StatusCode::CREATED, Json(recorded)))
}

#[derive(Debug, Deserialize)]
pub struct ReversePaymentRequest {
    pub recorded_by: String,
}

pub async fn reverse_payment(
    Extension(context): Extension<BillingContext>,
    Path((school_id, payment_id)): Path<(SchoolId, Uuid)>,
    Json(payload): Json<ReversePaymentRequest>,
) -> AppResult<(StatusCode, Json<RecordedPayment>)> {
    let recorded = context
        .payments
        .reverse_payment(school_id, payment_id, &payload.recorded_by, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(recorded)))
}

pub async fn financial_stats(
    Extension(context): Extension<BillingContext>,
    Path(school_id): Path<SchoolId>,
    Query(query): Query<PeriodQuery>,
) -> AppResult<Json<FinancialStats>> {
    let stats = context
        .stats
        .compute_financial_stats(school_id, query.period()?)
        .await?;
    Ok(Json(stats))
}

pub async fn create_order(
    Extension(context): Extension<BillingContext>,
    Path(school_id): Path<SchoolId>,
    Json(payload): Json<CreateOrderRequest>,
) -> AppResult<(StatusCode, Json<CreatedOrder>)> {
    let created = context
        .orders
        .create_order(school_id, payload, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn order_status(
    Extension(context): Extension<BillingContext>,
    Path((school_id, order_id)): Path<(SchoolId, Uuid)>,
) -> AppResult<Json<RetailOrder>> {
    Ok(Json(context.orders.order_status(school_id, order_id).await?))
}

pub async fn reissue_token(
    Extension(context): Extension<BillingContext>,
    Path((school_id, order_id)): Path<(SchoolId, Uuid)>,
) -> AppResult<(StatusCode, Json<IssuedToken>)> {
    let issued = context
        .tokens
        .issue_token(school_id, order_id, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(issued)))
}

#[derive(Debug, Deserialize)]
pub struct RedeemTokenRequest {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct RedeemTokenResponse {
    pub order_id: Uuid,
}

pub async fn redeem_token(
    Extension(context): Extension<BillingContext>,
    Path(school_id): Path<SchoolId>,
    Json(payload): Json<RedeemTokenRequest>,
) -> AppResult<Json<RedeemTokenResponse>> {
    let order_id = context
        .tokens
        .consume_token(school_id, &payload.token, Utc::now())
        .await?;
    Ok(Json(RedeemTokenResponse { order_id }))
}

pub async fn list_billing_events(
    Extension(context): Extension<BillingContext>,
    Path(school_id): Path<SchoolId>,
) -> AppResult<Json<Vec<BillingEvent>>> {
    Ok(Json(context.store.list_billing_events(school_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(invoice_id: Option<Uuid>, order_id: Option<Uuid>, amount: &str, method: &str) -> RegisterPaymentRequest {
        RegisterPaymentRequest {
            invoice_id,
            order_id,
            amount: amount.into(),
            method: method.into(),
            paid_at: None,
            recorded_by: "secretaria".into(),
        }
    }

    #[test]
    fn decimal_amounts_become_minor_units() {
        let invoice_id = Uuid::new_v4();
        let request = payload(Some(invoice_id), None, "450.5", "bank-slip")
            .into_request(Utc::now())
            .unwrap();
        assert_eq!(request.amount, Money::from_minor(45_050));
        assert_eq!(request.method, PaymentMethod::BankSlip);
        assert_eq!(request.target, PaymentTarget::Invoice(invoice_id));
    }

    #[test]
    fn malformed_fields_are_all_reported() {
        let err = payload(Some(Uuid::new_v4()), Some(Uuid::new_v4()), "4,50", "pix")
            .into_request(Utc::now())
            .unwrap_err();
        match err {
            AppError::Validation { offending, .. } => {
                assert_eq!(offending, vec!["amount", "method", "invoice_id", "order_id"])
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
