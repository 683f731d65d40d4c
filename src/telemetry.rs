use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::billing::SchoolId;

/// Business exceptions that need a human: refunds and gateway outages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventType {
    RefundRequired,
    OperatorReview,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::RefundRequired => "refund_required",
            BillingEventType::OperatorReview => "operator_review",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "refund_required" => Some(BillingEventType::RefundRequired),
            "operator_review" => Some(BillingEventType::OperatorReview),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: Uuid,
    pub school_id: SchoolId,
    pub order_id: Uuid,
    pub event_type: BillingEventType,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

impl BillingEvent {
    /// Builds an event after checking its detail payload carries what operators need.
    pub fn new(
        school_id: SchoolId,
        order_id: Uuid,
        event_type: BillingEventType,
        details: Value,
        now: DateTime<Utc>,
    ) -> Result<Self, EventValidationError> {
        validate_event_details(event_type, &details)?;
        Ok(Self {
            id: Uuid::new_v4(),
            school_id,
            order_id,
            event_type,
            details,
            created_at: now,
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventValidationError {
    #[error("billing event `{event_type}` details must be a JSON object")]
    NotAnObject { event_type: &'static str },
    #[error("billing event `{event_type}` missing required detail `{field}`")]
    MissingField {
        event_type: &'static str,
        field: &'static str,
    },
}

pub fn validate_event_details(
    event_type: BillingEventType,
    details: &Value,
) -> Result<(), EventValidationError> {
    let name = event_type.as_str();
    if !details.is_object() {
        return Err(EventValidationError::NotAnObject { event_type: name });
    }
    match event_type {
        BillingEventType::RefundRequired => {
            require_field(details, name, "reason")?;
            require_field(details, name, "amount_cents")?;
            require_field(details, name, "payment_intent_ref")?;
        }
        BillingEventType::OperatorReview => {
            require_field(details, name, "reason")?;
            require_field(details, name, "attempts")?;
        }
    }
    Ok(())
}

fn require_field<'a>(
    payload: &'a Value,
    event_type: &'static str,
    field: &'static str,
) -> Result<&'a Value, EventValidationError> {
    payload
        .get(field)
        .filter(|value| !value.is_null())
        .ok_or(EventValidationError::MissingField { event_type, field })
}
