use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Postgres SQLSTATE codes the ledger reacts to.
const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        offending: Vec<String>,
    },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{entity} {id} conflict: {reason}")]
    Conflict {
        entity: &'static str,
        id: String,
        reason: String,
    },
    #[error("invoice {invoice_id} is already settled")]
    AlreadySettled { invoice_id: uuid::Uuid },
    #[error("payment gateway error for order {order_id}: {message}")]
    Gateway {
        order_id: uuid::Uuid,
        message: String,
    },
    #[error("{entity} {id} has expired")]
    Expired { entity: &'static str, id: String },
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: &'static str },
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation {
            message: message.into(),
            offending: Vec::new(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        AppError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(entity: &'static str, id: impl ToString, reason: impl Into<String>) -> Self {
        AppError::Conflict {
            entity,
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn expired(entity: &'static str, id: impl ToString) -> Self {
        AppError::Expired {
            entity,
            id: id.to_string(),
        }
    }

    /// Stable machine-readable kind surfaced to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation { .. } => "validation_error",
            AppError::NotFound { .. } => "not_found",
            AppError::Conflict { .. } => "conflict",
            AppError::AlreadySettled { .. } => "already_settled",
            AppError::Gateway { .. } => "external_gateway_error",
            AppError::Expired { .. } => "expired",
            AppError::Unauthorized { .. } => "unauthorized",
            AppError::Db(_) => "storage_error",
            AppError::Timeout { .. } => "timeout",
        }
    }

    /// Errors worth an optimistic retry: serialization conflicts, deadlocks, timeouts.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Timeout { .. } => true,
            AppError::Db(sqlx::Error::PoolTimedOut) => true,
            AppError::Db(err) => matches!(
                sqlstate(err).as_deref(),
                Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED)
            ),
            _ => false,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::Conflict { .. } | AppError::AlreadySettled { .. } => StatusCode::CONFLICT,
            AppError::Gateway { .. } => StatusCode::BAD_GATEWAY,
            AppError::Expired { .. } => StatusCode::GONE,
            AppError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            AppError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> serde_json::Value {
        let mut body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        match self {
            AppError::Validation { offending, .. } if !offending.is_empty() => {
                body["offending"] = json!(offending);
            }
            AppError::NotFound { entity, id }
            | AppError::Conflict { entity, id, .. }
            | AppError::Expired { entity, id } => {
                body["entity"] = json!(entity);
                body["id"] = json!(id);
            }
            AppError::AlreadySettled { invoice_id } => {
                body["entity"] = json!("invoice");
                body["id"] = json!(invoice_id);
            }
            AppError::Gateway { order_id, .. } => {
                body["entity"] = json!("retail_order");
                body["id"] = json!(order_id);
            }
            _ => {}
        }
        body
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = ?self, kind = self.kind());
        } else {
            tracing::debug!(error = %self, kind = self.kind());
        }
        (status, Json(self.body())).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code.into_owned())
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some(UNIQUE_VIOLATION)
}

pub fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some(FOREIGN_KEY_VIOLATION)
}
