use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::suborder::SubOrderStatus;

/// Every failure in the core maps to one of these kinds. Callers branch on the
/// stable `kind` string in the response body, not on the status code.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("illegal transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: SubOrderStatus,
        to: SubOrderStatus,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no idle delivery unit available")]
    Busy,

    #[error("sub-order {0} already has an active assignment")]
    AlreadyAssigned(Uuid),

    #[error("token invalid: {0}")]
    TokenInvalid(String),

    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "validation",
            AppError::InvalidTransition { .. } => "invalid_transition",
            AppError::Conflict(_) => "conflict",
            AppError::Busy => "busy",
            AppError::AlreadyAssigned(_) => "already_assigned",
            AppError::TokenInvalid(_) => "token_invalid",
            AppError::TransientNetwork(_) => "transient_network",
            AppError::Internal(_) => "internal",
        }
    }

    /// Whether retrying the same request unchanged can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Busy | AppError::TransientNetwork(_))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Conflict(_) | AppError::Busy | AppError::AlreadyAssigned(_) => {
                StatusCode::CONFLICT
            }
            AppError::TokenInvalid(_) => StatusCode::GONE,
            AppError::TransientNetwork(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string(),
            "kind": self.kind(),
        }));

        (status, body).into_response()
    }
}
