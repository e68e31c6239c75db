//! Maps domain errors onto the HTTP response contracts of spec.md §6/§7.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::domain::errors::{RiskViolation, SignalError};

pub enum ApiError {
    InvalidPayload(String),
    Rejected(RiskViolation),
    Forbidden(&'static str),
    NotFound(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::InvalidPayload(reason) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "status": "invalid", "reason": reason }))).into_response()
            }
            ApiError::Rejected(violation) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "status": "rejected", "reason": violation.reason() })),
            )
                .into_response(),
            ApiError::Forbidden(message) => {
                (StatusCode::FORBIDDEN, Json(json!({ "error": message }))).into_response()
            }
            ApiError::NotFound(what) => {
                (StatusCode::NOT_FOUND, Json(json!({ "status": "not_found", "reason": what }))).into_response()
            }
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "control api: internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "status": "error", "reason": err.to_string() })))
                    .into_response()
            }
        }
    }
}

impl From<RiskViolation> for ApiError {
    fn from(v: RiskViolation) -> Self {
        ApiError::Rejected(v)
    }
}

impl From<SignalError> for ApiError {
    fn from(e: SignalError) -> Self {
        match e {
            SignalError::InvalidPayload { reason } => ApiError::InvalidPayload(reason),
            SignalError::Rejected(violation) => ApiError::Rejected(violation),
            SignalError::ExchangeFailed { reason } => ApiError::Internal(anyhow::anyhow!(reason)),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
