use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::decision_log::LoggerStats;
use crate::kpi::AggregationError;
use crate::mitigation::MitigationError;
use crate::policy::{GateError, PolicyError, StoreError};

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub policy_version: u64,
    pub uptime_secs: u64,
    pub decision_log: LoggerStats,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub policy_version: u64,
    pub rules: usize,
    pub mitigation_rules: usize,
}

/// Response to a staged policy.
#[derive(Debug, Serialize)]
pub struct StageResponse {
    pub staged_id: u64,
}

/// Response to a removed mitigation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovedResponse {
    pub rule_id: String,
    pub applied_version: u64,
}

/// Error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        ErrorResponse {
            error: error.into(),
            code: code.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ErrorResponse::new(message, "BAD_REQUEST")
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        ErrorResponse::new(message, "INTERNAL_ERROR")
    }
}

/// An error ready to be sent to the client.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>, code: impl Into<String>) -> Self {
        ApiError {
            status,
            body: ErrorResponse::new(error, code),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            body: ErrorResponse::bad_request(message),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: ErrorResponse::internal_error(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let (status, code) = match &e {
            StoreError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION"),
            StoreError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            StoreError::DeadlineExceeded { .. } => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            StoreError::UnknownVersion(_) => (StatusCode::NOT_FOUND, "UNKNOWN_VERSION"),
        };
        ApiError::new(status, e.to_string(), code)
    }
}

impl From<MitigationError> for ApiError {
    fn from(e: MitigationError) -> Self {
        let (status, code) = match &e {
            MitigationError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION"),
            MitigationError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            MitigationError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            MitigationError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            MitigationError::Store(inner) => return inner.clone().into(),
        };
        ApiError::new(status, e.to_string(), code)
    }
}

impl From<GateError> for ApiError {
    fn from(e: GateError) -> Self {
        let (status, code) = match &e {
            GateError::Disabled => (StatusCode::FORBIDDEN, "PROMOTION_DISABLED"),
            GateError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            GateError::UnknownStaged(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            GateError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION"),
            GateError::Store(inner) => return inner.clone().into(),
        };
        ApiError::new(status, e.to_string(), code)
    }
}

impl From<PolicyError> for ApiError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::Io(io) => ApiError::internal(io.to_string()),
            other => ApiError::new(StatusCode::BAD_REQUEST, other.to_string(), "VALIDATION"),
        }
    }
}

impl From<AggregationError> for ApiError {
    fn from(e: AggregationError) -> Self {
        match e {
            AggregationError::InvalidWindow { .. } => ApiError::bad_request(e.to_string()),
            AggregationError::Source(_) => ApiError::internal(e.to_string()),
        }
    }
}
