//! API error handling.
//!
//! Provides consistent error responses for the API. Every failure body names
//! the error kind and, for tool-level failures, the pipeline stage.

use std::sync::Arc;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::{Error, Stage};

/// API error response body.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ApiErrorResponse {
    /// Error kind for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Pipeline stage the failure occurred in, when attributable to one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
}

/// API error type that can be converted to HTTP responses.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub stage: Option<Stage>,
}

impl ApiError {
    /// Create a new API error.
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            stage: None,
        }
    }

    /// Attach the failing pipeline stage.
    pub fn with_stage(mut self, stage: Option<Stage>) -> Self {
        self.stage = stage;
        self
    }

    /// Create a 404 Not Found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    /// Create a 409 Conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    /// Create a 422 Unprocessable Entity error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "INVALID_REQUEST", message)
    }

    /// Create a 500 Internal Server Error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            code: self.code,
            message: self.message,
            stage: self.stage,
        };
        (self.status, Json(body)).into_response()
    }
}

/// Map a domain error to status + body. Shared by the owned and shared
/// (`Arc`, from deduplicated job results) conversions.
fn map_error(err: &Error) -> ApiError {
    let status = match err {
        Error::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Overloaded => StatusCode::TOO_MANY_REQUESTS,
        Error::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::ToolTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        Error::Cancelled => StatusCode::CONFLICT,
        Error::JobNotFound(_) => StatusCode::NOT_FOUND,
        Error::ToolFailed { .. } | Error::NoOutputProduced => StatusCode::INTERNAL_SERVER_ERROR,
        Error::Serialization(_) | Error::Io { .. } | Error::Internal(_) => {
            tracing::error!("Unexpected error: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    // Internal detail does not belong in responses.
    let message = match err {
        Error::Serialization(_) | Error::Io { .. } | Error::Internal(_) => {
            "An unexpected error occurred".to_string()
        }
        _ => err.to_string(),
    };

    ApiError::new(status, err.kind(), message).with_stage(err.stage())
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        map_error(&err)
    }
}

impl From<Arc<Error>> for ApiError {
    fn from(err: Arc<Error>) -> Self {
        map_error(&err)
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_status_mapping() {
        let cases = [
            (Error::invalid_request("x"), StatusCode::UNPROCESSABLE_ENTITY),
            (Error::Overloaded, StatusCode::TOO_MANY_REQUESTS),
            (
                Error::resource_exhausted("disk"),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                Error::ToolTimeout {
                    stage: Stage::Extracting,
                    timeout_secs: 1,
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (Error::NoOutputProduced, StatusCode::INTERNAL_SERVER_ERROR),
            (Error::Cancelled, StatusCode::CONFLICT),
            (Error::JobNotFound("j".into()), StatusCode::NOT_FOUND),
        ];

        for (error, expected) in cases {
            let api: ApiError = error.into();
            assert_eq!(api.status, expected, "{}", api.code);
        }
    }

    #[test]
    fn test_tool_failure_carries_stage() {
        let api: ApiError = Error::ToolFailed {
            stage: Stage::Transcoding,
            exit_code: 1,
            detail: "boom".into(),
        }
        .into();
        assert_eq!(api.stage, Some(Stage::Transcoding));
        assert_eq!(api.code, "TOOL_FAILED");
    }

    #[test]
    fn test_internal_detail_is_not_leaked() {
        let api: ApiError = Error::internal("secret pipeline state").into();
        assert!(!api.message.contains("secret"));
    }
}
