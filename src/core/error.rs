//! Error handling for the gateway
//!
//! One error type for the whole core. `Deferred` and `NotImplemented` double
//! as control flow inside the batch orchestrator and never reach the wire
//! from there.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

use crate::core::types::ApiError;

/// Result type alias for the gateway.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Main error type for the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Driver does not support the operation.
    #[error("not implemented")]
    NotImplemented,

    /// Model, alias, or batch id is unknown.
    #[error("model or alias is not found")]
    NotFound,

    /// The resolved model's driver does not implement the batch contract.
    #[error("model is not available for batching")]
    NotBatchable,

    /// Driver defers the upload until send; orchestrator-internal.
    #[error("batch upload is deferred until send")]
    Deferred,

    /// Validation failure on one input line.
    #[error("request/{location} ({custom_id}) is malformed: {message}")]
    Malformed {
        location: usize,
        custom_id: String,
        message: String,
    },

    /// Durable store failure.
    #[error("bookkeeping: {0}")]
    Bookkeeping(#[from] sqlx::Error),

    /// Image MIME outside the supported set.
    #[error("mime type {0:?} is not supported")]
    UnsupportedMime(String),

    /// Role other than system/user/assistant.
    #[error("message/{index}: role {role:?} is not supported")]
    UnsupportedRole { index: usize, role: String },

    /// System message anywhere but first.
    #[error("system message/{index} is misplaced")]
    MisplacedSystem { index: usize },

    /// Consecutive user or assistant messages.
    #[error("message/{index} is not alternating")]
    NotAlternating { index: usize },

    /// Receive called before an output locator exists.
    #[error("batch output is not available yet")]
    BatchIncomplete,

    /// Transient provider failure; retried at the refresh cadence.
    #[error("transient provider failure: {0}")]
    Retry(String),

    /// Terminal upstream failure.
    #[error("{message}")]
    Provider { kind: String, message: String },

    /// Configuration failure at startup.
    #[error("configuration: {0}")]
    Config(String),

    /// Caller-side request problem outside the batch validator.
    #[error("{0}")]
    InvalidRequest(String),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("upstream: {0}")]
    Http(#[from] reqwest::Error),
}

impl GatewayError {
    pub fn provider(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// The OpenAI-style error type string for the response body.
    pub fn error_type(&self) -> &str {
        match self {
            GatewayError::Provider { kind, .. } => kind,
            GatewayError::Bookkeeping(_) | GatewayError::Io(_) => "error",
            _ => "invalid_request_error",
        }
    }

    /// Whether a retry at the next drain or refresh pass may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Retry(_) => true,
            GatewayError::Http(e) => e.is_timeout() || e.is_connect(),
            GatewayError::Provider { kind, .. } => {
                kind == "rate_limit_error" || kind == "overloaded_error"
            }
            _ => false,
        }
    }

    /// Convert to the OpenAI-shaped error object.
    pub fn api_error(&self) -> ApiError {
        ApiError {
            message: self.to_string(),
            kind: self.error_type().to_string(),
            ..Default::default()
        }
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            GatewayError::Bookkeeping(_)
            | GatewayError::Io(_)
            | GatewayError::Config(_)
            | GatewayError::Provider { .. }
            | GatewayError::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        // bookkeeping details stay in the log, not on the wire
        let message = match self {
            GatewayError::Bookkeeping(_) => "bookkeeping error".to_string(),
            other => other.to_string(),
        };
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "message": message,
                "type": self.error_type(),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            GatewayError::NotImplemented.status_code(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            GatewayError::NotFound.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::Bookkeeping(sqlx::Error::RowNotFound).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::Malformed {
                location: 3,
                custom_id: "x".into(),
                message: "duplicate custom_id".into(),
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn error_type_defaults_to_invalid_request() {
        assert_eq!(GatewayError::NotFound.error_type(), "invalid_request_error");
        assert_eq!(
            GatewayError::provider("rate_limit_error", "slow down").error_type(),
            "rate_limit_error"
        );
    }

    #[test]
    fn bookkeeping_body_is_opaque() {
        let resp = GatewayError::Bookkeeping(sqlx::Error::RowNotFound).error_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
