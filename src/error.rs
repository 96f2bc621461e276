//! Error types for the gateway.
//!
//! Every caller-visible failure maps to a fixed HTTP status and machine-readable
//! code, rendered as `{"error": {"message", "type", "param", "code"}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::cache::CacheError;
use crate::store::StoreError;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("{message}")]
    InvalidApiKey { message: String },

    #[error("Rate limit exceeded: {limit} requests per {window_secs}s")]
    RateLimitExceeded { limit: u32, window_secs: u64 },

    #[error("{message}")]
    InsufficientBalance { message: String },

    #[error("The model '{model}' does not exist or is not active")]
    ModelNotFound { model: String },

    #[error("This API key is not allowed to use model '{model}'")]
    ModelNotAllowed { model: String },

    #[error("No available channel for model '{model}'")]
    NoAvailableChannel { model: String },

    #[error("{message}")]
    InvalidRequest {
        message: String,
        param: Option<String>,
    },

    #[error("Upstream error: {message}")]
    Upstream { message: String },

    #[error("Provider '{name}' has no registered adapter")]
    UnregisteredProvider { name: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn invalid_api_key(msg: impl Into<String>) -> Self {
        Self::InvalidApiKey {
            message: msg.into(),
        }
    }

    pub fn insufficient_balance(msg: impl Into<String>) -> Self {
        Self::InsufficientBalance {
            message: msg.into(),
        }
    }

    pub fn invalid_request(msg: impl Into<String>, param: Option<&str>) -> Self {
        Self::InvalidRequest {
            message: msg.into(),
            param: param.map(String::from),
        }
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidApiKey { .. } => StatusCode::UNAUTHORIZED,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            Self::ModelNotAllowed { .. } => StatusCode::FORBIDDEN,
            Self::NoAvailableChannel { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Upstream { .. } | Self::UnregisteredProvider { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidApiKey { .. } => "invalid_api_key",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::ModelNotFound { .. } => "model_not_found",
            Self::ModelNotAllowed { .. } => "model_not_allowed",
            Self::NoAvailableChannel { .. } => "no_available_channel",
            Self::InvalidRequest { .. } => "invalid_request_error",
            Self::Upstream { .. } | Self::UnregisteredProvider { .. } => "upstream_error",
            _ => "internal_error",
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidApiKey { .. } => "authentication_error",
            Self::RateLimitExceeded { .. } => "rate_limit_error",
            Self::InsufficientBalance { .. } => "billing_error",
            Self::ModelNotFound { .. } | Self::InvalidRequest { .. } => "invalid_request_error",
            Self::ModelNotAllowed { .. } => "permission_error",
            Self::NoAvailableChannel { .. } => "service_unavailable",
            Self::Upstream { .. } | Self::UnregisteredProvider { .. } => "upstream_error",
            _ => "internal_error",
        }
    }

    pub fn param(&self) -> Option<&str> {
        match self {
            Self::InvalidRequest { param, .. } => param.as_deref(),
            Self::ModelNotFound { .. } | Self::ModelNotAllowed { .. } => Some("model"),
            _ => None,
        }
    }

    /// Whether the error is an infrastructure failure whose detail must not reach the caller.
    pub fn is_internal(&self) -> bool {
        self.status() == StatusCode::INTERNAL_SERVER_ERROR
    }

    /// The message shown to the caller.
    pub fn public_message(&self) -> String {
        if self.is_internal() {
            "Internal server error".to_string()
        } else {
            self.to_string()
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: ErrorBody {
                message: self.public_message(),
                error_type: self.error_type().to_string(),
                param: self.param().map(String::from),
                code: self.code().to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub param: Option<String>,
    pub code: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if self.is_internal() {
            tracing::error!(error = %self, "internal error");
        }
        (self.status(), Json(self.envelope())).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_code_taxonomy() {
        let cases = [
            (GatewayError::invalid_api_key("x"), 401, "invalid_api_key"),
            (
                GatewayError::RateLimitExceeded {
                    limit: 1,
                    window_secs: 60,
                },
                429,
                "rate_limit_exceeded",
            ),
            (GatewayError::insufficient_balance("x"), 402, "insufficient_balance"),
            (
                GatewayError::ModelNotFound { model: "m".into() },
                404,
                "model_not_found",
            ),
            (
                GatewayError::ModelNotAllowed { model: "m".into() },
                403,
                "model_not_allowed",
            ),
            (
                GatewayError::NoAvailableChannel { model: "m".into() },
                503,
                "no_available_channel",
            ),
            (
                GatewayError::invalid_request("bad", Some("messages")),
                400,
                "invalid_request_error",
            ),
            (GatewayError::upstream("x"), 502, "upstream_error"),
            (GatewayError::internal("boom"), 500, "internal_error"),
        ];

        for (err, status, code) in cases {
            assert_eq!(err.status().as_u16(), status, "{err:?}");
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn test_internal_detail_is_hidden() {
        let err = GatewayError::internal("connection string postgres://secret");
        let envelope = err.envelope();
        assert_eq!(envelope.error.message, "Internal server error");
        assert_eq!(envelope.error.code, "internal_error");
    }

    #[test]
    fn test_invalid_request_names_param() {
        let err = GatewayError::invalid_request("temperature must be between 0 and 2", Some("temperature"));
        let envelope = err.envelope();
        assert_eq!(envelope.error.param.as_deref(), Some("temperature"));
        assert_eq!(envelope.error.error_type, "invalid_request_error");
    }
}
