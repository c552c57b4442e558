//! Gateway error kinds and the JSON error envelope.
//!
//! Every failure surfaced to a client is rendered as
//! `{"error": {"type", "code", "message"}}` with the HTTP status chosen by
//! kind. Cache and response-store failures never reach this type; they are
//! logged and swallowed at their call sites.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{message}")]
    Validation {
        code: &'static str,
        message: String,
    },

    #[error("missing API key")]
    MissingApiKey,

    #[error("invalid API key")]
    InvalidApiKey,

    #[error("previous response not found: {0}")]
    PreviousResponseNotFound(String),

    #[error("all providers failed. Last error: {last}")]
    AllProvidersFailed { last: String },

    #[error("no providers available for this request")]
    NoProvidersAvailable,

    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        GatewayError::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Validation { .. } => "invalid_request_error",
            GatewayError::MissingApiKey | GatewayError::InvalidApiKey => "authentication_error",
            GatewayError::PreviousResponseNotFound(_) => "not_found_error",
            GatewayError::AllProvidersFailed { .. } | GatewayError::NoProvidersAvailable => {
                "api_error"
            }
            GatewayError::Internal(_) => "api_error",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation { code, .. } => code,
            GatewayError::MissingApiKey => "missing_api_key",
            GatewayError::InvalidApiKey => "invalid_api_key",
            GatewayError::PreviousResponseNotFound(_) => "previous_response_not_found",
            GatewayError::AllProvidersFailed { .. } => "provider_error",
            GatewayError::NoProvidersAvailable => "no_providers_available",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    pub fn envelope(&self) -> serde_json::Value {
        json!({
            "error": {
                "type": self.error_type(),
                "code": self.code(),
                "message": self.to_string(),
            }
        })
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Validation { .. } => StatusCode::BAD_REQUEST,
            GatewayError::MissingApiKey | GatewayError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            GatewayError::PreviousResponseNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::AllProvidersFailed { .. } | GatewayError::NoProvidersAvailable => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(self.envelope())
    }
}
