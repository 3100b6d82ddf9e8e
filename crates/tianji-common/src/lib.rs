//! Shared error model and process-wide settings.

use serde::{Deserialize, Serialize};
use tianji_protocol::error::ErrorEnvelope;

/// Error classes the gateway exposes to clients, each with a fixed HTTP
/// status and a retriability flag the dispatcher consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequestError,
    AuthenticationError,
    NotFound,
    RateLimitError,
    BadGateway,
    ServiceUnavailable,
    InternalError,
    Timeout,
}

impl ErrorKind {
    pub fn status(self) -> u16 {
        match self {
            ErrorKind::InvalidRequestError => 400,
            ErrorKind::AuthenticationError => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::RateLimitError => 429,
            ErrorKind::InternalError => 500,
            ErrorKind::BadGateway => 502,
            ErrorKind::ServiceUnavailable => 503,
            ErrorKind::Timeout => 504,
        }
    }

    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimitError
                | ErrorKind::BadGateway
                | ErrorKind::ServiceUnavailable
                | ErrorKind::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidRequestError => "invalid_request_error",
            ErrorKind::AuthenticationError => "authentication_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::RateLimitError => "rate_limit_error",
            ErrorKind::BadGateway => "bad_gateway",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::InternalError => "internal_error",
            ErrorKind::Timeout => "timeout",
        }
    }
}

/// A tagged error that bubbles through dispatch and is rendered into the
/// JSON envelope exactly once, at the HTTP boundary.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
    pub code: Option<String>,
    /// Original upstream status, when the error wraps an upstream reply.
    pub upstream_status: Option<u16>,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            upstream_status: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_upstream_status(mut self, status: u16) -> Self {
        self.upstream_status = Some(status);
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequestError, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    pub fn status(&self) -> u16 {
        self.kind.status()
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        let env = ErrorEnvelope::new(self.kind.as_str(), self.message.clone());
        match &self.code {
            Some(code) => env.with_code(code.clone()),
            None => env,
        }
    }

    pub fn envelope_json(&self) -> String {
        serde_json::to_string(&self.envelope())
            .unwrap_or_else(|_| r#"{"error":{"message":"internal error","type":"internal_error"}}"#.to_string())
    }
}

/// `general_settings` from the config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneralSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auxiliary_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_idle_timeout_ms: Option<u64>,
}

impl GeneralSettings {
    pub const DEFAULT_COMPLETION_TIMEOUT_MS: u64 = 600_000;
    pub const DEFAULT_AUXILIARY_TIMEOUT_MS: u64 = 60_000;
    pub const DEFAULT_STREAM_IDLE_TIMEOUT_MS: u64 = 120_000;
}

/// `router_settings` from the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterSettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    2
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}
