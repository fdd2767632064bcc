//! RPC Error Taxonomy
//!
//! Every failure surfaced by the RPC manager is an `RpcError` carrying a
//! stable `RpcErrorCode`, so callers can branch on `code` or `retriable`
//! instead of matching on message text.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{BusError, HandlerError};

/// Result type for RPC manager calls
pub type RpcResult<T> = Result<T, RpcError>;

// ─────────────────────────────────────────────────────────────────────────────
// Error Code
// ─────────────────────────────────────────────────────────────────────────────

/// Stable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcErrorCode {
    InvalidRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    ValidationError,
    InternalError,
    ServiceUnavailable,
    Timeout,
    CircuitBreakerOpen,
    NetworkError,
    ConnectionRefused,
    ConnectionTimeout,
}

impl RpcErrorCode {
    pub const ALL: [RpcErrorCode; 13] = [
        RpcErrorCode::InvalidRequest,
        RpcErrorCode::Unauthorized,
        RpcErrorCode::Forbidden,
        RpcErrorCode::NotFound,
        RpcErrorCode::Conflict,
        RpcErrorCode::ValidationError,
        RpcErrorCode::InternalError,
        RpcErrorCode::ServiceUnavailable,
        RpcErrorCode::Timeout,
        RpcErrorCode::CircuitBreakerOpen,
        RpcErrorCode::NetworkError,
        RpcErrorCode::ConnectionRefused,
        RpcErrorCode::ConnectionTimeout,
    ];

    /// The wire name, e.g. `NOT_FOUND`
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcErrorCode::InvalidRequest => "INVALID_REQUEST",
            RpcErrorCode::Unauthorized => "UNAUTHORIZED",
            RpcErrorCode::Forbidden => "FORBIDDEN",
            RpcErrorCode::NotFound => "NOT_FOUND",
            RpcErrorCode::Conflict => "CONFLICT",
            RpcErrorCode::ValidationError => "VALIDATION_ERROR",
            RpcErrorCode::InternalError => "INTERNAL_ERROR",
            RpcErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            RpcErrorCode::Timeout => "TIMEOUT",
            RpcErrorCode::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
            RpcErrorCode::NetworkError => "NETWORK_ERROR",
            RpcErrorCode::ConnectionRefused => "CONNECTION_REFUSED",
            RpcErrorCode::ConnectionTimeout => "CONNECTION_TIMEOUT",
        }
    }

    /// Whether a call failing with this code may succeed if attempted again
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RpcErrorCode::ServiceUnavailable
                | RpcErrorCode::Timeout
                | RpcErrorCode::NetworkError
                | RpcErrorCode::ConnectionRefused
                | RpcErrorCode::ConnectionTimeout
        )
    }

    /// HTTP-like status code for logging and propagation
    pub fn status_code(&self) -> u16 {
        match self {
            RpcErrorCode::InvalidRequest => 400,
            RpcErrorCode::Unauthorized => 401,
            RpcErrorCode::Forbidden => 403,
            RpcErrorCode::NotFound => 404,
            RpcErrorCode::Conflict => 409,
            RpcErrorCode::ValidationError => 422,
            RpcErrorCode::InternalError => 500,
            RpcErrorCode::NetworkError => 502,
            RpcErrorCode::ServiceUnavailable
            | RpcErrorCode::CircuitBreakerOpen
            | RpcErrorCode::ConnectionRefused => 503,
            RpcErrorCode::Timeout | RpcErrorCode::ConnectionTimeout => 504,
        }
    }

    /// Guess a code from free-form error text.
    ///
    /// Used only for handler errors that did not carry a code.
    pub fn infer(message: &str) -> RpcErrorCode {
        let lower = message.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has(&["connection refused", "econnrefused"]) {
            RpcErrorCode::ConnectionRefused
        } else if has(&["connection timed out", "connect timeout", "etimedout"]) {
            RpcErrorCode::ConnectionTimeout
        } else if has(&["timeout", "timed out"]) {
            RpcErrorCode::Timeout
        } else if has(&["unavailable", "no subscriber"]) {
            RpcErrorCode::ServiceUnavailable
        } else if has(&["network", "connection reset", "broken pipe"]) {
            RpcErrorCode::NetworkError
        } else if has(&["unauthorized", "unauthenticated"]) {
            RpcErrorCode::Unauthorized
        } else if has(&["forbidden", "permission denied", "not allowed"]) {
            RpcErrorCode::Forbidden
        } else if has(&["not found"]) {
            RpcErrorCode::NotFound
        } else if has(&["conflict", "already exists"]) {
            RpcErrorCode::Conflict
        } else if has(&["invalid", "validation", "malformed"]) {
            RpcErrorCode::ValidationError
        } else {
            RpcErrorCode::InternalError
        }
    }
}

impl fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RpcErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RpcErrorCode::ALL
            .into_iter()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| format!("Unknown RPC error code: {}", s))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RPC Error
// ─────────────────────────────────────────────────────────────────────────────

/// Structured error returned by the RPC manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
#[serde(rename_all = "camelCase")]
pub struct RpcError {
    pub code: RpcErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Number of attempts made before giving up
    #[serde(default)]
    pub attempts: u32,
    pub retriable: bool,
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl RpcError {
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            topic: None,
            attempts: 0,
            retriable: code.is_retriable(),
            status_code: code.status_code(),
            details: None,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn circuit_open(topic: &str) -> Self {
        Self::new(
            RpcErrorCode::CircuitBreakerOpen,
            format!("Circuit breaker open for topic '{}'", topic),
        )
        .with_topic(topic)
    }

    pub fn timeout(topic: &str, timeout_ms: u64) -> Self {
        Self::new(
            RpcErrorCode::Timeout,
            format!("Request to '{}' timed out after {}ms", topic, timeout_ms),
        )
        .with_topic(topic)
    }

    /// Classify a bus failure into the RPC taxonomy
    pub fn from_bus(err: BusError, topic: &str) -> Self {
        // A closed bus or missing runtime never recovers for this caller
        let terminal = matches!(err, BusError::Shutdown | BusError::NoRuntime);
        let (code, message) = match err {
            BusError::InvalidPattern { .. } | BusError::InvalidTopic { .. } => {
                (RpcErrorCode::InvalidRequest, err.to_string())
            }
            BusError::NoSubscriber(_) | BusError::QueueOverflow(_) => {
                (RpcErrorCode::ServiceUnavailable, err.to_string())
            }
            BusError::Timeout { .. } => (RpcErrorCode::Timeout, err.to_string()),
            BusError::Handler(inner) | BusError::Remote(inner) => {
                let code = inner.code.unwrap_or_else(|| RpcErrorCode::infer(&inner.message));
                (code, inner.message)
            }
            BusError::Shutdown | BusError::NoRuntime => {
                (RpcErrorCode::ServiceUnavailable, err.to_string())
            }
            BusError::ChannelClosed => (RpcErrorCode::NetworkError, err.to_string()),
        };
        let mut error = Self::new(code, message).with_topic(topic);
        if terminal {
            error.retriable = false;
        }
        error
    }

    /// Message suitable for showing to an end user
    pub fn format_user_message(&self) -> String {
        let summary = match self.code {
            RpcErrorCode::InvalidRequest | RpcErrorCode::ValidationError => {
                "The request was invalid"
            }
            RpcErrorCode::Unauthorized => "Authentication is required",
            RpcErrorCode::Forbidden => "You do not have permission to perform this action",
            RpcErrorCode::NotFound => "The requested resource was not found",
            RpcErrorCode::Conflict => "The request conflicts with the current state",
            RpcErrorCode::InternalError => "An internal error occurred",
            RpcErrorCode::ServiceUnavailable | RpcErrorCode::CircuitBreakerOpen => {
                "The service is temporarily unavailable, please try again later"
            }
            RpcErrorCode::Timeout | RpcErrorCode::ConnectionTimeout => {
                "The service took too long to respond"
            }
            RpcErrorCode::NetworkError | RpcErrorCode::ConnectionRefused => {
                "The service could not be reached"
            }
        };

        match self.code {
            RpcErrorCode::InvalidRequest
            | RpcErrorCode::ValidationError
            | RpcErrorCode::NotFound
            | RpcErrorCode::Conflict => format!("{}: {}", summary, self.message),
            _ => format!("{}.", summary),
        }
    }
}

impl From<HandlerError> for RpcError {
    fn from(err: HandlerError) -> Self {
        let code = err.code.unwrap_or_else(|| RpcErrorCode::infer(&err.message));
        Self::new(code, err.message)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
