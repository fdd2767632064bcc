//! Bus Errors
//!
//! `BusError` covers validation, delivery and transport failures raised by the
//! message bus. `HandlerError` is the one error type every handler returns.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{RpcError, RpcErrorCode};

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Result type returned by every message handler
pub type HandlerResult<T = ()> = Result<T, HandlerError>;

// ─────────────────────────────────────────────────────────────────────────────
// Bus Error
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised by the message bus and pattern manager
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("No subscriber for topic '{0}'")]
    NoSubscriber(String),

    #[error("Request to '{topic}' timed out after {timeout_ms}ms")]
    Timeout { topic: String, timeout_ms: u64 },

    #[error("Handler failed: {0}")]
    Handler(HandlerError),

    #[error("Remote handler error: {0}")]
    Remote(HandlerError),

    #[error("Message evicted from a full queue (topic '{0}')")]
    QueueOverflow(String),

    #[error("Message bus is shut down")]
    Shutdown,

    #[error("Reply channel closed")]
    ChannelClosed,

    #[error("No async runtime available to drain the queue")]
    NoRuntime,
}

impl BusError {
    /// Whether this error was caused by the caller's input
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BusError::InvalidPattern { .. } | BusError::InvalidTopic { .. }
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handler Error
// ─────────────────────────────────────────────────────────────────────────────

/// Error returned by a subscription or RPC handler
///
/// The optional `code` lets responders report a typed failure (e.g. `NOT_FOUND`)
/// that survives the trip back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<RpcErrorCode>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Create an error carrying a typed code
    pub fn with_code(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_code(RpcErrorCode::InvalidRequest, err.to_string())
    }
}

impl From<RpcError> for HandlerError {
    fn from(err: RpcError) -> Self {
        Self::with_code(err.code, err.message)
    }
}

impl From<BusError> for HandlerError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Handler(inner) | BusError::Remote(inner) => inner,
            other => Self::new(other.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_display() {
        let plain = HandlerError::new("boom");
        assert_eq!(plain.to_string(), "boom");

        let coded = HandlerError::with_code(RpcErrorCode::NotFound, "no such user");
        assert_eq!(coded.to_string(), "[NOT_FOUND] no such user");
    }

    #[test]
    fn test_validation_classification() {
        let err = BusError::InvalidTopic {
            topic: String::new(),
            reason: "topic is empty".into(),
        };
        assert!(err.is_validation());
        assert!(!BusError::Shutdown.is_validation());
    }

    #[test]
    fn test_nested_bus_error_unwraps() {
        let inner = HandlerError::with_code(RpcErrorCode::Forbidden, "nope");
        let converted: HandlerError = BusError::Remote(inner.clone()).into();
        assert_eq!(converted, inner);
    }
}
