//! Messages
//!
//! A message is created on publish, carried through the queue, and handed to
//! every matching handler. Payloads are in-process `serde_json::Value`s.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::HandlerError;

/// Subscription identifier
pub type SubscriptionId = String;

/// Message identifier
pub type MessageId = String;

// ─────────────────────────────────────────────────────────────────────────────
// Priority
// ─────────────────────────────────────────────────────────────────────────────

/// Delivery priority; `High` is serviced before `Normal` before `Low`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Queue tier index, 0 is serviced first
    pub fn tier(&self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message
// ─────────────────────────────────────────────────────────────────────────────

/// A message travelling through the bus
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub topic: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    /// Failed delivery passes so far
    pub attempts: u32,
    pub max_retries: u32,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Absolute expiry on the monotonic clock
    pub expires_at: Option<Instant>,
}

impl Message {
    /// Create a message with default priority and retry settings
    pub fn new(topic: impl Into<String>, payload: serde_json::Value, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            payload,
            priority: Priority::Normal,
            attempts: 0,
            max_retries,
            correlation_id: None,
            reply_to: None,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    /// Check expiry against a given instant
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Whether a caller is waiting for a reply to this message
    pub fn is_rpc_request(&self) -> bool {
        self.reply_to.is_some() && self.correlation_id.is_some()
    }

    /// Whether another delivery pass is allowed after a failure
    pub fn can_retry(&self) -> bool {
        self.attempts <= self.max_retries
    }

    /// Deserialize the payload into a specific type
    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Publish Options
// ─────────────────────────────────────────────────────────────────────────────

/// Per-call publish settings
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub priority: Priority,
    /// Overrides the bus default when set
    pub max_retries: Option<u32>,
    /// Absolute expiry; takes precedence over `expiry`
    pub expires_at: Option<Instant>,
    /// Expiry relative to publish time
    pub expiry: Option<Duration>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn expires_at(mut self, at: Instant) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn expiry(mut self, after: Duration) -> Self {
        self.expiry = Some(after);
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Resolve the absolute expiry for a message published at `now`
    pub fn resolve_expiry(&self, now: Instant) -> Option<Instant> {
        // An expiry past the clock's range never fires
        self.expires_at
            .or_else(|| self.expiry.and_then(|after| now.checked_add(after)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscription Metadata
// ─────────────────────────────────────────────────────────────────────────────

/// Optional data attached to a subscription
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionMetadata {
    /// Owning plugin; used for bulk removal on unload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

impl SubscriptionMetadata {
    /// Metadata tagging a subscription with its owning plugin
    pub fn for_plugin(plugin: impl Into<String>) -> Self {
        Self {
            plugin: Some(plugin.into()),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reply Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// Build the payload an RPC responder publishes when its handler fails
pub fn error_reply(err: &HandlerError) -> serde_json::Value {
    serde_json::json!({ "error": err })
}

/// Recognise an error reply: an object whose only key is `error`, holding an
/// object with a string `message`.
pub fn parse_error_reply(payload: &serde_json::Value) -> Option<HandlerError> {
    let object = payload.as_object()?;
    if object.len() != 1 {
        return None;
    }
    let error = object.get("error")?;
    if !error.get("message").is_some_and(serde_json::Value::is_string) {
        return None;
    }
    serde_json::from_value(error.clone()).ok()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
