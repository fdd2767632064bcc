//! Subscriptions

use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use bus_types::{SubscriptionId, SubscriptionMetadata, TopicPattern};

use crate::SharedHandler;

/// A registered handler and the pattern it listens on
#[derive(Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub pattern: TopicPattern,
    pub handler: SharedHandler,
    pub created_at: DateTime<Utc>,
    pub metadata: SubscriptionMetadata,
}

impl Subscription {
    pub fn new(
        pattern: TopicPattern,
        handler: SharedHandler,
        metadata: SubscriptionMetadata,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pattern,
            handler,
            created_at: Utc::now(),
            metadata,
        }
    }

    /// Owning plugin, if tagged
    pub fn plugin(&self) -> Option<&str> {
        self.metadata.plugin.as_deref()
    }

    pub fn is_owned_by(&self, plugin: &str) -> bool {
        self.plugin() == Some(plugin)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern.as_str())
            .field("created_at", &self.created_at)
            .field("metadata", &self.metadata)
            .finish()
    }
}
