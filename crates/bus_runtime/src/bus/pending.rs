//! Pending RPC Requests
//!
//! One entry per in-flight correlation id. Whoever removes the entry owns the
//! right to settle it, so a request is resolved or rejected exactly once.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;

use bus_types::{BusResult, SubscriptionId};

pub(crate) struct PendingRequest {
    pub topic: String,
    pub reply_subscription: SubscriptionId,
    pub created_at: Instant,
    pub sender: oneshot::Sender<BusResult<serde_json::Value>>,
}

#[derive(Default)]
pub(crate) struct PendingRequests {
    entries: DashMap<String, PendingRequest>,
}

impl PendingRequests {
    pub fn insert(&self, correlation_id: String, request: PendingRequest) {
        self.entries.insert(correlation_id, request);
    }

    pub fn remove(&self, correlation_id: &str) -> Option<PendingRequest> {
        self.entries.remove(correlation_id).map(|(_, request)| request)
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.entries.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Correlation ids of entries older than `max_age`
    pub fn older_than(&self, max_age: Duration) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| now.duration_since(entry.created_at) >= max_age)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }
}
