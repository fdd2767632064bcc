//! Bus Counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::TrieStats;

#[derive(Default)]
pub(crate) struct BusMetrics {
    pub published: AtomicU64,
    pub delivered: AtomicU64,
    pub processed: AtomicU64,
    pub retried: AtomicU64,
    pub expired: AtomicU64,
    pub failed: AtomicU64,
    pub undeliverable: AtomicU64,
    pub dropped_overflow: AtomicU64,
    pub rpc_requests: AtomicU64,
    pub rpc_timeouts: AtomicU64,
    pub rpc_no_subscriber: AtomicU64,
}

impl BusMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of bus counters and gauges
#[derive(Debug, Clone, Default, Serialize)]
pub struct BusStats {
    /// Messages accepted by `publish`, expired-on-arrival included
    pub published: u64,
    /// Successful handler invocations
    pub delivered: u64,
    /// Messages delivered to every matched handler
    pub processed: u64,
    pub retried: u64,
    pub expired: u64,
    /// Messages dropped after exhausting retries
    pub failed: u64,
    /// Messages with no matching subscriber
    pub undeliverable: u64,
    pub dropped_overflow: u64,
    pub rpc_requests: u64,
    pub rpc_timeouts: u64,
    pub rpc_no_subscriber: u64,

    pub queue_depth: usize,
    pub queue_high: usize,
    pub queue_normal: usize,
    pub queue_low: usize,
    pub subscriptions: usize,
    pub pending_requests: usize,
    pub trie: TrieStats,
}

impl BusMetrics {
    pub fn snapshot(&self) -> BusStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        BusStats {
            published: load(&self.published),
            delivered: load(&self.delivered),
            processed: load(&self.processed),
            retried: load(&self.retried),
            expired: load(&self.expired),
            failed: load(&self.failed),
            undeliverable: load(&self.undeliverable),
            dropped_overflow: load(&self.dropped_overflow),
            rpc_requests: load(&self.rpc_requests),
            rpc_timeouts: load(&self.rpc_timeouts),
            rpc_no_subscriber: load(&self.rpc_no_subscriber),
            ..Default::default()
        }
    }
}
