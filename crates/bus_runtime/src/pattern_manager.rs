//! Pattern Manager
//!
//! Application-facing subscribe/publish surface over a `PatternTrie`, with a
//! time-boxed match cache and lifecycle events.
//!
//! The cache is keyed by topic. Any subscribe or unsubscribe can change the
//! result for any topic, so every mutation clears the whole cache. Results are
//! additionally bounded by a TTL that depends on the optimization mode.
//!
//! Unlike the message bus, `publish` here fans out to all matching handlers
//! concurrently and does not retry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use bus_types::{
    BusResult, HandlerResult, Message, SubscriptionId, SubscriptionMetadata, validate_topic,
};

use crate::handler::invoke;
use crate::{PatternTrie, SharedHandler, Subscription, TrieStats, handler_fn};

/// Share of cache entries dropped when the cache overflows
const EVICTION_FRACTION: f64 = 0.2;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Trade-off between cache memory and hit rate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationMode {
    /// Short TTL, small cache
    Memory,
    #[default]
    Balanced,
    /// Long TTL, large cache
    Speed,
}

impl OptimizationMode {
    pub fn cache_ttl(&self) -> Duration {
        match self {
            OptimizationMode::Memory => Duration::from_secs(1),
            OptimizationMode::Balanced => Duration::from_secs(10),
            OptimizationMode::Speed => Duration::from_secs(60),
        }
    }

    pub fn cache_max_entries(&self) -> usize {
        match self {
            OptimizationMode::Memory => 500,
            OptimizationMode::Balanced => 2_000,
            OptimizationMode::Speed => 10_000,
        }
    }
}

/// Configuration for a pattern manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternManagerConfig {
    pub mode: OptimizationMode,

    /// Overrides the mode's TTL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_ttl_ms: Option<u64>,

    /// Overrides the mode's size bound
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_max_entries: Option<usize>,

    /// Entries older than this are swept regardless of mode
    pub stale_after_ms: u64,

    /// Period of the background sweep
    pub cleanup_interval_ms: u64,

    /// Buffer size of the lifecycle event channel
    pub event_capacity: usize,
}

impl Default for PatternManagerConfig {
    fn default() -> Self {
        Self {
            mode: OptimizationMode::Balanced,
            cache_ttl_ms: None,
            cache_max_entries: None,
            stale_after_ms: 300_000,
            cleanup_interval_ms: 60_000,
            event_capacity: 256,
        }
    }
}

impl PatternManagerConfig {
    pub fn with_mode(mode: OptimizationMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.mode.cache_ttl())
    }

    pub fn cache_max_entries(&self) -> usize {
        self.cache_max_entries
            .unwrap_or_else(|| self.mode.cache_max_entries())
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    /// Sweep period, at least one millisecond
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms.max(1))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Events & Results
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle and metrics events emitted by the manager
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatternEvent {
    Subscribed {
        subscription_id: SubscriptionId,
        pattern: String,
    },
    Unsubscribed {
        subscription_id: SubscriptionId,
        pattern: String,
    },
    Published {
        topic: String,
        matched: usize,
        delivered: usize,
        failed: usize,
    },
    CacheEvicted {
        removed: usize,
    },
}

/// Outcome of a match lookup
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub subscriptions: Vec<Subscription>,
    pub match_time: Duration,
    pub cache_hit: bool,
}

struct CacheEntry {
    subscriptions: Vec<Subscription>,
    timestamp: Instant,
}

#[derive(Default)]
struct PatternMetrics {
    subscriptions: AtomicU64,
    unsubscriptions: AtomicU64,
    publishes: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_evictions: AtomicU64,
}

/// Snapshot of manager counters
#[derive(Debug, Clone, Serialize)]
pub struct PatternManagerStats {
    pub subscriptions: u64,
    pub unsubscriptions: u64,
    pub publishes: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub cache_size: usize,
    pub trie: TrieStats,
}

// ─────────────────────────────────────────────────────────────────────────────
// Pattern Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Cached pattern subscription registry with concurrent fan-out
pub struct PatternManager {
    config: PatternManagerConfig,
    trie: RwLock<PatternTrie>,
    /// Bumped on every trie mutation; guards against caching a result computed
    /// before a concurrent mutation
    generation: AtomicU64,
    cache: Mutex<HashMap<String, CacheEntry>>,
    events: broadcast::Sender<PatternEvent>,
    metrics: PatternMetrics,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl PatternManager {
    /// Create a manager without a background sweep
    pub fn new(config: PatternManagerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            trie: RwLock::new(PatternTrie::new()),
            generation: AtomicU64::new(0),
            cache: Mutex::new(HashMap::new()),
            events,
            metrics: PatternMetrics::default(),
            cleanup_task: Mutex::new(None),
        }
    }

    /// Create a shared manager and start its periodic cache sweep
    pub fn start(config: PatternManagerConfig) -> Arc<Self> {
        let manager = Arc::new(Self::new(config));
        manager.start_cleanup();
        manager
    }

    /// Spawn the periodic stale-entry sweep on the current runtime
    pub fn start_cleanup(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No tokio runtime; pattern cache sweep not started");
            return;
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.cleanup_interval();
        let task = runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let removed = manager.cleanup_stale();
                if removed > 0 {
                    tracing::debug!(removed, "Swept stale pattern cache entries");
                }
            }
        });

        if let Some(previous) = self.cleanup_task.lock().replace(task) {
            previous.abort();
        }
    }

    pub fn config(&self) -> &PatternManagerConfig {
        &self.config
    }

    /// Receive lifecycle events
    pub fn events(&self) -> broadcast::Receiver<PatternEvent> {
        self.events.subscribe()
    }

    /// Subscribe an async closure to a pattern
    pub fn subscribe<F, Fut>(
        &self,
        pattern: &str,
        handler: F,
        metadata: Option<SubscriptionMetadata>,
    ) -> BusResult<SubscriptionId>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe_handler(pattern, handler_fn(handler), metadata)
    }

    /// Subscribe a shared handler to a pattern
    pub fn subscribe_handler(
        &self,
        pattern: &str,
        handler: SharedHandler,
        metadata: Option<SubscriptionMetadata>,
    ) -> BusResult<SubscriptionId> {
        let subscription = {
            let mut trie = self.trie.write();
            let subscription =
                trie.add_pattern(pattern, handler, metadata.unwrap_or_default())?;
            self.generation.fetch_add(1, Ordering::SeqCst);
            subscription
        };
        self.invalidate_cache();

        self.metrics.subscriptions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            subscription_id = %subscription.id,
            pattern = %pattern,
            kind = %subscription.pattern.kind(),
            "Pattern subscribed"
        );
        let _ = self.events.send(PatternEvent::Subscribed {
            subscription_id: subscription.id.clone(),
            pattern: pattern.to_string(),
        });

        Ok(subscription.id)
    }

    /// Remove a subscription; false if it was already gone
    pub fn unsubscribe(&self, pattern: &str, subscription_id: &str) -> bool {
        let removed = {
            let mut trie = self.trie.write();
            let removed = trie.remove_pattern(pattern, subscription_id);
            if removed {
                self.generation.fetch_add(1, Ordering::SeqCst);
            }
            removed
        };

        if !removed {
            tracing::debug!(subscription_id, pattern, "Unsubscribe for unknown subscription");
            return false;
        }

        self.invalidate_cache();
        self.metrics.unsubscriptions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(subscription_id, pattern, "Pattern unsubscribed");
        let _ = self.events.send(PatternEvent::Unsubscribed {
            subscription_id: subscription_id.to_string(),
            pattern: pattern.to_string(),
        });
        true
    }

    /// Remove every subscription owned by a plugin
    pub fn unsubscribe_by_plugin(&self, plugin: &str) -> usize {
        let removed = {
            let mut trie = self.trie.write();
            let removed = trie.remove_where(|s| s.is_owned_by(plugin));
            if !removed.is_empty() {
                self.generation.fetch_add(1, Ordering::SeqCst);
            }
            removed
        };

        if removed.is_empty() {
            return 0;
        }

        self.invalidate_cache();
        self.metrics
            .unsubscriptions
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        for subscription in &removed {
            let _ = self.events.send(PatternEvent::Unsubscribed {
                subscription_id: subscription.id.clone(),
                pattern: subscription.pattern.as_str().to_string(),
            });
        }
        tracing::info!(plugin, count = removed.len(), "Removed plugin pattern subscriptions");
        removed.len()
    }

    /// Resolve subscriptions for a topic, consulting the cache first
    pub fn find_matches(&self, topic: &str) -> MatchResult {
        let started = Instant::now();
        let ttl = self.config.cache_ttl();

        {
            let mut cache = self.cache.lock();
            if let Some(entry) = cache.get(topic) {
                if entry.timestamp.elapsed() < ttl {
                    self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return MatchResult {
                        subscriptions: entry.subscriptions.clone(),
                        match_time: started.elapsed(),
                        cache_hit: true,
                    };
                }
            }
            // Expired or absent
            cache.remove(topic);
        }

        self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
        let (subscriptions, generation) = {
            let trie = self.trie.read();
            (
                trie.find_matches(topic),
                self.generation.load(Ordering::SeqCst),
            )
        };

        let evicted = {
            let mut cache = self.cache.lock();
            if self.generation.load(Ordering::SeqCst) == generation {
                cache.insert(
                    topic.to_string(),
                    CacheEntry {
                        subscriptions: subscriptions.clone(),
                        timestamp: Instant::now(),
                    },
                );
                self.evict_overflow(&mut cache)
            } else {
                0
            }
        };

        if evicted > 0 {
            self.metrics
                .cache_evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
            tracing::trace!(removed = evicted, "Evicted oldest pattern cache entries");
            let _ = self.events.send(PatternEvent::CacheEvicted { removed: evicted });
        }

        MatchResult {
            subscriptions,
            match_time: started.elapsed(),
            cache_hit: false,
        }
    }

    /// Deliver a payload to every matching subscription concurrently.
    ///
    /// Returns the number of handlers that completed without error; failures
    /// are logged and do not stop delivery to the others.
    pub async fn publish(&self, topic: &str, payload: serde_json::Value) -> BusResult<usize> {
        validate_topic(topic)?;
        self.metrics.publishes.fetch_add(1, Ordering::Relaxed);

        let matches = self.find_matches(topic);
        let message = Message::new(topic, payload, 0);

        let results = join_all(matches.subscriptions.iter().map(|subscription| {
            let message = message.clone();
            async move { (subscription, invoke(&subscription.handler, message).await) }
        }))
        .await;

        let mut delivered = 0;
        for (subscription, result) in &results {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        topic,
                        subscription_id = %subscription.id,
                        pattern = %subscription.pattern,
                        error = %e,
                        "Pattern handler failed"
                    );
                }
            }
        }
        let failed = results.len() - delivered;

        self.metrics
            .deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.metrics
            .delivery_failures
            .fetch_add(failed as u64, Ordering::Relaxed);
        let _ = self.events.send(PatternEvent::Published {
            topic: topic.to_string(),
            matched: results.len(),
            delivered,
            failed,
        });

        Ok(delivered)
    }

    /// Drop cache entries older than the staleness window
    pub fn cleanup_stale(&self) -> usize {
        let stale_after = self.config.stale_after();
        let mut cache = self.cache.lock();
        let before = cache.len();
        cache.retain(|_, entry| entry.timestamp.elapsed() < stale_after);
        before - cache.len()
    }

    pub fn invalidate_cache(&self) {
        self.cache.lock().clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn stats(&self) -> PatternManagerStats {
        let m = &self.metrics;
        PatternManagerStats {
            subscriptions: m.subscriptions.load(Ordering::Relaxed),
            unsubscriptions: m.unsubscriptions.load(Ordering::Relaxed),
            publishes: m.publishes.load(Ordering::Relaxed),
            deliveries: m.deliveries.load(Ordering::Relaxed),
            delivery_failures: m.delivery_failures.load(Ordering::Relaxed),
            cache_hits: m.cache_hits.load(Ordering::Relaxed),
            cache_misses: m.cache_misses.load(Ordering::Relaxed),
            cache_evictions: m.cache_evictions.load(Ordering::Relaxed),
            cache_size: self.cache_len(),
            trie: self.trie.read().stats(),
        }
    }

    /// Stop the sweep and drop all subscriptions and cached results
    pub fn shutdown(&self) {
        if let Some(task) = self.cleanup_task.lock().take() {
            task.abort();
        }
        self.trie.write().clear();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.invalidate_cache();
        tracing::info!("Pattern manager shut down");
    }

    /// Remove the oldest entries once the size bound is exceeded
    fn evict_overflow(&self, cache: &mut HashMap<String, CacheEntry>) -> usize {
        let max_entries = self.config.cache_max_entries();
        if cache.len() <= max_entries {
            return 0;
        }

        let count = ((cache.len() as f64 * EVICTION_FRACTION).ceil() as usize).max(1);
        let mut by_age: Vec<(String, Instant)> = cache
            .iter()
            .map(|(topic, entry)| (topic.clone(), entry.timestamp))
            .collect();
        by_age.sort_by_key(|(_, timestamp)| *timestamp);

        for (topic, _) in by_age.into_iter().take(count) {
            cache.remove(&topic);
        }
        count
    }
}

impl Drop for PatternManager {
    fn drop(&mut self) {
        if let Some(task) = self.cleanup_task.get_mut().take() {
            task.abort();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
