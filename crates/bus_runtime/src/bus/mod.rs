//! Message Bus
//!
//! The authoritative one-way and request/reply transport for plugins.
//!
//! # Delivery
//!
//! Published messages enter a priority queue (high → normal → low, FIFO within
//! a tier). A single drain task per bus pops messages and hands each one to
//! every matching handler in turn, awaiting each before the next. A handler
//! failure sends the message back to its tier for another pass, skipping the
//! handlers that already accepted it, until `max_retries` is exhausted.
//!
//! # Request / Reply
//!
//! `request` emulates RPC over one-way messaging: it subscribes to a private
//! reply topic, publishes the request with a correlation id and `reply_to`,
//! and waits for the matching reply or the timeout. `create_rpc_handler`
//! registers the responder side.

mod pending;
mod queue;
mod stats;

pub use stats::BusStats;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use uuid::Uuid;

use bus_types::{
    BusError, BusResult, HandlerResult, Message, MessageId, PatternKind, Priority,
    PublishOptions, SubscriptionId, SubscriptionMetadata, TopicPattern, error_reply,
    parse_error_reply, validate_topic,
};

use crate::handler::{catch_panic, invoke};
use crate::{PatternTrie, SharedHandler, Subscription, handler_fn};

use pending::{PendingRequest, PendingRequests};
use queue::{MessageQueue, QueuedMessage};
use stats::BusMetrics;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration for a message bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Retries after the first failed delivery pass
    pub default_max_retries: u32,

    /// Timeout for `request` when the caller gives none
    pub default_request_timeout_ms: u64,

    /// Queue bound; 0 disables it
    pub max_queue_depth: usize,

    /// First segment of generated reply topics
    pub reply_topic_prefix: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 2,
            default_request_timeout_ms: 5_000,
            max_queue_depth: 10_000,
            reply_topic_prefix: "_reply".to_string(),
        }
    }
}

impl BusConfig {
    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout_ms)
    }
}

/// Per-call request settings
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub priority: Priority,
    pub max_retries: Option<u32>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// What happened to a published message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Enqueued for delivery
    Queued(MessageId),
    /// Already expired at publish time; never enqueued
    Expired(MessageId),
}

impl PublishOutcome {
    pub fn id(&self) -> &str {
        match self {
            PublishOutcome::Queued(id) | PublishOutcome::Expired(id) => id,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, PublishOutcome::Queued(_))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message Bus
// ─────────────────────────────────────────────────────────────────────────────

/// In-process publish/subscribe and request/reply bus
///
/// Cloning is cheap; all clones share the same subscriptions and queue.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    config: BusConfig,

    /// Exact and prefix subscriptions
    subscriptions: RwLock<PatternTrie>,

    /// Subscription id -> pattern, for removal by id
    index: DashMap<SubscriptionId, String>,

    queue: Mutex<MessageQueue>,

    /// Set while a drain task owns the queue
    draining: AtomicBool,

    closed: AtomicBool,

    pending: PendingRequests,

    metrics: BusMetrics,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl MessageBus {
    /// Create a new bus
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                subscriptions: RwLock::new(PatternTrie::new()),
                index: DashMap::new(),
                queue: Mutex::new(MessageQueue::default()),
                draining: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                pending: PendingRequests::default(),
                metrics: BusMetrics::default(),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────────────────

    /// Subscribe to an exact topic
    pub fn subscribe<F, Fut>(&self, topic: &str, handler: F) -> BusResult<SubscriptionId>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe_handler(topic, handler_fn(handler), SubscriptionMetadata::default())
    }

    /// Subscribe to an exact topic with a shared handler and metadata
    pub fn subscribe_handler(
        &self,
        topic: &str,
        handler: SharedHandler,
        metadata: SubscriptionMetadata,
    ) -> BusResult<SubscriptionId> {
        let pattern = TopicPattern::parse(topic)?;
        if pattern.kind() != PatternKind::Exact {
            return Err(BusError::InvalidPattern {
                pattern: topic.to_string(),
                reason: "wildcards are only accepted by subscribe_pattern".to_string(),
            });
        }
        self.inner.add_subscription(pattern, handler, metadata)
    }

    /// Subscribe to every topic under a prefix, e.g. `order.*`
    pub fn subscribe_pattern<F, Fut>(&self, pattern: &str, handler: F) -> BusResult<SubscriptionId>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe_pattern_handler(pattern, handler_fn(handler), SubscriptionMetadata::default())
    }

    /// Subscribe a shared handler to a prefix pattern
    ///
    /// Only a single trailing `.*` wildcard is accepted.
    pub fn subscribe_pattern_handler(
        &self,
        pattern: &str,
        handler: SharedHandler,
        metadata: SubscriptionMetadata,
    ) -> BusResult<SubscriptionId> {
        let parsed = TopicPattern::parse(pattern)?;
        if parsed.kind() != PatternKind::Prefix {
            return Err(BusError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: format!(
                    "{} pattern given; the bus accepts only one trailing '.*' wildcard (e.g. 'order.*')",
                    parsed.kind()
                ),
            });
        }
        self.inner.add_subscription(parsed, handler, metadata)
    }

    /// Remove a subscription by id
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        self.inner.remove_subscription(subscription_id)
    }

    /// Remove every subscription tagged with `plugin`
    ///
    /// Called by the plugin loader on unload and hot reload.
    pub fn unsubscribe_by_plugin(&self, plugin: &str) -> usize {
        let removed = self
            .inner
            .subscriptions
            .write()
            .remove_where(|s| s.is_owned_by(plugin));
        for subscription in &removed {
            self.inner.index.remove(&subscription.id);
        }

        if !removed.is_empty() {
            tracing::info!(plugin, count = removed.len(), "Removed plugin subscriptions");
        }
        removed.len()
    }

    /// Number of live subscriptions, reply subscriptions included
    pub fn subscription_count(&self) -> usize {
        self.inner.index.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Publishing
    // ─────────────────────────────────────────────────────────────────────────

    /// Publish with default options
    pub fn publish(&self, topic: &str, payload: serde_json::Value) -> BusResult<PublishOutcome> {
        self.publish_with(topic, payload, PublishOptions::default())
    }

    /// Publish a message
    ///
    /// Only validation and lifecycle errors are returned; delivery problems
    /// are visible through stats and logs.
    pub fn publish_with(
        &self,
        topic: &str,
        payload: serde_json::Value,
        options: PublishOptions,
    ) -> BusResult<PublishOutcome> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Shutdown);
        }
        validate_topic(topic)?;
        let runtime = Handle::try_current().map_err(|_| BusError::NoRuntime)?;

        let now = Instant::now();
        let max_retries = options
            .max_retries
            .unwrap_or(self.inner.config.default_max_retries);
        let mut message = Message::new(topic, payload, max_retries);
        message.priority = options.priority;
        message.expires_at = options.resolve_expiry(now);
        message.correlation_id = options.correlation_id;
        message.reply_to = options.reply_to;

        BusMetrics::incr(&self.inner.metrics.published);

        if message.is_expired_at(now) {
            BusMetrics::incr(&self.inner.metrics.expired);
            tracing::debug!(topic, message_id = %message.id, "Message expired before enqueue");
            return Ok(PublishOutcome::Expired(message.id));
        }

        let id = message.id.clone();
        tracing::trace!(topic, message_id = %id, priority = %message.priority, "Message queued");
        self.inner.enqueue(QueuedMessage::new(message));
        self.inner.schedule_drain(&runtime);

        Ok(PublishOutcome::Queued(id))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Request / Reply
    // ─────────────────────────────────────────────────────────────────────────

    /// Send a request and wait for its reply
    ///
    /// Resolves with the responder's payload, or fails with `Timeout`,
    /// `NoSubscriber`, `Handler` (retries exhausted), `Remote` (the responder
    /// reported an error), `QueueOverflow` or `Shutdown`.
    pub async fn request(
        &self,
        topic: &str,
        payload: serde_json::Value,
        options: RequestOptions,
    ) -> BusResult<serde_json::Value> {
        validate_topic(topic)?;
        let inner = &self.inner;
        let timeout = options
            .timeout
            .unwrap_or_else(|| inner.config.default_request_timeout());

        let correlation_id = Uuid::new_v4().to_string();
        let reply_topic = format!(
            "{}.{}.{}",
            inner.config.reply_topic_prefix,
            correlation_id,
            Uuid::new_v4().simple()
        );

        let reply_subscription = inner.add_subscription(
            TopicPattern::parse(&reply_topic)?,
            reply_handler(Arc::downgrade(inner), correlation_id.clone()),
            SubscriptionMetadata::default().with_description(format!("reply for {}", topic)),
        )?;

        let (sender, receiver) = oneshot::channel();
        inner.pending.insert(
            correlation_id.clone(),
            PendingRequest {
                topic: topic.to_string(),
                reply_subscription,
                created_at: Instant::now(),
                sender,
            },
        );
        let _guard = PendingGuard {
            inner: inner.as_ref(),
            correlation_id: &correlation_id,
        };
        BusMetrics::incr(&inner.metrics.rpc_requests);

        let mut publish = PublishOptions::new()
            .priority(options.priority)
            .correlation_id(correlation_id.as_str())
            .reply_to(reply_topic.as_str());
        publish.max_retries = options.max_retries;
        self.publish_with(topic, payload, publish)?;

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::ChannelClosed),
            Err(_) => {
                BusMetrics::incr(&inner.metrics.rpc_timeouts);
                tracing::warn!(
                    topic,
                    correlation_id = %correlation_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Request timed out"
                );
                Err(BusError::Timeout {
                    topic: topic.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Register a responder on `topic`
    ///
    /// For each request (a message with both `reply_to` and `correlation_id`)
    /// the handler's result is published to the reply topic. A handler failure
    /// is published as an `{"error": {...}}` payload; it never fails the
    /// delivery itself.
    pub fn create_rpc_handler<F, Fut>(&self, topic: &str, handler: F) -> BusResult<SubscriptionId>
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<serde_json::Value>> + Send + 'static,
    {
        self.create_rpc_handler_with(topic, handler, SubscriptionMetadata::default())
    }

    /// Register a responder with subscription metadata
    pub fn create_rpc_handler_with<F, Fut>(
        &self,
        topic: &str,
        handler: F,
        metadata: SubscriptionMetadata,
    ) -> BusResult<SubscriptionId>
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<serde_json::Value>> + Send + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        let handler = Arc::new(handler);
        let rpc_topic = topic.to_string();

        let responder = handler_fn(move |message: Message| {
            let weak = weak.clone();
            let handler = Arc::clone(&handler);
            let rpc_topic = rpc_topic.clone();
            async move {
                let (Some(reply_to), Some(correlation_id)) =
                    (message.reply_to.clone(), message.correlation_id.clone())
                else {
                    tracing::trace!(topic = %rpc_topic, "Ignoring message without reply address");
                    return Ok(());
                };

                let payload = match catch_panic((*handler)(message.payload)).await {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::warn!(
                            topic = %rpc_topic,
                            correlation_id = %correlation_id,
                            error = %e,
                            "RPC handler failed"
                        );
                        error_reply(&e)
                    }
                };

                let Some(inner) = weak.upgrade() else {
                    return Ok(());
                };
                let reply = PublishOptions::new()
                    .priority(message.priority)
                    .correlation_id(correlation_id);
                if let Err(e) = (MessageBus { inner }).publish_with(&reply_to, payload, reply) {
                    tracing::warn!(topic = %rpc_topic, error = %e, "Failed to publish RPC reply");
                }
                Ok(())
            }
        });

        self.subscribe_handler(topic, responder, metadata)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Number of requests awaiting a reply
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn has_pending_request(&self, correlation_id: &str) -> bool {
        self.inner.pending.contains(correlation_id)
    }

    /// Force-reject requests waiting longer than `max_age`
    pub fn sweep_stale_requests(&self, max_age: Duration) -> usize {
        let stale = self.inner.pending.older_than(max_age);
        let mut swept = 0;
        for correlation_id in stale {
            let Some(request) = self.inner.pending.remove(&correlation_id) else {
                continue;
            };
            BusMetrics::incr(&self.inner.metrics.rpc_timeouts);
            tracing::warn!(
                topic = %request.topic,
                correlation_id = %correlation_id,
                "Evicting stale pending request"
            );
            let error = BusError::Timeout {
                topic: request.topic.clone(),
                timeout_ms: max_age.as_millis() as u64,
            };
            self.inner.finish(request, Err(error));
            swept += 1;
        }
        swept
    }

    /// True when nothing is queued or being delivered
    pub fn is_idle(&self) -> bool {
        !self.inner.draining.load(Ordering::SeqCst) && self.inner.queue.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> BusStats {
        let mut stats = self.inner.metrics.snapshot();
        {
            let queue = self.inner.queue.lock();
            stats.queue_depth = queue.len();
            stats.queue_high = queue.depth(Priority::High);
            stats.queue_normal = queue.depth(Priority::Normal);
            stats.queue_low = queue.depth(Priority::Low);
        }
        stats.subscriptions = self.inner.index.len();
        stats.pending_requests = self.inner.pending.len();
        stats.trie = self.inner.subscriptions.read().stats();
        stats
    }

    /// Reject pending requests, drop queued messages and subscriptions.
    ///
    /// Later publishes fail with `Shutdown`.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let dropped = self.inner.queue.lock().drain_all().len();
        for correlation_id in self.inner.pending.ids() {
            if let Some(request) = self.inner.pending.remove(&correlation_id) {
                self.inner.finish(request, Err(BusError::Shutdown));
            }
        }
        self.inner.subscriptions.write().clear();
        self.inner.index.clear();

        tracing::info!(dropped_messages = dropped, "Message bus shut down");
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("subscriptions", &self.inner.index.len())
            .field("pending_requests", &self.inner.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Internals
// ─────────────────────────────────────────────────────────────────────────────

impl BusInner {
    fn add_subscription(
        &self,
        pattern: TopicPattern,
        handler: SharedHandler,
        metadata: SubscriptionMetadata,
    ) -> BusResult<SubscriptionId> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Shutdown);
        }

        let subscription = Subscription::new(pattern, handler, metadata);
        let id = subscription.id.clone();
        let pattern = subscription.pattern.as_str().to_string();
        {
            let mut trie = self.subscriptions.write();
            trie.insert(subscription);
            self.index.insert(id.clone(), pattern.clone());
        }

        tracing::debug!(subscription_id = %id, pattern = %pattern, "Subscribed");
        Ok(id)
    }

    fn remove_subscription(&self, subscription_id: &str) -> bool {
        let removed = {
            let mut trie = self.subscriptions.write();
            match self.index.remove(subscription_id) {
                Some((_, pattern)) => trie.remove_pattern(&pattern, subscription_id),
                None => false,
            }
        };

        if removed {
            tracing::debug!(subscription_id, "Unsubscribed");
        }
        removed
    }

    /// Enqueue, evicting from the lowest tier if the bound is exceeded
    fn enqueue(&self, queued: QueuedMessage) {
        let evicted = {
            let mut queue = self.queue.lock();
            queue.push(queued);
            let bound = self.config.max_queue_depth;
            if bound > 0 && queue.len() > bound {
                queue.evict()
            } else {
                None
            }
        };

        if let Some(evicted) = evicted {
            BusMetrics::incr(&self.metrics.dropped_overflow);
            let message = evicted.message;
            tracing::warn!(
                topic = %message.topic,
                message_id = %message.id,
                priority = %message.priority,
                "Queue full, evicted message"
            );
            if message.is_rpc_request() {
                if let Some(correlation_id) = &message.correlation_id {
                    self.settle(correlation_id, Err(BusError::QueueOverflow(message.topic.clone())));
                }
            }
        }
    }

    /// Start a drain task unless one is already running
    fn schedule_drain(self: &Arc<Self>, runtime: &Handle) {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let inner = Arc::clone(self);
            runtime.spawn(async move { inner.drain().await });
        }
    }

    async fn drain(self: Arc<Self>) {
        loop {
            loop {
                let next = self.queue.lock().pop();
                let Some(queued) = next else {
                    break;
                };
                self.process(queued).await;
            }

            self.draining.store(false, Ordering::SeqCst);

            // A publish may have enqueued after the last pop but before the flag
            // cleared; take the queue back unless another task already has.
            if self.queue.lock().is_empty() || self.draining.swap(true, Ordering::SeqCst) {
                break;
            }
        }
    }

    async fn process(&self, mut queued: QueuedMessage) {
        if queued.message.is_expired() {
            BusMetrics::incr(&self.metrics.expired);
            tracing::debug!(
                topic = %queued.message.topic,
                message_id = %queued.message.id,
                "Dropping expired message"
            );
            return;
        }

        let subscriptions = self.subscriptions.read().find_matches(&queued.message.topic);

        if subscriptions.is_empty() {
            BusMetrics::incr(&self.metrics.undeliverable);
            let message = &queued.message;
            match (&message.correlation_id, message.reply_to.is_some()) {
                (Some(correlation_id), true) => {
                    BusMetrics::incr(&self.metrics.rpc_no_subscriber);
                    tracing::debug!(topic = %message.topic, "No subscriber for request");
                    self.settle(correlation_id, Err(BusError::NoSubscriber(message.topic.clone())));
                }
                _ => {
                    tracing::trace!(topic = %message.topic, "No subscribers, message dropped");
                }
            }
            return;
        }

        let mut failure = None;
        for subscription in &subscriptions {
            if queued.delivered_to.contains(&subscription.id) {
                continue;
            }
            match invoke(&subscription.handler, queued.message.clone()).await {
                Ok(()) => {
                    BusMetrics::incr(&self.metrics.delivered);
                    queued.delivered_to.insert(subscription.id.clone());
                }
                Err(e) => {
                    tracing::warn!(
                        topic = %queued.message.topic,
                        subscription_id = %subscription.id,
                        attempt = queued.message.attempts + 1,
                        error = %e,
                        "Handler failed"
                    );
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }

        let Some(error) = failure else {
            BusMetrics::incr(&self.metrics.processed);
            return;
        };

        queued.message.attempts += 1;
        if queued.message.can_retry() {
            BusMetrics::incr(&self.metrics.retried);
            self.enqueue(queued);
            return;
        }

        BusMetrics::incr(&self.metrics.failed);
        let message = queued.message;
        tracing::warn!(
            topic = %message.topic,
            message_id = %message.id,
            attempts = message.attempts,
            "Retries exhausted, message dropped"
        );
        if message.is_rpc_request() {
            if let Some(correlation_id) = &message.correlation_id {
                self.settle(correlation_id, Err(BusError::Handler(error)));
            }
        }
    }

    /// Resolve or reject a pending request; false if it is no longer pending
    fn settle(&self, correlation_id: &str, result: BusResult<serde_json::Value>) -> bool {
        match self.pending.remove(correlation_id) {
            Some(request) => {
                self.finish(request, result);
                true
            }
            None => {
                tracing::trace!(correlation_id, "Reply for unknown or settled request dropped");
                false
            }
        }
    }

    fn finish(&self, request: PendingRequest, result: BusResult<serde_json::Value>) {
        self.remove_subscription(&request.reply_subscription);
        let _ = request.sender.send(result);
    }
}

/// Handler for a request's private reply topic
fn reply_handler(inner: Weak<BusInner>, correlation_id: String) -> SharedHandler {
    handler_fn(move |message: Message| {
        let inner = inner.clone();
        let correlation_id = correlation_id.clone();
        async move {
            if message.correlation_id.as_deref() != Some(correlation_id.as_str()) {
                return Ok(());
            }
            if let Some(inner) = inner.upgrade() {
                let result = match parse_error_reply(&message.payload) {
                    Some(error) => Err(BusError::Remote(error)),
                    None => Ok(message.payload),
                };
                inner.settle(&correlation_id, result);
            }
            Ok(())
        }
    })
}

/// Removes a request's pending entry and reply subscription when the
/// requesting future finishes or is dropped
struct PendingGuard<'a> {
    inner: &'a BusInner,
    correlation_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(request) = self.inner.pending.remove(self.correlation_id) {
            self.inner.remove_subscription(&request.reply_subscription);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
