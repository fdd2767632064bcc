//! RPC Manager
//!
//! Resilient client facade over the bus's request/reply: per-call timeout,
//! retry with exponential backoff for retriable failures, a circuit breaker
//! per topic, and a periodic sweep of stale pending requests.
//!
//! Every failure is returned as an `RpcError` so callers can branch on
//! `code` and `retriable`.

mod circuit_breaker;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakers, CircuitSnapshot, CircuitState};

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use bus_types::{
    BusError, BusResult, HandlerError, Priority, RpcError, RpcErrorCode, RpcResult,
    SubscriptionId, SubscriptionMetadata, validate_topic,
};

use crate::{MessageBus, RequestOptions};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// RPC manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub default_timeout_ms: u64,

    /// Retries after the first attempt
    pub default_retries: u32,

    /// Backoff before retry n is `base_delay_ms * 2^n`
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,

    /// Randomize each delay over `[0, delay]`
    pub jitter: bool,

    pub circuit: CircuitBreakerConfig,

    /// Pending requests older than this are force-rejected by the sweep
    pub stale_after_ms: u64,
    pub cleanup_interval_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            default_retries: 2,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            jitter: false,
            circuit: CircuitBreakerConfig::default(),
            stale_after_ms: 60_000,
            cleanup_interval_ms: 30_000,
        }
    }
}

impl RpcConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    /// Sweep period, at least one millisecond
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms.max(1))
    }

    /// Delay before retry number `retry` (0-based)
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let mut delay_ms = self.base_delay_ms.saturating_mul(factor);
        if self.max_delay_ms > 0 {
            delay_ms = delay_ms.min(self.max_delay_ms);
        }
        if self.jitter && delay_ms > 0 {
            delay_ms = rand::thread_rng().gen_range(0..=delay_ms);
        }
        Duration::from_millis(delay_ms)
    }
}

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct RpcRequestOptions {
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub priority: Priority,
}

impl RpcRequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stats
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RpcMetrics {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    circuit_rejections: AtomicU64,
    stale_evictions: AtomicU64,
}

fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Snapshot of RPC counters and breaker states
#[derive(Debug, Clone, Default, Serialize)]
pub struct RpcStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub circuit_rejections: u64,
    pub stale_evictions: u64,
    pub in_flight: usize,
    pub circuits: Vec<CircuitSnapshot>,
}

// ─────────────────────────────────────────────────────────────────────────────
// RPC Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Retrying, circuit-breaking RPC client over a `MessageBus`
#[derive(Clone)]
pub struct RpcManager {
    inner: Arc<RpcInner>,
}

struct RpcInner {
    bus: MessageBus,
    config: RpcConfig,
    circuits: CircuitBreakers,
    /// Call id -> (topic, start)
    in_flight: DashMap<u64, (String, Instant)>,
    next_call: AtomicU64,
    metrics: RpcMetrics,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcManager {
    /// Create a manager without the background sweep
    pub fn new(bus: MessageBus, config: RpcConfig) -> Self {
        let circuits = CircuitBreakers::new(config.circuit.clone());
        Self {
            inner: Arc::new(RpcInner {
                bus,
                config,
                circuits,
                in_flight: DashMap::new(),
                next_call: AtomicU64::new(0),
                metrics: RpcMetrics::default(),
                cleanup_task: Mutex::new(None),
            }),
        }
    }

    /// Create a manager and start its stale-request sweep
    pub fn start(bus: MessageBus, config: RpcConfig) -> Self {
        let manager = Self::new(bus, config);
        manager.start_cleanup();
        manager
    }

    /// Spawn the periodic stale-request sweep on the current runtime
    pub fn start_cleanup(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No tokio runtime; RPC stale-request sweep not started");
            return;
        };

        let weak: Weak<RpcInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.cleanup_interval();
        let task = runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let swept = (RpcManager { inner }).sweep_stale();
                if swept > 0 {
                    tracing::info!(swept, "Swept stale RPC requests");
                }
            }
        });

        if let Some(previous) = self.inner.cleanup_task.lock().replace(task) {
            previous.abort();
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    /// Call `topic` and wait for its reply
    pub async fn request(
        &self,
        topic: &str,
        payload: serde_json::Value,
        options: RpcRequestOptions,
    ) -> RpcResult<serde_json::Value> {
        let inner = &self.inner;
        if let Err(e) = validate_topic(topic) {
            return Err(RpcError::from_bus(e, topic));
        }

        let timeout = options
            .timeout
            .unwrap_or_else(|| inner.config.default_timeout());
        let max_retries = options.retries.unwrap_or(inner.config.default_retries);

        incr(&inner.metrics.calls);
        let _tracking = InFlight::track(inner, topic);

        let mut attempts = 0u32;
        loop {
            if !inner.circuits.try_acquire(topic) {
                incr(&inner.metrics.circuit_rejections);
                incr(&inner.metrics.failures);
                return Err(RpcError::circuit_open(topic).with_attempts(attempts));
            }

            // Retries are driven here, not by the bus
            let bus_options = RequestOptions::new()
                .timeout(timeout)
                .priority(options.priority)
                .max_retries(0);
            let result = inner.bus.request(topic, payload.clone(), bus_options).await;
            attempts += 1;

            let error = match result {
                Ok(value) => {
                    inner.circuits.record_success(topic);
                    incr(&inner.metrics.successes);
                    return Ok(value);
                }
                Err(e) => {
                    if matches!(e, BusError::Timeout { .. }) {
                        incr(&inner.metrics.timeouts);
                    }
                    RpcError::from_bus(e, topic)
                }
            };
            inner.circuits.record_failure(topic);

            if error.retriable && attempts <= max_retries {
                let delay = inner.config.backoff_delay(attempts - 1);
                incr(&inner.metrics.retries);
                tracing::debug!(
                    topic,
                    attempt = attempts,
                    code = %error.code,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying RPC call"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            incr(&inner.metrics.failures);
            tracing::warn!(
                topic,
                attempts,
                code = %error.code,
                error = %error.message,
                "RPC call failed"
            );
            return Err(error.with_attempts(attempts));
        }
    }

    /// Call `topic` and deserialize the reply
    pub async fn call<T: serde::de::DeserializeOwned>(
        &self,
        topic: &str,
        payload: serde_json::Value,
        options: RpcRequestOptions,
    ) -> RpcResult<T> {
        let value = self.request(topic, payload, options).await?;
        serde_json::from_value(value).map_err(|e| {
            RpcError::new(
                RpcErrorCode::InternalError,
                format!("Invalid reply from '{}': {}", topic, e),
            )
            .with_topic(topic)
        })
    }

    /// Register a responder whose errors keep their RPC code on the caller side
    pub fn serve<F, Fut>(&self, topic: &str, handler: F) -> BusResult<SubscriptionId>
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<serde_json::Value>> + Send + 'static,
    {
        self.serve_with(topic, handler, SubscriptionMetadata::default())
    }

    pub fn serve_with<F, Fut>(
        &self,
        topic: &str,
        handler: F,
        metadata: SubscriptionMetadata,
    ) -> BusResult<SubscriptionId>
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<serde_json::Value>> + Send + 'static,
    {
        self.inner.bus.create_rpc_handler_with(
            topic,
            move |payload| {
                let reply = handler(payload);
                async move { reply.await.map_err(HandlerError::from) }
            },
            metadata,
        )
    }

    pub fn circuit_state(&self, topic: &str) -> CircuitState {
        self.inner.circuits.state(topic)
    }

    pub fn reset_circuit(&self, topic: &str) -> bool {
        self.inner.circuits.reset(topic)
    }

    /// Force-reject bus requests and forget tracked calls older than the
    /// staleness bound
    pub fn sweep_stale(&self) -> usize {
        let inner = &self.inner;
        let max_age = inner.config.stale_after();
        let swept = inner.bus.sweep_stale_requests(max_age);

        let now = Instant::now();
        let before = inner.in_flight.len();
        inner
            .in_flight
            .retain(|_, (_, started)| now.duration_since(*started) < max_age);
        let forgotten = before.saturating_sub(inner.in_flight.len());

        let total = swept + forgotten;
        inner
            .metrics
            .stale_evictions
            .fetch_add(total as u64, Ordering::Relaxed);
        total
    }

    pub fn stats(&self) -> RpcStats {
        let m = &self.inner.metrics;
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RpcStats {
            calls: load(&m.calls),
            successes: load(&m.successes),
            failures: load(&m.failures),
            retries: load(&m.retries),
            timeouts: load(&m.timeouts),
            circuit_rejections: load(&m.circuit_rejections),
            stale_evictions: load(&m.stale_evictions),
            in_flight: self.inner.in_flight.len(),
            circuits: self.inner.circuits.snapshots(),
        }
    }

    /// Stop the background sweep
    pub fn shutdown(&self) {
        if let Some(task) = self.inner.cleanup_task.lock().take() {
            task.abort();
        }
        tracing::debug!("RPC manager stopped");
    }
}

impl Drop for RpcInner {
    fn drop(&mut self) {
        if let Some(task) = self.cleanup_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Tracks one call for the lifetime of its future
struct InFlight<'a> {
    inner: &'a RpcInner,
    id: u64,
}

impl<'a> InFlight<'a> {
    fn track(inner: &'a RpcInner, topic: &str) -> Self {
        let id = inner.next_call.fetch_add(1, Ordering::Relaxed);
        inner.in_flight.insert(id, (topic.to_string(), Instant::now()));
        Self { inner, id }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.inner.in_flight.remove(&self.id);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use crate::BusConfig;

    fn manager(config: RpcConfig) -> RpcManager {
        RpcManager::new(MessageBus::new(BusConfig::default()), config)
    }

    fn fast_config(threshold: u32, reset_timeout_ms: u64) -> RpcConfig {
        RpcConfig {
            default_timeout_ms: 200,
            default_retries: 0,
            base_delay_ms: 1,
            max_delay_ms: 10,
            circuit: CircuitBreakerConfig {
                enabled: true,
                failure_threshold: threshold,
                reset_timeout_ms,
            },
            ..Default::default()
        }
    }

    /// Responder that fails with `code` while `healthy` is false
    fn serve_flaky(
        rpc: &RpcManager,
        topic: &str,
        code: RpcErrorCode,
        calls: Arc<AtomicU32>,
        healthy: Arc<std::sync::atomic::AtomicBool>,
    ) {
        rpc.serve(topic, move |payload| {
            calls.fetch_add(1, Ordering::SeqCst);
            let ok = healthy.load(Ordering::SeqCst);
            async move {
                if ok {
                    Ok(payload)
                } else {
                    Err(RpcError::new(code, "backend down"))
                }
            }
        })
        .unwrap();
    }

    #[test]
    fn test_backoff_delay() {
        let config = RpcConfig {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            ..Default::default()
        };
        assert_eq!(config.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(800));
        assert_eq!(config.backoff_delay(4), Duration::from_millis(1_000));
        assert_eq!(config.backoff_delay(80), Duration::from_millis(1_000));

        let jittered = RpcConfig {
            jitter: true,
            ..config
        };
        for retry in 0..6 {
            assert!(jittered.backoff_delay(retry) <= Duration::from_millis(1_000));
        }
    }

    #[tokio::test]
    async fn test_request_success() {
        let rpc = manager(fast_config(5, 1_000));
        rpc.serve("math.double", |payload| async move {
            let n = payload.as_i64().unwrap_or_default();
            Ok(serde_json::json!(n * 2))
        })
        .unwrap();

        let reply: i64 = rpc
            .call("math.double", serde_json::json!(21), RpcRequestOptions::new())
            .await
            .unwrap();
        assert_eq!(reply, 42);

        let stats = rpc.stats();
        assert_eq!(stats.calls, 1);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_retriable_error_is_retried() {
        let rpc = manager(fast_config(10, 1_000));
        let calls = Arc::new(AtomicU32::new(0));
        let healthy = Arc::new(std::sync::atomic::AtomicBool::new(false));
        serve_flaky(&rpc, "svc.data", RpcErrorCode::ServiceUnavailable, Arc::clone(&calls), healthy);

        let err = rpc
            .request("svc.data", serde_json::Value::Null, RpcRequestOptions::new().retries(2))
            .await
            .unwrap_err();

        assert_eq!(err.code, RpcErrorCode::ServiceUnavailable);
        assert_eq!(err.attempts, 3);
        assert!(err.retriable);
        assert_eq!(err.status_code, 503);
        assert_eq!(err.topic.as_deref(), Some("svc.data"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(rpc.stats().retries, 2);
    }

    #[tokio::test]
    async fn test_non_retriable_error_fails_once() {
        let rpc = manager(fast_config(10, 1_000));
        let calls = Arc::new(AtomicU32::new(0));
        let healthy = Arc::new(std::sync::atomic::AtomicBool::new(false));
        serve_flaky(&rpc, "svc.data", RpcErrorCode::ValidationError, Arc::clone(&calls), healthy);

        let err = rpc
            .request("svc.data", serde_json::Value::Null, RpcRequestOptions::new().retries(3))
            .await
            .unwrap_err();

        assert_eq!(err.code, RpcErrorCode::ValidationError);
        assert_eq!(err.attempts, 1);
        assert!(!err.retriable);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_classified() {
        let rpc = manager(fast_config(10, 1_000));
        rpc.bus()
            .subscribe("svc.silent", |_msg| async move { Ok(()) })
            .unwrap();

        let started = Instant::now();
        let err = rpc
            .request(
                "svc.silent",
                serde_json::Value::Null,
                RpcRequestOptions::new().timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code, RpcErrorCode::Timeout);
        assert_eq!(err.status_code, 504);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(rpc.bus().pending_requests(), 0);
        assert_eq!(rpc.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_no_subscriber_is_service_unavailable() {
        let rpc = manager(fast_config(10, 1_000));
        let err = rpc
            .request("nobody.home", serde_json::Value::Null, RpcRequestOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::ServiceUnavailable);
    }

    #[tokio::test]
    async fn test_circuit_opens_and_admits_one_trial() {
        let rpc = manager(fast_config(3, 50));
        let calls = Arc::new(AtomicU32::new(0));
        let healthy = Arc::new(std::sync::atomic::AtomicBool::new(false));
        serve_flaky(
            &rpc,
            "svc.data",
            RpcErrorCode::ServiceUnavailable,
            Arc::clone(&calls),
            Arc::clone(&healthy),
        );

        for _ in 0..3 {
            rpc.request("svc.data", serde_json::Value::Null, RpcRequestOptions::new())
                .await
                .unwrap_err();
        }
        assert_eq!(rpc.circuit_state("svc.data"), CircuitState::Open);

        let err = rpc
            .request("svc.data", serde_json::Value::Null, RpcRequestOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::CircuitBreakerOpen);
        assert_eq!(err.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        tokio::time::sleep(Duration::from_millis(60)).await;
        healthy.store(true, Ordering::SeqCst);

        // The first call becomes the trial; the second is rejected while it runs
        let (trial, rejected) = tokio::join!(
            rpc.request("svc.data", serde_json::json!(1), RpcRequestOptions::new()),
            rpc.request("svc.data", serde_json::json!(2), RpcRequestOptions::new()),
        );
        assert_eq!(trial.unwrap(), serde_json::json!(1));
        assert_eq!(rejected.unwrap_err().code, RpcErrorCode::CircuitBreakerOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(rpc.circuit_state("svc.data"), CircuitState::Closed);

        let stats = rpc.stats();
        assert_eq!(stats.circuit_rejections, 2);
        assert_eq!(stats.circuits.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_circuit() {
        let rpc = manager(fast_config(1, 60_000));
        rpc.request("nobody.home", serde_json::Value::Null, RpcRequestOptions::new())
            .await
            .unwrap_err();
        assert_eq!(rpc.circuit_state("nobody.home"), CircuitState::Open);

        assert!(rpc.reset_circuit("nobody.home"));
        assert_eq!(rpc.circuit_state("nobody.home"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_invalid_topic() {
        let rpc = manager(fast_config(1, 60_000));
        let err = rpc
            .request("bad..topic", serde_json::Value::Null, RpcRequestOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::InvalidRequest);
        assert_eq!(rpc.circuit_state("bad..topic"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_closed_bus_is_not_retried() {
        let rpc = manager(fast_config(10, 1_000));
        rpc.serve("svc.data", |payload| async move { Ok(payload) })
            .unwrap();
        rpc.bus().shutdown();

        let err = rpc
            .request("svc.data", serde_json::Value::Null, RpcRequestOptions::new().retries(3))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::ServiceUnavailable);
        assert!(!err.retriable);
        assert_eq!(err.attempts, 1);
        assert_eq!(rpc.stats().retries, 0);
    }

    #[tokio::test]
    async fn test_zero_cleanup_interval_keeps_sweeping() {
        let config = RpcConfig {
            cleanup_interval_ms: 0,
            ..fast_config(10, 1_000)
        };
        assert_eq!(config.cleanup_interval(), Duration::from_millis(1));

        let rpc = RpcManager::start(MessageBus::new(BusConfig::default()), config);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let running = rpc
            .inner
            .cleanup_task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished());
        assert_eq!(running, Some(true));
        rpc.shutdown();
    }

    #[tokio::test]
    async fn test_sweep_stale() {
        let config = RpcConfig {
            stale_after_ms: 0,
            ..fast_config(10, 1_000)
        };
        let rpc = manager(config);
        rpc.bus()
            .subscribe("svc.silent", |_msg| async move { Ok(()) })
            .unwrap();

        let caller = rpc.clone();
        let call = tokio::spawn(async move {
            caller
                .request(
                    "svc.silent",
                    serde_json::Value::Null,
                    RpcRequestOptions::new().timeout(Duration::from_secs(10)),
                )
                .await
        });
        while rpc.bus().pending_requests() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(rpc.sweep_stale() >= 1);
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.code, RpcErrorCode::Timeout);
        assert!(rpc.stats().stale_evictions >= 1);
    }
}
