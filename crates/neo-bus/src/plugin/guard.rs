//! Permission-checking decorator
//!
//! `Guarded<T>` wraps any capability implementation and checks each call
//! against the plugin's granted capabilities and topic patterns before
//! forwarding it. The permissions are compiled once at construction.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use bus_runtime::{PublishOutcome, RpcRequestOptions, SharedHandler};
use bus_types::{BusResult, PublishOptions, SubscriptionId, TopicPattern};

use super::{EventsApi, PluginError, PluginResult, RpcApi, RpcHandler};

/// A group of operations a plugin may be granted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "events.publish")]
    Publish,
    #[serde(rename = "events.subscribe")]
    Subscribe,
    #[serde(rename = "rpc.call")]
    RpcCall,
    #[serde(rename = "rpc.serve")]
    RpcServe,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Capability::Publish => "events.publish",
            Capability::Subscribe => "events.subscribe",
            Capability::RpcCall => "rpc.call",
            Capability::RpcServe => "rpc.serve",
        };
        f.write_str(name)
    }
}

/// Permissions declared in a plugin manifest
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginPermissions {
    pub capabilities: HashSet<Capability>,

    /// Topic patterns the plugin may use; empty allows every topic
    pub topics: Vec<String>,
}

impl PluginPermissions {
    pub fn all() -> Self {
        Self {
            capabilities: [
                Capability::Publish,
                Capability::Subscribe,
                Capability::RpcCall,
                Capability::RpcServe,
            ]
            .into_iter()
            .collect(),
            topics: Vec::new(),
        }
    }

    pub fn grant(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn topic(mut self, pattern: impl Into<String>) -> Self {
        self.topics.push(pattern.into());
        self
    }
}

/// Whether `allowed` admits every topic that `requested` can address
fn covers(allowed: &TopicPattern, requested: &TopicPattern) -> bool {
    match requested {
        TopicPattern::Exact { topic } => allowed.matches(topic),
        _ if allowed.as_str() == requested.as_str() => true,
        TopicPattern::Prefix { segments, .. } => match allowed {
            TopicPattern::Prefix {
                segments: allowed, ..
            } => segments.starts_with(allowed),
            _ => false,
        },
        _ => false,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Guarded
// ─────────────────────────────────────────────────────────────────────────────

/// Capability decorator; denied calls fail with `PermissionDenied`
pub struct Guarded<T> {
    inner: T,
    plugin: String,
    capabilities: HashSet<Capability>,
    /// Empty means unrestricted
    topics: Vec<TopicPattern>,
    denied: Arc<AtomicU64>,
}

impl<T> Guarded<T> {
    /// Wrap `inner`, compiling the topic patterns up front
    ///
    /// `denied` is incremented for every rejected call.
    pub fn new(
        inner: T,
        plugin: impl Into<String>,
        permissions: &PluginPermissions,
        denied: Arc<AtomicU64>,
    ) -> BusResult<Self> {
        let topics = permissions
            .topics
            .iter()
            .map(|pattern| TopicPattern::parse(pattern))
            .collect::<BusResult<Vec<_>>>()?;

        Ok(Self {
            inner,
            plugin: plugin.into(),
            capabilities: permissions.capabilities.clone(),
            topics,
            denied,
        })
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    fn deny(&self, reason: String) -> PluginError {
        self.denied.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(plugin = %self.plugin, reason = %reason, "Permission denied");
        PluginError::PermissionDenied {
            plugin: self.plugin.clone(),
            reason,
        }
    }

    fn check(&self, capability: Capability, topic: Option<&str>) -> PluginResult<()> {
        if !self.capabilities.contains(&capability) {
            return Err(self.deny(format!("missing capability '{}'", capability)));
        }

        let Some(topic) = topic else {
            return Ok(());
        };
        if self.topics.is_empty() {
            return Ok(());
        }
        // Malformed topics are left for the bus to reject
        let Ok(requested) = TopicPattern::parse(topic) else {
            return Ok(());
        };
        if self.topics.iter().any(|allowed| covers(allowed, &requested)) {
            Ok(())
        } else {
            Err(self.deny(format!("topic '{}' is not permitted", topic)))
        }
    }
}

impl<T: EventsApi> EventsApi for Guarded<T> {
    fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        options: PublishOptions,
    ) -> PluginResult<PublishOutcome> {
        self.check(Capability::Publish, Some(topic))?;
        self.inner.publish(topic, payload, options)
    }

    fn subscribe(&self, topic: &str, handler: SharedHandler) -> PluginResult<SubscriptionId> {
        self.check(Capability::Subscribe, Some(topic))?;
        self.inner.subscribe(topic, handler)
    }

    fn subscribe_pattern(
        &self,
        pattern: &str,
        handler: SharedHandler,
    ) -> PluginResult<SubscriptionId> {
        self.check(Capability::Subscribe, Some(pattern))?;
        self.inner.subscribe_pattern(pattern, handler)
    }

    fn unsubscribe(&self, subscription_id: &str) -> PluginResult<bool> {
        self.check(Capability::Subscribe, None)?;
        self.inner.unsubscribe(subscription_id)
    }
}

#[async_trait]
impl<T: RpcApi> RpcApi for Guarded<T> {
    async fn request(
        &self,
        topic: &str,
        payload: serde_json::Value,
        options: RpcRequestOptions,
    ) -> PluginResult<serde_json::Value> {
        self.check(Capability::RpcCall, Some(topic))?;
        self.inner.request(topic, payload, options).await
    }

    fn serve(&self, topic: &str, handler: RpcHandler) -> PluginResult<SubscriptionId> {
        self.check(Capability::RpcServe, Some(topic))?;
        self.inner.serve(topic, handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{PluginBus, rpc_handler_fn};
    use bus_runtime::{BusConfig, MessageBus, RpcConfig, RpcManager, handler_fn};

    fn guarded(permissions: PluginPermissions) -> (Guarded<PluginBus>, Arc<AtomicU64>) {
        let bus = MessageBus::new(BusConfig::default());
        let rpc = RpcManager::new(bus.clone(), RpcConfig::default());
        let denied = Arc::new(AtomicU64::new(0));
        let api = Guarded::new(
            PluginBus::new("sensor", bus, rpc),
            "sensor",
            &permissions,
            Arc::clone(&denied),
        )
        .unwrap();
        (api, denied)
    }

    #[test]
    fn test_covers() {
        let allowed = TopicPattern::parse("sensor.*").unwrap();
        let parse = |p: &str| TopicPattern::parse(p).unwrap();

        assert!(covers(&allowed, &parse("sensor.temp")));
        assert!(covers(&allowed, &parse("sensor.*")));
        assert!(covers(&allowed, &parse("sensor.zone.*")));
        assert!(!covers(&allowed, &parse("sensor")));
        assert!(!covers(&allowed, &parse("alarm.*")));
        assert!(!covers(&allowed, &parse("*.temp")));

        let exact = TopicPattern::parse("alarm.raise").unwrap();
        assert!(covers(&exact, &parse("alarm.raise")));
        assert!(!covers(&exact, &parse("alarm.*")));
    }

    #[tokio::test]
    async fn test_missing_capability_denied() {
        let (api, denied) = guarded(PluginPermissions::default().grant(Capability::Publish));

        tokio_test::assert_ok!(api.publish("sensor.temp", serde_json::json!(20), PublishOptions::new()));

        let err = api
            .subscribe("sensor.temp", handler_fn(|_msg| async move { Ok(()) }))
            .unwrap_err();
        assert!(err.is_permission_denied());

        let err = api
            .request("svc.data", serde_json::Value::Null, RpcRequestOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_permission_denied());
        assert_eq!(denied.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_topic_restriction() {
        let (api, denied) = guarded(PluginPermissions::all().topic("sensor.*"));

        tokio_test::assert_ok!(api.publish("sensor.temp", serde_json::json!(20), PublishOptions::new()));
        assert!(
            api.publish("alarm.raise", serde_json::Value::Null, PublishOptions::new())
                .unwrap_err()
                .is_permission_denied()
        );
        assert!(
            api.subscribe_pattern("sensor.zone.*", handler_fn(|_msg| async move { Ok(()) }))
                .is_ok()
        );
        assert!(
            api.serve("alarm.ack", rpc_handler_fn(|p| async move { Ok(p) }))
                .unwrap_err()
                .is_permission_denied()
        );
        assert_eq!(denied.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_bus_errors_pass_through() {
        let (api, denied) = guarded(PluginPermissions::all());
        let err = api
            .subscribe_pattern("*.temp", handler_fn(|_msg| async move { Ok(()) }))
            .unwrap_err();
        assert!(matches!(err, PluginError::Bus(_)));
        assert_eq!(denied.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_invalid_permission_pattern() {
        let bus = MessageBus::new(BusConfig::default());
        let rpc = RpcManager::new(bus.clone(), RpcConfig::default());
        let permissions = PluginPermissions::all().topic("a..b");
        let result = Guarded::new(
            PluginBus::new("bad", bus, rpc),
            "bad",
            &permissions,
            Arc::new(AtomicU64::new(0)),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_capability_names() {
        let json = serde_json::to_string(&Capability::RpcCall).unwrap();
        assert_eq!(json, "\"rpc.call\"");
        assert_eq!(Capability::Subscribe.to_string(), "events.subscribe");
    }
}
