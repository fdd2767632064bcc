//! Capability interfaces and their bus-backed implementation

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use bus_runtime::{MessageBus, PublishOutcome, RpcManager, RpcRequestOptions, SharedHandler};
use bus_types::{PublishOptions, RpcResult, SubscriptionId, SubscriptionMetadata};

use super::PluginResult;

/// Type-erased RPC responder
pub type RpcHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, RpcResult<serde_json::Value>> + Send + Sync>;

/// Wrap an async closure as an `RpcHandler`
pub fn rpc_handler_fn<F, Fut>(f: F) -> RpcHandler
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<serde_json::Value>> + Send + 'static,
{
    Arc::new(move |payload| f(payload).boxed())
}

// ─────────────────────────────────────────────────────────────────────────────
// Capability Groups
// ─────────────────────────────────────────────────────────────────────────────

/// One-way messaging
pub trait EventsApi: Send + Sync {
    fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        options: PublishOptions,
    ) -> PluginResult<PublishOutcome>;

    fn subscribe(&self, topic: &str, handler: SharedHandler) -> PluginResult<SubscriptionId>;

    fn subscribe_pattern(&self, pattern: &str, handler: SharedHandler)
    -> PluginResult<SubscriptionId>;

    /// Remove one of this plugin's own subscriptions
    fn unsubscribe(&self, subscription_id: &str) -> PluginResult<bool>;
}

/// Request/reply
#[async_trait]
pub trait RpcApi: Send + Sync {
    async fn request(
        &self,
        topic: &str,
        payload: serde_json::Value,
        options: RpcRequestOptions,
    ) -> PluginResult<serde_json::Value>;

    fn serve(&self, topic: &str, handler: RpcHandler) -> PluginResult<SubscriptionId>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Bus
// ─────────────────────────────────────────────────────────────────────────────

/// Bus access for a single plugin
///
/// Every subscription it creates is tagged with the plugin name so the
/// loader can remove them all at once.
#[derive(Clone)]
pub struct PluginBus {
    plugin: String,
    bus: MessageBus,
    rpc: RpcManager,
    owned: Arc<Mutex<HashSet<SubscriptionId>>>,
}

impl PluginBus {
    pub fn new(plugin: impl Into<String>, bus: MessageBus, rpc: RpcManager) -> Self {
        Self {
            plugin: plugin.into(),
            bus,
            rpc,
            owned: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Subscriptions created through this handle that are still tracked
    pub fn subscription_count(&self) -> usize {
        self.owned.lock().len()
    }

    fn metadata(&self) -> SubscriptionMetadata {
        SubscriptionMetadata::for_plugin(self.plugin.as_str())
    }

    fn track(&self, id: SubscriptionId) -> SubscriptionId {
        self.owned.lock().insert(id.clone());
        id
    }
}

impl EventsApi for PluginBus {
    fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        options: PublishOptions,
    ) -> PluginResult<PublishOutcome> {
        Ok(self.bus.publish_with(topic, payload, options)?)
    }

    fn subscribe(&self, topic: &str, handler: SharedHandler) -> PluginResult<SubscriptionId> {
        let id = self.bus.subscribe_handler(topic, handler, self.metadata())?;
        Ok(self.track(id))
    }

    fn subscribe_pattern(
        &self,
        pattern: &str,
        handler: SharedHandler,
    ) -> PluginResult<SubscriptionId> {
        let id = self
            .bus
            .subscribe_pattern_handler(pattern, handler, self.metadata())?;
        Ok(self.track(id))
    }

    fn unsubscribe(&self, subscription_id: &str) -> PluginResult<bool> {
        if !self.owned.lock().remove(subscription_id) {
            return Ok(false);
        }
        Ok(self.bus.unsubscribe(subscription_id))
    }
}

#[async_trait]
impl RpcApi for PluginBus {
    async fn request(
        &self,
        topic: &str,
        payload: serde_json::Value,
        options: RpcRequestOptions,
    ) -> PluginResult<serde_json::Value> {
        Ok(self.rpc.request(topic, payload, options).await?)
    }

    fn serve(&self, topic: &str, handler: RpcHandler) -> PluginResult<SubscriptionId> {
        let id = self
            .rpc
            .serve_with(topic, move |payload| handler(payload), self.metadata())?;
        Ok(self.track(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus_runtime::{BusConfig, RpcConfig, handler_fn};

    fn plugin_bus(name: &str) -> PluginBus {
        let bus = MessageBus::new(BusConfig::default());
        let rpc = RpcManager::new(bus.clone(), RpcConfig::default());
        PluginBus::new(name, bus, rpc)
    }

    #[tokio::test]
    async fn test_subscriptions_are_tagged() {
        let api = plugin_bus("hvac");
        let noop = handler_fn(|_msg| async move { Ok(()) });

        api.subscribe("zone.temp", noop.clone()).unwrap();
        api.subscribe_pattern("zone.*", noop).unwrap();
        api.serve("hvac.ping", rpc_handler_fn(|p| async move { Ok(p) }))
            .unwrap();
        assert_eq!(api.subscription_count(), 3);

        assert_eq!(api.bus.unsubscribe_by_plugin("hvac"), 3);
    }

    #[tokio::test]
    async fn test_unsubscribe_only_own() {
        let api = plugin_bus("hvac");
        let foreign = api
            .bus
            .subscribe("zone.temp", |_msg| async move { Ok(()) })
            .unwrap();

        assert!(!api.unsubscribe(&foreign).unwrap());
        assert_eq!(api.bus.subscription_count(), 1);

        let own = api
            .subscribe("zone.temp", handler_fn(|_msg| async move { Ok(()) }))
            .unwrap();
        assert!(api.unsubscribe(&own).unwrap());
        assert!(!api.unsubscribe(&own).unwrap());
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let api = plugin_bus("calc");
        api.serve(
            "calc.add",
            rpc_handler_fn(|p| async move {
                let sum: i64 = p
                    .as_array()
                    .map(|values| values.iter().filter_map(serde_json::Value::as_i64).sum())
                    .unwrap_or_default();
                Ok(serde_json::json!(sum))
            }),
        )
        .unwrap();

        let reply = api
            .request("calc.add", serde_json::json!([1, 2, 3]), RpcRequestOptions::new())
            .await
            .unwrap();
        assert_eq!(reply, serde_json::json!(6));
    }
}
