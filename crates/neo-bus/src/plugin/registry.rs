//! Plugin Registry
//!
//! Hands out capability-checked contexts on load and removes every
//! subscription a plugin owns on unload or reload.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

use bus_runtime::{MessageBus, PatternManager, RpcManager};

use super::{EventsApi, Guarded, PluginBus, PluginError, PluginPermissions, PluginResult, RpcApi};

/// Manifest file looked for in each plugin directory
pub const MANIFEST_FILE: &str = "neo-plugin.json";

/// Plugin manifest (neo-plugin.json)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub permissions: PluginPermissions,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl PluginManifest {
    pub fn new(id: impl Into<String>, permissions: PluginPermissions) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: default_version(),
            description: None,
            permissions,
        }
    }
}

/// Read every `<dir>/<plugin>/neo-plugin.json`, sorted by id
///
/// A missing directory yields no manifests. Manifests that fail to parse, and
/// later duplicates of an id, are skipped with a warning.
pub async fn read_manifests(dir: &Path) -> PluginResult<Vec<PluginManifest>> {
    if !tokio::fs::try_exists(dir).await? {
        tracing::debug!(dir = %dir.display(), "No plugin manifest directory");
        return Ok(Vec::new());
    }

    let mut plugin_dirs = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            plugin_dirs.push(entry.path());
        }
    }
    // Directory order decides which duplicate wins
    plugin_dirs.sort();

    let mut by_id = std::collections::BTreeMap::new();
    for plugin_dir in plugin_dirs {
        let path = plugin_dir.join(MANIFEST_FILE);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<PluginManifest>(&raw) {
            Ok(manifest) if by_id.contains_key(&manifest.id) => {
                tracing::warn!(plugin = %manifest.id, path = %path.display(), "Duplicate plugin id; skipped");
            }
            Ok(manifest) => {
                by_id.insert(manifest.id.clone(), manifest);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Invalid plugin manifest; skipped");
            }
        }
    }

    Ok(by_id.into_values().collect())
}

// ─────────────────────────────────────────────────────────────────────────────
// Context
// ─────────────────────────────────────────────────────────────────────────────

/// What a loaded plugin is given to talk to the rest of the system
#[derive(Clone)]
pub struct PluginContext {
    manifest: Arc<PluginManifest>,
    api: Arc<Guarded<PluginBus>>,
}

impl PluginContext {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    pub fn events(&self) -> Arc<dyn EventsApi> {
        self.api.clone()
    }

    pub fn rpc(&self) -> Arc<dyn RpcApi> {
        self.api.clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

struct LoadedPlugin {
    manifest: Arc<PluginManifest>,
    loaded_at: DateTime<Utc>,
}

/// Summary of a loaded plugin
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub loaded_at: DateTime<Utc>,
}

/// Tracks loaded plugins and their bus footprint
pub struct PluginRegistry {
    bus: MessageBus,
    rpc: RpcManager,
    patterns: Option<Arc<PatternManager>>,
    plugins: DashMap<String, LoadedPlugin>,
    denied: Arc<AtomicU64>,
}

impl PluginRegistry {
    pub fn new(bus: MessageBus, rpc: RpcManager) -> Self {
        Self {
            bus,
            rpc,
            patterns: None,
            plugins: DashMap::new(),
            denied: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Also clean up pattern manager subscriptions on unload
    pub fn with_pattern_manager(mut self, patterns: Arc<PatternManager>) -> Self {
        self.patterns = Some(patterns);
        self
    }

    /// Register a plugin and build its context
    pub fn load(&self, manifest: PluginManifest) -> PluginResult<PluginContext> {
        let id = manifest.id.clone();
        let slot = match self.plugins.entry(id.clone()) {
            Entry::Occupied(_) => return Err(PluginError::AlreadyLoaded(id)),
            Entry::Vacant(slot) => slot,
        };

        let api = Guarded::new(
            PluginBus::new(id.as_str(), self.bus.clone(), self.rpc.clone()),
            id.as_str(),
            &manifest.permissions,
            Arc::clone(&self.denied),
        )?;

        let manifest = Arc::new(manifest);
        slot.insert(LoadedPlugin {
            manifest: Arc::clone(&manifest),
            loaded_at: Utc::now(),
        });

        tracing::info!(
            "Loaded plugin: {} v{} ({})",
            manifest.name,
            manifest.version,
            manifest.id
        );
        Ok(PluginContext {
            manifest,
            api: Arc::new(api),
        })
    }

    /// Unregister a plugin; returns the number of subscriptions removed
    pub fn unload(&self, id: &str) -> PluginResult<usize> {
        if self.plugins.remove(id).is_none() {
            return Err(PluginError::NotLoaded(id.to_string()));
        }

        let mut removed = self.bus.unsubscribe_by_plugin(id);
        if let Some(patterns) = &self.patterns {
            removed += patterns.unsubscribe_by_plugin(id);
        }

        tracing::info!(plugin = id, subscriptions = removed, "Unloaded plugin");
        Ok(removed)
    }

    /// Unload (if loaded) and load again with a possibly updated manifest
    pub fn reload(&self, manifest: PluginManifest) -> PluginResult<PluginContext> {
        match self.unload(&manifest.id) {
            Ok(_) | Err(PluginError::NotLoaded(_)) => {}
            Err(e) => return Err(e),
        }
        self.load(manifest)
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.plugins.contains_key(id)
    }

    pub fn loaded(&self) -> Vec<PluginInfo> {
        let mut plugins: Vec<PluginInfo> = self
            .plugins
            .iter()
            .map(|entry| PluginInfo {
                id: entry.manifest.id.clone(),
                name: entry.manifest.name.clone(),
                version: entry.manifest.version.clone(),
                loaded_at: entry.loaded_at,
            })
            .collect();
        plugins.sort_by(|a, b| a.id.cmp(&b.id));
        plugins
    }

    /// Calls rejected by any plugin's permission check
    pub fn permission_denied(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Capability, rpc_handler_fn};
    use bus_runtime::{BusConfig, PatternManagerConfig, RpcConfig, RpcRequestOptions, handler_fn};
    use bus_types::PublishOptions;
    use tempfile::TempDir;
    use tokio::fs;

    fn registry() -> (PluginRegistry, MessageBus, Arc<PatternManager>) {
        let bus = MessageBus::new(BusConfig::default());
        let rpc = RpcManager::new(bus.clone(), RpcConfig::default());
        let patterns = Arc::new(PatternManager::new(PatternManagerConfig::default()));
        let registry = PluginRegistry::new(bus.clone(), rpc).with_pattern_manager(Arc::clone(&patterns));
        (registry, bus, patterns)
    }

    #[tokio::test]
    async fn test_unload_removes_subscriptions() {
        let (registry, bus, patterns) = registry();
        let ctx = registry
            .load(PluginManifest::new("hvac", PluginPermissions::all()))
            .unwrap();

        ctx.events()
            .subscribe("zone.temp", handler_fn(|_msg| async move { Ok(()) }))
            .unwrap();
        ctx.rpc()
            .serve("hvac.setpoint", rpc_handler_fn(|p| async move { Ok(p) }))
            .unwrap();
        patterns
            .subscribe(
                "zone.*.temp",
                |_msg| async move { Ok(()) },
                Some(bus_types::SubscriptionMetadata::for_plugin("hvac")),
            )
            .unwrap();
        assert_eq!(bus.subscription_count(), 2);

        assert_eq!(registry.unload("hvac").unwrap(), 3);
        assert_eq!(bus.subscription_count(), 0);
        assert!(!registry.is_loaded("hvac"));
        assert!(matches!(registry.unload("hvac"), Err(PluginError::NotLoaded(_))));
    }

    #[tokio::test]
    async fn test_load_twice_fails() {
        let (registry, _, _) = registry();
        registry
            .load(PluginManifest::new("hvac", PluginPermissions::all()))
            .unwrap();
        assert!(matches!(
            registry.load(PluginManifest::new("hvac", PluginPermissions::all())),
            Err(PluginError::AlreadyLoaded(_))
        ));
    }

    #[test]
    fn test_concurrent_load_admits_one() {
        let (registry, _, _) = registry();
        let start = std::sync::Barrier::new(8);

        let loaded = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        start.wait();
                        registry
                            .load(PluginManifest::new("hvac", PluginPermissions::all()))
                            .is_ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or(false))
                .filter(|ok| *ok)
                .count()
        });

        assert_eq!(loaded, 1);
        assert_eq!(registry.loaded().len(), 1);
    }

    #[tokio::test]
    async fn test_reload_applies_new_permissions() {
        let (registry, bus, _) = registry();
        let ctx = registry
            .load(PluginManifest::new("hvac", PluginPermissions::all()))
            .unwrap();
        ctx.events()
            .subscribe("zone.temp", handler_fn(|_msg| async move { Ok(()) }))
            .unwrap();

        let restricted = PluginPermissions::default().grant(Capability::RpcCall);
        let ctx = registry
            .reload(PluginManifest::new("hvac", restricted))
            .unwrap();
        assert_eq!(bus.subscription_count(), 0);

        let err = ctx
            .events()
            .publish("zone.temp", serde_json::Value::Null, PublishOptions::new())
            .unwrap_err();
        assert!(err.is_permission_denied());
        assert_eq!(registry.permission_denied(), 1);

        // Reload of a plugin that was never loaded just loads it
        registry
            .reload(PluginManifest::new("lighting", PluginPermissions::all()))
            .unwrap();
        let ids: Vec<String> = registry.loaded().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["hvac", "lighting"]);
    }

    #[tokio::test]
    async fn test_plugins_talk_over_rpc() {
        let (registry, _, _) = registry();
        let server = registry
            .load(PluginManifest::new(
                "weather",
                PluginPermissions::default()
                    .grant(Capability::RpcServe)
                    .topic("weather.*"),
            ))
            .unwrap();
        let client = registry
            .load(PluginManifest::new(
                "dashboard",
                PluginPermissions::default().grant(Capability::RpcCall),
            ))
            .unwrap();

        server
            .rpc()
            .serve(
                "weather.current",
                rpc_handler_fn(|_p| async move { Ok(serde_json::json!({"temp_f": 71})) }),
            )
            .unwrap();

        let reply = client
            .rpc()
            .request("weather.current", serde_json::Value::Null, RpcRequestOptions::new())
            .await
            .unwrap();
        assert_eq!(reply["temp_f"], 71);
    }

    #[tokio::test]
    async fn test_read_manifests() {
        let dir = TempDir::new().unwrap();
        let path = dir.path();

        for (name, body) in [
            (
                "weather",
                r#"{
  "id": "weather",
  "name": "Weather Service",
  "permissions": {
    "capabilities": ["rpc.serve", "events.publish"],
    "topics": ["weather.*"]
  }
}"#,
            ),
            ("alarms", r#"{ "id": "alarms", "name": "Alarms" }"#),
            ("weather-copy", r#"{ "id": "weather", "name": "Second Weather" }"#),
            ("broken", "{ not json"),
        ] {
            fs::create_dir(path.join(name)).await.unwrap();
            fs::write(path.join(name).join(MANIFEST_FILE), body).await.unwrap();
        }
        fs::create_dir(path.join("assets")).await.unwrap();
        fs::write(path.join("README.md"), "plugins").await.unwrap();

        let manifests = read_manifests(path).await.unwrap();
        let ids: Vec<&str> = manifests.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["alarms", "weather"]);

        let weather = &manifests[1];
        assert_eq!(weather.version, "1.0.0");
        assert!(weather.permissions.capabilities.contains(&Capability::RpcServe));
        assert_eq!(weather.permissions.topics, vec!["weather.*"]);
        assert!(manifests[0].permissions.capabilities.is_empty());

        assert!(read_manifests(&path.join("nope")).await.unwrap().is_empty());
    }
}
