//! Soak Run
//!
//! Loads a few plugins, pushes sensor traffic through the bus and the pattern
//! manager, makes a batch of echo RPC calls, then unloads everything and
//! reports the resulting stats.
//!
//! Manifests read from a plugins directory replace the built-in `sensor`,
//! `monitor` and `echo` manifests with the same id; any other manifest is
//! loaded alongside them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::future::join_all;
use serde::Serialize;

use bus_runtime::{
    BusStats, MessageBus, PatternManager, PatternManagerStats, RpcManager, RpcRequestOptions,
    RpcStats, handler_fn,
};
use bus_types::{Priority, PublishOptions, SubscriptionMetadata};

use crate::config::NeoBusConfig;
use crate::plugin::{
    Capability, PluginManifest, PluginPermissions, PluginRegistry, read_manifests,
    rpc_handler_fn,
};

/// How long to wait for the queue to drain
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of a soak run
#[derive(Debug, Clone, Serialize)]
pub struct SoakReport {
    pub messages: usize,
    /// Plugins loaded from manifests on disk
    pub manifest_plugins: Vec<String>,
    /// Sensor publishes refused by the bus or the permission check
    pub publish_rejected: usize,
    /// Deliveries seen by the bus pattern subscriber
    pub received: u64,
    /// Deliveries seen by the pattern manager subscriber
    pub pattern_deliveries: u64,
    pub rpc_calls: usize,
    pub rpc_failures: usize,
    pub permission_denied: u64,
    pub unloaded_subscriptions: usize,
    pub elapsed_ms: u64,
    pub bus: BusStats,
    pub patterns: PatternManagerStats,
    pub rpc: RpcStats,
}

pub async fn run(
    config: &NeoBusConfig,
    messages: usize,
    plugins_dir: Option<&Path>,
) -> Result<SoakReport> {
    let started = Instant::now();

    let mut on_disk: HashMap<String, PluginManifest> = match plugins_dir {
        Some(dir) => read_manifests(dir)
            .await
            .with_context(|| format!("Reading plugin manifests from {}", dir.display()))?
            .into_iter()
            .map(|manifest| (manifest.id.clone(), manifest))
            .collect(),
        None => HashMap::new(),
    };
    let manifest_plugins = {
        let mut ids: Vec<String> = on_disk.keys().cloned().collect();
        ids.sort();
        ids
    };
    let mut manifest = |id: &str, permissions: PluginPermissions| {
        on_disk
            .remove(id)
            .unwrap_or_else(|| PluginManifest::new(id, permissions))
    };

    let bus = MessageBus::new(config.bus.clone());
    let patterns = PatternManager::start(config.patterns.clone());
    let rpc = RpcManager::start(bus.clone(), config.rpc.clone());
    let registry = PluginRegistry::new(bus.clone(), rpc.clone())
        .with_pattern_manager(Arc::clone(&patterns));

    let sensor = registry.load(manifest(
        "sensor",
        PluginPermissions::default()
            .grant(Capability::Publish)
            .topic("sensor.*"),
    ))?;
    let monitor = registry.load(manifest(
        "monitor",
        PluginPermissions::default()
            .grant(Capability::Subscribe)
            .grant(Capability::RpcCall),
    ))?;
    let echo = registry.load(manifest(
        "echo",
        PluginPermissions::default()
            .grant(Capability::RpcServe)
            .topic("echo"),
    ))?;
    for (_, extra) in on_disk.drain() {
        registry.load(extra)?;
    }

    let received = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&received);
    monitor.events().subscribe_pattern(
        "sensor.*",
        handler_fn(move |_msg| {
            counter.fetch_add(1, Ordering::Relaxed);
            async move { Ok(()) }
        }),
    )?;

    let pattern_deliveries = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&pattern_deliveries);
    patterns.subscribe(
        "sensor.*.temp",
        move |_msg| {
            counter.fetch_add(1, Ordering::Relaxed);
            async move { Ok(()) }
        },
        Some(SubscriptionMetadata::for_plugin("monitor")),
    )?;

    echo.rpc()
        .serve("echo", rpc_handler_fn(|payload| async move { Ok(payload) }))?;

    tracing::info!(messages, "Publishing sensor traffic");
    let events = sensor.events();
    let mut publish_rejected = 0;
    for i in 0..messages {
        let priority = match i % 3 {
            0 => Priority::High,
            1 => Priority::Normal,
            _ => Priority::Low,
        };
        let topic = format!("sensor.zone{}.temp", i % 8);
        let payload = serde_json::json!({ "seq": i, "value": 68.0 + (i % 10) as f64 * 0.5 });

        if let Err(e) = events.publish(&topic, payload.clone(), PublishOptions::new().priority(priority)) {
            publish_rejected += 1;
            tracing::debug!(topic = %topic, error = %e, "Sensor publish rejected");
        }
        patterns.publish(&topic, payload).await?;
    }

    if let Err(e) = events.publish("alarm.raise", serde_json::Value::Null, PublishOptions::new()) {
        tracing::debug!(error = %e, "Sensor plugin blocked from alarm topics");
    }

    let rpc_calls = (messages / 10).max(1);
    let client = monitor.rpc();
    let results = join_all((0..rpc_calls).map(|i| {
        client.request("echo", serde_json::json!({ "n": i }), RpcRequestOptions::new())
    }))
    .await;
    let rpc_failures = results.iter().filter(|r| r.is_err()).count();
    if rpc_failures > 0 {
        tracing::warn!(rpc_failures, "Some echo calls failed");
    }

    tokio::time::timeout(DRAIN_TIMEOUT, async {
        while !bus.is_idle() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .context("Message queue did not drain")?;

    let mut unloaded_subscriptions = 0;
    for plugin in registry.loaded() {
        unloaded_subscriptions += registry.unload(&plugin.id)?;
    }

    let report = SoakReport {
        messages,
        manifest_plugins,
        publish_rejected,
        received: received.load(Ordering::Relaxed),
        pattern_deliveries: pattern_deliveries.load(Ordering::Relaxed),
        rpc_calls,
        rpc_failures,
        permission_denied: registry.permission_denied(),
        unloaded_subscriptions,
        elapsed_ms: started.elapsed().as_millis() as u64,
        bus: bus.stats(),
        patterns: patterns.stats(),
        rpc: rpc.stats(),
    };

    rpc.shutdown();
    patterns.shutdown();
    bus.shutdown();

    tracing::info!(
        received = report.received,
        rpc_calls = report.rpc_calls,
        elapsed_ms = report.elapsed_ms,
        "Soak run complete"
    );
    Ok(report)
}
