//! Plugin Capability Layer
//!
//! Plugins never see the bus directly. Each one gets a `PluginContext` whose
//! event and RPC interfaces are wrapped in a permission-checking decorator
//! built from the plugin's manifest when it is loaded.

mod api;
mod guard;
mod registry;

pub use api::*;
pub use guard::*;
pub use registry::*;

use bus_types::{BusError, RpcError};

/// Result type for plugin-facing operations
pub type PluginResult<T> = Result<T, PluginError>;

/// Errors surfaced to plugins and the plugin loader
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Permission denied for plugin '{plugin}': {reason}")]
    PermissionDenied { plugin: String, reason: String },

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("Plugin already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("Plugin not loaded: {0}")]
    NotLoaded(String),

    #[error("Failed to read plugin manifests: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, PluginError::PermissionDenied { .. })
    }
}
