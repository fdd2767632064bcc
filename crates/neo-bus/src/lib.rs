//! Neo Bus - Plugin messaging host
//!
//! This crate wires the bus runtime into an application:
//! - Layered configuration (defaults, TOML file, environment)
//! - Capability-checked plugin access to events and RPC
//! - A soak run that drives the bus end to end and reports stats

// Re-export core crates
pub use bus_runtime;

// Application configuration
pub mod config;

// Plugin capability layer
pub mod plugin;

// End-to-end soak run
pub mod soak;
