//! Bus Runtime - Messaging and RPC substrate for plugins
//!
//! This crate contains the pattern trie, the cached pattern manager, the
//! prioritized message bus with request/reply, and the resilient RPC manager.

pub use bus_types;

mod bus;
mod handler;
mod pattern_manager;
mod rpc;
mod subscription;
mod trie;

pub use bus::*;
pub use handler::{FnHandler, MessageHandler, SharedHandler, handler_fn};
pub use pattern_manager::*;
pub use rpc::*;
pub use subscription::*;
pub use trie::*;
