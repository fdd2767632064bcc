//! Bus Types - Core data definitions for the plugin message bus
//!
//! This crate contains the pure data structures shared by the bus runtime and
//! its consumers: the topic/pattern grammar, messages, and the error taxonomy.

mod error;
mod message;
mod rpc_error;
mod topic;

pub use error::*;
pub use message::*;
pub use rpc_error::*;
pub use topic::*;
