//! The node runtime: flow registry, fiber scheduling, and event pumps.
//!
//! A [`FlowNode`] owns everything one party needs to run flows: the
//! checkpoint store, the bus subscription, the timer service, the session
//! binding table, and one fiber per live flow. Build one with
//! [`FlowNode::builder`], register flow classes, then drive it with
//! [`FlowNode::run`] until a shutdown signal.

mod config;
mod node;

pub use config::RuntimeConfig;
pub use node::{FlowNode, NodeBuilder};
