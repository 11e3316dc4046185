//! Feed Relay: multi-source message forwarding engine.

pub mod admin;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod link_checker;
pub mod pipeline;
pub mod resolver;
pub mod store;
pub mod transport;
