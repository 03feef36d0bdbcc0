//! appgate core daemon.
//!
//! Apps connect over a Unix socket, prove who they are once per connection
//! and then issue typed requests. Everything an app can reach (its database,
//! object storage, events, the task queue) is brokered here.

pub mod app;
pub mod config;
pub mod connection;
pub mod events;
pub mod gateway;
pub mod identity;
pub mod permissions;
pub mod router;
pub mod storage;
pub mod store;
pub mod supervisor;
pub mod sweeper;
pub mod tasks;

pub use gateway::Gateway;

pub const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");
