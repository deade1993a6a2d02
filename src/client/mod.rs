//! MCP client connection implementation
//!
//! This module provides the connection core: a single task owning the
//! request table and lifecycle state machine, plus the thin public handle
//! callers use to talk to it.

pub mod builder;
pub mod connection;
pub mod handle;
pub mod notifications;

pub(crate) mod request_table;
pub(crate) mod timers;


// Re-export the main entry points
pub use builder::{ConnectionConfig, McpConnectionBuilder};
pub use connection::{ConnState, StopOutcome};
pub use handle::{CallOptions, ConnectionStats, McpConnection};
pub use notifications::{LoggingNotificationHandler, NotificationHandler};
