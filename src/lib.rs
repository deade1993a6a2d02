// Copyright (c) 2025 MCP Rust Contributors
// SPDX-License-Identifier: MIT

//! # MCP Connection Core
//!
//! A client-side connection core for the
//! [Model Context Protocol (MCP)](https://modelcontextprotocol.io/) version
//! 2025-06-18. One connection owns a JSON-RPC 2.0 session with a single MCP
//! server over a framed transport and keeps it healthy under concurrent
//! failures:
//!
//! - A five-state lifecycle (starting, initializing, ready, backoff,
//!   closing) with exponential-backoff reconnection
//! - Request/response correlation with per-request timeouts, tombstoning of
//!   resolved ids, and at-most-once reply delivery
//! - Bounded busy-retry on send that preserves each caller's timeout budget
//! - Active-once flow control: the core asks the transport for every single
//!   inbound frame it is willing to process
//! - Frame size enforcement in both directions before any JSON parsing
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mcp_conn::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> McpResult<()> {
//!     let conn = McpConnectionBuilder::new("my-app", "1.0.0")
//!         .on_notification(LoggingNotificationHandler)
//!         .connect(StdioConnector::new("my-mcp-server", vec!["--verbose"]));
//!
//!     conn.await_ready(Duration::from_secs(15)).await?;
//!
//!     let result = conn
//!         .call("tools/call", Some(json!({"name": "ping", "arguments": {}})), CallOptions::new())
//!         .await?;
//!     println!("tool result: {result}");
//!
//!     conn.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`core`]: Error taxonomy every public operation reports through
//! - [`protocol`]: JSON-RPC message types, handshake shapes, and the frame
//!   codec
//! - [`transport`]: The framed transport port contract and the stdio
//!   subprocess transport
//! - [`client`]: The connection state machine, its public handle, and the
//!   notification sink

pub mod client;
pub mod core;
pub mod protocol;
pub mod transport;

// Re-export commonly used types for convenience
pub use client::{CallOptions, ConnState, McpConnection, McpConnectionBuilder, StopOutcome};
pub use core::error::{CallError, McpResult};
pub use protocol::types::*;

/// Prelude module for convenient imports
///
/// Use `use mcp_conn::prelude::*;` to bring the common surface into scope.
pub mod prelude {
    pub use crate::client::{
        CallOptions, ConnState, ConnectionConfig, ConnectionStats, LoggingNotificationHandler,
        McpConnection, McpConnectionBuilder, NotificationHandler, StopOutcome,
    };
    pub use crate::core::error::{CallError, McpResult};
    pub use crate::protocol::messages::*;
    pub use crate::protocol::types::*;
    pub use crate::transport::{ActiveMode, FramePort, PortConnector, PortEvent, SendOutcome};

    #[cfg(feature = "stdio")]
    pub use crate::transport::StdioConnector;

    // Essential external types
    pub use serde_json::{Value, json};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        // Basic smoke test to ensure the public surface is wired up
        let _error = CallError::protocol("test");
        assert_eq!(LATEST_PROTOCOL_VERSION, "2025-06-18");
    }
}
