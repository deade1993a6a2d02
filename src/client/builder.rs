// ! Connection configuration and builder
// !
// ! Module defines the immutable configuration a connection runs with and
// ! the builder callers use to construct one.

use crate::client::handle::McpConnection;
use crate::client::notifications::NotificationHandler;
use crate::protocol::types::{ClientCapabilities, Implementation};
use crate::transport::traits::PortConnector;

/// Immutable configuration for one connection.
///
/// Constructed once; callers override fields by building a modified copy
/// before the connection starts.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Default request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Handshake deadline in milliseconds
    pub init_timeout_ms: u64,
    /// Smallest reconnect delay in milliseconds
    pub backoff_min_ms: u64,
    /// Largest reconnect delay in milliseconds
    pub backoff_max_ms: u64,
    /// Uniform jitter factor applied to the backoff schedule (0.0 to 1.0)
    pub backoff_jitter: f64,
    /// Total send attempts per request, including the first
    pub retry_attempts: u32,
    /// Base delay between busy retries in milliseconds
    pub retry_delay_ms: u64,
    /// Uniform jitter factor applied to retry delays (0.0 to 1.0)
    pub retry_jitter: f64,
    /// Frame size limit enforced in both directions
    pub max_frame_bytes: usize,
    /// Interval between tombstone sweep ticks in milliseconds
    pub tombstone_sweep_ms: u64,
    /// Client identity sent during the handshake
    pub client_info: Implementation,
    /// Capabilities advertised during the handshake
    pub capabilities: ClientCapabilities,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            init_timeout_ms: 10_000,
            backoff_min_ms: 1_000,
            backoff_max_ms: 30_000,
            backoff_jitter: 0.2,
            retry_attempts: 3,
            retry_delay_ms: 10,
            retry_jitter: 0.5,
            max_frame_bytes: 16 * 1024 * 1024,
            tombstone_sweep_ms: 60_000,
            client_info: Implementation::new("mcp-conn", env!("CARGO_PKG_VERSION")),
            capabilities: ClientCapabilities::default(),
        }
    }
}

impl ConnectionConfig {
    /// How long a tombstone is retained.
    ///
    /// Sized so a response delayed by a full timeout, reconnect, and
    /// handshake cycle still lands on its tombstone instead of a live
    /// request.
    pub fn tombstone_ttl_ms(&self) -> u64 {
        self.request_timeout_ms + self.init_timeout_ms + self.backoff_max_ms + 5_000
    }
}

/// Builder for [`McpConnection`]
///
/// # Example
/// ```rust,no_run
/// use mcp_conn::client::McpConnectionBuilder;
/// use mcp_conn::transport::StdioConnector;
///
/// #[tokio::main]
/// async fn main() {
///     let conn = McpConnectionBuilder::new("my-app", "1.0.0")
///         .request_timeout_ms(10_000)
///         .connect(StdioConnector::new("my-mcp-server", vec![]));
///     conn.await_ready(std::time::Duration::from_secs(15)).await.unwrap();
/// }
/// ```
pub struct McpConnectionBuilder {
    config: ConnectionConfig,
    handlers: Vec<Box<dyn NotificationHandler>>,
}

impl McpConnectionBuilder {
    /// Create a builder identifying the client by name and version
    pub fn new<S: Into<String>>(name: S, version: S) -> Self {
        let config = ConnectionConfig {
            client_info: Implementation::new(name.into(), version.into()),
            ..Default::default()
        };
        Self {
            config,
            handlers: Vec::new(),
        }
    }

    /// Replace the whole configuration, client identity included
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Capabilities to advertise during the handshake
    pub fn capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.config.capabilities = capabilities;
        self
    }

    /// Default request timeout
    pub fn request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.request_timeout_ms = timeout_ms;
        self
    }

    /// Handshake deadline
    pub fn init_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.init_timeout_ms = timeout_ms;
        self
    }

    /// Total send attempts per request, including the first
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.config.retry_attempts = attempts.max(1);
        self
    }

    /// Base delay between busy retries
    pub fn retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.config.retry_delay_ms = delay_ms;
        self
    }

    /// Reconnect delay bounds
    pub fn backoff_ms(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.config.backoff_min_ms = min_ms.max(1);
        self.config.backoff_max_ms = max_ms.max(self.config.backoff_min_ms);
        self
    }

    /// Frame size limit in both directions
    pub fn max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.config.max_frame_bytes = max_frame_bytes;
        self
    }

    /// Register a notification handler.
    ///
    /// Handlers run synchronously on the connection core in registration
    /// order, so they must be fast and non-blocking.
    pub fn on_notification<H>(mut self, handler: H) -> Self
    where
        H: NotificationHandler + 'static,
    {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Spawn the connection using the given transport connector.
    ///
    /// Returns immediately; use [`McpConnection::await_ready`] to wait for
    /// the handshake.
    pub fn connect<C>(self, connector: C) -> McpConnection
    where
        C: PortConnector + 'static,
    {
        McpConnection::spawn(self.config, Box::new(connector), self.handlers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.request_timeout_ms, 30_000);
        assert_eq!(config.init_timeout_ms, 10_000);
        assert_eq!(config.backoff_min_ms, 1_000);
        assert_eq!(config.backoff_max_ms, 30_000);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.retry_delay_ms, 10);
        assert_eq!(config.max_frame_bytes, 16_777_216);
        assert_eq!(config.tombstone_sweep_ms, 60_000);
    }

    #[test]
    fn test_tombstone_ttl_tracks_other_budgets() {
        let config = ConnectionConfig::default();
        assert_eq!(config.tombstone_ttl_ms(), 30_000 + 10_000 + 30_000 + 5_000);

        let config = ConnectionConfig {
            request_timeout_ms: 5_000,
            ..Default::default()
        };
        assert_eq!(config.tombstone_ttl_ms(), 5_000 + 10_000 + 30_000 + 5_000);
    }

    #[test]
    fn test_builder_setters() {
        let builder = McpConnectionBuilder::new("test-app", "0.2.0")
            .request_timeout_ms(5_000)
            .init_timeout_ms(2_000)
            .retry_attempts(0)
            .retry_delay_ms(25)
            .backoff_ms(500, 100)
            .max_frame_bytes(1024);

        assert_eq!(builder.config.client_info.name, "test-app");
        assert_eq!(builder.config.request_timeout_ms, 5_000);
        assert_eq!(builder.config.init_timeout_ms, 2_000);
        // Zero attempts would mean never sending at all
        assert_eq!(builder.config.retry_attempts, 1);
        assert_eq!(builder.config.retry_delay_ms, 25);
        // Max is clamped up to min
        assert_eq!(builder.config.backoff_min_ms, 500);
        assert_eq!(builder.config.backoff_max_ms, 500);
        assert_eq!(builder.config.max_frame_bytes, 1024);
    }
}
