// ! Public entry to a connection
// !
// ! The handle is a thin, cloneable facade over the connection core's
// ! mailbox. A call blocks its caller on a one-shot reply channel until the
// ! request reaches a terminal outcome; request ids never leave the core.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Duration;

use crate::client::builder::ConnectionConfig;
use crate::client::connection::{ConnState, ConnectionCore, Control, Event, Shared, StopOutcome};
use crate::client::notifications::NotificationHandler;
use crate::core::error::{CallError, McpResult};
use crate::protocol::types::{Implementation, ServerCapabilities};
use crate::transport::traits::PortConnector;

/// Mailbox capacity of the connection core
const MAILBOX_CAPACITY: usize = 256;

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Override for the connection-wide request timeout, in milliseconds
    pub timeout_ms: Option<u64>,
}

impl CallOptions {
    /// Options using every connection default
    pub fn new() -> Self {
        Self::default()
    }

    /// Give this call its own timeout budget
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Point-in-time connection observability snapshot
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// Current lifecycle state
    pub state: ConnState,
    /// Number of successful handshakes so far
    pub session: u64,
    /// Requests sent and awaiting a response
    pub in_flight: usize,
    /// Requests awaiting a busy-retry tick
    pub retrying: usize,
    /// Terminally resolved ids still held to drop late responses
    pub tombstones: usize,
}

/// Handle to one MCP server connection.
///
/// Cloning is cheap; all clones talk to the same connection task.
#[derive(Clone)]
pub struct McpConnection {
    control_tx: mpsc::Sender<Event>,
    state_rx: watch::Receiver<ConnState>,
    shared: Arc<Shared>,
}

impl McpConnection {
    /// Spawn the connection core and hand back its public face.
    ///
    /// The transport port is attached before any control event is
    /// processed; callers typically follow up with
    /// [`McpConnection::await_ready`].
    pub(crate) fn spawn(
        config: ConnectionConfig,
        connector: Box<dyn PortConnector>,
        handlers: Vec<Box<dyn NotificationHandler>>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnState::Starting);
        let shared = Arc::new(Shared::default());

        let core = ConnectionCore::new(
            config,
            connector,
            handlers,
            events_tx.clone(),
            state_tx,
            shared.clone(),
        );
        tokio::spawn(core.run(events_rx));

        Self {
            control_tx: events_tx,
            state_rx,
            shared,
        }
    }

    /// Issue a request and wait for its terminal outcome.
    ///
    /// Returns the server's result value, or the error that resolved the
    /// request: a timeout, backpressure after bounded retries, transport
    /// loss, shutdown, or a relayed server error.
    pub async fn call(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        opts: CallOptions,
    ) -> McpResult<Value> {
        let (reply, outcome) = oneshot::channel();
        self.control_tx
            .send(Event::Control(Control::Submit {
                method: method.into(),
                params,
                timeout_ms: opts.timeout_ms,
                reply,
            }))
            .await
            .map_err(|_| CallError::Shutdown)?;

        // A dropped reply channel means the core exited with the request
        // still queued
        outcome.await.map_err(|_| CallError::Shutdown)?
    }

    /// Send a fire-and-forget notification
    pub async fn notify(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> McpResult<()> {
        self.control_tx
            .send(Event::Control(Control::Notify {
                method: method.into(),
                params,
            }))
            .await
            .map_err(|_| CallError::Shutdown)
    }

    /// Stop the connection. Idempotent.
    ///
    /// Pending requests fail with [`CallError::Shutdown`]; a second call
    /// reports [`StopOutcome::AlreadyClosing`].
    pub async fn stop(&self) -> StopOutcome {
        let (reply, outcome) = oneshot::channel();
        if self
            .control_tx
            .send(Event::Control(Control::Stop { reply }))
            .await
            .is_err()
        {
            return StopOutcome::AlreadyClosing;
        }
        outcome.await.unwrap_or(StopOutcome::AlreadyClosing)
    }

    /// Block until the connection is ready or the deadline passes
    pub async fn await_ready(&self, deadline: Duration) -> McpResult<()> {
        let mut state_rx = self.state_rx.clone();
        let wait = async move {
            loop {
                match *state_rx.borrow_and_update() {
                    ConnState::Ready => return Ok(()),
                    ConnState::Closing => return Err(CallError::Shutdown),
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(CallError::Shutdown);
                }
            }
        };

        tokio::time::timeout(deadline, wait)
            .await
            .map_err(|_| CallError::Timeout {
                elapsed_ms: deadline.as_millis() as u64,
            })?
    }

    /// Current lifecycle state
    pub fn current_state(&self) -> ConnState {
        *self.state_rx.borrow()
    }

    /// Subscribe to lifecycle state changes
    pub fn subscribe_state_changes(&self) -> watch::Receiver<ConnState> {
        self.state_rx.clone()
    }

    /// Capabilities the server advertised, once a handshake has succeeded
    pub async fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.shared.server_capabilities.read().await.clone()
    }

    /// Server implementation info, once a handshake has succeeded
    pub async fn server_info(&self) -> Option<Implementation> {
        self.shared.server_info.read().await.clone()
    }

    /// Observability snapshot of the connection
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            state: self.current_state(),
            session: self.shared.session.load(Ordering::SeqCst),
            in_flight: self.shared.in_flight.load(Ordering::Relaxed),
            retrying: self.shared.retrying.load(Ordering::Relaxed),
            tombstones: self.shared.tombstones.load(Ordering::Relaxed),
        }
    }
}
