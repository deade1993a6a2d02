// ! The connection state machine
// !
// ! A single task owns everything mutable about one server connection: the
// ! lifecycle state, the request table, the backoff schedule, and the
// ! transport port. Control calls, transport events, and timer fires are
// ! all linearised through one mailbox, so no handler ever races another
// ! and no locking is needed around the tables.
// !
// ! Lifecycle: Starting -> Initializing -> Ready, with Backoff between
// ! transport incarnations and Closing as the terminal state. Handshake
// ! failures, oversized frames, and transport loss all route through
// ! Backoff; only an explicit stop (or the closing grace deadline) ends the
// ! task.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde_json::Value;
use tokio::sync::{RwLock, mpsc, oneshot, watch};
use tokio::time::{Duration, Instant};

use crate::client::builder::ConnectionConfig;
use crate::client::notifications::NotificationSink;
use crate::client::request_table::{CallerHandle, InFlightEntry, RequestTable, RetryEntry};
use crate::client::timers::{FsmTimer, FsmTimerKind, TimerFire, arm_request_timer, jittered, jittered_ms};
use crate::core::error::CallError;
use crate::protocol::codec::{DecodeError, DecodedFrame, EncodeError, FrameCodec};
use crate::protocol::messages::{
    CancelRequestParams, CancelledParams, InitializeParams, InitializeResult, InitializedParams,
};
use crate::protocol::methods;
use crate::protocol::types::{
    INIT_REQUEST_ID, Implementation, JsonRpcNotification, LATEST_PROTOCOL_VERSION,
    ServerCapabilities, error_codes,
};
use crate::transport::traits::{ActiveMode, FramePort, PortConnector, PortEvent, SendOutcome};

/// Grace period between entering Closing and the core task exiting
const CLOSE_GRACE: Duration = Duration::from_millis(100);

/// Externally observable connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// The transport port is being attached; no I/O has happened yet
    Starting,
    /// The initialize handshake is in progress
    Initializing,
    /// Normal request and response flow
    Ready,
    /// A reconnect is scheduled; the transport is not reading frames
    Backoff,
    /// Terminal; the core exits after a short grace period
    Closing,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnState::Starting => "starting",
            ConnState::Initializing => "initializing",
            ConnState::Ready => "ready",
            ConnState::Backoff => "backoff",
            ConnState::Closing => "closing",
        };
        write!(f, "{name}")
    }
}

/// Reply to a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// This call initiated the shutdown
    Stopped,
    /// The connection was already shutting down
    AlreadyClosing,
}

/// Control operations submitted through the public handle
pub(crate) enum Control {
    Submit {
        method: String,
        params: Option<Value>,
        timeout_ms: Option<u64>,
        reply: CallerHandle,
    },
    Notify {
        method: String,
        params: Option<Value>,
    },
    Stop {
        reply: oneshot::Sender<StopOutcome>,
    },
}

/// Everything the core mailbox can carry
pub(crate) enum Event {
    Control(Control),
    /// An event from the transport port incarnation tagged by `generation`
    Port { generation: u64, event: PortEvent },
    Timer(TimerFire),
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Control(Control::Submit { method, .. }) => {
                write!(f, "Control::Submit({method})")
            }
            Event::Control(Control::Notify { method, .. }) => {
                write!(f, "Control::Notify({method})")
            }
            Event::Control(Control::Stop { .. }) => write!(f, "Control::Stop"),
            Event::Port { generation, event } => write!(f, "Port(gen={generation}, {event:?})"),
            Event::Timer(fire) => write!(f, "Timer({fire:?})"),
        }
    }
}

/// State shared between the core and the public handle.
///
/// The core is the only writer; the handle reads.
pub(crate) struct Shared {
    pub server_capabilities: RwLock<Option<ServerCapabilities>>,
    pub server_info: RwLock<Option<Implementation>>,
    /// Incremented on every successful handshake
    pub session: AtomicU64,
    pub in_flight: AtomicUsize,
    pub retrying: AtomicUsize,
    pub tombstones: AtomicUsize,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            server_capabilities: RwLock::new(None),
            server_info: RwLock::new(None),
            session: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            retrying: AtomicUsize::new(0),
            tombstones: AtomicUsize::new(0),
        }
    }
}

enum Flow {
    Continue,
    Exit,
}

/// The single-owner connection task
pub(crate) struct ConnectionCore {
    config: ConnectionConfig,
    codec: FrameCodec,
    connector: Box<dyn PortConnector>,
    sink: NotificationSink,

    state: ConnState,
    state_tx: watch::Sender<ConnState>,
    events_tx: mpsc::Sender<Event>,

    port: Option<Box<dyn FramePort>>,
    port_generation: u64,
    /// Set once a close has been ordered for the current port; no
    /// `set_active` may follow
    port_closed: bool,

    table: RequestTable,
    /// Strictly monotonic id counter for caller requests, never reset
    next_id: i64,
    backoff_ms: u64,
    backoff_until: Option<Instant>,
    fsm_timer: FsmTimer,

    shared: Arc<Shared>,
}

impl ConnectionCore {
    pub fn new(
        config: ConnectionConfig,
        connector: Box<dyn PortConnector>,
        handlers: Vec<Box<dyn crate::client::notifications::NotificationHandler>>,
        events_tx: mpsc::Sender<Event>,
        state_tx: watch::Sender<ConnState>,
        shared: Arc<Shared>,
    ) -> Self {
        let codec = FrameCodec::new(config.max_frame_bytes);
        let table = RequestTable::new(Duration::from_millis(config.tombstone_ttl_ms()));
        let backoff_ms = config.backoff_min_ms;
        Self {
            config,
            codec,
            connector,
            sink: NotificationSink::new(handlers),
            state: ConnState::Starting,
            state_tx,
            events_tx,
            port: None,
            port_generation: 0,
            port_closed: false,
            table,
            next_id: 1,
            backoff_ms,
            backoff_until: None,
            fsm_timer: FsmTimer::new(),
            shared,
        }
    }

    /// Run the connection until stop or the closing grace deadline
    pub async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        self.attach_transport().await;
        self.publish_stats();

        while let Some(event) = events.recv().await {
            let flow = self.handle_event(event).await;
            self.publish_stats();
            if matches!(flow, Flow::Exit) {
                break;
            }
        }

        self.close_port();
        tracing::debug!("connection core exited");
    }

    async fn handle_event(&mut self, event: Event) -> Flow {
        // Events from a previous port incarnation are meaningless now
        if let Event::Port { generation, .. } = &event {
            if *generation != self.port_generation {
                return Flow::Continue;
            }
        }
        // Fires from a replaced FSM timer that had already reached the
        // mailbox are equally stale
        if let Event::Timer(TimerFire::Fsm { epoch, .. }) = &event {
            if !self.fsm_timer.accepts(*epoch) {
                return Flow::Continue;
            }
        }

        match self.state {
            ConnState::Starting => self.on_event_starting(event),
            ConnState::Initializing => self.on_event_initializing(event).await,
            ConnState::Ready => self.on_event_ready(event).await,
            ConnState::Backoff => self.on_event_backoff(event).await,
            ConnState::Closing => self.on_event_closing(event),
        }
    }

    // ========================================================================
    // Starting
    // ========================================================================

    fn on_event_starting(&mut self, event: Event) -> Flow {
        match event {
            Event::Control(Control::Stop { reply }) => {
                let _ = reply.send(StopOutcome::Stopped);
                self.close_port();
                self.enter_closing()
            }
            Event::Control(control) => {
                self.reject_control(control);
                Flow::Continue
            }
            _ => Flow::Continue,
        }
    }

    // ========================================================================
    // Initializing
    // ========================================================================

    async fn on_event_initializing(&mut self, event: Event) -> Flow {
        match event {
            Event::Port {
                event: PortEvent::Up,
                ..
            } => {
                self.on_transport_up();
                Flow::Continue
            }
            Event::Port {
                event: PortEvent::Frame(bytes),
                ..
            } => {
                self.on_init_frame(bytes).await;
                Flow::Continue
            }
            Event::Port {
                event: PortEvent::Down(reason),
                ..
            } => {
                tracing::warn!(%reason, "transport down during handshake");
                self.enter_backoff();
                Flow::Continue
            }
            Event::Timer(TimerFire::Fsm {
                kind: FsmTimerKind::InitDeadline,
                ..
            }) => {
                tracing::warn!(
                    timeout_ms = self.config.init_timeout_ms,
                    "initialize handshake timed out"
                );
                self.enter_backoff();
                Flow::Continue
            }
            Event::Timer(_) => Flow::Continue,
            Event::Control(Control::Stop { reply }) => {
                let _ = reply.send(StopOutcome::Stopped);
                self.close_port();
                self.enter_closing()
            }
            Event::Control(control) => {
                self.reject_control(control);
                Flow::Continue
            }
        }
    }

    /// The port came up: send initialize, then request the first frame.
    ///
    /// The order is load-bearing. Activating the read before the initialize
    /// frame is on the wire would hand the single read permit to a response
    /// that can never arrive.
    fn on_transport_up(&mut self) {
        let params = InitializeParams::new(
            LATEST_PROTOCOL_VERSION.to_string(),
            self.config.capabilities.clone(),
            self.config.client_info.clone(),
        );

        let frame = match self
            .codec
            .encode_request(INIT_REQUEST_ID, methods::INITIALIZE, Some(params))
        {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("failed to encode initialize request: {e}");
                self.enter_backoff();
                return;
            }
        };

        match self.send_on_port(&frame) {
            SendOutcome::Sent => {
                self.request_next_frame();
                self.fsm_timer.arm(
                    &self.events_tx,
                    FsmTimerKind::InitDeadline,
                    Duration::from_millis(self.config.init_timeout_ms),
                );
            }
            SendOutcome::Busy => {
                tracing::warn!("transport busy on initialize, reconnecting");
                self.enter_backoff();
            }
            SendOutcome::Failed(reason) => {
                tracing::warn!(%reason, "failed to send initialize, reconnecting");
                self.enter_backoff();
            }
        }
    }

    async fn on_init_frame(&mut self, bytes: Vec<u8>) {
        if bytes.len() > self.config.max_frame_bytes {
            tracing::error!(
                len = bytes.len(),
                limit = self.config.max_frame_bytes,
                "oversized frame during handshake"
            );
            self.enter_backoff();
            return;
        }

        match self.codec.decode(&bytes) {
            Ok(DecodedFrame::Response { id, result }) if id == INIT_REQUEST_ID => {
                self.on_init_response(result).await;
            }
            Ok(DecodedFrame::ErrorResponse { id, error }) if id == INIT_REQUEST_ID => {
                tracing::warn!(
                    code = error.code,
                    message = %error.message,
                    "server rejected initialize"
                );
                self.enter_backoff();
            }
            Ok(_) => {
                tracing::debug!("dropping unexpected frame during handshake");
                self.request_next_frame();
            }
            Err(DecodeError::Malformed(e)) => {
                tracing::warn!("dropping malformed frame during handshake: {e}");
                self.request_next_frame();
            }
            Err(DecodeError::UnknownShape) => {
                tracing::debug!("dropping unrecognized frame during handshake");
                self.request_next_frame();
            }
            Err(DecodeError::Oversize { .. }) => {
                self.enter_backoff();
            }
        }
    }

    async fn on_init_response(&mut self, result: Value) {
        let init: InitializeResult = match serde_json::from_value(result) {
            Ok(init) => init,
            Err(e) => {
                tracing::warn!("malformed initialize result: {e}");
                self.enter_backoff();
                return;
            }
        };

        if init.protocol_version != LATEST_PROTOCOL_VERSION {
            tracing::warn!(
                server_version = %init.protocol_version,
                supported = LATEST_PROTOCOL_VERSION,
                "protocol version mismatch"
            );
            self.enter_backoff();
            return;
        }

        *self.shared.server_capabilities.write().await = Some(init.capabilities);
        *self.shared.server_info.write().await = Some(init.server_info.clone());
        let session = self.shared.session.fetch_add(1, Ordering::SeqCst) + 1;

        // The schedule resets only here, on a proven-good connection
        self.backoff_ms = self.config.backoff_min_ms;
        self.backoff_until = None;

        match self
            .codec
            .encode_notification(methods::INITIALIZED, None::<InitializedParams>)
        {
            Ok(frame) => {
                if self.send_on_port(&frame) != SendOutcome::Sent {
                    tracing::warn!("failed to send initialized notification");
                }
            }
            Err(e) => tracing::error!("failed to encode initialized notification: {e}"),
        }

        self.fsm_timer.arm(
            &self.events_tx,
            FsmTimerKind::TombstoneSweep,
            Duration::from_millis(self.config.tombstone_sweep_ms),
        );
        self.request_next_frame();
        self.transition(ConnState::Ready);
        tracing::info!(
            session,
            server = %init.server_info.name,
            version = %init.server_info.version,
            "connection ready"
        );
    }

    // ========================================================================
    // Ready
    // ========================================================================

    async fn on_event_ready(&mut self, event: Event) -> Flow {
        match event {
            Event::Control(Control::Submit {
                method,
                params,
                timeout_ms,
                reply,
            }) => {
                self.on_submit(method, params, timeout_ms, reply);
                Flow::Continue
            }
            Event::Control(Control::Notify { method, params }) => {
                self.on_notify(method, params);
                Flow::Continue
            }
            Event::Control(Control::Stop { reply }) => {
                self.fail_all(CallError::Shutdown);
                self.close_port();
                let _ = reply.send(StopOutcome::Stopped);
                self.enter_closing()
            }
            Event::Port {
                event: PortEvent::Frame(bytes),
                ..
            } => {
                self.on_ready_frame(bytes);
                Flow::Continue
            }
            Event::Port {
                event: PortEvent::Down(reason),
                ..
            } => {
                tracing::warn!(%reason, "transport down");
                self.fail_all(CallError::TransportLoss(reason));
                self.enter_backoff();
                Flow::Continue
            }
            Event::Port {
                event: PortEvent::Up,
                ..
            } => Flow::Continue,
            Event::Timer(TimerFire::RequestTimeout { id }) => {
                self.on_request_timeout(id);
                Flow::Continue
            }
            Event::Timer(TimerFire::Retry { id }) => {
                self.on_retry(id);
                Flow::Continue
            }
            Event::Timer(TimerFire::Fsm {
                kind: FsmTimerKind::TombstoneSweep,
                ..
            }) => {
                self.table.sweep();
                self.fsm_timer.arm(
                    &self.events_tx,
                    FsmTimerKind::TombstoneSweep,
                    Duration::from_millis(self.config.tombstone_sweep_ms),
                );
                Flow::Continue
            }
            Event::Timer(_) => Flow::Continue,
        }
    }

    fn on_submit(
        &mut self,
        method: String,
        params: Option<Value>,
        timeout_ms: Option<u64>,
        reply: CallerHandle,
    ) {
        let id = self.next_id;
        self.next_id += 1;

        let frame = match self.codec.encode_request(id, &method, params) {
            Ok(frame) => frame,
            Err(EncodeError::Oversize { size, limit }) => {
                let _ = reply.send(Err(CallError::OversizeOutbound { size, limit }));
                return;
            }
            Err(EncodeError::Serialize(e)) => {
                let _ = reply.send(Err(CallError::internal(e)));
                return;
            }
        };

        let timeout_ms = timeout_ms.unwrap_or(self.config.request_timeout_ms);

        match self.send_on_port(&frame) {
            SendOutcome::Sent => {
                let timer = arm_request_timer(
                    &self.events_tx,
                    TimerFire::RequestTimeout { id },
                    Duration::from_millis(timeout_ms),
                );
                self.table.insert_in_flight(
                    id,
                    InFlightEntry {
                        caller: reply,
                        method,
                        started_at: Instant::now(),
                        timeout_ms,
                        timer,
                    },
                );
            }
            SendOutcome::Busy => {
                let delay = jittered(self.config.retry_delay_ms, self.config.retry_jitter);
                let timer = arm_request_timer(&self.events_tx, TimerFire::Retry { id }, delay);
                self.table.insert_retry(
                    id,
                    RetryEntry {
                        frame,
                        caller: reply,
                        method,
                        started_at: Instant::now(),
                        timeout_ms,
                        attempts: 1,
                        timer,
                    },
                );
            }
            SendOutcome::Failed(reason) => {
                let _ = reply.send(Err(CallError::Transport(reason)));
            }
        }
    }

    /// Notifications are best-effort: failures are logged, never retried
    fn on_notify(&mut self, method: String, params: Option<Value>) {
        match self.codec.encode_notification(&method, params) {
            Ok(frame) => match self.send_on_port(&frame) {
                SendOutcome::Sent => {}
                SendOutcome::Busy => {
                    tracing::debug!(%method, "notification dropped, transport busy")
                }
                SendOutcome::Failed(reason) => {
                    tracing::debug!(%method, %reason, "notification send failed")
                }
            },
            Err(e) => tracing::warn!(%method, "failed to encode notification: {e}"),
        }
    }

    fn on_ready_frame(&mut self, bytes: Vec<u8>) {
        if bytes.len() > self.config.max_frame_bytes {
            tracing::error!(
                len = bytes.len(),
                limit = self.config.max_frame_bytes,
                "oversized frame received, dropping connection"
            );
            self.fail_all(CallError::TransportLoss(
                "protocol violation: oversized frame".to_string(),
            ));
            self.enter_backoff();
            return;
        }

        match self.codec.decode(&bytes) {
            Ok(DecodedFrame::Response { id, result }) => {
                self.deliver_response(id, Ok(result));
                self.request_next_frame();
            }
            Ok(DecodedFrame::ErrorResponse { id, error }) => {
                self.deliver_response(id, Err(CallError::from_error_object(error)));
                self.request_next_frame();
            }
            Ok(DecodedFrame::Notification(n)) if n.method == methods::CANCELLED => {
                self.on_cancelled(n);
                self.request_next_frame();
            }
            Ok(DecodedFrame::Notification(n)) => {
                self.sink.dispatch(&n);
                self.request_next_frame();
            }
            Ok(DecodedFrame::ServerRequest { id, method, .. }) => {
                if method == methods::INITIALIZE {
                    // A second initialize mid-session is nonsensical; treat
                    // it as a broken peer and reconnect
                    tracing::warn!("server-initiated initialize while ready");
                    self.fail_all(CallError::TransportLoss(
                        "protocol violation: server-initiated initialize".to_string(),
                    ));
                    self.enter_backoff();
                } else {
                    self.reply_method_not_found(id, &method);
                    self.request_next_frame();
                }
            }
            Err(DecodeError::Malformed(e)) => {
                tracing::warn!("dropping malformed frame: {e}");
                self.request_next_frame();
            }
            Err(DecodeError::UnknownShape) => {
                tracing::debug!("dropping unrecognized frame shape");
                self.request_next_frame();
            }
            Err(DecodeError::Oversize { .. }) => {
                self.fail_all(CallError::TransportLoss(
                    "protocol violation: oversized frame".to_string(),
                ));
                self.enter_backoff();
            }
        }
    }

    /// Route a response or error response to its waiting caller
    fn deliver_response(&mut self, id: i64, outcome: Result<Value, CallError>) {
        if let Some(entry) = self.table.take_in_flight(id) {
            entry.timer.abort();
            let _ = entry.caller.send(outcome);
            self.table.tombstone(id);
        } else if self.table.is_tombstoned(id) {
            tracing::debug!(id, "dropping late response for resolved request");
        } else {
            tracing::debug!(id, "dropping response for unknown request id");
        }
    }

    /// Server cancelled one of our requests; resolve it like a timeout
    fn on_cancelled(&mut self, notification: JsonRpcNotification) {
        let params = notification
            .params
            .and_then(|p| serde_json::from_value::<CancelledParams>(p).ok());
        let Some(params) = params else {
            tracing::debug!("dropping cancelled notification without usable params");
            return;
        };
        let Some(id) = params.integer_id() else {
            return;
        };

        if let Some(entry) = self.table.take_in_flight(id) {
            entry.timer.abort();
            let _ = entry.caller.send(Err(CallError::Cancelled {
                reason: params.reason,
            }));
            self.table.tombstone(id);
        }
        // Cancellations for unknown ids are dropped silently
    }

    fn reply_method_not_found(&mut self, id: i64, method: &str) {
        tracing::debug!(%method, "rejecting server-initiated request");
        match self.codec.encode_error_reply(
            id,
            error_codes::METHOD_NOT_FOUND,
            format!("method not supported: {method}"),
        ) {
            Ok(frame) => {
                if self.send_on_port(&frame) != SendOutcome::Sent {
                    tracing::debug!("failed to send method-not-found reply");
                }
            }
            Err(e) => tracing::debug!("failed to encode method-not-found reply: {e}"),
        }
    }

    fn on_request_timeout(&mut self, id: i64) {
        let Some(entry) = self.table.take_in_flight(id) else {
            return;
        };

        // One best-effort cancel towards the server, no retry, no effect
        // on local state
        match self.codec.encode_notification(
            methods::CANCEL_REQUEST,
            Some(CancelRequestParams { request_id: id }),
        ) {
            Ok(frame) => {
                let _ = self.send_on_port(&frame);
            }
            Err(e) => tracing::debug!("failed to encode cancel notification: {e}"),
        }

        self.table.tombstone(id);
        tracing::debug!(
            id,
            method = %entry.method,
            elapsed_ms = entry.started_at.elapsed().as_millis() as u64,
            "request timed out"
        );
        let _ = entry.caller.send(Err(CallError::Timeout {
            elapsed_ms: entry.timeout_ms,
        }));
    }

    fn on_retry(&mut self, id: i64) {
        let Some(entry) = self.table.retry_mut(id) else {
            return;
        };

        if entry.attempts >= self.config.retry_attempts {
            if let Some(entry) = self.table.take_retry(id) {
                self.table.tombstone(id);
                let _ = entry.caller.send(Err(CallError::Backpressure {
                    attempts: entry.attempts,
                }));
            }
            return;
        }

        let outcome = {
            let Some(entry) = self.table.retry_mut(id) else {
                return;
            };
            match &mut self.port {
                Some(port) => port.send_frame(&entry.frame),
                None => SendOutcome::Failed("no transport".to_string()),
            }
        };

        match outcome {
            SendOutcome::Sent => {
                let events_tx = self.events_tx.clone();
                self.table.promote(id, |timeout_ms| {
                    arm_request_timer(
                        &events_tx,
                        TimerFire::RequestTimeout { id },
                        Duration::from_millis(timeout_ms),
                    )
                });
            }
            SendOutcome::Busy => {
                let delay = jittered(self.config.retry_delay_ms, self.config.retry_jitter);
                let timer = arm_request_timer(&self.events_tx, TimerFire::Retry { id }, delay);
                if let Some(entry) = self.table.retry_mut(id) {
                    entry.attempts += 1;
                    entry.timer = timer;
                }
            }
            SendOutcome::Failed(reason) => {
                if let Some(entry) = self.table.take_retry(id) {
                    self.table.tombstone(id);
                    let _ = entry.caller.send(Err(CallError::Transport(reason)));
                }
            }
        }
    }

    // ========================================================================
    // Backoff
    // ========================================================================

    async fn on_event_backoff(&mut self, event: Event) -> Flow {
        match event {
            Event::Timer(TimerFire::Fsm {
                kind: FsmTimerKind::BackoffExpire,
                ..
            }) => {
                self.attach_transport().await;
                Flow::Continue
            }
            Event::Port {
                generation,
                event: PortEvent::Up,
            } => {
                // A port finishing its attach late still counts
                self.transition(ConnState::Initializing);
                self.on_event_initializing(Event::Port {
                    generation,
                    event: PortEvent::Up,
                })
                .await
            }
            Event::Port { .. } => Flow::Continue,
            Event::Control(Control::Stop { reply }) => {
                let _ = reply.send(StopOutcome::Stopped);
                self.enter_closing()
            }
            Event::Control(control) => {
                self.reject_control(control);
                Flow::Continue
            }
            Event::Timer(_) => Flow::Continue,
        }
    }

    // ========================================================================
    // Closing
    // ========================================================================

    fn on_event_closing(&mut self, event: Event) -> Flow {
        match event {
            Event::Control(Control::Stop { reply }) => {
                let _ = reply.send(StopOutcome::AlreadyClosing);
                Flow::Continue
            }
            Event::Port {
                event: PortEvent::Down(_),
                ..
            } => Flow::Exit,
            Event::Timer(TimerFire::Fsm {
                kind: FsmTimerKind::CloseGrace,
                ..
            }) => Flow::Exit,
            // Everything else is dropped silently; pending reply channels
            // close and surface as shutdown on the caller side
            _ => Flow::Continue,
        }
    }

    // ========================================================================
    // Shared helpers
    // ========================================================================

    /// Spawn a fresh transport port and move to Initializing
    async fn attach_transport(&mut self) {
        self.port_generation += 1;
        self.port_closed = false;
        let generation = self.port_generation;

        let (port_tx, mut port_rx) = mpsc::channel(32);
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = port_rx.recv().await {
                if events_tx
                    .send(Event::Port { generation, event })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        match self.connector.connect(port_tx).await {
            Ok(port) => {
                self.port = Some(port);
                self.transition(ConnState::Initializing);
            }
            Err(e) => {
                tracing::warn!("transport spawn failed: {e}");
                self.enter_backoff();
            }
        }
    }

    /// Schedule a reconnect after the current backoff delay, then advance
    /// the schedule for the next failure
    fn enter_backoff(&mut self) {
        self.close_port();

        let delay_ms = self.backoff_ms;
        let doubled = self.backoff_ms.saturating_mul(2).min(self.config.backoff_max_ms);
        self.backoff_ms = jittered_ms(doubled, self.config.backoff_jitter)
            .clamp(self.config.backoff_min_ms, self.config.backoff_max_ms);

        self.backoff_until = Some(Instant::now() + Duration::from_millis(delay_ms));
        self.fsm_timer.arm(
            &self.events_tx,
            FsmTimerKind::BackoffExpire,
            Duration::from_millis(delay_ms),
        );
        tracing::info!(delay_ms, "reconnect scheduled");
        self.transition(ConnState::Backoff);
    }

    fn enter_closing(&mut self) -> Flow {
        self.transition(ConnState::Closing);
        self.fsm_timer
            .arm(&self.events_tx, FsmTimerKind::CloseGrace, CLOSE_GRACE);
        Flow::Continue
    }

    /// Fail every tracked request with the same error
    fn fail_all(&mut self, error: CallError) {
        for (_, caller) in self.table.drain() {
            let _ = caller.send(Err(error.clone()));
        }
    }

    /// Order the current port closed. After this, no read is ever
    /// activated on it again.
    fn close_port(&mut self) {
        if let Some(port) = self.port.as_mut() {
            if !self.port_closed {
                port.close();
            }
        }
        self.port_closed = true;
        self.port = None;
    }

    /// Ask the port for exactly one more inbound frame
    fn request_next_frame(&mut self) {
        if self.port_closed {
            return;
        }
        if let Some(port) = self.port.as_mut() {
            port.set_active(ActiveMode::Once);
        }
    }

    fn send_on_port(&mut self, frame: &[u8]) -> SendOutcome {
        match &mut self.port {
            Some(port) => port.send_frame(frame),
            None => SendOutcome::Failed("no transport".to_string()),
        }
    }

    /// Reply to a control operation that arrived in the wrong state
    fn reject_control(&mut self, control: Control) {
        match control {
            Control::Submit { reply, .. } => {
                let error = match self.state {
                    ConnState::Backoff => CallError::Unavailable {
                        retry_in_ms: self.backoff_remaining_ms(),
                    },
                    ConnState::Closing => CallError::Shutdown,
                    current => CallError::State { current },
                };
                let _ = reply.send(Err(error));
            }
            Control::Notify { method, .. } => {
                tracing::debug!(%method, state = %self.state, "notification dropped, connection not ready");
            }
            Control::Stop { .. } => {
                tracing::debug!("stop routed through reject path");
            }
        }
    }

    fn backoff_remaining_ms(&self) -> u64 {
        self.backoff_until
            .map(|t| t.saturating_duration_since(Instant::now()).as_millis() as u64)
            .unwrap_or(0)
    }

    fn transition(&mut self, next: ConnState) {
        if self.state != next {
            tracing::debug!(from = %self.state, to = %next, "state change");
            self.state = next;
            let _ = self.state_tx.send(next);
        }
    }

    fn publish_stats(&self) {
        self.shared
            .in_flight
            .store(self.table.in_flight_len(), Ordering::Relaxed);
        self.shared
            .retrying
            .store(self.table.retrying_len(), Ordering::Relaxed);
        self.shared
            .tombstones
            .store(self.table.tombstones_len(), Ordering::Relaxed);
    }
}
