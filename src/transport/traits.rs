// ! Transport port traits and abstractions
// !
// ! Module defines the framed transport contract the connection core runs
// ! against. A port moves complete JSON-RPC frames in both directions and
// ! applies active-once flow control on the inbound side: the core must ask
// ! for every single frame it is willing to process.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::error::McpResult;

/// Outcome of a single non-blocking send attempt
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// The frame was accepted for delivery
    Sent,
    /// The outbound buffer cannot take the frame right now; retry later
    Busy,
    /// The send failed and the frame will not be delivered
    Failed(String),
}

/// Inbound flow control modes
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActiveMode {
    /// Permit delivery of exactly one subsequent frame event
    Once,
    /// Disable frame delivery entirely
    Off,
}

/// Events a port delivers to the connection core
#[derive(Debug, Clone, PartialEq)]
pub enum PortEvent {
    /// The port is ready to exchange frames. Sent exactly once per port.
    Up,
    /// One complete JSON-RPC message. Only delivered after a prior
    /// `set_active(Once)`, at most one per permit.
    Frame(Vec<u8>),
    /// The port is gone. Terminal for this port instance.
    Down(String),
}

/// A live framed transport attached to one connection.
///
/// All three operations must be non-blocking; blocking I/O belongs inside
/// the port's own tasks. After [`FramePort::close`] every operation is a
/// no-op.
pub trait FramePort: Send {
    /// Attempt to send one frame without blocking
    fn send_frame(&mut self, frame: &[u8]) -> SendOutcome;

    /// Request delivery of the next inbound frame, or switch delivery off
    fn set_active(&mut self, mode: ActiveMode);

    /// Best-effort graceful termination. Idempotent.
    fn close(&mut self);
}

/// Factory for port instances.
///
/// The connection core calls [`PortConnector::connect`] once at startup and
/// again after every backoff period, so a connector must be able to produce
/// a fresh port for each attempt.
#[async_trait]
pub trait PortConnector: Send {
    /// Spawn a new port delivering its events to the given channel.
    ///
    /// The port must send [`PortEvent::Up`] exactly once when it is ready
    /// to exchange frames, and never deliver a frame before that.
    async fn connect(&mut self, events: mpsc::Sender<PortEvent>) -> McpResult<Box<dyn FramePort>>;
}
