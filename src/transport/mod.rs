//! Transport layer for the connection core
//!
//! The core only ever talks to the [`traits::FramePort`] contract; concrete
//! transports live behind feature gates.

pub mod traits;

#[cfg(feature = "stdio")]
pub mod stdio;

pub use traits::{ActiveMode, FramePort, PortConnector, PortEvent, SendOutcome};

#[cfg(feature = "stdio")]
pub use stdio::StdioConnector;
