//! MCP protocol implementation (2025-06-18)
//!
//! This module contains the JSON-RPC message types, the handshake and
//! cancellation shapes, the method name constants, and the frame codec the
//! connection core runs every byte through.

pub mod codec;
pub mod messages;
pub mod methods;
pub mod types;

pub use codec::{DecodeError, DecodedFrame, EncodeError, FrameCodec};
pub use messages::*;
pub use types::*;
