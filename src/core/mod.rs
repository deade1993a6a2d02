//! Core abstractions shared across the connection crate
//!
//! This module holds the error taxonomy that every public operation reports
//! through.

pub mod error;

pub use error::{CallError, McpResult};
