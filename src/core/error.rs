// ! Error types for the MCP connection core
// !
// ! Module defines every error a caller can observe from a connection,
// ! covering request outcomes, connection lifecycle, and wire-level faults.

use thiserror::Error;

use crate::client::connection::ConnState;
use crate::protocol::types::{ErrorObject, error_codes};

/// The main error type surfaced to callers of a connection
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    /// The request exceeded its deadline
    #[error("request timed out after {elapsed_ms} ms")]
    Timeout {
        /// Budget the request was given, in milliseconds
        elapsed_ms: u64,
    },

    /// The transport reported BUSY on every send attempt
    #[error("transport busy after {attempts} send attempts")]
    Backpressure {
        /// Total number of send attempts made
        attempts: u32,
    },

    /// A send failed outright
    #[error("transport error: {0}")]
    Transport(String),

    /// The transport went down while the request was in flight
    #[error("transport lost: {0}")]
    TransportLoss(String),

    /// The connection was stopped while the request was pending
    #[error("connection shut down")]
    Shutdown,

    /// Malformed response or notification tied to this request
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The encoded request exceeded the frame size limit
    #[error("encoded request is {size} bytes, limit is {limit}")]
    OversizeOutbound {
        /// Encoded size of the rejected request
        size: usize,
        /// Configured frame size limit
        limit: usize,
    },

    /// A JSON-RPC error object relayed verbatim from the server
    #[error("server error {code}: {message}")]
    Server {
        /// JSON-RPC error code
        code: i32,
        /// Server-provided message
        message: String,
        /// Optional structured error data
        data: Option<serde_json::Value>,
    },

    /// The server cancelled the request via `notifications/cancelled`
    #[error("request cancelled by server")]
    Cancelled {
        /// Optional server-provided reason
        reason: Option<String>,
    },

    /// The operation requires a ready connection
    #[error("connection is {current}, not ready")]
    State {
        /// State the connection was in when the operation arrived
        current: ConnState,
    },

    /// The connection is waiting out a reconnect backoff
    #[error("connection unavailable, reconnecting in {retry_in_ms} ms")]
    Unavailable {
        /// Remaining backoff delay in milliseconds
        retry_in_ms: u64,
    },

    /// The negotiated capabilities do not allow the operation
    #[error("capability mismatch: {0}")]
    CapabilityMismatch(String),

    /// Internal errors that shouldn't normally occur
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for CallError {
    fn from(err: serde_json::Error) -> Self {
        CallError::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for CallError {
    fn from(err: std::io::Error) -> Self {
        CallError::Transport(err.to_string())
    }
}

/// Result type alias for connection operations
pub type McpResult<T> = Result<T, CallError>;

impl CallError {
    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Map a JSON-RPC error object onto the caller-visible taxonomy.
    ///
    /// Recognised codes (the standard JSON-RPC set and the MCP range) are
    /// relayed verbatim as [`CallError::Server`]; anything else surfaces as
    /// [`CallError::Internal`].
    pub fn from_error_object(error: ErrorObject) -> Self {
        if error_codes::is_recognized(error.code) {
            Self::Server {
                code: error.code,
                message: error.message,
                data: error.data,
            }
        } else {
            Self::Internal(format!(
                "unrecognized server error code {}: {}",
                error.code, error.message
            ))
        }
    }

    /// Get the error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            CallError::Timeout { .. } => "timeout",
            CallError::Backpressure { .. } => "backpressure",
            CallError::Transport(_) => "transport",
            CallError::TransportLoss(_) => "transport",
            CallError::Shutdown => "shutdown",
            CallError::Protocol(_) => "protocol",
            CallError::OversizeOutbound { .. } => "oversize",
            CallError::Server { .. } => "server",
            CallError::Cancelled { .. } => "cancelled",
            CallError::State { .. } => "state",
            CallError::Unavailable { .. } => "state",
            CallError::CapabilityMismatch(_) => "capability",
            CallError::Internal(_) => "internal",
        }
    }

    /// Check whether retrying the whole call later could succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            CallError::Timeout { .. } => true,
            CallError::Backpressure { .. } => true,
            CallError::Transport(_) => true,
            CallError::TransportLoss(_) => true,
            CallError::Shutdown => false,
            CallError::Protocol(_) => false,
            CallError::OversizeOutbound { .. } => false,
            CallError::Server { .. } => false,
            CallError::Cancelled { .. } => false,
            CallError::State { .. } => true,
            CallError::Unavailable { .. } => true,
            CallError::CapabilityMismatch(_) => false,
            CallError::Internal(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_display() {
        let error = CallError::transport("pipe closed");
        assert_eq!(error.to_string(), "transport error: pipe closed");
        assert_eq!(error.category(), "transport");
        assert!(error.is_recoverable());
    }

    #[test]
    fn test_recognized_server_code_relayed_verbatim() {
        let error = CallError::from_error_object(ErrorObject {
            code: error_codes::METHOD_NOT_FOUND,
            message: "no such method".to_string(),
            data: Some(json!({"method": "tools/fly"})),
        });

        match error {
            CallError::Server {
                code,
                message,
                data,
            } => {
                assert_eq!(code, error_codes::METHOD_NOT_FOUND);
                assert_eq!(message, "no such method");
                assert_eq!(data, Some(json!({"method": "tools/fly"})));
            }
            other => panic!("expected Server, got {other:?}"),
        }
    }

    #[test]
    fn test_mcp_range_is_recognized() {
        for code in -32007..=-32001 {
            let error = CallError::from_error_object(ErrorObject {
                code,
                message: "mcp error".to_string(),
                data: None,
            });
            assert!(matches!(error, CallError::Server { .. }), "code {code}");
        }
    }

    #[test]
    fn test_unknown_code_maps_to_internal() {
        let error = CallError::from_error_object(ErrorObject {
            code: -31999,
            message: "vendor extension".to_string(),
            data: None,
        });
        assert!(matches!(error, CallError::Internal(_)));
        assert_eq!(error.category(), "internal");
    }

    #[test]
    fn test_error_recovery() {
        assert!(CallError::Timeout { elapsed_ms: 100 }.is_recoverable());
        assert!(CallError::Unavailable { retry_in_ms: 500 }.is_recoverable());
        assert!(!CallError::Shutdown.is_recoverable());
        assert!(!CallError::protocol("bad frame").is_recoverable());
    }
}
