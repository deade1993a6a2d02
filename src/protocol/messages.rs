// ! MCP handshake and cancellation message types
// !
// ! Module defines the parameter and result shapes the connection core
// ! exchanges during session establishment and request cancellation.

use crate::protocol::types::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Parameters for the initialize request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InitializeParams {
    /// Protocol version the client speaks
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Client capabilities
    pub capabilities: ClientCapabilities,
    /// Client implementation info
    #[serde(rename = "clientInfo")]
    pub client_info: Implementation,
    /// Request metadata
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<HashMap<String, serde_json::Value>>,
}

/// Result of the initialize request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InitializeResult {
    /// Protocol version the server speaks
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Server capabilities
    pub capabilities: ServerCapabilities,
    /// Server implementation info
    #[serde(rename = "serverInfo")]
    pub server_info: Implementation,
    /// Optional instructions for the client
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Response metadata
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<HashMap<String, serde_json::Value>>,
}

/// Parameters for the initialized notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InitializedParams {
    /// Notification metadata
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<HashMap<String, serde_json::Value>>,
}

/// Parameters of the server-sent cancelled notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CancelledParams {
    /// ID of the request being cancelled
    #[serde(rename = "requestId")]
    pub request_id: serde_json::Value,
    /// Optional reason for cancellation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CancelledParams {
    /// The cancelled request id, when it is an integer.
    ///
    /// Non-integer ids cannot refer to a request this client issued.
    pub fn integer_id(&self) -> Option<i64> {
        self.request_id.as_i64()
    }
}

/// Parameters of the client-sent cancel request notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CancelRequestParams {
    /// ID of the request to cancel
    #[serde(rename = "requestId")]
    pub request_id: i64,
}

impl InitializeParams {
    pub fn new(
        protocol_version: String,
        capabilities: ClientCapabilities,
        client_info: Implementation,
    ) -> Self {
        Self {
            protocol_version,
            capabilities,
            client_info,
            meta: None,
        }
    }
}

impl InitializeResult {
    pub fn new(
        protocol_version: String,
        capabilities: ServerCapabilities,
        server_info: Implementation,
    ) -> Self {
        Self {
            protocol_version,
            capabilities,
            server_info,
            instructions: None,
            meta: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_initialize_params_serialization() {
        let params = InitializeParams::new(
            LATEST_PROTOCOL_VERSION.to_string(),
            ClientCapabilities::default(),
            Implementation::new("test-client", "1.0.0"),
        );

        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["protocolVersion"], json!("2025-06-18"));
        assert_eq!(value["clientInfo"]["name"], json!("test-client"));
        assert!(value.get("_meta").is_none());
    }

    #[test]
    fn test_initialize_result_round_trip() {
        let result = InitializeResult::new(
            LATEST_PROTOCOL_VERSION.to_string(),
            ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(false),
                }),
                ..Default::default()
            },
            Implementation::with_title("test-server", "2.1.0", "Test Server"),
        );

        let value = serde_json::to_value(&result).unwrap();
        let back: InitializeResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_cancelled_params_integer_id() {
        let params: CancelledParams =
            serde_json::from_value(json!({"requestId": 42, "reason": "user aborted"})).unwrap();
        assert_eq!(params.integer_id(), Some(42));
        assert_eq!(params.reason.as_deref(), Some("user aborted"));

        let params: CancelledParams =
            serde_json::from_value(json!({"requestId": "abc"})).unwrap();
        assert_eq!(params.integer_id(), None);
    }

    #[test]
    fn test_cancel_request_params_wire_shape() {
        let params = CancelRequestParams { request_id: 9 };
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            json!({"requestId": 9})
        );
    }
}
