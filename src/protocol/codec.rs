// ! JSON-RPC frame codec
// !
// ! Module encodes outbound requests and notifications into byte frames and
// ! classifies inbound frames into the message shapes the connection core
// ! dispatches on. The frame size limit is enforced on both directions
// ! before any JSON parsing happens.

use serde::Serialize;
use thiserror::Error;

use crate::protocol::types::{
    ErrorObject, JSONRPC_VERSION, JsonRpcError, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest,
};

/// A decoded inbound frame, tagged by how the core must treat it
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    /// Successful response to a request this client issued
    Response {
        id: i64,
        result: serde_json::Value,
    },
    /// Error response to a request this client issued
    ErrorResponse { id: i64, error: ErrorObject },
    /// Server-initiated notification
    Notification(JsonRpcNotification),
    /// Server-initiated request expecting a reply
    ServerRequest {
        id: i64,
        method: String,
        params: Option<serde_json::Value>,
    },
}

/// Inbound frame rejection reasons
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Frame length exceeds the configured limit
    #[error("frame is {len} bytes, limit is {limit}")]
    Oversize { len: usize, limit: usize },

    /// Frame is not valid JSON or not a JSON-RPC 2.0 message
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Valid JSON-RPC envelope but not a shape this client recognises
    #[error("unrecognized JSON-RPC shape")]
    UnknownShape,
}

/// Outbound frame rejection reasons
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    /// Encoded frame length exceeds the configured limit
    #[error("encoded frame is {size} bytes, limit is {limit}")]
    Oversize { size: usize, limit: usize },

    /// Parameters failed to serialize
    #[error("serialization failed: {0}")]
    Serialize(String),
}

/// Codec for one connection, carrying its frame size limit
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    /// Create a codec enforcing the given frame size limit
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    /// Frame size limit this codec enforces
    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Encode a request into a byte frame
    pub fn encode_request<P: Serialize>(
        &self,
        id: i64,
        method: &str,
        params: Option<P>,
    ) -> Result<Vec<u8>, EncodeError> {
        let request = JsonRpcRequest::new(id, method.to_string(), params)
            .map_err(|e| EncodeError::Serialize(e.to_string()))?;
        self.to_frame(&request)
    }

    /// Encode a notification into a byte frame
    pub fn encode_notification<P: Serialize>(
        &self,
        method: &str,
        params: Option<P>,
    ) -> Result<Vec<u8>, EncodeError> {
        let notification = JsonRpcNotification::new(method.to_string(), params)
            .map_err(|e| EncodeError::Serialize(e.to_string()))?;
        self.to_frame(&notification)
    }

    /// Encode an error reply to a server-initiated request
    pub fn encode_error_reply(
        &self,
        id: i64,
        code: i32,
        message: String,
    ) -> Result<Vec<u8>, EncodeError> {
        self.to_frame(&JsonRpcError::new(id, code, message))
    }

    /// Classify an inbound byte frame.
    ///
    /// The length check runs before any parsing so oversized input never
    /// reaches the JSON decoder.
    pub fn decode(&self, bytes: &[u8]) -> Result<DecodedFrame, DecodeError> {
        if bytes.len() > self.max_frame_bytes {
            return Err(DecodeError::Oversize {
                len: bytes.len(),
                limit: self.max_frame_bytes,
            });
        }

        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let envelope_ok = value
            .as_object()
            .and_then(|o| o.get("jsonrpc"))
            .and_then(|v| v.as_str())
            == Some(JSONRPC_VERSION);
        if !envelope_ok {
            return Err(DecodeError::Malformed(
                "missing or unsupported jsonrpc version".to_string(),
            ));
        }

        let message: JsonRpcMessage =
            serde_json::from_value(value).map_err(|_| DecodeError::UnknownShape)?;

        Ok(match message {
            JsonRpcMessage::Request(r) => DecodedFrame::ServerRequest {
                id: r.id,
                method: r.method,
                params: r.params,
            },
            JsonRpcMessage::Response(r) => DecodedFrame::Response {
                id: r.id,
                result: r.result,
            },
            JsonRpcMessage::Error(e) => DecodedFrame::ErrorResponse {
                id: e.id,
                error: e.error,
            },
            JsonRpcMessage::Notification(n) => DecodedFrame::Notification(n),
        })
    }

    fn to_frame<T: Serialize>(&self, message: &T) -> Result<Vec<u8>, EncodeError> {
        let bytes =
            serde_json::to_vec(message).map_err(|e| EncodeError::Serialize(e.to_string()))?;
        if bytes.len() > self.max_frame_bytes {
            return Err(EncodeError::Oversize {
                size: bytes.len(),
                limit: self.max_frame_bytes,
            });
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn codec() -> FrameCodec {
        FrameCodec::new(16 * 1024 * 1024)
    }

    #[test]
    fn test_request_round_trip() {
        let frame = codec()
            .encode_request(3, "tools/call", Some(json!({"name": "ping"})))
            .unwrap();

        // A peer decoding our request sees a server request shape
        let decoded = codec().decode(&frame).unwrap();
        assert_eq!(
            decoded,
            DecodedFrame::ServerRequest {
                id: 3,
                method: "tools/call".to_string(),
                params: Some(json!({"name": "ping"})),
            }
        );
    }

    #[test]
    fn test_notification_round_trip() {
        let frame = codec()
            .encode_notification("notifications/initialized", None::<serde_json::Value>)
            .unwrap();
        let decoded = codec().decode(&frame).unwrap();
        match decoded {
            DecodedFrame::Notification(n) => {
                assert_eq!(n.method, "notifications/initialized");
                assert_eq!(n.params, None);
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn test_error_reply_round_trip() {
        let frame = codec()
            .encode_error_reply(11, -32601, "method not found".to_string())
            .unwrap();
        let decoded = codec().decode(&frame).unwrap();
        assert_eq!(
            decoded,
            DecodedFrame::ErrorResponse {
                id: 11,
                error: ErrorObject {
                    code: -32601,
                    message: "method not found".to_string(),
                    data: None,
                },
            }
        );
    }

    #[test]
    fn test_response_decode() {
        let frame = serde_json::to_vec(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"content": [{"type": "text", "text": "pong"}], "isError": false}
        }))
        .unwrap();

        let decoded = codec().decode(&frame).unwrap();
        match decoded {
            DecodedFrame::Response { id, result } => {
                assert_eq!(id, 1);
                assert_eq!(result["isError"], json!(false));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_oversize_rejected_before_parse() {
        let codec = FrameCodec::new(64);
        // Not even valid JSON; the length check must reject it first
        let frame = vec![b'x'; 65];
        assert_eq!(
            codec.decode(&frame),
            Err(DecodeError::Oversize { len: 65, limit: 64 })
        );
    }

    #[test]
    fn test_encode_oversize_rejected() {
        let codec = FrameCodec::new(32);
        let result = codec.encode_request(1, "tools/call", Some(json!({"blob": "y".repeat(64)})));
        assert!(matches!(result, Err(EncodeError::Oversize { .. })));
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            codec().decode(b"{not json"),
            Err(DecodeError::Malformed(_))
        ));
        // Valid JSON but no jsonrpc envelope
        assert!(matches!(
            codec().decode(br#"{"id": 1, "result": {}}"#),
            Err(DecodeError::Malformed(_))
        ));
        // Wrong version string
        assert!(matches!(
            codec().decode(br#"{"jsonrpc": "1.0", "id": 1, "result": {}}"#),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_unknown_shape() {
        // Correct envelope, but neither request, response, error nor notification
        assert_eq!(
            codec().decode(br#"{"jsonrpc": "2.0", "id": 1}"#),
            Err(DecodeError::UnknownShape)
        );
        // String ids are not issued by this client
        assert_eq!(
            codec().decode(br#"{"jsonrpc": "2.0", "id": "a", "result": {}}"#),
            Err(DecodeError::UnknownShape)
        );
    }
}
