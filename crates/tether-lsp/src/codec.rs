//! JSON-RPC 2.0 envelopes exchanged with the language server.
//!
//! [`Message::decode`] classifies a frame payload by the members it carries:
//! a request has `method` and `id`, a notification has `method` only, and a
//! response has `id` with exactly one of `result` or `error`. Anything else is
//! rejected with a [`CodecError`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::bytes::Bytes;

use crate::errors::CodecError;

const JSONRPC_VERSION: &str = "2.0";

/// Identifier correlating a request with its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric identifier, as issued by this client.
    Integer(i64),
    /// String identifier, as some servers issue for their own requests.
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::String(value) => write!(f, "{value:?}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

/// The `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    /// JSON-RPC error code.
    pub code: i64,
    /// Human-readable description.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// The request was cancelled by the client.
    pub const REQUEST_CANCELLED: i64 = -32800;

    /// Creates an error without structured data.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Creates the reply sent for inbound requests nobody handles.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    /// Attaches structured data to the error.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code: {})", self.message, self.code)
    }
}

/// A decoded JSON-RPC 2.0 message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A call expecting a response.
    Request {
        /// Correlation identifier.
        id: RequestId,
        /// Method name.
        method: String,
        /// Optional parameters.
        params: Option<Value>,
    },
    /// A one-way message.
    Notification {
        /// Method name.
        method: String,
        /// Optional parameters.
        params: Option<Value>,
    },
    /// A successful response.
    Response {
        /// Identifier of the answered request.
        id: RequestId,
        /// Result value, `null` when the method returns nothing.
        result: Value,
    },
    /// A failed response.
    ErrorResponse {
        /// Identifier of the answered request; `None` when the server could
        /// not determine it.
        id: Option<RequestId>,
        /// The error object.
        error: ResponseError,
    },
}

#[derive(Serialize)]
struct WireRequest<'a> {
    jsonrpc: &'static str,
    id: &'a RequestId,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

#[derive(Serialize)]
struct WireNotification<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

#[derive(Serialize)]
struct WireResponse<'a> {
    jsonrpc: &'static str,
    id: &'a RequestId,
    result: &'a Value,
}

#[derive(Serialize)]
struct WireErrorResponse<'a> {
    jsonrpc: &'static str,
    id: Option<&'a RequestId>,
    error: &'a ResponseError,
}

impl Message {
    /// Creates a request.
    #[must_use]
    pub fn request(
        id: impl Into<RequestId>,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Self {
        Self::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Creates a notification.
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification {
            method: method.into(),
            params,
        }
    }

    /// Creates a successful response.
    #[must_use]
    pub fn response(id: impl Into<RequestId>, result: Value) -> Self {
        Self::Response {
            id: id.into(),
            result,
        }
    }

    /// Creates a failed response.
    #[must_use]
    pub fn error_response(id: Option<RequestId>, error: ResponseError) -> Self {
        Self::ErrorResponse { id, error }
    }

    /// Returns the method name of a request or notification.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } | Self::ErrorResponse { .. } => None,
        }
    }

    /// Returns the identifier carried by the message, if any.
    #[must_use]
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => Some(id),
            Self::ErrorResponse { id, .. } => id.as_ref(),
            Self::Notification { .. } => None,
        }
    }

    /// Serialises the message into a frame payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] if a parameter or result value cannot be
    /// serialised.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let payload = match self {
            Self::Request { id, method, params } => serde_json::to_vec(&WireRequest {
                jsonrpc: JSONRPC_VERSION,
                id,
                method,
                params: params.as_ref(),
            }),
            Self::Notification { method, params } => serde_json::to_vec(&WireNotification {
                jsonrpc: JSONRPC_VERSION,
                method,
                params: params.as_ref(),
            }),
            Self::Response { id, result } => serde_json::to_vec(&WireResponse {
                jsonrpc: JSONRPC_VERSION,
                id,
                result,
            }),
            Self::ErrorResponse { id, error } => serde_json::to_vec(&WireErrorResponse {
                jsonrpc: JSONRPC_VERSION,
                id: id.as_ref(),
                error,
            }),
        }?;
        Ok(Bytes::from(payload))
    }

    /// Parses a frame payload.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] describing why the payload is not a JSON-RPC
    /// 2.0 message.
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let Value::Object(mut object) = serde_json::from_slice::<Value>(payload)? else {
            return Err(CodecError::NotAnObject);
        };

        if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(CodecError::InvalidVersion);
        }

        let id = take_id(&mut object)?;
        let method = take_method(&mut object)?;
        let params = object.remove("params");
        let result = object.remove("result");
        let error = object
            .remove("error")
            .map(serde_json::from_value::<ResponseError>)
            .transpose()
            .map_err(CodecError::InvalidError)?;

        match (method, id, result, error) {
            (Some(method), Some(Some(id)), None, None) => Ok(Self::Request { id, method, params }),
            (Some(method), None, None, None) => Ok(Self::Notification { method, params }),
            (None, Some(Some(id)), Some(result), None) => Ok(Self::Response { id, result }),
            (None, Some(id), None, Some(error)) => Ok(Self::ErrorResponse { id, error }),
            _ => Err(CodecError::Unclassifiable),
        }
    }
}

/// Removes the `id` member: `None` when absent, `Some(None)` when `null`.
fn take_id(object: &mut Map<String, Value>) -> Result<Option<Option<RequestId>>, CodecError> {
    match object.remove("id") {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(Value::String(value)) => Ok(Some(Some(RequestId::String(value)))),
        Some(Value::Number(number)) => number
            .as_i64()
            .map(|value| Some(Some(RequestId::Integer(value))))
            .ok_or(CodecError::InvalidId),
        Some(_) => Err(CodecError::InvalidId),
    }
}

fn take_method(object: &mut Map<String, Value>) -> Result<Option<String>, CodecError> {
    match object.remove("method") {
        None => Ok(None),
        Some(Value::String(method)) => Ok(Some(method)),
        Some(_) => Err(CodecError::InvalidMethod),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn encoded_json(message: &Message) -> Value {
        let bytes = message.encode().expect("encode");
        serde_json::from_slice(&bytes).expect("valid json")
    }

    #[rstest]
    fn encodes_request_with_version_and_params() {
        let message = Message::request(7_i64, "textDocument/hover", Some(json!({"line": 1})));

        assert_eq!(
            encoded_json(&message),
            json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": "textDocument/hover",
                "params": {"line": 1}
            })
        );
    }

    #[rstest]
    fn omits_absent_params() {
        let json = encoded_json(&Message::notification("exit", None));

        assert_eq!(json, json!({"jsonrpc": "2.0", "method": "exit"}));
    }

    #[rstest]
    fn null_result_keeps_the_result_member() {
        let json = encoded_json(&Message::response(3_i64, Value::Null));

        assert_eq!(json, json!({"jsonrpc": "2.0", "id": 3, "result": null}));
    }

    #[rstest]
    fn error_response_without_id_serialises_null_id() {
        let message =
            Message::error_response(None, ResponseError::new(ResponseError::PARSE_ERROR, "bad"));

        assert_eq!(
            encoded_json(&message),
            json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": {"code": -32700, "message": "bad"}
            })
        );
    }

    #[rstest]
    #[case::request(
        br#"{"jsonrpc":"2.0","id":"a1","method":"workspace/configuration","params":{"items":[]}}"#.as_slice(),
        Message::request("a1", "workspace/configuration", Some(json!({"items": []})))
    )]
    #[case::notification(
        br#"{"jsonrpc":"2.0","method":"window/logMessage"}"#.as_slice(),
        Message::notification("window/logMessage", None)
    )]
    #[case::response(
        br#"{"jsonrpc":"2.0","id":4,"result":null}"#.as_slice(),
        Message::response(4_i64, Value::Null)
    )]
    #[case::error_response(
        br#"{"jsonrpc":"2.0","id":5,"error":{"code":-32601,"message":"nope","data":[1]}}"#.as_slice(),
        Message::error_response(
            Some(RequestId::Integer(5)),
            ResponseError::new(ResponseError::METHOD_NOT_FOUND, "nope").with_data(json!([1]))
        )
    )]
    #[case::null_id_error(
        br#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"parse"}}"#.as_slice(),
        Message::error_response(None, ResponseError::new(ResponseError::PARSE_ERROR, "parse"))
    )]
    fn decodes_each_message_kind(#[case] payload: &[u8], #[case] expected: Message) {
        assert_eq!(Message::decode(payload).expect("decode"), expected);
    }

    #[rstest]
    #[case::request(Message::request(12_i64, "initialize", Some(json!({"capabilities": {}}))))]
    #[case::request_with_string_id(Message::request("abc", "shutdown", None))]
    #[case::notification(Message::notification(
        "textDocument/didOpen",
        Some(json!({"textDocument": {"text": "fn main() {}"}}))
    ))]
    #[case::notification_without_params(Message::notification("exit", None))]
    #[case::response(Message::response(9_i64, json!({"contents": "docs"})))]
    #[case::null_result(Message::response(3_i64, Value::Null))]
    #[case::error_response(Message::error_response(
        Some(RequestId::Integer(4)),
        ResponseError::new(ResponseError::INVALID_PARAMS, "bad position")
    ))]
    #[case::error_response_with_data(Message::error_response(
        Some(RequestId::from("s-1")),
        ResponseError::new(ResponseError::INTERNAL_ERROR, "crashed").with_data(json!({"trace": []}))
    ))]
    #[case::error_response_without_id(Message::error_response(
        None,
        ResponseError::new(ResponseError::PARSE_ERROR, "unreadable")
    ))]
    fn encoded_messages_decode_to_the_original(#[case] original: Message) {
        let bytes = original.encode().expect("encode");

        assert_eq!(Message::decode(&bytes).expect("decode"), original);
    }

    #[rstest]
    #[case::invalid_json(b"{not json".as_slice(), "invalid JSON")]
    #[case::array(b"[1,2]".as_slice(), "not a JSON object")]
    #[case::missing_version(br#"{"id":1,"result":1}"#.as_slice(), "jsonrpc")]
    #[case::wrong_version(br#"{"jsonrpc":"1.0","id":1,"result":1}"#.as_slice(), "jsonrpc")]
    #[case::float_id(br#"{"jsonrpc":"2.0","id":1.5,"result":1}"#.as_slice(), "integer or a string")]
    #[case::object_id(br#"{"jsonrpc":"2.0","id":{},"result":1}"#.as_slice(), "integer or a string")]
    #[case::numeric_method(br#"{"jsonrpc":"2.0","method":3}"#.as_slice(), "method must be a string")]
    #[case::both_result_and_error(
        br#"{"jsonrpc":"2.0","id":1,"result":1,"error":{"code":1,"message":"x"}}"#.as_slice(),
        "neither"
    )]
    #[case::neither_result_nor_error(br#"{"jsonrpc":"2.0","id":1}"#.as_slice(), "neither")]
    #[case::bad_error_object(br#"{"jsonrpc":"2.0","id":1,"error":"boom"}"#.as_slice(), "malformed error")]
    fn rejects_invalid_messages(#[case] payload: &[u8], #[case] expected: &str) {
        let error = Message::decode(payload).expect_err("decode should fail");

        assert!(
            error.to_string().contains(expected),
            "unexpected error: {error}"
        );
    }

    #[rstest]
    fn accessors_expose_method_and_id() {
        let request = Message::request("x", "shutdown", None);

        assert_eq!(request.method(), Some("shutdown"));
        assert_eq!(request.id(), Some(&RequestId::from("x")));
        assert_eq!(Message::notification("exit", None).id(), None);
    }
}
