//! Error types for the agency RPC runtime.
//!
//! Three layers live here:
//! - [`RpcError`]: what public operations of the client and server return.
//! - [`ErrorObject`] / [`ErrorCode`]: the error descriptor carried on the wire.
//! - [`HandlerError`]: what registered method handlers return; translated into
//!   an [`ErrorObject`] at the dispatch boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the RPC runtime.
#[derive(Debug, Error)]
pub enum RpcError {
    // Transport errors
    #[error("not connected")]
    NotConnected,

    #[error("websocket already instantiated")]
    AlreadyConnected,

    #[error("call to {method} timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("connection closed before a response arrived")]
    ConnectionClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Remote errors
    #[error("remote error {}: {}", .0.code, .0.message)]
    Remote(ErrorObject),

    // Registration errors
    #[error("invalid definition for {name:?}: {message}")]
    InvalidDefinition { name: String, message: String },

    #[error("unsupported version of rpc spec: {0}")]
    UnsupportedSpecVersion(u32),

    #[error("no operation resolved for method {method}")]
    BadOperation { method: String },

    #[error("notification not registered: {0}")]
    NotificationNotRegistered(String),

    #[error("subscription to {name} failed: {reason}")]
    Subscription { name: String, reason: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl RpcError {
    /// The wire error carried by a remote failure, if this is one.
    pub fn remote(&self) -> Option<&ErrorObject> {
        match self {
            RpcError::Remote(obj) => Some(obj),
            _ => None,
        }
    }

    /// Whether the failure came from the transport rather than the peer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RpcError::NotConnected
                | RpcError::ConnectionClosed
                | RpcError::Transport(_)
                | RpcError::Io(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RpcError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RpcError::Transport(err.to_string())
    }
}

/// Numeric error codes used on the wire.
///
/// JSON-RPC 2.0 codes plus the runtime's extensions:
/// - -32604: params not found
/// - -32605: method forbidden
/// - -32000: event not provided
/// - -29001: becoming forbidden
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    ParamsNotFound,
    MethodForbidden,
    EventNotProvided,
    BecomingForbidden,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::ParamsNotFound => -32604,
            ErrorCode::MethodForbidden => -32605,
            ErrorCode::EventNotProvided => -32000,
            ErrorCode::BecomingForbidden => -29001,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "Parse error",
            ErrorCode::InvalidRequest => "Invalid Request",
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::InvalidParams => "Invalid params",
            ErrorCode::InternalError => "Internal error",
            ErrorCode::ParamsNotFound => "Params not found",
            ErrorCode::MethodForbidden => "Method forbidden",
            ErrorCode::EventNotProvided => "Event not provided",
            ErrorCode::BecomingForbidden => "Becoming is forbidden",
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        [
            ErrorCode::ParseError,
            ErrorCode::InvalidRequest,
            ErrorCode::MethodNotFound,
            ErrorCode::InvalidParams,
            ErrorCode::InternalError,
            ErrorCode::ParamsNotFound,
            ErrorCode::MethodForbidden,
            ErrorCode::EventNotProvided,
            ErrorCode::BecomingForbidden,
        ]
        .into_iter()
        .find(|c| c.code() == code)
    }
}

/// Wire error descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code: code.code(),
            message: code.message().to_string(),
            data: None,
        }
    }

    /// Attach free-form details under `data`.
    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn kind(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }
}

impl From<ErrorCode> for ErrorObject {
    fn from(code: ErrorCode) -> Self {
        ErrorObject::new(code)
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Failure returned by a method handler.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerError {
    /// Sent to the caller verbatim.
    Rpc(ErrorObject),
    /// Reported as an internal error with `kind` as message and `message` as data.
    Failed { kind: String, message: String },
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        HandlerError::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Translate into the descriptor sent back to the caller.
    pub fn into_error_object(self) -> ErrorObject {
        match self {
            HandlerError::Rpc(obj) => obj,
            HandlerError::Failed { kind, message } => ErrorObject {
                code: ErrorCode::InternalError.code(),
                message: kind,
                data: Some(Value::String(message)),
            },
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Rpc(obj) => write!(f, "{}", obj),
            HandlerError::Failed { kind, message } => write!(f, "{}: {}", kind, message),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<ErrorObject> for HandlerError {
    fn from(obj: ErrorObject) -> Self {
        HandlerError::Rpc(obj)
    }
}

impl From<ErrorCode> for HandlerError {
    fn from(code: ErrorCode) -> Self {
        HandlerError::Rpc(ErrorObject::new(code))
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        HandlerError::new("Error", format!("{:#}", err))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::new("SerializationError", err.to_string())
    }
}

impl From<RpcError> for HandlerError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Remote(obj) => HandlerError::Rpc(obj),
            other => HandlerError::new("RpcError", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_codes() {
        assert_eq!(ErrorCode::ParseError.code(), -32700);
        assert_eq!(ErrorCode::MethodForbidden.code(), -32605);
        assert_eq!(ErrorCode::BecomingForbidden.code(), -29001);
        assert_eq!(ErrorCode::from_code(-32000), Some(ErrorCode::EventNotProvided));
        assert_eq!(ErrorCode::from_code(1), None);
    }

    #[test]
    fn test_error_object_serialization_skips_empty_data() {
        let obj = ErrorObject::new(ErrorCode::MethodNotFound);
        let json = serde_json::to_value(&obj).unwrap();
        assert_eq!(json, json!({"code": -32601, "message": "Method not found"}));
    }

    #[test]
    fn test_failed_handler_becomes_internal_error() {
        let obj = HandlerError::new("TypeError", "bad input").into_error_object();
        assert_eq!(obj.code, -32603);
        assert_eq!(obj.message, "TypeError");
        assert_eq!(obj.data, Some(json!("bad input")));
    }

    #[test]
    fn test_rpc_handler_error_passes_through() {
        let original = ErrorObject {
            code: 0,
            message: "Internal Server Error".to_string(),
            data: None,
        };
        let obj = HandlerError::Rpc(original.clone()).into_error_object();
        assert_eq!(obj, original);
    }

    #[test]
    fn test_transport_classification() {
        assert!(RpcError::NotConnected.is_transport());
        assert!(RpcError::ConnectionClosed.is_transport());
        assert!(!RpcError::Remote(ErrorObject::new(ErrorCode::InternalError)).is_transport());
    }

    #[test]
    fn test_error_display() {
        let err = RpcError::Timeout {
            method: "rule.list".into(),
            after: Duration::from_millis(1000),
        };
        assert_eq!(err.to_string(), "call to rule.list timed out after 1s");
    }
}
