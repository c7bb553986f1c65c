//! Wire format shared by client and server.
//!
//! Every WebSocket text message carries either a single JSON-RPC envelope or a
//! non-empty array of them:
//!
//! ```text
//! {"jsonrpc":"2.0","method":"rule.list","params":{},"id":1}
//! [{"jsonrpc":"2.0","method":"a","id":1},{"jsonrpc":"2.0","method":"b"}]
//! ```
//!
//! Requests may carry the out-of-band `x-agency-become` field to act as a
//! different user for that single call.

use crate::config::RpcConfig;
use crate::error::{ErrorCode, ErrorObject};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request or client-originated notification (a request without an id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(
        rename = "x-agency-become",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub become_user: Option<String>,
}

impl Request {
    /// Create a request that expects a response.
    pub fn call(method: impl Into<String>, params: Option<Value>, id: u64) -> Self {
        Self {
            jsonrpc: RpcConfig::PROTOCOL_VERSION.to_string(),
            method: method.into(),
            params,
            id: Some(Value::Number(id.into())),
            become_user: None,
        }
    }

    /// Create a fire-and-forget notification.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: RpcConfig::PROTOCOL_VERSION.to_string(),
            method: method.into(),
            params,
            id: None,
            become_user: None,
        }
    }

    pub fn with_become(mut self, user: Option<String>) -> Self {
        self.become_user = user;
        self
    }

    /// Whether the sender expects a response.
    pub fn expects_response(&self) -> bool {
        id_present(self.id.as_ref())
    }
}

/// Response to a request that carried an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    #[serde(default)]
    pub id: Option<Value>,
}

impl Response {
    /// Create a success response.
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: RpcConfig::PROTOCOL_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response.
    pub fn error(id: Option<Value>, error: impl Into<ErrorObject>) -> Self {
        Self {
            jsonrpc: RpcConfig::PROTOCOL_VERSION.to_string(),
            result: None,
            error: Some(error.into()),
            id,
        }
    }

    /// Numeric correlation id, if the response carries one.
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }

    /// Collapse into the call outcome.
    pub fn into_outcome(self) -> Result<Value, ErrorObject> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Server push to a subscribed connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    #[serde(alias = "notification")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: RpcConfig::PROTOCOL_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// One envelope or a batch of them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Frame<T> {
    Single(T),
    Batch(Vec<T>),
}

impl<T: Serialize> Frame<T> {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A request entry that failed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invalid {
    pub id: Option<Value>,
    pub error: ErrorObject,
}

impl Invalid {
    fn new(id: Option<Value>, code: ErrorCode, details: Option<&str>) -> Self {
        let mut error = ErrorObject::new(code);
        if let Some(details) = details {
            error = error.with_data(details);
        }
        Self { id, error }
    }

    pub fn into_response(self) -> Response {
        Response::error(self.id, self.error)
    }
}

/// Message received by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response(Response),
    Notification(Notification),
}

/// Whether an id is meaningful enough to answer.
///
/// Null, `false`, `0` and `""` are treated as absent.
pub fn id_present(id: Option<&Value>) -> bool {
    is_truthy(id)
}

/// Render a user name carried in a JSON value.
///
/// Strings are taken as-is; anything else uses its JSON text, so `42`
/// names the user `"42"`.
pub fn user_name(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64() != Some(0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// Split an inbound text message into envelopes.
///
/// Malformed JSON yields a parse error; an empty array yields an invalid
/// request error, which callers must keep distinct.
pub fn decode_frame(text: &str) -> Result<Frame<Value>, ErrorObject> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ErrorObject::new(ErrorCode::ParseError).with_data(e.to_string()))?;

    match value {
        Value::Array(entries) if entries.is_empty() => {
            Err(ErrorObject::new(ErrorCode::InvalidRequest).with_data("Invalid array"))
        }
        Value::Array(entries) => Ok(Frame::Batch(entries)),
        other => Ok(Frame::Single(other)),
    }
}

/// Validate one envelope as an inbound request.
pub fn validate_request(value: Value) -> Result<Request, Invalid> {
    let Value::Object(mut map) = value else {
        return Err(Invalid::new(None, ErrorCode::InvalidRequest, None));
    };

    let id = map.remove("id").filter(|id| !id.is_null());

    if map.get("jsonrpc").and_then(Value::as_str) != Some(RpcConfig::PROTOCOL_VERSION) {
        return Err(Invalid::new(
            id,
            ErrorCode::InvalidRequest,
            Some("Invalid JSON RPC version"),
        ));
    }

    let method = match map.remove("method") {
        None | Some(Value::Null) => {
            return Err(Invalid::new(
                id,
                ErrorCode::InvalidParams,
                Some("Method not specified"),
            ));
        }
        Some(Value::String(m)) if m.is_empty() => {
            return Err(Invalid::new(
                id,
                ErrorCode::InvalidParams,
                Some("Method not specified"),
            ));
        }
        Some(Value::String(m)) => m,
        Some(_) => {
            return Err(Invalid::new(
                id,
                ErrorCode::InvalidRequest,
                Some("Invalid method name"),
            ));
        }
    };

    let params = map.remove("params").filter(|p| !p.is_null());
    if matches!(params, Some(Value::String(_))) {
        return Err(Invalid::new(id, ErrorCode::InvalidRequest, None));
    }

    let become_user = map
        .remove(RpcConfig::BECOME_FIELD)
        .filter(|user| is_truthy(Some(user)))
        .map(|user| user_name(&user));

    Ok(Request {
        jsonrpc: RpcConfig::PROTOCOL_VERSION.to_string(),
        method,
        params,
        id,
        become_user,
    })
}

/// Decode a message arriving at a client.
///
/// Entries that are not JSON-RPC 2.0 responses or notifications are dropped.
pub fn decode_incoming(text: &str) -> Vec<Incoming> {
    let entries = match decode_frame(text) {
        Ok(Frame::Single(v)) => vec![v],
        Ok(Frame::Batch(vs)) => vs,
        Err(_) => return Vec::new(),
    };

    entries.into_iter().filter_map(classify_incoming).collect()
}

fn classify_incoming(value: Value) -> Option<Incoming> {
    let obj = value.as_object()?;
    if obj.get("jsonrpc").and_then(Value::as_str) != Some(RpcConfig::PROTOCOL_VERSION) {
        return None;
    }

    let has_method = obj.get("method").or_else(|| obj.get("notification")).is_some();
    if has_method && !id_present(obj.get("id")) {
        return serde_json::from_value(value).ok().map(Incoming::Notification);
    }

    if obj.contains_key("result") || obj.contains_key("error") {
        return serde_json::from_value(value).ok().map(Incoming::Response);
    }

    None
}
