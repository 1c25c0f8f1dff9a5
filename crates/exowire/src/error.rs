//! # Error Definitions
//!
//! Failures of the wire layer itself, and the structured failure a remote
//! peer reports inside a reply.

use serde_json::Value;

/// Operational failures while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The frame was not valid JSON, or did not fit the expected record shape.
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    /// The frame parsed but broke the protocol (missing correlation id, wrong field types).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// A remote-initiated frame named an action this side does not serve.
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    /// A blob reply carried something other than base64 text or a byte array.
    #[error("invalid blob payload: {0}")]
    Blob(String),
}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The structured error payload of a failed reply.
///
/// Remote runtimes usually report `{message, stack, name}`; anything else is
/// kept verbatim in `raw` and rendered as the message.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFailure {
    pub message: String,
    pub stack: Option<String>,
    pub type_name: Option<String>,
    pub raw: Value,
}

impl RemoteFailure {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            raw: Value::String(message.clone()),
            message,
            stack: None,
            type_name: None,
        }
    }

    pub fn with_type(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    /// Interprets an `error` field from a reply.
    pub fn from_payload(raw: Value) -> Self {
        let field = |name: &str| raw.get(name).and_then(Value::as_str).map(str::to_owned);
        let message = match &raw {
            Value::String(s) => s.clone(),
            Value::Object(_) => field("message").unwrap_or_else(|| raw.to_string()),
            other => other.to_string(),
        };
        Self {
            message,
            stack: field("stack"),
            type_name: field("name").or_else(|| field("type")),
            raw,
        }
    }

    /// Payload sent back to a remote peer when a local invocation fails.
    pub fn to_payload(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("message".into(), Value::String(self.message.clone()));
        if let Some(name) = &self.type_name {
            map.insert("name".into(), Value::String(name.clone()));
        }
        if let Some(stack) = &self.stack {
            map.insert("stack".into(), Value::String(stack.clone()));
        }
        Value::Object(map)
    }
}

impl std::fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.type_name {
            Some(name) => write!(f, "{}: {}", name, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}
