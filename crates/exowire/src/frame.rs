//! # Protocol Frames
//!
//! Defines the records exchanged with the remote runtime: outbound requests,
//! inbound replies, remote-initiated invocations and destroy notifications.
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on unknown data.
//! - **Forward Compatibility**: Unknown fields are ignored.
//! - **Classification**: A frame with an `action` was initiated by the remote
//!   side; a frame without one is a reply to a local request.

use base64::Engine;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::Error;
use crate::error::RemoteFailure;
use crate::error::Result;
use crate::kind::Kind;

/// Foreign object identifier. Minted by the remote side.
pub type Ffid = u64;

/// The remote runtime's global object.
pub const ROOT_FFID: Ffid = 0;

/// Operations the local side requests from the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Get,
    Set,
    Call,
    Init,
    Inspect,
    Serialize,
    Blob,
    Keys,
    Free,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Call => "call",
            Self::Init => "init",
            Self::Inspect => "inspect",
            Self::Serialize => "serialize",
            Self::Blob => "blob",
            Self::Keys => "keys",
            Self::Free => "free",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An attribute name or an index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Index(u64),
    Name(String),
}

impl Key {
    /// The empty name, used when the target itself is called.
    pub fn empty() -> Self {
        Self::Name(String::new())
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            Self::Name(name) => Some(name),
            Self::Index(_) => None,
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{}", i),
            Self::Name(name) => f.write_str(name),
        }
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<&String> for Key {
    fn from(name: &String) -> Self {
        Self::Name(name.clone())
    }
}

impl From<usize> for Key {
    fn from(index: usize) -> Self {
        Self::Index(index as u64)
    }
}

impl From<u64> for Key {
    fn from(index: u64) -> Self {
        Self::Index(index)
    }
}

impl From<&Key> for Key {
    fn from(key: &Key) -> Self {
        key.clone()
    }
}

/// An outbound request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub r: u64,
    pub action: Action,
    pub ffid: Ffid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Key>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    /// Number of adoption requests among the arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<u64>,
}

impl Request {
    pub fn new(r: u64, action: Action, ffid: Ffid) -> Self {
        Self { r, action, ffid, key: None, args: None, p: None }
    }

    pub fn with_key(mut self, key: Key) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = Some(args);
        self
    }

    pub fn with_pending(mut self, p: u64) -> Self {
        self.p = Some(p);
        self
    }

    /// A batched release of remote objects. The remote side does not reply.
    pub fn free(r: u64, ffids: impl IntoIterator<Item = Ffid>) -> Self {
        let args = ffids.into_iter().map(Value::from).collect();
        Self::new(r, Action::Free, ROOT_FFID).with_args(args)
    }

    /// Serializes the request as one frame (without the line terminator).
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// A reply to a local request.
///
/// Reply shapes differ per action, so every field but `r` is optional and the
/// accessors interpret the record for the shape the caller expects.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Reply {
    pub r: u64,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub val: Value,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub keys: Option<Vec<Value>>,
    #[serde(default)]
    pub blob: Option<Value>,
}

impl Reply {
    /// A successful reply carrying `val` tagged with `kind`.
    pub fn value(r: u64, kind: Kind, val: Value) -> Self {
        Self { r, key: Some(kind.as_tag().to_string()), val, error: None, keys: None, blob: None }
    }

    pub fn kind(&self) -> Kind {
        Kind::from_tag(self.key.as_deref().unwrap_or_default())
    }

    /// The remote failure, if this reply reports one.
    pub fn failure(&self) -> Option<RemoteFailure> {
        self.error.clone().map(RemoteFailure::from_payload)
    }

    /// Reads an FFID-assignment reply: provisional tag → minted FFID.
    pub fn assignments(&self) -> Result<Vec<(u64, Ffid)>> {
        let Value::Object(map) = &self.val else {
            return Err(Error::ProtocolViolation(format!(
                "assignment reply {} does not carry a tag map", self.r
            )));
        };
        map.iter()
            .map(|(tag, ffid)| {
                let tag = tag.parse::<u64>().map_err(|_| {
                    Error::ProtocolViolation(format!("assignment tag '{}' is not an integer", tag))
                })?;
                let ffid = ffid.as_u64().ok_or_else(|| {
                    Error::ProtocolViolation(format!("assigned ffid for tag {} is not an integer", tag))
                })?;
                Ok((tag, ffid))
            })
            .collect()
    }

    /// Reads a `keys` reply.
    pub fn key_list(&self) -> Result<Vec<Value>> {
        match (&self.keys, &self.val) {
            (Some(keys), _) => Ok(keys.clone()),
            (None, Value::Array(keys)) => Ok(keys.clone()),
            _ => Err(Error::ProtocolViolation(format!("keys reply {} carries no key list", self.r))),
        }
    }

    /// Reads a `blob` reply as raw bytes.
    pub fn blob_bytes(&self) -> Result<Vec<u8>> {
        let payload = self.blob.as_ref().unwrap_or(&self.val);
        match payload {
            Value::String(text) => base64::engine::general_purpose::STANDARD
                .decode(text)
                .map_err(|e| Error::Blob(e.to_string())),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|b| u8::try_from(b).ok())
                        .ok_or_else(|| Error::Blob(format!("{} is not a byte", item)))
                })
                .collect(),
            other => Err(Error::Blob(format!("unexpected {}", other))),
        }
    }

    /// Reads a `serialize` reply. Text is parsed as JSON; structured values pass through.
    pub fn serialized(&self) -> Result<Value> {
        match &self.val {
            Value::String(text) => Ok(serde_json::from_str(text)?),
            other => Ok(other.clone()),
        }
    }
}

/// What a remote-initiated invocation asks of a local object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvokeAction {
    Call,
    Get,
    Inspect,
}

/// A remote-initiated request against an object the local side owns.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Invoke {
    pub r: u64,
    pub action: InvokeAction,
    pub ffid: Ffid,
    #[serde(default)]
    pub key: Option<Key>,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// An inbound frame, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Reply(Reply),
    Invoke(Invoke),
    /// The remote side no longer references these local objects.
    Destroy(Vec<Ffid>),
}

impl Frame {
    /// Decodes one line received from the transport.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes.trim_ascii())?;
        let Value::Object(map) = &value else {
            return Err(Error::ProtocolViolation("frame is not a JSON object".into()));
        };

        let action = match map.get("action") {
            None => None,
            Some(Value::String(action)) => Some(action.clone()),
            Some(other) => {
                return Err(Error::ProtocolViolation(format!("action must be a string, got {}", other)));
            }
        };

        match action.as_deref() {
            None => Ok(Self::Reply(serde_json::from_value(value)?)),
            Some("free") => Self::decode_destroy(map),
            Some("call" | "get" | "inspect") => Ok(Self::Invoke(serde_json::from_value(value)?)),
            Some(other) => Err(Error::UnknownAction(other.to_string())),
        }
    }

    fn decode_destroy(map: &serde_json::Map<String, Value>) -> Result<Self> {
        let mut ffids = Vec::new();
        if let Some(ffid) = map.get("ffid").and_then(Value::as_u64) {
            ffids.push(ffid);
        }
        if let Some(Value::Array(items)) = map.get("args") {
            for item in items {
                let ffid = item.as_u64().ok_or_else(|| {
                    Error::ProtocolViolation(format!("free entry {} is not an ffid", item))
                })?;
                ffids.push(ffid);
            }
        }
        if ffids.is_empty() {
            return Err(Error::ProtocolViolation("free notification names no ffid".into()));
        }
        Ok(Self::Destroy(ffids))
    }
}

/// An outbound reply to a remote-initiated invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub r: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub val: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Response {
    pub fn ok(r: u64, kind: Kind, val: Value) -> Self {
        Self { r, key: Some(kind.as_tag().to_string()), val: Some(val), error: None }
    }

    pub fn err(r: u64, failure: &RemoteFailure) -> Self {
        Self { r, key: None, val: None, error: Some(failure.to_payload()) }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
