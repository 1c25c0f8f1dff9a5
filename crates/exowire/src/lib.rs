//! # ExoWire
//!
//! The wire format spoken between the local bridge and a remote runtime.
//!
//! ## Architecture
//!
//! Frames are JSON records, one per line. The local side sends [`Request`]s
//! tagged with a correlation id `r` and receives [`Reply`]s carrying the same
//! id. The remote side may also initiate frames of its own: [`Invoke`]s
//! against objects the local side owns, and destroy notifications.
//! [`Frame::decode`] tells the three apart.
//!
//! Object identity crosses the boundary as an FFID ([`Ffid`]). Arguments are
//! plain JSON, with two reserved shapes:
//!
//! - `{"ffid": n}` references an object the receiver already knows,
//! - `{"r": tag, "ffid": ""}` asks the remote side to mint an FFID for an
//!   object the local side is passing out (adoption).

pub mod error;
pub mod frame;
pub mod kind;


pub use error::Error;
pub use error::RemoteFailure;
pub use error::Result;
pub use frame::Action;
pub use frame::Ffid;
pub use frame::Frame;
pub use frame::Invoke;
pub use frame::InvokeAction;
pub use frame::Key;
pub use frame::Reply;
pub use frame::Request;
pub use frame::Response;
pub use frame::ROOT_FFID;
pub use kind::Kind;

use serde_json::Value;

/// Builds the argument shape referencing a known object.
pub fn reference(ffid: Ffid) -> Value {
    serde_json::json!({ "ffid": ffid })
}

/// Builds the argument shape requesting adoption of the object tagged `tag`.
pub fn adoption_request(tag: u64) -> Value {
    serde_json::json!({ "r": tag, "ffid": "" })
}

/// Recognizes the `{"ffid": n}` reference shape.
pub fn as_reference(value: &Value) -> Option<Ffid> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    map.get("ffid")?.as_u64()
}
