//! Errors surfaced to callers of the bridge.

use std::time::Duration;

use exowire::Action;
use exowire::Ffid;
use exowire::RemoteFailure;

use crate::transport;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No reply arrived in time. The request may still be answered later; that
    /// late reply is discarded.
    #[error("{}", timeout_message(.action, .ffid, .key, .after, .loop_stopped))]
    Timeout {
        action: Action,
        ffid: Ffid,
        key: String,
        after: Duration,
        loop_stopped: bool,
    },

    /// The remote side answered with an error.
    #[error("remote error accessing '{key}': {failure}")]
    Remote { key: String, failure: RemoteFailure },

    /// An FFID that should be registered locally is not.
    #[error("unknown reference: ffid {0} is not registered on this side")]
    UnknownReference(Ffid),

    /// A frame broke the protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The event loop is gone; nothing can be delivered any more.
    #[error("the bridge event loop has stopped; restart the bridge to keep using remote objects")]
    LoopStopped,

    /// A local object was invoked but cannot be called.
    #[error("{0} is not callable")]
    NotCallable(String),

    /// A local object has no such attribute.
    #[error("no attribute '{0}'")]
    MissingAttribute(String),

    /// A local object without an FFID cannot be returned to the remote side.
    #[error("{0} was never adopted by the remote side and cannot be returned to it")]
    Unadopted(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Wire(#[from] exowire::Error),

    #[error(transparent)]
    Transport(#[from] transport::Error),
}

fn timeout_message(action: &Action, ffid: &Ffid, key: &str, after: &Duration, loop_stopped: &bool) -> String {
    let mut message = format!(
        "timed out after {:?} accessing '{}' ({} on ffid {})",
        after, key, action, ffid
    );
    if *loop_stopped {
        message.push_str("; the event loop is not running, the remote process has likely crashed");
    }
    message
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The failure reported back to the remote side when a local invocation fails.
    pub(crate) fn to_failure(&self) -> RemoteFailure {
        let type_name = match self {
            Self::NotCallable(_) => "TypeError",
            Self::MissingAttribute(_) => "ReferenceError",
            Self::UnknownReference(_) => "UnknownReference",
            _ => "LocalError",
        };
        RemoteFailure::new(self.to_string()).with_type(type_name)
    }
}
