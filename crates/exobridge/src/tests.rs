//! Tests for the session plumbing with a recording transport.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use exowire::Action;
use exowire::RemoteFailure;
use serde_json::Value as Json;
use serde_json::json;

use crate::config::BridgeConfig;
use crate::error::Error;
use crate::event_loop::flush_frees;
use crate::session::Session;
use crate::transport;
use crate::transport::Transport;

/// Mock transport that keeps every sent frame and never receives anything.
#[derive(Default)]
struct RecordingTransport {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        self.sent.lock().unwrap().push(payload.to_vec());
        Ok(())
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        std::future::pending().await
    }
}

fn session() -> (Arc<Session>, Arc<Mutex<Vec<Vec<u8>>>>) {
    let transport = RecordingTransport::default();
    let sent = transport.sent.clone();
    let (session, _control) = Session::new(Arc::new(transport), BridgeConfig::default());
    (session, sent)
}

fn frames(sent: &Mutex<Vec<Vec<u8>>>) -> Vec<Json> {
    sent.lock()
        .unwrap()
        .iter()
        .map(|bytes| serde_json::from_slice(bytes).unwrap())
        .collect()
}

#[test]
fn test_ids_are_reserved_in_blocks() {
    let (session, _) = session();
    assert_eq!(session.next_ids(1), 1);
    assert_eq!(session.next_ids(2), 2);
    assert_eq!(session.next_ids(1), 4);
}

#[tokio::test]
async fn test_flush_skips_root_and_live_handles() {
    let (session, sent) = session();
    session.refs.retain_remote(4);

    session.free(3);
    session.free(0);
    session.free(4);
    session.free(3);
    flush_frees(&session).await;

    assert_eq!(frames(&sent), vec![json!({ "r": 1, "action": "free", "ffid": 0, "args": [3] })]);
}

#[tokio::test]
async fn test_flush_with_nothing_queued_sends_nothing() {
    let (session, sent) = session();
    flush_frees(&session).await;
    assert!(frames(&sent).is_empty());
}

#[tokio::test]
async fn test_stopped_session_refuses_requests() {
    let (session, sent) = session();
    session.mark_stopped();

    assert!(!session.is_alive());
    assert!(matches!(session.get_prop(0, "x".into()).await, Err(Error::LoopStopped)));
    assert!(frames(&sent).is_empty());
}

#[test]
fn test_timeout_message_mentions_dead_loop() {
    let alive = Error::Timeout {
        action: Action::Get,
        ffid: 3,
        key: "name".into(),
        after: Duration::from_secs(10),
        loop_stopped: false,
    };
    let dead = Error::Timeout {
        action: Action::Call,
        ffid: 3,
        key: "run".into(),
        after: Duration::from_secs(10),
        loop_stopped: true,
    };

    let alive = alive.to_string();
    assert!(alive.contains("'name'"));
    assert!(alive.contains("get on ffid 3"));
    assert!(!alive.contains("crashed"));
    assert!(dead.to_string().contains("crashed"));
}

#[test]
fn test_remote_error_display() {
    let failure = RemoteFailure::from_payload(json!({ "message": "nope", "name": "RangeError" }));
    let error = Error::Remote { key: "slice".into(), failure };
    assert_eq!(error.to_string(), "remote error accessing 'slice': RangeError: nope");
}

#[test]
fn test_local_failures_map_to_remote_type_names() {
    assert_eq!(Error::NotCallable("x".into()).to_failure().type_name.as_deref(), Some("TypeError"));
    assert_eq!(Error::MissingAttribute("x".into()).to_failure().type_name.as_deref(), Some("ReferenceError"));
    assert_eq!(Error::UnknownReference(9).to_failure().type_name.as_deref(), Some("UnknownReference"));
    assert_eq!(Error::LoopStopped.to_failure().type_name.as_deref(), Some("LocalError"));
}
