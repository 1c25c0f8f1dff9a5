//! Shared setup for the bridge integration tests.

#![allow(dead_code)]

use std::time::Duration;

use serde_json::Value as Json;
use serde_json::json;

use exobridge::Bridge;
use exobridge::BridgeConfig;
use exobridge::mock_transport::FakeRemote;

/// Config with the free tick effectively off, so tests decide when frees go out.
pub fn config() -> BridgeConfig {
    BridgeConfig::default()
        .with_legacy_emitter_shims(false)
        .with_free_flush_interval(Duration::from_secs(3600))
}

pub fn start() -> (Bridge, FakeRemote) {
    start_with(config())
}

pub fn start_with(config: BridgeConfig) -> (Bridge, FakeRemote) {
    exobridge::logging::init(&config);
    let (transport, remote) = FakeRemote::pair();
    (Bridge::start(transport, config), remote)
}

/// Receives the next request and checks its action.
pub async fn expect(remote: &FakeRemote, action: &str) -> Json {
    let request = remote.recv().await.expect("Bridge sent nothing");
    assert_eq!(request["action"], json!(action), "unexpected request {}", request);
    request
}

pub fn r(request: &Json) -> u64 {
    request["r"].as_u64().expect("Request without correlation id")
}

/// Answers the next `get` request with `val` tagged `kind`.
pub async fn answer_get(remote: &FakeRemote, key: &str, kind: &str, val: Json) -> Json {
    let request = expect(remote, "get").await;
    assert_eq!(request["key"], json!(key));
    remote.reply(r(&request), kind, val).await.expect("Reply failed");
    request
}
