//! # Call Executor
//!
//! Turns proxy operations into requests and replies into `(kind, value)`
//! pairs.
//!
//! ## Request shapes
//!
//! - **ipc** (`get`, `inspect`, `serialize`, `blob`, `keys`): one request,
//!   one reply.
//! - **pcall** (`call`, `init`, `set`): arguments may hold objects the
//!   remote side has never seen. Each one gets a provisional tag and the
//!   remote side answers twice, on `r + 1` with the FFIDs it minted for the
//!   tags and on `r` with the result, in either order. Adoption is recorded
//!   before the result is looked at, so the call may already call back into
//!   an adopted object.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use exowire::Action;
use exowire::Ffid;
use exowire::Key;
use exowire::Kind;
use exowire::Reply;
use exowire::Request;
use serde_json::Value as Json;
use tracing::debug;
use tracing::warn;

use crate::error::Error;
use crate::error::Result;
use crate::proxy::Proxy;
use crate::registry::Delivered;
use crate::registry::WaitError;
use crate::registry::Waiter;
use crate::session::Session;
use crate::value::LocalRef;
use crate::value::Value;

/// How `inspect` should render the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectMode {
    /// Plain string conversion.
    Str,
    /// Detailed, debug-style representation.
    Repr,
}

impl InspectMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Str => "str",
            Self::Repr => "repr",
        }
    }
}

/// Options for one call.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Overrides [`crate::BridgeConfig::call_timeout`].
    pub timeout: Option<Duration>,
    /// Treat top-level map arguments as captured environments: only numbers,
    /// booleans and null are inlined, everything else is adopted.
    pub force_refs: bool,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_force_refs(mut self) -> Self {
        self.force_refs = true;
        self
    }
}

/// Serializes arguments, collecting the objects that need adoption.
struct ArgEncoder {
    force_refs: bool,
    wanted: BTreeMap<u64, LocalRef>,
    next_tag: u64,
}

impl ArgEncoder {
    fn new(force_refs: bool) -> Self {
        Self { force_refs, wanted: BTreeMap::new(), next_tag: 0 }
    }

    fn argument(&mut self, value: &Value) -> Json {
        match value {
            Value::Map(env) if self.force_refs => self.environment(env),
            other => self.encode(other),
        }
    }

    fn environment(&mut self, env: &BTreeMap<String, Value>) -> Json {
        let captured = env
            .iter()
            .map(|(name, value)| {
                let encoded = match value {
                    Value::Void => Json::Null,
                    Value::Json(json @ (Json::Null | Json::Bool(_) | Json::Number(_))) => json.clone(),
                    // no shortcut for values that already have an ffid
                    other => self.adopt(LocalRef::from_value(other.clone())),
                };
                (name.clone(), encoded)
            })
            .collect();
        Json::Object(captured)
    }

    fn encode(&mut self, value: &Value) -> Json {
        match value {
            Value::Void => Json::Null,
            Value::Json(json) => json.clone(),
            Value::List(items) => Json::Array(items.iter().map(|item| self.encode(item)).collect()),
            Value::Map(entries) => Json::Object(
                entries.iter().map(|(name, item)| (name.clone(), self.encode(item))).collect(),
            ),
            Value::Remote(proxy) => exowire::reference(proxy.ffid()),
            Value::Local(local) => match (local.is_pinned(), local.ffid()) {
                (true, Some(ffid)) => exowire::reference(ffid),
                _ => self.adopt(local.clone()),
            },
        }
    }

    fn adopt(&mut self, local: LocalRef) -> Json {
        self.next_tag += 1;
        self.wanted.insert(self.next_tag, local);
        exowire::adoption_request(self.next_tag)
    }
}

impl Session {
    pub(crate) async fn send_request(&self, request: &Request) -> Result<()> {
        let bytes = request.encode()?;
        if self.config.debug {
            debug!(frame = %String::from_utf8_lossy(&bytes), "-> send");
        }
        self.transport.send(&bytes).await?;
        Ok(())
    }

    async fn wait_for(&self, waiter: Waiter, request: &Request, timeout: Duration) -> Result<Delivered> {
        match self.registry.wait(waiter, timeout).await {
            Ok(delivered) => Ok(delivered),
            Err(WaitError::Closed) => Err(Error::LoopStopped),
            Err(WaitError::Elapsed) => {
                let key = request.key.as_ref().map(Key::to_string).unwrap_or_default();
                let loop_stopped = !self.is_alive();
                warn!(
                    action = %request.action,
                    ffid = request.ffid,
                    key = %key,
                    ?timeout,
                    loop_stopped,
                    "request timed out"
                );
                Err(Error::Timeout { action: request.action, ffid: request.ffid, key, after: timeout, loop_stopped })
            }
        }
    }

    /// One request, one reply.
    pub(crate) async fn ipc(&self, action: Action, ffid: Ffid, key: Option<Key>) -> Result<Reply> {
        let mut request = Request::new(self.next_ids(1), action, ffid);
        if let Some(key) = key {
            request = request.with_key(key);
        }

        let waiter = self.registry.register(request.r)?;
        if let Err(e) = self.send_request(&request).await {
            self.registry.cancel(request.r);
            return Err(e);
        }

        let reply = self.wait_for(waiter, &request, self.config.ipc_timeout).await?.into_reply();
        match reply.failure() {
            Some(failure) => Err(Error::Remote { key: describe_key(&request), failure }),
            None => Ok(reply),
        }
    }

    /// The two-phase call used for `call`, `init` and `set`.
    pub(crate) async fn pcall(
        &self,
        ffid: Ffid,
        action: Action,
        key: Key,
        args: &[Value],
        options: CallOptions,
    ) -> Result<(Kind, Json)> {
        let mut encoder = ArgEncoder::new(options.force_refs);
        let wire_args = args.iter().map(|arg| encoder.argument(arg)).collect();
        let adoptions = encoder.wanted.len() as u64;

        let call_id = self.next_ids(2);
        let assign_id = call_id + 1;
        let request = Request::new(call_id, action, ffid)
            .with_key(key)
            .with_args(wire_args)
            .with_pending(adoptions);
        let timeout = options.timeout.unwrap_or(self.config.call_timeout);

        let call_waiter = self.registry.register(call_id)?;
        let assign_waiter = if adoptions > 0 {
            match self.registry.register_held(assign_id) {
                Ok(waiter) => Some(waiter),
                Err(e) => {
                    self.registry.cancel(call_id);
                    return Err(e);
                }
            }
        } else {
            None
        };

        if let Err(e) = self.send_request(&request).await {
            self.registry.cancel(call_id);
            self.registry.cancel(assign_id);
            return Err(e);
        }

        if let Some(waiter) = assign_waiter {
            if let Err(e) = self.adopt_assigned(waiter, &request, timeout, encoder.wanted).await {
                self.registry.abandon(call_id);
                return Err(e);
            }
        }

        let reply = self.wait_for(call_waiter, &request, timeout).await?.into_reply();
        if let Some(failure) = reply.failure() {
            return Err(Error::Remote { key: describe_key(&request), failure });
        }
        Ok((reply.kind(), reply.val))
    }

    async fn adopt_assigned(
        &self,
        waiter: Waiter,
        request: &Request,
        timeout: Duration,
        mut wanted: BTreeMap<u64, LocalRef>,
    ) -> Result<()> {
        // holding `delivered` keeps the loop from reading on until adoption is recorded
        let delivered = self.wait_for(waiter, request, timeout).await?;
        let reply = delivered.reply();
        if let Some(failure) = reply.failure() {
            return Err(Error::Remote { key: describe_key(request), failure });
        }

        for (tag, ffid) in reply.assignments()? {
            match wanted.remove(&tag) {
                Some(local) => self.refs.adopt(ffid, local),
                None => warn!(tag, ffid, r = request.r, "ffid assigned to a tag that was never requested"),
            }
        }
        if !wanted.is_empty() {
            let missing: Vec<u64> = wanted.keys().copied().collect();
            warn!(?missing, r = request.r, "remote side left adoption requests unanswered");
        }
        drop(delivered);
        Ok(())
    }

    pub(crate) async fn get_prop(&self, ffid: Ffid, key: Key) -> Result<(Kind, Json)> {
        let reply = self.ipc(Action::Get, ffid, Some(key)).await?;
        Ok((reply.kind(), reply.val))
    }

    pub(crate) async fn set_prop(&self, ffid: Ffid, key: Key, value: Value) -> Result<()> {
        self.pcall(ffid, Action::Set, key, &[value], CallOptions::default()).await?;
        Ok(())
    }

    pub(crate) async fn call_prop(
        &self,
        ffid: Ffid,
        key: Key,
        args: &[Value],
        options: CallOptions,
    ) -> Result<(Kind, Json)> {
        self.pcall(ffid, Action::Call, key, args, options).await
    }

    pub(crate) async fn init_prop(
        &self,
        ffid: Ffid,
        key: Key,
        args: &[Value],
        options: CallOptions,
    ) -> Result<(Kind, Json)> {
        self.pcall(ffid, Action::Init, key, args, options).await
    }

    pub(crate) async fn inspect(&self, ffid: Ffid, mode: InspectMode) -> Result<String> {
        let reply = self.ipc(Action::Inspect, ffid, Some(Key::from(mode.as_str()))).await?;
        Ok(match reply.val {
            Json::String(text) => text,
            other => other.to_string(),
        })
    }

    pub(crate) async fn keys(&self, ffid: Ffid) -> Result<Vec<Json>> {
        Ok(self.ipc(Action::Keys, ffid, None).await?.key_list()?)
    }

    pub(crate) async fn serialize(&self, ffid: Ffid) -> Result<Json> {
        Ok(self.ipc(Action::Serialize, ffid, None).await?.serialized()?)
    }

    pub(crate) async fn blob(&self, ffid: Ffid) -> Result<Vec<u8>> {
        Ok(self.ipc(Action::Blob, ffid, None).await?.blob_bytes()?)
    }

    /// Queues `ffid` for the next batched free request.
    pub(crate) fn free(&self, ffid: Ffid) {
        self.frees.push(ffid);
    }

    pub fn resolve(&self, ffid: Ffid) -> Result<LocalRef> {
        self.refs.resolve(ffid)
    }

    /// Turns inbound JSON into a value, wrapping `{"ffid": n}` as proxies.
    pub(crate) fn lift(self: &Arc<Self>, json: Json) -> Value {
        if let Some(ffid) = exowire::as_reference(&json) {
            return Value::Remote(Proxy::new(self.clone(), ffid));
        }
        match json {
            Json::Array(items) => Value::List(items.into_iter().map(|item| self.lift(item)).collect()),
            Json::Object(map) => Value::Map(map.into_iter().map(|(name, item)| (name, self.lift(item))).collect()),
            other => Value::Json(other),
        }
    }
}

/// Turns a local result into JSON for a reply to the remote side.
pub(crate) fn outbound(value: &Value) -> Result<Json> {
    match value {
        Value::Void => Ok(Json::Null),
        Value::Json(json) => Ok(json.clone()),
        Value::List(items) => items.iter().map(outbound).collect::<Result<Vec<_>>>().map(Json::Array),
        Value::Map(entries) => entries
            .iter()
            .map(|(name, item)| Ok((name.clone(), outbound(item)?)))
            .collect::<Result<serde_json::Map<_, _>>>()
            .map(Json::Object),
        Value::Remote(proxy) => Ok(exowire::reference(proxy.ffid())),
        Value::Local(local) => match local.ffid() {
            Some(ffid) => Ok(exowire::reference(ffid)),
            None => Err(Error::Unadopted(local.describe())),
        },
    }
}

fn describe_key(request: &Request) -> String {
    match &request.key {
        Some(key) if !key.to_string().is_empty() => key.to_string(),
        _ => request.action.to_string(),
    }
}
