//! # Remote Object Proxies
//!
//! A [`Proxy`] is a lazy handle to one remote object. It owns nothing but
//! the FFID: every read, write, call and iteration is a round trip through
//! the session's executor.
//!
//! ## Call targets
//!
//! A function read off an object remembers where it came from. Calling it
//! issues `call` against the parent's FFID and the attribute name, so the
//! remote side invokes it with the original receiver. Unbound proxies call
//! their own FFID with an empty key.
//!
//! ## Lifetime
//!
//! Clones share one handle. When the last proxy for an FFID drops, the FFID
//! is queued for a batched free request; dropping never does I/O.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use exowire::Ffid;
use exowire::Key;
use exowire::Kind;
use exowire::ROOT_FFID;
use futures::Stream;
use serde_json::Value as Json;

use crate::error::Error;
use crate::error::Result;
use crate::executor::CallOptions;
use crate::executor::InspectMode;
use crate::session::Session;
use crate::value::Value;

/// Attribute names kept on the proxy itself and never forwarded.
pub const RESERVED_ATTRS: &[&str] = &["ffid", "_target_ffid", "_target_name", "_es6"];

/// The key that yields a constructor for the current call target.
const CONSTRUCT_KEY: &str = "new";

struct ProxyInner {
    session: Arc<Session>,
    ffid: Ffid,
    /// Receiver of a method read off an object.
    parent: Option<Proxy>,
    target_name: Key,
    es6: bool,
    annotations: Mutex<BTreeMap<String, Value>>,
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        if self.session.refs.release_remote(self.ffid) && self.ffid != ROOT_FFID {
            self.session.free(self.ffid);
        }
    }
}

#[derive(Clone)]
pub struct Proxy(Arc<ProxyInner>);

impl Proxy {
    pub(crate) fn new(session: Arc<Session>, ffid: Ffid) -> Self {
        Self::build(session, ffid, None, Key::empty(), false)
    }

    fn build(session: Arc<Session>, ffid: Ffid, parent: Option<Proxy>, target_name: Key, es6: bool) -> Self {
        session.refs.retain_remote(ffid);
        Self(Arc::new(ProxyInner {
            session,
            ffid,
            parent,
            target_name,
            es6,
            annotations: Mutex::new(BTreeMap::new()),
        }))
    }

    pub fn ffid(&self) -> Ffid {
        self.0.ffid
    }

    /// The FFID calls are issued against.
    pub fn target_ffid(&self) -> Ffid {
        self.0.parent.as_ref().map_or(self.0.ffid, Proxy::ffid)
    }

    pub fn target_name(&self) -> &Key {
        &self.0.target_name
    }

    /// True for class references and for proxies obtained through `new`.
    pub fn is_constructor(&self) -> bool {
        self.0.es6
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.0.session
    }

    /// A proxy that issues `init` against this proxy's call target.
    pub fn constructor(&self) -> Proxy {
        Self::build(
            self.0.session.clone(),
            self.0.ffid,
            self.0.parent.clone(),
            self.0.target_name.clone(),
            true,
        )
    }

    /// Reads an attribute.
    pub async fn get(&self, key: impl Into<Key>) -> Result<Value> {
        let key = key.into();
        if let Some(name) = key.as_name() {
            if name == CONSTRUCT_KEY {
                return Ok(Value::Remote(self.constructor()));
            }
            if RESERVED_ATTRS.contains(&name) {
                return Ok(self.reserved(name));
            }
        }

        let (kind, val) = self.0.session.get_prop(self.0.ffid, key.clone()).await?;
        self.wrap(kind, val, Some(key))
    }

    pub async fn index(&self, index: u64) -> Result<Value> {
        self.get(Key::Index(index)).await
    }

    /// Writes an attribute. Objects in `value` are adopted by the remote side.
    pub async fn set(&self, name: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let name = name.into();
        let value = value.into();
        if RESERVED_ATTRS.contains(&name.as_str()) {
            self.annotations().insert(name, value);
            return Ok(());
        }
        self.0.session.set_prop(self.0.ffid, Key::Name(name), value).await
    }

    pub async fn set_index(&self, index: u64, value: impl Into<Value>) -> Result<()> {
        self.0.session.set_prop(self.0.ffid, Key::Index(index), value.into()).await
    }

    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        self.call_with(args, CallOptions::default()).await
    }

    /// Calls the proxy, or constructs through it if it is a constructor.
    pub async fn call_with(&self, args: Vec<Value>, options: CallOptions) -> Result<Value> {
        let session = &self.0.session;
        let target = self.target_ffid();
        let key = self.0.target_name.clone();
        let (kind, val) = if self.0.es6 {
            session.init_prop(target, key, &args, options).await?
        } else {
            session.call_prop(target, key, &args, options).await?
        };
        // functions returned by a call have no receiver to bind to
        self.wrap(kind, val, None)
    }

    /// `new target(...args)`.
    pub async fn construct(&self, args: Vec<Value>) -> Result<Value> {
        self.constructor().call(args).await
    }

    /// Starts a fresh forward pass over the object.
    ///
    /// Array-likes (numeric `length`) are walked by index, one round trip per
    /// element. Anything else costs one `keys` round trip and then yields that
    /// snapshot of keys.
    pub async fn iter(&self) -> Result<Cursor> {
        let length = self.get("length").await?;
        let state = match length.as_json().and_then(as_length) {
            Some(len) => CursorState::Indexed { next: 0, len },
            None => {
                let keys = self.0.session.keys(self.0.ffid).await?;
                CursorState::Keys(keys.into_iter())
            }
        };
        Ok(Cursor { proxy: self.clone(), state })
    }

    /// The remote side's JSON rendering of the object, parsed.
    pub async fn value_of(&self) -> Result<Json> {
        self.0.session.serialize(self.0.ffid).await
    }

    pub async fn blob(&self) -> Result<Vec<u8>> {
        self.0.session.blob(self.0.ffid).await
    }

    pub async fn inspect(&self, mode: InspectMode) -> Result<String> {
        self.0.session.inspect(self.0.ffid, mode).await
    }

    /// True when `key` reads as something other than null.
    ///
    /// An attribute that exists but holds null counts as absent.
    pub async fn contains(&self, key: impl Into<Key>) -> Result<bool> {
        Ok(!self.get(key).await?.is_nullish())
    }

    fn annotations(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        self.0.annotations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reserved(&self, name: &str) -> Value {
        if let Some(value) = self.annotations().get(name) {
            return value.clone();
        }
        match name {
            "ffid" => Value::from(Json::from(self.0.ffid)),
            "_target_ffid" => Value::from(Json::from(self.target_ffid())),
            "_target_name" => Value::from(self.0.target_name.to_string()),
            "_es6" => Value::from(self.0.es6),
            _ => Value::Void,
        }
    }

    /// Decodes a reply by kind. `bind` is the attribute a function was read from.
    fn wrap(&self, kind: Kind, val: Json, bind: Option<Key>) -> Result<Value> {
        let session = &self.0.session;
        let value = match &kind {
            Kind::Fn => {
                let ffid = reference_ffid(&kind, &val)?;
                let function = match bind {
                    Some(key) => Self::build(session.clone(), ffid, Some(self.clone()), key, false),
                    None => Self::new(session.clone(), ffid),
                };
                Value::Remote(function)
            }
            Kind::Class => Self::build(session.clone(), reference_ffid(&kind, &val)?, None, Key::empty(), true).into(),
            Kind::Obj | Kind::Inst => Self::new(session.clone(), reference_ffid(&kind, &val)?).into(),
            Kind::Void => Value::Void,
            Kind::Py => Value::Local(session.resolve(reference_ffid(&kind, &val)?)?),
            Kind::Value(_) => Value::Json(val),
        };
        Ok(value)
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("ffid", &self.0.ffid)
            .field("target_ffid", &self.target_ffid())
            .field("target_name", &self.0.target_name)
            .field("es6", &self.0.es6)
            .finish()
    }
}

fn reference_ffid(kind: &Kind, val: &Json) -> Result<Ffid> {
    val.as_u64()
        .ok_or_else(|| Error::ProtocolViolation(format!("'{}' reply carries {} instead of an ffid", kind, val)))
}

fn as_length(json: &Json) -> Option<u64> {
    json.as_u64()
        .or_else(|| json.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
}

enum CursorState {
    Indexed { next: u64, len: u64 },
    Keys(std::vec::IntoIter<Json>),
}

/// One forward pass over a remote object, from [`Proxy::iter`].
pub struct Cursor {
    proxy: Proxy,
    state: CursorState,
}

impl Cursor {
    pub async fn next(&mut self) -> Result<Option<Value>> {
        match &mut self.state {
            CursorState::Indexed { next, len } => {
                if *next >= *len {
                    return Ok(None);
                }
                let index = *next;
                *next += 1;
                self.proxy.index(index).await.map(Some)
            }
            CursorState::Keys(keys) => Ok(keys.next().map(Value::Json)),
        }
    }

    /// Elements left, where known without a round trip.
    pub fn remaining(&self) -> usize {
        match &self.state {
            CursorState::Indexed { next, len } => usize::try_from(len - next).unwrap_or(usize::MAX),
            CursorState::Keys(keys) => keys.len(),
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Value>> {
        futures::stream::try_unfold(self, |mut cursor| async move {
            let next = cursor.next().await?;
            Ok::<_, Error>(next.map(|value| (value, cursor)))
        })
    }

    pub async fn collect(mut self) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(self.remaining());
        while let Some(value) = self.next().await? {
            values.push(value);
        }
        Ok(values)
    }
}

/// The capabilities of a handle to a remote object.
#[async_trait]
pub trait RemoteHandle: Send + Sync {
    async fn get(&self, key: Key) -> Result<Value>;
    async fn set(&self, key: Key, value: Value) -> Result<()>;
    async fn invoke(&self, args: Vec<Value>) -> Result<Value>;
    async fn iterate(&self) -> Result<Vec<Value>>;
}

#[async_trait]
impl RemoteHandle for Proxy {
    async fn get(&self, key: Key) -> Result<Value> {
        Proxy::get(self, key).await
    }

    async fn set(&self, key: Key, value: Value) -> Result<()> {
        match key {
            Key::Name(name) => Proxy::set(self, name, value).await,
            Key::Index(index) => Proxy::set_index(self, index, value).await,
        }
    }

    async fn invoke(&self, args: Vec<Value>) -> Result<Value> {
        Proxy::call(self, args).await
    }

    async fn iterate(&self) -> Result<Vec<Value>> {
        Proxy::iter(self).await?.collect().await
    }
}
