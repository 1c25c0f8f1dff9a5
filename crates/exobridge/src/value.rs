//! # Values Crossing the Boundary
//!
//! [`Value`] is what proxy operations accept and return. Plain data travels
//! inline as JSON; remote objects are [`Proxy`] handles; objects owned by
//! this side are [`LocalRef`]s, which the remote side reaches through FFIDs
//! it mints on adoption.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use exowire::Ffid;
use exowire::Key;
use exowire::ROOT_FFID;
use futures::future::BoxFuture;

use crate::error::Error;
use crate::error::Result;
use crate::proxy::Proxy;

#[derive(Debug, Clone)]
pub enum Value {
    /// Nothing was produced.
    Void,
    Json(serde_json::Value),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Remote(Proxy),
    Local(LocalRef),
}

impl Value {
    pub fn null() -> Self {
        Self::Json(serde_json::Value::Null)
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Self::Void)
    }

    /// Void or JSON null.
    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Void | Self::Json(serde_json::Value::Null))
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(json) => Some(json),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_json().and_then(serde_json::Value::as_str)
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_json().and_then(serde_json::Value::as_i64)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_json().and_then(serde_json::Value::as_f64)
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_json().and_then(serde_json::Value::as_bool)
    }

    pub fn as_proxy(&self) -> Option<&Proxy> {
        match self {
            Self::Remote(proxy) => Some(proxy),
            _ => None,
        }
    }

    /// The proxy, or `InvalidArgument` naming what was found instead.
    pub fn into_proxy(self) -> Result<Proxy> {
        match self {
            Self::Remote(proxy) => Ok(proxy),
            other => Err(Error::InvalidArgument(format!("expected a remote object, got {}", other.describe()))),
        }
    }

    pub fn as_local(&self) -> Option<&LocalRef> {
        match self {
            Self::Local(local) => Some(local),
            _ => None,
        }
    }

    /// A short human readable rendering, used in diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Self::Void => "void".into(),
            Self::Json(json) => json.to_string(),
            Self::List(items) => format!("[list of {}]", items.len()),
            Self::Map(entries) => format!("[map of {}]", entries.len()),
            Self::Remote(proxy) => format!("[remote ffid {}]", proxy.ffid()),
            Self::Local(local) => local.describe(),
        }
    }

    /// Truthiness the way the remote side sees it.
    pub(crate) fn is_truthy(&self) -> bool {
        use serde_json::Value as Json;
        match self {
            Self::Void | Self::Json(Json::Null) | Self::Json(Json::Bool(false)) => false,
            Self::Json(Json::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Self::Json(Json::String(s)) => !s.is_empty(),
            _ => true,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Self::Json(json)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Json(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Json(s.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Json(n.into())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Json(n.into())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Json(b.into())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Self::Map(entries)
    }
}

impl From<Proxy> for Value {
    fn from(proxy: Proxy) -> Self {
        Self::Remote(proxy)
    }
}

impl From<LocalRef> for Value {
    fn from(local: LocalRef) -> Self {
        Self::Local(local)
    }
}

/// An object owned by this side that the remote side may call into.
///
/// Invocations run on their own task, so implementations may await proxy
/// operations without stalling the event loop.
#[async_trait]
pub trait LocalObject: Send + Sync + 'static {
    fn is_callable(&self) -> bool {
        false
    }

    async fn call(&self, _args: Vec<Value>) -> Result<Value> {
        Err(Error::NotCallable(self.describe()))
    }

    async fn get(&self, key: &Key) -> Result<Value> {
        Err(Error::MissingAttribute(key.to_string()))
    }

    fn describe(&self) -> String {
        "[local object]".into()
    }
}

type LocalFn = Box<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

struct FnObject {
    name: String,
    f: LocalFn,
}

#[async_trait]
impl LocalObject for FnObject {
    fn is_callable(&self) -> bool {
        true
    }

    async fn call(&self, args: Vec<Value>) -> Result<Value> {
        (self.f)(args).await
    }

    fn describe(&self) -> String {
        format!("[local function {}]", self.name)
    }
}

/// Plain data exposed by reference, as captured environments are.
struct ValueObject {
    value: Value,
}

#[async_trait]
impl LocalObject for ValueObject {
    async fn get(&self, key: &Key) -> Result<Value> {
        let found = match (&self.value, key) {
            (Value::Map(entries), Key::Name(name)) => entries.get(name).cloned(),
            (Value::List(items), Key::Index(i)) => usize::try_from(*i).ok().and_then(|i| items.get(i)).cloned(),
            (Value::Json(json), Key::Name(name)) => json.get(name).cloned().map(Value::Json),
            (Value::Json(json), Key::Index(i)) => {
                usize::try_from(*i).ok().and_then(|i| json.get(i)).cloned().map(Value::Json)
            }
            _ => None,
        };
        found.ok_or_else(|| Error::MissingAttribute(key.to_string()))
    }

    fn describe(&self) -> String {
        self.value.describe()
    }
}

struct LocalInner {
    object: Box<dyn LocalObject>,
    // 0 = not yet assigned; ROOT_FFID names the remote global and is never minted for us
    ffid: AtomicU64,
    pinned: AtomicBool,
}

/// Shared handle to a [`LocalObject`].
///
/// Clones are the same object: adopting one adopts all of them, and
/// [`LocalRef::ptr_eq`] is the identity the event helpers rely on.
#[derive(Clone)]
pub struct LocalRef(Arc<LocalInner>);

impl LocalRef {
    pub fn new(object: impl LocalObject) -> Self {
        Self(Arc::new(LocalInner {
            object: Box::new(object),
            ffid: AtomicU64::new(ROOT_FFID),
            pinned: AtomicBool::new(false),
        }))
    }

    /// A callable backed by an async closure.
    pub fn function<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::new(FnObject {
            name: name.into(),
            f: Box::new(move |args| -> BoxFuture<'static, Result<Value>> { Box::pin(f(args)) }),
        })
    }

    /// Exposes `value` by reference. A local value is returned as itself.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Local(local) => local,
            value => Self::new(ValueObject { value }),
        }
    }

    /// The FFID the remote side assigned when this callable was last adopted.
    pub fn ffid(&self) -> Option<Ffid> {
        match self.0.ffid.load(Ordering::Acquire) {
            ROOT_FFID => None,
            ffid => Some(ffid),
        }
    }

    pub(crate) fn assign(&self, ffid: Ffid) {
        self.0.ffid.store(ffid, Ordering::Release);
    }

    /// Makes later calls pass the assigned FFID instead of asking for a new one.
    pub fn pin(&self) {
        self.0.pinned.store(true, Ordering::Release);
    }

    pub fn is_pinned(&self) -> bool {
        self.0.pinned.load(Ordering::Acquire)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn is_callable(&self) -> bool {
        self.0.object.is_callable()
    }

    pub fn describe(&self) -> String {
        self.0.object.describe()
    }

    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        self.0.object.call(args).await
    }

    pub async fn get(&self, key: &Key) -> Result<Value> {
        self.0.object.get(key).await
    }
}

impl std::fmt::Debug for LocalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRef")
            .field("object", &self.describe())
            .field("ffid", &self.ffid())
            .field("pinned", &self.is_pinned())
            .finish()
    }
}
