//! # Bridge
//!
//! The entry point: one [`Bridge`] per connection to a remote runtime.
//!
//! ## Lifecycle
//!
//! [`Bridge::start`] spawns the event loop on the current tokio runtime.
//! The loop runs until [`Bridge::shutdown`] or until the transport closes.
//! Proxies keep the session alive and stay usable while the loop runs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use exowire::Ffid;
use exowire::ROOT_FFID;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::config::BridgeConfig;
use crate::error::Error;
use crate::error::Result;
use crate::event_loop;
use crate::executor::CallOptions;
use crate::proxy::Proxy;
use crate::session::Session;
use crate::transport::Transport;
use crate::value::LocalRef;
use crate::value::Value;

/// Options for [`Bridge::require_with`].
#[derive(Debug, Clone, Default)]
pub struct RequireOptions {
    /// Package version to load, when the remote side installs on demand.
    pub version: Option<String>,
    /// Directory relative module names are resolved against. Defaults to the
    /// current working directory.
    pub base_dir: Option<PathBuf>,
}

pub struct Bridge {
    session: Arc<Session>,
    event_loop: JoinHandle<()>,
}

impl Bridge {
    /// Starts the event loop over `transport`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(transport: impl Transport, config: BridgeConfig) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let (session, control) = Session::new(transport, config);
        let event_loop = event_loop::spawn(session.clone(), control);
        debug!(debug = session.config.debug, "bridge started");
        Self { session, event_loop }
    }

    /// Starts the bridge and, unless the config decides it, asks the remote
    /// runtime whether event handlers need the legacy emitter shims.
    pub async fn connect(transport: impl Transport, config: BridgeConfig) -> Result<Self> {
        let bridge = Self::start(transport, config);
        if bridge.session.config.legacy_emitter_shims.is_none() {
            match bridge.probe_legacy_shims().await {
                Ok(needed) => bridge.session.set_legacy_shims(needed),
                Err(e) => {
                    bridge.shutdown().await;
                    return Err(e);
                }
            }
        }
        Ok(bridge)
    }

    async fn probe_legacy_shims(&self) -> Result<bool> {
        match self.global().get("needsNodePatches").await? {
            Value::Remote(probe) => Ok(probe.call(vec![]).await?.is_truthy()),
            _ => Ok(false),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The remote runtime's global object.
    pub fn global(&self) -> Proxy {
        Proxy::new(self.session.clone(), ROOT_FFID)
    }

    pub async fn require(&self, name: &str) -> Result<Value> {
        self.require_with(name, RequireOptions::default()).await
    }

    /// Loads a module through the remote global `require`.
    pub async fn require_with(&self, name: &str, options: RequireOptions) -> Result<Value> {
        let calling_dir = if name.starts_with('.') {
            let dir = match options.base_dir {
                Some(dir) => dir,
                None => std::env::current_dir().map_err(|e| {
                    Error::InvalidArgument(format!("cannot resolve '{}' without a base directory: {}", name, e))
                })?,
            };
            Value::from(dir.to_string_lossy().into_owned())
        } else {
            Value::null()
        };
        let version = options.version.map_or_else(Value::null, Value::from);

        let require = self.remote_function("require").await?;
        let timeout = self.session.config.long_call_timeout;
        require
            .call_with(vec![Value::from(name), version, calling_dir], CallOptions::default().with_timeout(timeout))
            .await
    }

    /// Evaluates `code` remotely with `env` as its local variables.
    ///
    /// Numbers, booleans and null in `env` are copied; everything else is
    /// passed by reference, even objects the remote side already knows.
    pub async fn eval(&self, code: &str, env: BTreeMap<String, Value>) -> Result<Value> {
        let evaluate = self.remote_function("evaluateWithContext").await?;
        evaluate
            .call_with(vec![Value::from(code), Value::Map(env)], CallOptions::default().with_force_refs())
            .await
    }

    /// Waits for `emitter` to emit `event` once and returns the emitted value.
    pub async fn once(&self, emitter: &Proxy, event: &str) -> Result<Value> {
        let once = self.remote_function("once").await?;
        let timeout = self.session.config.long_call_timeout;
        once.call_with(
            vec![Value::Remote(emitter.clone()), Value::from(event)],
            CallOptions::default().with_timeout(timeout),
        )
        .await
    }

    /// The local object the remote side knows as `ffid`.
    pub fn resolve(&self, ffid: Ffid) -> Result<LocalRef> {
        self.session.resolve(ffid)
    }

    /// Sends pending free requests now instead of on the next tick.
    pub async fn flush(&self) -> Result<()> {
        self.session.request_flush().await
    }

    pub fn is_alive(&self) -> bool {
        self.session.is_alive() && !self.event_loop.is_finished()
    }

    pub fn legacy_shims(&self) -> bool {
        self.session.legacy_shims()
    }

    /// Flushes pending frees and stops the event loop. Waiting callers fail
    /// with [`Error::LoopStopped`].
    pub async fn shutdown(self) {
        self.session.request_shutdown();
        if let Err(e) = self.event_loop.await {
            warn!(error = %e, "event loop ended abnormally");
        }
    }

    async fn remote_function(&self, name: &str) -> Result<Proxy> {
        match self.global().get(name).await? {
            Value::Remote(function) => Ok(function),
            _ => Err(Error::MissingAttribute(name.to_string())),
        }
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge").field("session", &self.session).finish()
    }
}
