//! # Bridge Session
//!
//! Everything one connection owns: the transport, the response registry,
//! the reference table, the pending-free queue and the callback table.
//!
//! ## Invariants
//!
//! - Exactly one event loop runs per session.
//! - Correlation ids come from one counter and are never reused.
//! - Every [`crate::Proxy`] holds an `Arc<Session>`; nothing is global.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use exowire::Ffid;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::config::BridgeConfig;
use crate::error::Error;
use crate::error::Result;
use crate::event_loop::Control;
use crate::free_queue::FreeQueue;
use crate::reftable::RefTable;
use crate::registry::ResponseRegistry;
use crate::transport::Transport;
use crate::value::LocalRef;

/// A handler registered through [`crate::events`].
#[derive(Debug, Clone)]
pub(crate) struct Callback {
    /// What the caller passed in.
    pub handler: LocalRef,
    /// What the remote side holds; a shim around `handler` or `handler` itself.
    pub registered: LocalRef,
}

pub struct Session {
    pub(crate) config: BridgeConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) registry: ResponseRegistry,
    pub(crate) refs: RefTable,
    pub(crate) frees: FreeQueue,
    /// Keyed by the pinned FFID and the event name.
    pub(crate) callbacks: DashMap<(Ffid, String), Callback>,
    control: mpsc::UnboundedSender<Control>,
    seq: AtomicU64,
    alive: AtomicBool,
    legacy_shims: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        config: BridgeConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Control>) {
        let (control, control_rx) = mpsc::unbounded_channel();
        let legacy_shims = config.legacy_emitter_shims.unwrap_or(false);
        let session = Arc::new(Self {
            config,
            transport,
            registry: ResponseRegistry::new(),
            refs: RefTable::new(),
            frees: FreeQueue::new(),
            callbacks: DashMap::new(),
            control,
            seq: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            legacy_shims: AtomicBool::new(legacy_shims),
        });
        (session, control_rx)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn refs(&self) -> &RefTable {
        &self.refs
    }

    pub fn registry(&self) -> &ResponseRegistry {
        &self.registry
    }

    /// Reserves `count` consecutive correlation ids and returns the first.
    pub(crate) fn next_ids(&self, count: u64) -> u64 {
        self.seq.fetch_add(count, Ordering::Relaxed)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Called by the event loop on its way out. Nothing can invoke local
    /// objects any more, so they are dropped along with the handlers that
    /// hold proxies (and through them this session).
    pub(crate) fn mark_stopped(&self) {
        self.alive.store(false, Ordering::Release);
        self.registry.close();
        self.callbacks.clear();
        self.refs.clear_local();
    }

    pub fn legacy_shims(&self) -> bool {
        self.legacy_shims.load(Ordering::Acquire)
    }

    pub(crate) fn set_legacy_shims(&self, enabled: bool) {
        self.legacy_shims.store(enabled, Ordering::Release);
    }

    /// Asks the event loop to send pending frees now; resolves once sent.
    pub(crate) async fn request_flush(&self) -> Result<()> {
        let (done, flushed) = oneshot::channel();
        self.control.send(Control::Flush(done)).map_err(|_| Error::LoopStopped)?;
        flushed.await.map_err(|_| Error::LoopStopped)
    }

    pub(crate) fn request_shutdown(&self) {
        // a stopped loop has nothing left to shut down
        let _ = self.control.send(Control::Shutdown);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("alive", &self.is_alive())
            .field("pending", &self.registry.pending_count())
            .field("local_refs", &self.refs.local_count())
            .finish()
    }
}
