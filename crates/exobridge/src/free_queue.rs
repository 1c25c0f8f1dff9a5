//! Pending-free queue.
//!
//! Dropped proxies push their FFID from whatever thread they die on; only
//! the event loop drains. Draining coalesces duplicates, so an FFID queued
//! twice goes out once.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::PoisonError;

use exowire::Ffid;
use tokio::sync::mpsc;

pub struct FreeQueue {
    tx: mpsc::UnboundedSender<Ffid>,
    rx: Mutex<mpsc::UnboundedReceiver<Ffid>>,
}

impl Default for FreeQueue {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Mutex::new(rx) }
    }
}

impl FreeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never blocks and never does I/O; safe to call from `Drop`.
    pub fn push(&self, ffid: Ffid) {
        // the receiver lives as long as self
        let _ = self.tx.send(ffid);
    }

    pub fn drain(&self) -> BTreeSet<Ffid> {
        let mut rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ffids = BTreeSet::new();
        while let Ok(ffid) = rx.try_recv() {
            ffids.insert(ffid);
        }
        ffids
    }
}
