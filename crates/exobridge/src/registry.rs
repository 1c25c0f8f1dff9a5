//! # Response Registry
//!
//! Correlates replies with the callers waiting for them.
//!
//! Any number of caller tasks register correlation ids and wait; the event
//! loop is the only task that fulfills them. A reply is handed over exactly
//! once. For ids registered with [`ResponseRegistry::register_held`] the loop
//! then holds off on the next frame until the caller lets go of the
//! [`Delivered`] reply, which lets a caller finish bookkeeping (adopting
//! FFIDs) before any later frame can depend on it. Every other reply is
//! handed over without holding the loop, so a caller that is not polling its
//! waiter yet never stalls anyone else.
//!
//! ## Invariants
//!
//! - At most one pending entry per correlation id.
//! - A reply for an id that timed out is discarded, not an error.
//! - A reply for an id never registered (or already consumed) is a protocol violation.
//! - Abandoned ids stay bounded: once more than twice [`ABANDONED_WINDOW`]
//!   pile up, those further than the window behind the newest are forgotten.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::DashSet;
use dashmap::mapref::entry::Entry;
use exowire::Reply;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::error::Result;

/// How far behind the newest abandoned id an abandoned id is still
/// remembered. Late replies to older ids count as unknown.
pub const ABANDONED_WINDOW: u64 = 4096;

/// A reply handed to its caller. Dropping a held reply releases the event loop.
#[derive(Debug)]
pub struct Delivered {
    reply: Reply,
    _ack: Option<oneshot::Sender<()>>,
}

impl Delivered {
    pub fn reply(&self) -> &Reply {
        &self.reply
    }

    /// Takes the reply, releasing the event loop if it was held.
    pub fn into_reply(self) -> Reply {
        self.reply
    }
}

/// Outcome of [`ResponseRegistry::fulfill`].
#[derive(Debug)]
pub enum Delivery {
    /// Handed over; the loop may go on.
    Delivered,
    /// Handed over. Resolves once the caller released the reply.
    Held(oneshot::Receiver<()>),
    /// Nobody is waiting any more (the caller timed out or went away).
    Discarded,
}

/// A registered correlation id, consumed by [`ResponseRegistry::wait`].
#[derive(Debug)]
pub struct Waiter {
    id: u64,
    rx: oneshot::Receiver<Delivered>,
}

impl Waiter {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The timeout passed; the id is now abandoned.
    Elapsed,
    /// The registry was closed because the event loop stopped.
    Closed,
}

#[derive(Debug)]
struct Pending {
    tx: oneshot::Sender<Delivered>,
    hold: bool,
}

#[derive(Debug, Default)]
pub struct ResponseRegistry {
    pending: DashMap<u64, Pending>,
    abandoned: DashSet<u64>,
    closed: AtomicBool,
}

impl ResponseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id` before its request is sent.
    pub fn register(&self, id: u64) -> Result<Waiter> {
        self.insert(id, false)
    }

    /// Like [`register`](Self::register), but the loop waits for the caller
    /// to drop the [`Delivered`] reply before reading the next frame.
    pub fn register_held(&self, id: u64) -> Result<Waiter> {
        self.insert(id, true)
    }

    fn insert(&self, id: u64, hold: bool) -> Result<Waiter> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::LoopStopped);
        }

        let (tx, rx) = oneshot::channel();
        match self.pending.entry(id) {
            Entry::Occupied(_) => {
                return Err(Error::ProtocolViolation(format!(
                    "correlation id {} is already pending", id
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(Pending { tx, hold });
            }
        }

        // close() may have drained the map between the check and the insert
        if self.closed.load(Ordering::Acquire) {
            self.pending.remove(&id);
            return Err(Error::LoopStopped);
        }
        Ok(Waiter { id, rx })
    }

    /// Hands `reply` to whoever registered its correlation id.
    pub fn fulfill(&self, reply: Reply) -> Result<Delivery> {
        let id = reply.r;
        if let Some((_, Pending { tx, hold })) = self.pending.remove(&id) {
            if !hold {
                return match tx.send(Delivered { reply, _ack: None }) {
                    Ok(()) => Ok(Delivery::Delivered),
                    Err(_) => Ok(Delivery::Discarded),
                };
            }
            let (ack_tx, ack_rx) = oneshot::channel();
            return match tx.send(Delivered { reply, _ack: Some(ack_tx) }) {
                Ok(()) => Ok(Delivery::Held(ack_rx)),
                Err(_) => Ok(Delivery::Discarded),
            };
        }

        if self.abandoned.remove(&id).is_some() {
            return Ok(Delivery::Discarded);
        }

        Err(Error::ProtocolViolation(format!(
            "reply for unknown or already consumed correlation id {}", id
        )))
    }

    /// Waits for the reply to `waiter`'s id.
    pub async fn wait(&self, waiter: Waiter, timeout: Duration) -> std::result::Result<Delivered, WaitError> {
        let Waiter { id, rx } = waiter;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(delivered)) => Ok(delivered),
            Ok(Err(_)) => Err(WaitError::Closed),
            Err(_) => {
                self.abandon(id);
                Err(WaitError::Elapsed)
            }
        }
    }

    /// Gives up on `id`; a later reply to it is discarded quietly.
    pub fn abandon(&self, id: u64) {
        if self.pending.remove(&id).is_none() {
            return;
        }
        self.abandoned.insert(id);
        if self.abandoned.len() as u64 > 2 * ABANDONED_WINDOW {
            let floor = id.saturating_sub(ABANDONED_WINDOW);
            self.abandoned.retain(|old| *old >= floor);
        }
    }

    /// Forgets `id` whose request never left this side.
    pub fn cancel(&self, id: u64) {
        self.pending.remove(&id);
    }

    /// Fails every waiter and refuses new registrations.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending.clear();
        self.abandoned.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn abandoned_count(&self) -> usize {
        self.abandoned.len()
    }
}
