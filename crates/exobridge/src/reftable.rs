//! # Reference Table
//!
//! The handle arena for both directions of the boundary:
//!
//! - **local**: objects this side owns, adopted under FFIDs the remote side
//!   minted. Entries live until the remote side sends a destroy notification.
//! - **remote**: how many live proxies hold each remote FFID. When the count
//!   drops to zero the FFID becomes eligible for a batched free request.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use exowire::Ffid;

use crate::error::Error;
use crate::error::Result;
use crate::value::LocalRef;

#[derive(Default)]
pub struct RefTable {
    local: DashMap<Ffid, LocalRef>,
    remote: DashMap<Ffid, usize>,
}

impl RefTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `value` under the FFID the remote side assigned to it.
    pub fn adopt(&self, ffid: Ffid, value: LocalRef) {
        if value.is_callable() {
            value.assign(ffid);
        }
        if let Some(previous) = self.local.insert(ffid, value) {
            tracing::warn!(ffid, replaced = %previous.describe(), "remote side reassigned an ffid");
        }
    }

    pub fn resolve(&self, ffid: Ffid) -> Result<LocalRef> {
        self.local
            .get(&ffid)
            .map(|entry| entry.value().clone())
            .ok_or(Error::UnknownReference(ffid))
    }

    /// Forgets a local object. Releasing an unknown FFID is a no-op.
    pub fn release(&self, ffid: Ffid) -> Option<LocalRef> {
        self.local.remove(&ffid).map(|(_, value)| value)
    }

    /// Forgets every local object.
    pub fn clear_local(&self) {
        self.local.clear();
    }

    pub fn local_count(&self) -> usize {
        self.local.len()
    }

    pub fn retain_remote(&self, ffid: Ffid) {
        *self.remote.entry(ffid).or_insert(0) += 1;
    }

    /// Returns true when the last local proxy for `ffid` went away.
    pub fn release_remote(&self, ffid: Ffid) -> bool {
        match self.remote.entry(ffid) {
            Entry::Occupied(mut entry) => {
                let remaining = entry.get().saturating_sub(1);
                if remaining == 0 {
                    entry.remove();
                    true
                } else {
                    *entry.get_mut() = remaining;
                    false
                }
            }
            Entry::Vacant(_) => false,
        }
    }

    pub fn remote_count(&self, ffid: Ffid) -> usize {
        self.remote.get(&ffid).map(|count| *count).unwrap_or(0)
    }
}
