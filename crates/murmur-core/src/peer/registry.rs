//! Peer registry: every peer this instance has learned of, keyed by id.
//!
//! Populated by discovery and the greet handshake, read by the transport
//! and by observers waiting on [`ChangeSignal`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use super::PeerRecord;

/// One-shot change notification handed out by [`PeerRegistry::changed`].
///
/// Fires exactly once, at the first qualifying change after it was
/// handed out, and stays fired. Waiters must call `changed()` again
/// after waking to observe later changes.
#[derive(Debug, Clone)]
pub struct ChangeSignal(CancellationToken);

impl ChangeSignal {
    /// Wait until this signal fires.
    pub async fn fired(&self) {
        self.0.cancelled().await
    }

    pub fn is_fired(&self) -> bool {
        self.0.is_cancelled()
    }
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    order: Vec<String>,
    by_id: HashMap<String, Arc<PeerRecord>>,
    signal: CancellationToken,
}

impl Inner {
    /// Fire the current signal and install a fresh one for later waiters.
    /// Called with the write lock held, after the mutation is visible.
    fn notify(&mut self) {
        self.signal.cancel();
        self.signal = CancellationToken::new();
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `peer`, or merge its addresses into the record already
    /// stored under the same id. Returns true if anything changed.
    ///
    /// The stored record is never replaced, so identity and any live
    /// connection keyed on it survive re-sightings.
    pub fn add(&self, peer: Arc<PeerRecord>) -> bool {
        let mut inner = self.inner.write();

        if let Some(existing) = inner.by_id.get(&peer.id) {
            if !existing.addresses.merge_from(&peer.addresses) {
                return false;
            }
            tracing::debug!(peer = %peer.id, "merged new addresses into known peer");
            inner.notify();
            return true;
        }

        tracing::debug!(peer = %peer.id, name = %peer.name, "new peer");
        inner.order.push(peer.id.clone());
        inner.by_id.insert(peer.id.clone(), peer);
        inner.notify();
        true
    }

    pub fn get(&self, id: &str) -> Option<Arc<PeerRecord>> {
        self.inner.read().by_id.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().by_id.contains_key(id)
    }

    /// Snapshot of all peers in the order they were first seen.
    pub fn list(&self) -> Vec<Arc<PeerRecord>> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect()
    }

    /// The signal that fires on the next addition or address merge.
    pub fn changed(&self) -> ChangeSignal {
        ChangeSignal(self.inner.read().signal.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
