//! Identity -> live connection map held by a server.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// At most one entry per identity.
pub(crate) struct PeerRegistry<C> {
    peers: Mutex<HashMap<String, C>>,
}

impl<C> Default for PeerRegistry<C> {
    fn default() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
        }
    }
}

impl<C: Clone> PeerRegistry<C> {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, C>> {
        self.peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `peer`, returning the entry it replaced.
    pub(crate) fn insert(&self, identity: &str, peer: C) -> Option<C> {
        self.lock().insert(identity.to_string(), peer)
    }

    pub(crate) fn get(&self, identity: &str) -> Option<C> {
        self.lock().get(identity).cloned()
    }

    /// Remove the entry for `identity` only if `is_current` says it is still
    /// the one being retired. A newer connection under the same identity is
    /// left alone.
    pub(crate) fn remove_if(&self, identity: &str, is_current: impl FnOnce(&C) -> bool) -> bool {
        let mut peers = self.lock();
        match peers.get(identity) {
            Some(peer) if is_current(peer) => {
                peers.remove(identity);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}
