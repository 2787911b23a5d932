//! Bounded in-memory registry
//!
//! Userspace counterpart of the `MAP_SOCKS`/`MAP_PEERS` pair with the same
//! semantics as a non-LRU BPF hash map: updates of an existing key always
//! succeed, new keys are rejected once `capacity` entries are live.

use crate::hooks::{Registry, RegistryFull};
use crate::{OriginalDest, PeerKey, SocketKey, PEER_HEADROOM};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Fixed-capacity concurrent map
struct BoundedMap<K, V> {
    inner: DashMap<K, V>,
    len: AtomicUsize,
    capacity: usize,
}

impl<K: Eq + Hash, V: Copy> BoundedMap<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            inner: DashMap::with_capacity(capacity),
            len: AtomicUsize::new(0),
            capacity,
        }
    }

    fn insert(&self, key: K, value: V) -> Result<(), RegistryFull> {
        // the entry guard holds the shard lock, so a key is reserved at most once
        match self.inner.entry(key) {
            Entry::Occupied(mut occupied) => {
                occupied.insert(value);
                Ok(())
            }
            Entry::Vacant(vacant) => {
                self.len
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                        (len < self.capacity).then_some(len + 1)
                    })
                    .map_err(|_| RegistryFull)?;
                vacant.insert(value);
                Ok(())
            }
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).map(|r| *r)
    }

    fn remove(&self, key: &K) -> Option<V> {
        let removed = self.inner.remove(key).map(|(_, v)| v);
        if removed.is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }
}

/// Thread-safe registry of intercepted sockets
pub struct BoundedRegistry {
    socks: BoundedMap<SocketKey, OriginalDest>,
    peers: BoundedMap<PeerKey, SocketKey>,
}

impl BoundedRegistry {
    /// Create a registry holding at most `capacity` sockets, with the peer
    /// index sized like the kernel's (`peer_capacity`).
    pub fn new(capacity: usize) -> Self {
        Self {
            socks: BoundedMap::new(capacity),
            peers: BoundedMap::new(capacity.saturating_mul(PEER_HEADROOM as usize)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.socks.capacity
    }

    /// Number of live socket entries
    pub fn len(&self) -> usize {
        self.socks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live peer bindings
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Copy of all socket entries
    pub fn entries(&self) -> Vec<(SocketKey, OriginalDest)> {
        self.socks
            .inner
            .iter()
            .map(|r| (*r.key(), *r.value()))
            .collect()
    }

    /// Copy of all peer bindings
    pub fn peer_bindings(&self) -> Vec<(PeerKey, SocketKey)> {
        self.peers
            .inner
            .iter()
            .map(|r| (*r.key(), *r.value()))
            .collect()
    }
}

impl Registry for BoundedRegistry {
    fn insert(&self, key: SocketKey, dest: &OriginalDest) -> Result<(), RegistryFull> {
        self.socks.insert(key, *dest)
    }

    fn lookup(&self, key: SocketKey) -> Option<OriginalDest> {
        self.socks.get(&key)
    }

    fn remove(&self, key: SocketKey) {
        self.socks.remove(&key);
    }

    fn bind_peer(&self, peer: &PeerKey, key: SocketKey) -> Result<(), RegistryFull> {
        self.peers.insert(*peer, key)
    }

    fn peer_key(&self, peer: &PeerKey) -> Option<SocketKey> {
        self.peers.get(peer)
    }

    fn unbind_peer(&self, peer: &PeerKey) {
        self.peers.remove(peer);
    }
}
