//! Userspace handles on the kernel registry maps

use crate::ebpf::sweeper::RegistryView;
use crate::{InterposeError, Result};
use aya::maps::{HashMap, MapData, MapError};
use interpose_common::{maps, OriginalDest, PeerKey, SocketKey};
use tracing::warn;

/// `MAP_SOCKS` and `MAP_PEERS`, taken out of the loaded object
pub struct KernelRegistry {
    socks: HashMap<MapData, SocketKey, OriginalDest>,
    peers: HashMap<MapData, PeerKey, SocketKey>,
}

impl KernelRegistry {
    pub fn new(
        socks: HashMap<MapData, SocketKey, OriginalDest>,
        peers: HashMap<MapData, PeerKey, SocketKey>,
    ) -> Self {
        Self { socks, peers }
    }

    pub fn lookup(&self, key: SocketKey) -> Option<OriginalDest> {
        self.socks.get(&key, 0).ok()
    }
}

/// A key deleted concurrently by the lifecycle hook is not an error
fn ignore_missing(result: std::result::Result<(), MapError>, map: &str) -> Result<()> {
    match result {
        Ok(()) | Err(MapError::KeyNotFound) => Ok(()),
        Err(MapError::SyscallError(ref e)) if e.io_error.raw_os_error() == Some(libc::ENOENT) => {
            Ok(())
        }
        Err(e) => Err(InterposeError::kernel(map, e)),
    }
}

impl RegistryView for KernelRegistry {
    fn snapshot(&mut self) -> Result<Vec<(SocketKey, OriginalDest)>> {
        let mut entries = Vec::new();
        for item in self.socks.iter() {
            match item {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping unreadable {} entry: {}", maps::SOCKS, e),
            }
        }
        Ok(entries)
    }

    fn peer_bindings(&mut self) -> Result<Vec<(PeerKey, SocketKey)>> {
        let mut bindings = Vec::new();
        for item in self.peers.iter() {
            match item {
                Ok(binding) => bindings.push(binding),
                Err(e) => warn!("Skipping unreadable {} entry: {}", maps::PEERS, e),
            }
        }
        Ok(bindings)
    }

    fn evict(&mut self, key: SocketKey) -> Result<()> {
        ignore_missing(self.socks.remove(&key), maps::SOCKS)
    }

    fn unbind_peer(&mut self, peer: &PeerKey) -> Result<()> {
        ignore_missing(self.peers.remove(peer), maps::PEERS)
    }
}
