//! Idle eviction for the interception registry
//!
//! The lifecycle hook removes entries when a socket reaches `TCP_CLOSE`. If
//! that notification is lost (the socket never established, state callbacks
//! could not be enabled, ...) the entry would stay forever, so a periodic sweep
//! evicts anything older than the idle timeout and drops peer bindings whose
//! socket entry is gone.

use crate::metrics::ProxyMetrics;
use crate::Result;
use interpose_common::hooks::Registry;
use interpose_common::registry::BoundedRegistry;
use interpose_common::{OriginalDest, PeerKey, SocketKey};
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Registry access needed by the sweeper
pub trait RegistryView {
    fn snapshot(&mut self) -> Result<Vec<(SocketKey, OriginalDest)>>;

    fn peer_bindings(&mut self) -> Result<Vec<(PeerKey, SocketKey)>>;

    fn evict(&mut self, key: SocketKey) -> Result<()>;

    fn unbind_peer(&mut self, peer: &PeerKey) -> Result<()>;
}

impl RegistryView for BoundedRegistry {
    fn snapshot(&mut self) -> Result<Vec<(SocketKey, OriginalDest)>> {
        Ok(self.entries())
    }

    fn peer_bindings(&mut self) -> Result<Vec<(PeerKey, SocketKey)>> {
        Ok(BoundedRegistry::peer_bindings(self))
    }

    fn evict(&mut self, key: SocketKey) -> Result<()> {
        Registry::remove(self, key);
        Ok(())
    }

    fn unbind_peer(&mut self, peer: &PeerKey) -> Result<()> {
        Registry::unbind_peer(self, peer);
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub evicted: usize,
    pub orphans: usize,
    pub remaining: usize,
}

pub struct IdleSweeper {
    idle_timeout_ns: u64,
}

impl IdleSweeper {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout_ns: u64::try_from(idle_timeout.as_nanos()).unwrap_or(u64::MAX),
        }
    }

    /// One pass over the registry. `now_ns` is on the kernel monotonic clock.
    pub fn sweep<V: RegistryView + ?Sized>(&self, view: &mut V, now_ns: u64) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        let mut live = HashSet::new();

        for (key, dest) in view.snapshot()? {
            if now_ns.saturating_sub(dest.created_ns) >= self.idle_timeout_ns {
                debug!("Evicting idle registry entry {} -> {}", key, dest.socket_addr());
                view.evict(key)?;
                stats.evicted += 1;
            } else {
                live.insert(key);
            }
        }

        for (peer, key) in view.peer_bindings()? {
            if !live.contains(&key) {
                view.unbind_peer(&peer)?;
                stats.orphans += 1;
            }
        }

        stats.remaining = live.len();
        Ok(stats)
    }
}

/// Current `CLOCK_MONOTONIC` in nanoseconds, the clock behind `bpf_ktime_get_ns`
pub fn monotonic_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // clock_gettime cannot fail for CLOCK_MONOTONIC with a valid pointer
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    (ts.tv_sec as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(ts.tv_nsec as u64)
}

/// Sweep `view` every `interval` until `shutdown` fires
pub async fn run<V: RegistryView + Send>(
    mut view: V,
    sweeper: IdleSweeper,
    interval: Duration,
    metrics: ProxyMetrics,
    shutdown: CancellationToken,
) {
    info!("Registry sweeper running every {:?}", interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match sweeper.sweep(&mut view, monotonic_now_ns()) {
                    Ok(stats) => {
                        metrics.record_sweep(&stats);
                        if stats.evicted > 0 || stats.orphans > 0 {
                            info!(
                                "Swept registry: {} idle entries evicted, {} orphaned peers dropped, {} live",
                                stats.evicted, stats.orphans, stats.remaining
                            );
                        }
                    }
                    Err(e) => warn!("Registry sweep failed: {}", e),
                }
            }
        }
    }

    debug!("Registry sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use interpose_common::hooks::{on_connect, on_socket_event, ConnectAttempt, SocketEvent};
    use interpose_common::{ipv4_to_raw, ProxyConfig};
    use std::net::Ipv4Addr;

    const SECOND: u64 = 1_000_000_000;

    fn config() -> ProxyConfig {
        ProxyConfig {
            proxy_addr: ipv4_to_raw(Ipv4Addr::LOCALHOST),
            proxy_port: 18000,
            _padding: 0,
            group_id: 99,
        }
    }

    fn intercept(registry: &BoundedRegistry, key: SocketKey, now_ns: u64) {
        let attempt = ConnectAttempt {
            key,
            group_id: 1,
            dst_addr: ipv4_to_raw(Ipv4Addr::new(10, 0, 0, 1)),
            dst_port: 443,
            now_ns,
        };
        on_connect(registry, &config(), &attempt);
    }

    #[test]
    fn test_sweep_evicts_entries_whose_close_was_lost() {
        let mut registry = BoundedRegistry::new(16);
        intercept(&registry, 1, 0);
        intercept(&registry, 2, 100 * SECOND);

        let sweeper = IdleSweeper::new(Duration::from_secs(120));
        let stats = sweeper.sweep(&mut registry, 150 * SECOND).unwrap();

        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.remaining, 1);
        assert!(registry.lookup(1).is_none());
        assert!(registry.lookup(2).is_some());
    }

    #[test]
    fn test_sweep_drops_orphaned_peer_bindings() {
        let mut registry = BoundedRegistry::new(16);
        intercept(&registry, 1, 0);
        let local = PeerKey::new(ipv4_to_raw(Ipv4Addr::LOCALHOST), 50000);
        assert!(on_socket_event(&registry, 1, &SocketEvent::Established { local }));

        let sweeper = IdleSweeper::new(Duration::from_secs(10));
        let stats = sweeper.sweep(&mut registry, 20 * SECOND).unwrap();

        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.orphans, 1);
        assert!(registry.is_empty());
        assert_eq!(registry.peer_count(), 0);
    }

    #[test]
    fn test_sweep_keeps_fresh_entries_and_bindings() {
        let mut registry = BoundedRegistry::new(16);
        intercept(&registry, 1, 5 * SECOND);
        let local = PeerKey::new(ipv4_to_raw(Ipv4Addr::LOCALHOST), 50001);
        on_socket_event(&registry, 1, &SocketEvent::Established { local });

        let sweeper = IdleSweeper::new(Duration::from_secs(120));
        let stats = sweeper.sweep(&mut registry, 6 * SECOND).unwrap();

        assert_eq!(stats, SweepStats { evicted: 0, orphans: 0, remaining: 1 });
        assert_eq!(registry.peer_count(), 1);
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let a = monotonic_now_ns();
        let b = monotonic_now_ns();
        assert!(b >= a);
        assert!(a > 0);
    }
}
