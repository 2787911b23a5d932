//! Decision logic of the three kernel hooks
//!
//! The probes call these functions with a `Registry` backed by BPF maps; the
//! userspace side runs the very same code against `registry::BoundedRegistry`.
//! Everything here is branch-only and bounded so it stays verifier friendly.

use crate::{first_octet, OriginalDest, PeerKey, ProxyConfig, SocketKey};

/// The registry refused an insert because it is at capacity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegistryFull;

/// Socket-keyed destination registry plus the peer index used to resolve
/// accepted proxy sockets.
pub trait Registry {
    /// Record the original destination of `key`. Must fail instead of evicting
    /// another key when the registry is full.
    fn insert(&self, key: SocketKey, dest: &OriginalDest) -> Result<(), RegistryFull>;

    fn lookup(&self, key: SocketKey) -> Option<OriginalDest>;

    /// Remove `key`; absent keys are ignored.
    fn remove(&self, key: SocketKey);

    fn bind_peer(&self, peer: &PeerKey, key: SocketKey) -> Result<(), RegistryFull>;

    fn peer_key(&self, peer: &PeerKey) -> Option<SocketKey>;

    fn unbind_peer(&self, peer: &PeerKey);
}

/// A `connect()` seen by the interceptor
#[derive(Clone, Copy, Debug)]
pub struct ConnectAttempt {
    pub key: SocketKey,
    /// cgroup id of the calling process
    pub group_id: u64,
    /// requested destination (network byte order)
    pub dst_addr: u32,
    /// requested port (host byte order)
    pub dst_port: u16,
    pub now_ns: u64,
}

/// Why a connect was left untouched
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassReason {
    /// The config cell has not been written yet
    Unconfigured,
    /// The caller is the proxy itself
    ProxyGroup,
    /// The destination already is the proxy
    ProxyEndpoint,
    /// No room left in the registry, fail open
    RegistryFull,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectVerdict {
    /// Rewrite the connect target (address in network order, port in host order)
    Redirect { addr: u32, port: u16 },
    Passthrough(PassReason),
}

/// Returns true when `addr:port` would land on the proxy listener.
#[inline(always)]
pub fn targets_proxy(config: &ProxyConfig, addr: u32, port: u16) -> bool {
    if port != config.proxy_port {
        return false;
    }
    addr == config.proxy_addr || first_octet(addr) == 127 || addr == 0
}

/// Connect interceptor: register the original destination and redirect.
#[inline(always)]
pub fn on_connect<R: Registry + ?Sized>(
    registry: &R,
    config: &ProxyConfig,
    attempt: &ConnectAttempt,
) -> ConnectVerdict {
    if !config.is_configured() {
        return ConnectVerdict::Passthrough(PassReason::Unconfigured);
    }
    if attempt.group_id == config.group_id {
        return ConnectVerdict::Passthrough(PassReason::ProxyGroup);
    }
    if targets_proxy(config, attempt.dst_addr, attempt.dst_port) {
        return ConnectVerdict::Passthrough(PassReason::ProxyEndpoint);
    }

    let dest = OriginalDest::new(attempt.dst_addr, attempt.dst_port, attempt.now_ns);
    match registry.insert(attempt.key, &dest) {
        Ok(()) => ConnectVerdict::Redirect {
            addr: config.proxy_addr,
            port: config.proxy_port,
        },
        Err(RegistryFull) => ConnectVerdict::Passthrough(PassReason::RegistryFull),
    }
}

/// Socket state transitions the lifecycle tracker cares about
#[derive(Clone, Copy, Debug)]
pub enum SocketEvent {
    /// Active open completed; `local` is the client's own endpoint
    Established { local: PeerKey },
    /// Socket moved to TCP_CLOSE
    Closed { local: PeerKey },
}

/// Lifecycle tracker. Returns true when the socket is tracked and state
/// callbacks should be enabled for it.
#[inline(always)]
pub fn on_socket_event<R: Registry + ?Sized>(
    registry: &R,
    key: SocketKey,
    event: &SocketEvent,
) -> bool {
    match event {
        SocketEvent::Established { local } => {
            if registry.lookup(key).is_none() {
                return false;
            }
            if registry.bind_peer(local, key).is_err() {
                // unresolvable without a binding, free the slot now
                registry.remove(key);
                return false;
            }
            true
        }
        SocketEvent::Closed { local } => {
            registry.remove(key);
            if registry.peer_key(local) == Some(key) {
                registry.unbind_peer(local);
            }
            false
        }
    }
}

/// Destination resolver: map an accepted socket's peer back to the original
/// destination of the intercepted socket.
#[inline(always)]
pub fn resolve<R: Registry + ?Sized>(registry: &R, peer: &PeerKey) -> Option<OriginalDest> {
    let key = registry.peer_key(peer)?;
    registry.lookup(key)
}

#[cfg(all(test, feature = "userspace"))]
mod tests {
    use super::*;
    use crate::ipv4_to_raw;
    use crate::registry::BoundedRegistry;
    use std::net::Ipv4Addr;

    const PROXY_PORT: u16 = 18000;
    const PROXY_GROUP: u64 = 4242;
    const APP_GROUP: u64 = 1;

    fn config() -> ProxyConfig {
        ProxyConfig {
            proxy_addr: ipv4_to_raw(Ipv4Addr::LOCALHOST),
            proxy_port: PROXY_PORT,
            _padding: 0,
            group_id: PROXY_GROUP,
        }
    }

    fn attempt(key: SocketKey, ip: Ipv4Addr, port: u16) -> ConnectAttempt {
        ConnectAttempt {
            key,
            group_id: APP_GROUP,
            dst_addr: ipv4_to_raw(ip),
            dst_port: port,
            now_ns: 1_000,
        }
    }

    fn local(port: u16) -> PeerKey {
        PeerKey::new(ipv4_to_raw(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn test_connect_redirects_and_records_destination() {
        let registry = BoundedRegistry::new(8);
        let target = Ipv4Addr::new(93, 184, 216, 34);

        let verdict = on_connect(&registry, &config(), &attempt(7, target, 80));

        assert_eq!(
            verdict,
            ConnectVerdict::Redirect {
                addr: ipv4_to_raw(Ipv4Addr::LOCALHOST),
                port: PROXY_PORT,
            }
        );
        let stored = registry.lookup(7).expect("entry recorded");
        assert_eq!(stored.socket_addr().ip(), &target);
        assert_eq!(stored.port, 80);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_round_trip_through_peer_binding() {
        let registry = BoundedRegistry::new(8);
        let target = Ipv4Addr::new(93, 184, 216, 34);

        on_connect(&registry, &config(), &attempt(7, target, 80));
        assert!(on_socket_event(
            &registry,
            7,
            &SocketEvent::Established { local: local(50000) }
        ));

        let dest = resolve(&registry, &local(50000)).expect("resolved");
        assert_eq!(dest.socket_addr(), "93.184.216.34:80".parse().unwrap());
    }

    #[test]
    fn test_proxy_port_is_not_intercepted() {
        let registry = BoundedRegistry::new(8);

        let verdict = on_connect(
            &registry,
            &config(),
            &attempt(1, Ipv4Addr::LOCALHOST, PROXY_PORT),
        );

        assert_eq!(verdict, ConnectVerdict::Passthrough(PassReason::ProxyEndpoint));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_other_loopback_alias_on_proxy_port_is_not_intercepted() {
        let registry = BoundedRegistry::new(8);

        let verdict = on_connect(
            &registry,
            &config(),
            &attempt(1, Ipv4Addr::new(127, 0, 0, 2), PROXY_PORT),
        );

        assert_eq!(verdict, ConnectVerdict::Passthrough(PassReason::ProxyEndpoint));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_proxy_port_on_remote_host_is_intercepted() {
        let registry = BoundedRegistry::new(8);

        let verdict = on_connect(
            &registry,
            &config(),
            &attempt(1, Ipv4Addr::new(10, 0, 0, 9), PROXY_PORT),
        );

        assert!(matches!(verdict, ConnectVerdict::Redirect { .. }));
    }

    #[test]
    fn test_proxy_group_is_not_intercepted() {
        let registry = BoundedRegistry::new(8);
        let mut from_proxy = attempt(1, Ipv4Addr::new(93, 184, 216, 34), 80);
        from_proxy.group_id = PROXY_GROUP;

        let verdict = on_connect(&registry, &config(), &from_proxy);

        assert_eq!(verdict, ConnectVerdict::Passthrough(PassReason::ProxyGroup));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unconfigured_passes_through() {
        let registry = BoundedRegistry::new(8);

        let verdict = on_connect(
            &registry,
            &ProxyConfig::default(),
            &attempt(1, Ipv4Addr::new(93, 184, 216, 34), 80),
        );

        assert_eq!(verdict, ConnectVerdict::Passthrough(PassReason::Unconfigured));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_full_registry_fails_open() {
        let registry = BoundedRegistry::new(1);
        let first = on_connect(&registry, &config(), &attempt(1, Ipv4Addr::new(1, 1, 1, 1), 443));
        assert!(matches!(first, ConnectVerdict::Redirect { .. }));

        let second = on_connect(&registry, &config(), &attempt(2, Ipv4Addr::new(8, 8, 8, 8), 53));

        assert_eq!(second, ConnectVerdict::Passthrough(PassReason::RegistryFull));
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(2).is_none());
        // the existing entry is untouched
        assert_eq!(registry.lookup(1).unwrap().port, 443);
    }

    #[test]
    fn test_close_removes_entry_and_binding() {
        let registry = BoundedRegistry::new(8);
        on_connect(&registry, &config(), &attempt(3, Ipv4Addr::new(10, 1, 1, 1), 8080));
        on_socket_event(&registry, 3, &SocketEvent::Established { local: local(41000) });

        on_socket_event(&registry, 3, &SocketEvent::Closed { local: local(41000) });

        assert!(registry.lookup(3).is_none());
        assert!(registry.peer_key(&local(41000)).is_none());
        assert!(resolve(&registry, &local(41000)).is_none());
    }

    #[test]
    fn test_duplicate_close_is_idempotent() {
        let registry = BoundedRegistry::new(8);
        on_connect(&registry, &config(), &attempt(3, Ipv4Addr::new(10, 1, 1, 1), 8080));

        on_socket_event(&registry, 3, &SocketEvent::Closed { local: local(41000) });
        on_socket_event(&registry, 3, &SocketEvent::Closed { local: local(41000) });

        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_close_keeps_rebound_port() {
        let registry = BoundedRegistry::new(8);
        on_connect(&registry, &config(), &attempt(3, Ipv4Addr::new(10, 1, 1, 1), 80));
        on_socket_event(&registry, 3, &SocketEvent::Established { local: local(41000) });
        // port reused by a newer socket before the old close arrives
        on_connect(&registry, &config(), &attempt(4, Ipv4Addr::new(10, 2, 2, 2), 80));
        on_socket_event(&registry, 4, &SocketEvent::Established { local: local(41000) });

        on_socket_event(&registry, 3, &SocketEvent::Closed { local: local(41000) });

        let dest = resolve(&registry, &local(41000)).expect("newer socket still resolvable");
        assert_eq!(dest.socket_addr().ip(), &Ipv4Addr::new(10, 2, 2, 2));
    }

    #[test]
    fn test_untracked_socket_is_ignored() {
        let registry = BoundedRegistry::new(8);

        let tracked = on_socket_event(&registry, 99, &SocketEvent::Established { local: local(1) });

        assert!(!tracked);
        assert!(registry.peer_key(&local(1)).is_none());
    }

    #[test]
    fn test_resolve_unknown_peer() {
        let registry = BoundedRegistry::new(8);
        assert!(resolve(&registry, &local(12345)).is_none());
    }
}
