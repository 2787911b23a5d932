//! Shared types between eBPF (kernel) and userspace
//!
//! This crate defines map layouts and hook logic that must be:
//! - `#[repr(C)]` for stable memory layout
//! - `no_std` compatible for eBPF
//! - Shared between kernel hooks and the userspace proxy
//!
//! Byte order convention: IPv4 addresses are kept exactly as the kernel hands
//! them out (network byte order in memory), ports are kept in host order.

#![cfg_attr(not(feature = "userspace"), no_std)]

pub mod hooks;
#[cfg(feature = "userspace")]
pub mod registry;

/// Kernel socket cookie identifying one socket for its whole lifetime
pub type SocketKey = u64;

/// Map names, shared by the probes and the loader
pub mod maps {
    pub const CONFIG: &str = "MAP_CONFIG";
    pub const SOCKS: &str = "MAP_SOCKS";
    pub const PEERS: &str = "MAP_PEERS";
}

/// Default number of in-flight intercepted sockets the registry can track
pub const DEFAULT_REGISTRY_CAPACITY: u32 = 65536;

/// Peer index slots per registry slot. A peer binding can outlive its socket
/// entry until the sweeper reaps it; the headroom keeps such orphans from
/// filling the index before the socket entries do.
pub const PEER_HEADROOM: u32 = 2;

/// Peer index size for a registry of `capacity` sockets
pub const fn peer_capacity(capacity: u32) -> u32 {
    capacity.saturating_mul(PEER_HEADROOM)
}

/// `getsockopt(SOL_IP, SO_ORIGINAL_DST)`, answered by the resolver hook
pub const SOL_IP: i32 = 0;
pub const SO_ORIGINAL_DST: i32 = 80;

pub const AF_INET: u32 = 2;
pub const IPPROTO_TCP: u32 = 6;

/// Proxy configuration cell, stored at index 0 of `MAP_CONFIG`
///
/// Layout (16 bytes, 8-byte aligned):
/// - proxy_addr: proxy IPv4 address (network byte order)
/// - proxy_port: proxy TCP port (host byte order), 0 means "not configured"
/// - group_id: cgroup id of the proxy's own group, excluded from interception
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct ProxyConfig {
    pub proxy_addr: u32,
    pub proxy_port: u16,
    pub _padding: u16,
    pub group_id: u64,
}

impl ProxyConfig {
    pub const fn is_configured(&self) -> bool {
        self.proxy_port != 0
    }
}

/// Original destination of an intercepted socket, stored in `MAP_SOCKS`
///
/// Layout (16 bytes, 8-byte aligned):
/// - addr: destination IPv4 address (network byte order)
/// - port: destination port (host byte order)
/// - created_ns: kernel monotonic timestamp of the interception
#[repr(C)]
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct OriginalDest {
    pub addr: u32,
    pub port: u16,
    pub _padding: u16,
    pub created_ns: u64,
}

impl OriginalDest {
    pub const fn new(addr: u32, port: u16, created_ns: u64) -> Self {
        Self {
            addr,
            port,
            _padding: 0,
            created_ns,
        }
    }
}

/// Local endpoint of an intercepted client socket, key of `MAP_PEERS`
///
/// The accepted proxy socket observes this endpoint as its peer, which is how
/// the resolver finds its way back to the intercepted socket.
#[repr(C)]
#[derive(Clone, Copy, Debug, Hash)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct PeerKey {
    pub addr: u32,
    pub port: u16,
    pub _padding: u16,
}

impl PeerKey {
    pub const fn new(addr: u32, port: u16) -> Self {
        Self {
            addr,
            port,
            _padding: 0,
        }
    }
}

/// First octet of an address kept in network byte order
#[inline(always)]
pub fn first_octet(addr: u32) -> u8 {
    addr.to_ne_bytes()[0]
}

#[cfg(feature = "userspace")]
mod convert {
    use super::{OriginalDest, PeerKey};
    use std::net::{Ipv4Addr, SocketAddrV4};

    /// Convert an address to the in-kernel representation
    pub fn ipv4_to_raw(ip: Ipv4Addr) -> u32 {
        u32::from_ne_bytes(ip.octets())
    }

    /// Convert an in-kernel address back to `Ipv4Addr`
    pub fn raw_to_ipv4(raw: u32) -> Ipv4Addr {
        Ipv4Addr::from(raw.to_ne_bytes())
    }

    impl OriginalDest {
        pub fn socket_addr(&self) -> SocketAddrV4 {
            SocketAddrV4::new(raw_to_ipv4(self.addr), self.port)
        }
    }

    impl PeerKey {
        pub fn from_socket_addr(addr: SocketAddrV4) -> Self {
            Self::new(ipv4_to_raw(*addr.ip()), addr.port())
        }

        pub fn socket_addr(&self) -> SocketAddrV4 {
            SocketAddrV4::new(raw_to_ipv4(self.addr), self.port)
        }
    }
}

#[cfg(feature = "userspace")]
pub use convert::{ipv4_to_raw, raw_to_ipv4};

#[cfg(all(feature = "userspace", target_os = "linux"))]
unsafe impl aya::Pod for ProxyConfig {}
#[cfg(all(feature = "userspace", target_os = "linux"))]
unsafe impl aya::Pod for OriginalDest {}
#[cfg(all(feature = "userspace", target_os = "linux"))]
unsafe impl aya::Pod for PeerKey {}

#[cfg(feature = "userspace")]
const _: () = {
    assert!(
        core::mem::size_of::<ProxyConfig>() == 16,
        "ProxyConfig must be exactly 16 bytes"
    );
    assert!(
        core::mem::align_of::<ProxyConfig>() == 8,
        "ProxyConfig must be 8-byte aligned"
    );
    assert!(
        core::mem::size_of::<OriginalDest>() == 16,
        "OriginalDest must be exactly 16 bytes"
    );
    assert!(
        core::mem::size_of::<PeerKey>() == 8,
        "PeerKey must be exactly 8 bytes"
    );
};
