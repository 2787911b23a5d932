//! Transparent interception hooks
//!
//! Three cgroup programs share one registry:
//! - cg_connect4 writes `MAP_SOCKS[cookie]` and rewrites the connect target
//! - cg_sock_ops writes `MAP_PEERS[client endpoint]` on establish and clears
//!   both maps on close
//! - cg_sock_opt reads them back for `getsockopt(SOL_IP, SO_ORIGINAL_DST)`
//!
//! Note: This binary must be built for the bpfel-unknown-none target.
//! The root crate's build.rs handles cross-compilation automatically.

#![no_std]
#![no_main]

use core::mem;

use aya_ebpf::{
    bindings::{
        bpf_sock_addr, bpf_sockopt, BPF_SOCK_OPS_ACTIVE_ESTABLISHED_CB, BPF_SOCK_OPS_STATE_CB,
        BPF_SOCK_OPS_STATE_CB_FLAG, BPF_TCP_CLOSE,
    },
    helpers::{bpf_get_current_cgroup_id, bpf_get_socket_cookie, bpf_ktime_get_ns},
    macros::{cgroup_sock_addr, cgroup_sockopt, map, sock_ops},
    maps::{Array, HashMap},
    programs::{SockAddrContext, SockOpsContext, SockoptContext},
    EbpfContext,
};
use aya_log_ebpf::warn;
use interpose_common::{
    hooks::{
        on_connect, on_socket_event, resolve, ConnectAttempt, ConnectVerdict, PassReason,
        Registry, RegistryFull, SocketEvent,
    },
    peer_capacity, OriginalDest, PeerKey, ProxyConfig, SocketKey, AF_INET,
    DEFAULT_REGISTRY_CAPACITY, IPPROTO_TCP, SOL_IP, SO_ORIGINAL_DST,
};

/// Return value letting the syscall proceed
const ALLOW: i32 = 1;

#[map]
static MAP_CONFIG: Array<ProxyConfig> = Array::with_max_entries(1, 0);

/// Capacity is overridden by the loader from the userspace configuration.
#[map]
static MAP_SOCKS: HashMap<SocketKey, OriginalDest> =
    HashMap::with_max_entries(DEFAULT_REGISTRY_CAPACITY, 0);

#[map]
static MAP_PEERS: HashMap<PeerKey, SocketKey> =
    HashMap::with_max_entries(peer_capacity(DEFAULT_REGISTRY_CAPACITY), 0);

/// IPv4 socket address as written back to getsockopt callers
#[repr(C)]
struct SockaddrIn {
    sin_family: u16,
    sin_port: u16,
    sin_addr: u32,
    sin_zero: [u8; 8],
}

/// Registry backed by the two hash maps. A plain (non-LRU) hash map rejects
/// new keys with E2BIG once full, which is exactly the fail-closed insert the
/// hooks rely on.
struct MapRegistry;

impl Registry for MapRegistry {
    #[inline(always)]
    fn insert(&self, key: SocketKey, dest: &OriginalDest) -> Result<(), RegistryFull> {
        MAP_SOCKS.insert(&key, dest, 0).map_err(|_| RegistryFull)
    }

    #[inline(always)]
    fn lookup(&self, key: SocketKey) -> Option<OriginalDest> {
        unsafe { MAP_SOCKS.get(&key) }.copied()
    }

    #[inline(always)]
    fn remove(&self, key: SocketKey) {
        let _ = MAP_SOCKS.remove(&key);
    }

    #[inline(always)]
    fn bind_peer(&self, peer: &PeerKey, key: SocketKey) -> Result<(), RegistryFull> {
        MAP_PEERS.insert(peer, &key, 0).map_err(|_| RegistryFull)
    }

    #[inline(always)]
    fn peer_key(&self, peer: &PeerKey) -> Option<SocketKey> {
        unsafe { MAP_PEERS.get(peer) }.copied()
    }

    #[inline(always)]
    fn unbind_peer(&self, peer: &PeerKey) {
        let _ = MAP_PEERS.remove(peer);
    }
}

#[cgroup_sock_addr(connect4)]
pub fn cg_connect4(ctx: SockAddrContext) -> i32 {
    let sock = unsafe { &*ctx.sock_addr };
    if sock.user_family != AF_INET || sock.protocol != IPPROTO_TCP {
        return ALLOW;
    }
    let config = match MAP_CONFIG.get(0) {
        Some(c) => *c,
        None => return ALLOW,
    };

    // user_port carries the network-order port in its low 16 bits
    let attempt = ConnectAttempt {
        key: unsafe { bpf_get_socket_cookie(ctx.as_ptr()) },
        group_id: unsafe { bpf_get_current_cgroup_id() },
        dst_addr: sock.user_ip4,
        dst_port: u16::from_be(sock.user_port as u16),
        now_ns: unsafe { bpf_ktime_get_ns() },
    };

    match on_connect(&MapRegistry, &config, &attempt) {
        ConnectVerdict::Redirect { addr, port } => {
            let sock_mut = ctx.sock_addr as *mut bpf_sock_addr;
            unsafe {
                (*sock_mut).user_ip4 = addr;
                (*sock_mut).user_port = u32::from(port.to_be());
            }
        }
        ConnectVerdict::Passthrough(PassReason::RegistryFull) => {
            warn!(&ctx, "registry full, connect left unmodified");
        }
        ConnectVerdict::Passthrough(_) => {}
    }

    ALLOW
}

#[sock_ops]
pub fn cg_sock_ops(ctx: SockOpsContext) -> u32 {
    if ctx.family() != AF_INET {
        return 0;
    }

    let local = PeerKey::new(ctx.local_ip4(), ctx.local_port() as u16);
    let event = match ctx.op() {
        BPF_SOCK_OPS_ACTIVE_ESTABLISHED_CB => SocketEvent::Established { local },
        // arg(1) is the new TCP state
        BPF_SOCK_OPS_STATE_CB if ctx.arg(1) == BPF_TCP_CLOSE => SocketEvent::Closed { local },
        _ => return 0,
    };

    let key = unsafe { bpf_get_socket_cookie(ctx.as_ptr()) };
    if on_socket_event(&MapRegistry, key, &event) {
        let flags = ctx.cb_flags() | BPF_SOCK_OPS_STATE_CB_FLAG;
        let _ = ctx.set_cb_flags(flags as i32);
    }

    0
}

#[cgroup_sockopt(getsockopt)]
pub fn cg_sock_opt(ctx: SockoptContext) -> i32 {
    let sockopt = unsafe { &mut *(ctx.sockopt as *mut bpf_sockopt) };
    if sockopt.level != SOL_IP || sockopt.optname != SO_ORIGINAL_DST {
        return ALLOW;
    }

    let sk = unsafe { sockopt.__bindgen_anon_1.sk };
    if sk.is_null() {
        return ALLOW;
    }
    let sk = unsafe { &*sk };
    if sk.family != AF_INET || sk.protocol != IPPROTO_TCP {
        return ALLOW;
    }

    // On the accepted socket the remote end is the intercepted client
    let peer = PeerKey::new(sk.dst_ip4, u16::from_be(sk.dst_port as u16));
    let dest = match resolve(&MapRegistry, &peer) {
        Some(d) => d,
        None => return ALLOW,
    };

    let optval = unsafe { sockopt.__bindgen_anon_2.optval };
    let optval_end = unsafe { sockopt.__bindgen_anon_3.optval_end };
    let sa = optval as *mut SockaddrIn;
    if sa.is_null() || optval as usize + mem::size_of::<SockaddrIn>() > optval_end as usize {
        return ALLOW;
    }

    unsafe {
        (*sa).sin_family = AF_INET as u16;
        (*sa).sin_port = dest.port.to_be();
        (*sa).sin_addr = dest.addr;
        (*sa).sin_zero = [0u8; 8];
    }
    sockopt.optlen = mem::size_of::<SockaddrIn>() as i32;
    sockopt.retval = 0;

    ALLOW
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
