//! eBPF hooks for interpose
//!
//! This crate contains the cgroup programs that run in kernel space:
//! - `cg_connect4` (cgroup/connect4): records the original destination and
//!   redirects the connect to the local proxy
//! - `cg_sock_ops` (sockops): binds the client endpoint on establish and
//!   prunes registry entries on close
//! - `cg_sock_opt` (cgroup/getsockopt): answers `SO_ORIGINAL_DST` for the
//!   proxy's accepted sockets
//!
//! The decision logic lives in `interpose_common::hooks`; the programs in
//! src/bin/ only adapt kernel contexts and BPF maps to it.

#![cfg_attr(not(test), no_std)]

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
