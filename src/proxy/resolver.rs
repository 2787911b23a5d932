//! Recovering the original destination of an accepted connection

use crate::{InterposeError, Result};
use interpose_common::hooks::{self, Registry};
use interpose_common::PeerKey;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::TcpStream;

pub trait DestinationResolver: Send + Sync + 'static {
    /// Original destination of the connection accepted from `peer`
    fn resolve(&self, stream: &TcpStream, peer: SocketAddr) -> Result<SocketAddrV4>;
}

/// Asks the kernel via `getsockopt(SOL_IP, SO_ORIGINAL_DST)`, answered by the
/// resolver hook
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct OriginalDstResolver;

#[cfg(target_os = "linux")]
impl DestinationResolver for OriginalDstResolver {
    fn resolve(&self, stream: &TcpStream, peer: SocketAddr) -> Result<SocketAddrV4> {
        use std::os::unix::io::AsRawFd;

        let fd = stream.as_raw_fd();
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

        let ret = unsafe {
            libc::getsockopt(
                fd,
                interpose_common::SOL_IP,
                interpose_common::SO_ORIGINAL_DST,
                &mut addr as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret != 0 {
            return Err(InterposeError::ResolutionMissing {
                peer,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        if addr.sin_family != libc::AF_INET as libc::sa_family_t {
            return Err(InterposeError::ResolutionMissing {
                peer,
                reason: format!("unexpected address family {}", addr.sin_family),
            });
        }

        // sin_addr is kept in network order, same as the registry
        Ok(SocketAddrV4::new(
            interpose_common::raw_to_ipv4(addr.sin_addr.s_addr),
            u16::from_be(addr.sin_port),
        ))
    }
}

/// Resolves against an in-process registry, running the same lookup as the
/// kernel hook
pub struct RegistryResolver<R> {
    registry: Arc<R>,
}

impl<R> RegistryResolver<R> {
    pub fn new(registry: Arc<R>) -> Self {
        Self { registry }
    }
}

impl<R: Registry + Send + Sync + 'static> DestinationResolver for RegistryResolver<R> {
    fn resolve(&self, _stream: &TcpStream, peer: SocketAddr) -> Result<SocketAddrV4> {
        let SocketAddr::V4(peer_v4) = peer else {
            return Err(InterposeError::ResolutionMissing {
                peer,
                reason: "not an IPv4 peer".into(),
            });
        };

        hooks::resolve(self.registry.as_ref(), &PeerKey::from_socket_addr(peer_v4))
            .map(|dest| dest.socket_addr())
            .ok_or_else(|| InterposeError::ResolutionMissing {
                peer,
                reason: "no registry entry".into(),
            })
    }
}
