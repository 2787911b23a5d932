//! Listener accepting redirected connections

use crate::proxy::pipeline::Pipeline;
use crate::{InterposeError, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

const LISTEN_BACKLOG: i32 = 1024;
/// Pause after a failed accept, e.g. while out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct ProxyListener {
    listener: TcpListener,
}

impl ProxyListener {
    /// Bind `addr` with `SO_REUSEADDR` (and `SO_REUSEPORT` when asked)
    pub fn bind(addr: SocketAddr, reuse_port: bool) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.set_nonblocking(true)?;
        socket
            .bind(&addr.into())
            .map_err(|e| InterposeError::Config(format!("cannot bind {}: {}", addr, e)))?;
        socket.listen(LISTEN_BACKLOG)?;

        let listener = TcpListener::from_std(socket.into())?;
        info!("Proxy listening on {}", addr);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown` fires, one tracked pipeline task per connection.
    /// Connections already accepted keep running; drain them through `tracker`.
    pub async fn serve(self, pipeline: Arc<Pipeline>, shutdown: CancellationToken, tracker: TaskTracker) {
        let next_id = AtomicU64::new(1);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let conn_id = next_id.fetch_add(1, Ordering::Relaxed);
                    pipeline.metrics().connection_accepted();
                    debug!(conn = conn_id, "Accepted connection from {}", peer);

                    let pipeline = pipeline.clone();
                    tracker.spawn(async move { pipeline.handle(conn_id, stream, peer).await });
                }
                Err(e) => {
                    pipeline.metrics().accept_failed();
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        info!("Proxy listener stopped");
    }
}
