//! Per-connection forwarding pipeline
//!
//! `Resolving -> Connecting -> Relaying -> Closed`; any failure moves the
//! connection to `Errored` and is reported with the state it happened in.

use crate::metrics::ProxyMetrics;
use crate::proxy::relay::{relay, PumpSide, RelaySummary};
use crate::proxy::resolver::DestinationResolver;
use crate::proxy::tap::{spawn_tap, Direction, ObservationSink, TapReport};
use crate::InterposeError;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Resolving,
    Connecting,
    Relaying,
    Closed,
    Errored,
}

impl PipelineState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Resolving => "resolving",
            PipelineState::Connecting => "connecting",
            PipelineState::Relaying => "relaying",
            PipelineState::Closed => "closed",
            PipelineState::Errored => "errored",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A connection failure and the state it happened in
#[derive(Error, Debug)]
#[error("failed while {state}: {error}")]
pub struct PipelineError {
    pub state: PipelineState,
    #[source]
    pub error: InterposeError,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub connect_timeout: Duration,
    pub tap_queue_depth: usize,
    /// The proxy's own listening address; a destination equal to it is refused
    pub listen_addr: SocketAddr,
}

pub struct Pipeline {
    resolver: Arc<dyn DestinationResolver>,
    sink: Arc<dyn ObservationSink>,
    metrics: ProxyMetrics,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        resolver: Arc<dyn DestinationResolver>,
        sink: Arc<dyn ObservationSink>,
        metrics: ProxyMetrics,
        config: PipelineConfig,
    ) -> Self {
        Self {
            resolver,
            sink,
            metrics,
            config,
        }
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    /// Drive one accepted connection to completion, logging and counting the outcome
    pub async fn handle(&self, conn_id: u64, client: TcpStream, peer: SocketAddr) {
        match self.run(conn_id, client, peer).await {
            Ok(summary) => {
                self.metrics.connection_closed();
                debug!(
                    conn = conn_id,
                    "Connection from {} closed ({} bytes sent, {} received)",
                    peer,
                    summary.sent,
                    summary.received
                );
            }
            Err(e) => {
                self.metrics.connection_failed(e.state);
                match e.state {
                    PipelineState::Relaying => debug!(conn = conn_id, "Connection from {} {}", peer, e),
                    _ => warn!(conn = conn_id, "Connection from {} {}", peer, e),
                }
            }
        }
    }

    /// Run the state machine for one connection
    pub async fn run(
        &self,
        conn_id: u64,
        mut client: TcpStream,
        peer: SocketAddr,
    ) -> Result<RelaySummary, PipelineError> {
        let fail = |state, error| PipelineError { state, error };

        // Resolving
        let dest = self
            .resolver
            .resolve(&client, peer)
            .map_err(|e| fail(PipelineState::Resolving, e))?;
        if SocketAddr::V4(dest) == self.config.listen_addr {
            return Err(fail(
                PipelineState::Resolving,
                InterposeError::ResolutionMissing {
                    peer,
                    reason: "destination is the proxy itself".into(),
                },
            ));
        }

        // Connecting
        let mut upstream = self
            .connect(dest)
            .await
            .map_err(|e| fail(PipelineState::Connecting, e))?;
        info!(conn = conn_id, "{} -> {}", peer, dest);

        // Relaying
        enable_nodelay(conn_id, "client", &client);
        enable_nodelay(conn_id, "upstream", &upstream);
        let (request_tap, request_task) =
            spawn_tap(conn_id, Direction::Request, self.config.tap_queue_depth, self.sink.clone());
        let (response_tap, response_task) =
            spawn_tap(conn_id, Direction::Response, self.config.tap_queue_depth, self.sink.clone());

        let result = relay(
            &mut client,
            &mut upstream,
            PumpSide {
                tap: request_tap,
                bytes: self.metrics.bytes_counter(Direction::Request),
            },
            PumpSide {
                tap: response_tap,
                bytes: self.metrics.bytes_counter(Direction::Response),
            },
        )
        .await;
        drop(client);
        drop(upstream);

        self.collect_tap(conn_id, request_task).await;
        self.collect_tap(conn_id, response_task).await;

        result.map_err(|e| fail(PipelineState::Relaying, InterposeError::RelayIo(e)))
    }

    async fn connect(&self, dest: SocketAddrV4) -> crate::Result<TcpStream> {
        match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(dest)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(InterposeError::UpstreamUnreachable { addr: dest, source }),
            Err(_) => Err(InterposeError::UpstreamUnreachable {
                addr: dest,
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            }),
        }
    }

    async fn collect_tap(&self, conn_id: u64, task: JoinHandle<TapReport>) {
        match task.await {
            Ok(report) => {
                self.metrics
                    .observations_counter(report.direction)
                    .inc_by(report.observations as u64);
                if let Some(e) = report.error {
                    debug!(conn = conn_id, "{} tap disabled: {}", report.direction, e);
                }
            }
            Err(e) => warn!(conn = conn_id, "Tap task failed: {}", e),
        }
    }
}

/// Turn off Nagle on a relayed socket; failure only costs latency
fn enable_nodelay(conn_id: u64, side: &str, stream: &TcpStream) -> bool {
    match stream.set_nodelay(true) {
        Ok(()) => true,
        Err(e) => {
            debug!(conn = conn_id, "Failed to set TCP_NODELAY on {} socket: {}", side, e);
            false
        }
    }
}
