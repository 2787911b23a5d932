use interpose::error::{InterposeError, Result};
use interpose::metrics::ProxyMetrics;
use interpose::proxy::{
    Observation, ObservationSink, Pipeline, PipelineConfig, PipelineState, ProxyListener,
    RegistryResolver,
};
use interpose_common::hooks::{
    on_connect, on_socket_event, ConnectAttempt, ConnectVerdict, PassReason, Registry, SocketEvent,
};
use interpose_common::registry::BoundedRegistry;
use interpose_common::{ipv4_to_raw, raw_to_ipv4, OriginalDest, PeerKey, ProxyConfig};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const PROXY_GROUP: u64 = 7;
const APP_GROUP: u64 = 3;

#[derive(Default)]
struct Recorder(Mutex<Vec<Observation>>);

impl Recorder {
    fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|o| o.to_string()).collect()
    }
}

impl ObservationSink for Recorder {
    fn observe(&self, _conn_id: u64, observation: &Observation) {
        self.0.lock().unwrap().push(observation.clone());
    }
}

/// A proxy on an ephemeral loopback port resolving through an in-process registry
struct Harness {
    proxy: SocketAddrV4,
    registry: Arc<BoundedRegistry>,
    recorder: Arc<Recorder>,
    metrics: ProxyMetrics,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    server: JoinHandle<()>,
}

impl Harness {
    async fn start(capacity: usize) -> Self {
        let listener = ProxyListener::bind("127.0.0.1:0".parse().unwrap(), false).unwrap();
        let proxy = match listener.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => panic!("expected IPv4"),
        };
        let registry = Arc::new(BoundedRegistry::new(capacity));
        let recorder = Arc::new(Recorder::default());
        let metrics = ProxyMetrics::new().unwrap();
        let pipeline = Arc::new(Pipeline::new(
            Arc::new(RegistryResolver::new(registry.clone())),
            recorder.clone(),
            metrics.clone(),
            PipelineConfig {
                connect_timeout: Duration::from_secs(2),
                tap_queue_depth: 64,
                listen_addr: SocketAddr::V4(proxy),
            },
        ));
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let server = tokio::spawn(listener.serve(pipeline, shutdown.clone(), tracker.clone()));

        Self {
            proxy,
            registry,
            recorder,
            metrics,
            shutdown,
            tracker,
            server,
        }
    }

    fn config(&self) -> ProxyConfig {
        ProxyConfig {
            proxy_addr: ipv4_to_raw(*self.proxy.ip()),
            proxy_port: self.proxy.port(),
            _padding: 0,
            group_id: PROXY_GROUP,
        }
    }

    /// Play the kernel's part for an application `connect(dest)`: run the
    /// connect hook, establish (binding the local endpoint before the proxy
    /// can accept, as the kernel does) and return the connected stream.
    async fn app_connect(&self, key: u64, dest: SocketAddrV4) -> (TcpStream, ConnectVerdict) {
        let attempt = ConnectAttempt {
            key,
            group_id: APP_GROUP,
            dst_addr: ipv4_to_raw(*dest.ip()),
            dst_port: dest.port(),
            now_ns: 1,
        };
        let verdict = on_connect(self.registry.as_ref(), &self.config(), &attempt);
        let target = match verdict {
            ConnectVerdict::Redirect { addr, port } => SocketAddrV4::new(raw_to_ipv4(addr), port),
            ConnectVerdict::Passthrough(_) => dest,
        };

        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let local = match socket.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => panic!("expected IPv4"),
        };
        on_socket_event(
            self.registry.as_ref(),
            key,
            &SocketEvent::Established {
                local: PeerKey::from_socket_addr(local),
            },
        );

        let stream = socket.connect(SocketAddr::V4(target)).await.unwrap();
        (stream, verdict)
    }

    fn app_close(&self, key: u64, stream: &TcpStream) {
        let local = match stream.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => panic!("expected IPv4"),
        };
        on_socket_event(
            self.registry.as_ref(),
            key,
            &SocketEvent::Closed {
                local: PeerKey::from_socket_addr(local),
            },
        );
    }

    async fn stop(self) -> (Arc<Recorder>, ProxyMetrics, Arc<BoundedRegistry>) {
        self.shutdown.cancel();
        self.server.await.unwrap();
        self.tracker.close();
        tokio::time::timeout(Duration::from_secs(5), self.tracker.wait())
            .await
            .unwrap();
        (self.recorder, self.metrics, self.registry)
    }
}

/// Upstream answering one HTTP request with `200 OK` and a two byte body
async fn http_upstream() -> (SocketAddrV4, JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = match listener.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => panic!("expected IPv4"),
    };
    let task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();
        request
    });
    (addr, task)
}

const GET: &[u8] = b"GET / HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n";

#[tokio::test]
async fn test_intercepted_get_is_relayed_and_observed() {
    let harness = Harness::start(16).await;
    let (upstream, upstream_task) = http_upstream().await;

    let (mut app, verdict) = harness.app_connect(1, upstream).await;
    assert_eq!(
        verdict,
        ConnectVerdict::Redirect {
            addr: ipv4_to_raw(Ipv4Addr::LOCALHOST),
            port: harness.proxy.port(),
        }
    );

    app.write_all(GET).await.unwrap();
    app.shutdown().await.unwrap();
    let mut response = Vec::new();
    app.read_to_end(&mut response).await.unwrap();

    assert!(response.starts_with(b"HTTP/1.1 200 OK"));
    assert!(response.ends_with(b"hi"));
    assert_eq!(upstream_task.await.unwrap(), GET);

    harness.app_close(1, &app);
    let (recorder, metrics, registry) = harness.stop().await;

    // the two taps report independently, so only the set is fixed
    let mut lines = recorder.lines();
    lines.sort();
    assert_eq!(lines, vec!["200 OK", "GET / example.com"]);
    assert_eq!(metrics.accepted_total(), 1);
    assert_eq!(metrics.closed_total(), 1);
    assert!(registry.is_empty());
    assert_eq!(registry.peer_count(), 0);
}

#[tokio::test]
async fn test_full_registry_connects_to_original_destination() {
    let harness = Harness::start(1).await;
    harness
        .registry
        .insert(99, &OriginalDest::new(ipv4_to_raw(Ipv4Addr::new(10, 0, 0, 9)), 80, 0))
        .unwrap();
    let (upstream, upstream_task) = http_upstream().await;

    let (mut app, verdict) = harness.app_connect(2, upstream).await;
    assert_eq!(verdict, ConnectVerdict::Passthrough(PassReason::RegistryFull));

    app.write_all(GET).await.unwrap();
    let mut response = Vec::new();
    app.read_to_end(&mut response).await.unwrap();
    assert!(response.starts_with(b"HTTP/1.1 200 OK"));
    upstream_task.await.unwrap();

    let (recorder, metrics, registry) = harness.stop().await;
    assert_eq!(metrics.accepted_total(), 0);
    assert!(recorder.lines().is_empty());
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_unresolvable_connection_never_reaches_upstream() {
    let harness = Harness::start(16).await;
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();

    // straight to the proxy, no hook ever saw this socket
    let mut app = TcpStream::connect(SocketAddr::V4(harness.proxy)).await.unwrap();
    let _ = app.write_all(GET).await;
    let mut response = Vec::new();
    let _ = app.read_to_end(&mut response).await;
    assert!(response.is_empty());

    let accepted = tokio::time::timeout(Duration::from_millis(200), upstream.accept()).await;
    assert!(accepted.is_err());

    let (_, metrics, _) = harness.stop().await;
    assert_eq!(metrics.failed_total(PipelineState::Resolving), 1);
}

#[tokio::test]
async fn test_refused_upstream_fails_while_connecting() {
    let harness = Harness::start(16).await;
    let closed = match TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => panic!("expected IPv4"),
    };

    let (mut app, _) = harness.app_connect(3, closed).await;
    let mut response = Vec::new();
    let _ = app.read_to_end(&mut response).await;
    assert!(response.is_empty());

    harness.app_close(3, &app);
    let (_, metrics, registry) = harness.stop().await;
    assert_eq!(metrics.failed_total(PipelineState::Connecting), 1);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_non_http_traffic_is_relayed_untouched() {
    let harness = Harness::start(16).await;
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = match echo.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => panic!("expected IPv4"),
    };
    tokio::spawn(async move {
        let (mut stream, _) = echo.accept().await.unwrap();
        let (mut reader, mut writer) = stream.split();
        tokio::io::copy(&mut reader, &mut writer).await.unwrap();
        writer.shutdown().await.unwrap();
    });

    let garbage: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    let (mut app, _) = harness.app_connect(4, echo_addr).await;
    app.write_all(&garbage).await.unwrap();
    app.shutdown().await.unwrap();
    let mut echoed = Vec::new();
    app.read_to_end(&mut echoed).await.unwrap();

    assert_eq!(echoed, garbage);

    harness.app_close(4, &app);
    let (recorder, metrics, _) = harness.stop().await;
    assert!(recorder.lines().is_empty());
    assert_eq!(metrics.closed_total(), 1);
}

#[tokio::test]
async fn test_undecodable_request_leaves_response_tap_running() {
    let harness = Harness::start(16).await;
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = match upstream.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => panic!("expected IPv4"),
    };
    let upstream_task = tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();
        let mut request = Vec::new();
        stream.read_to_end(&mut request).await.unwrap();
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();
        request
    });

    // TLS ClientHello-looking bytes: the request tap gives up on the first chunk
    let hello: Vec<u8> = [0x16, 0x03, 0x01, 0x02, 0x00, 0x01, 0x00, 0x01, 0xfc]
        .into_iter()
        .chain((0..=255u8).cycle().take(508))
        .collect();
    let (mut app, _) = harness.app_connect(6, upstream_addr).await;
    app.write_all(&hello).await.unwrap();
    app.shutdown().await.unwrap();
    let mut response = Vec::new();
    app.read_to_end(&mut response).await.unwrap();

    assert_eq!(response, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi");
    assert_eq!(upstream_task.await.unwrap(), hello);

    harness.app_close(6, &app);
    let (recorder, metrics, _) = harness.stop().await;
    assert_eq!(recorder.lines(), vec!["200 OK"]);
    assert_eq!(metrics.closed_total(), 1);
}

#[tokio::test]
async fn test_proxy_group_is_never_redirected() {
    let harness = Harness::start(16).await;
    let attempt = ConnectAttempt {
        key: 5,
        group_id: PROXY_GROUP,
        dst_addr: ipv4_to_raw(Ipv4Addr::new(93, 184, 216, 34)),
        dst_port: 80,
        now_ns: 0,
    };

    let verdict = on_connect(harness.registry.as_ref(), &harness.config(), &attempt);

    assert_eq!(verdict, ConnectVerdict::Passthrough(PassReason::ProxyGroup));
    assert!(harness.registry.is_empty());
    harness.stop().await;
}

#[test]
fn test_error_types() {
    let err = InterposeError::ResolutionMissing {
        peer: "127.0.0.1:40000".parse().unwrap(),
        reason: "no registry entry".to_string(),
    };

    assert!(err.to_string().contains("127.0.0.1:40000"));
    assert!(err.to_string().contains("no registry entry"));

    let result: Result<()> = Err(InterposeError::NotConfigured);
    assert!(result.is_err());
}

#[test]
fn test_version_const() {
    assert!(!interpose::VERSION.is_empty());
}
