//! Bidirectional byte relay with half-close propagation

use crate::proxy::tap::TapHandle;
use bytes::BytesMut;
use prometheus::IntCounter;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const READ_CHUNK: usize = 16 * 1024;

/// One direction of the relay: where its chunks are offered and counted
pub struct PumpSide {
    pub tap: TapHandle,
    pub bytes: IntCounter,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelaySummary {
    /// client -> upstream
    pub sent: u64,
    /// upstream -> client
    pub received: u64,
}

/// Copy `src` into `dst` until EOF, then half-close `dst`.
async fn pump<R, W>(mut src: R, mut dst: W, mut side: PumpSide) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut total = 0u64;

    loop {
        buf.reserve(READ_CHUNK);
        let n = src.read_buf(&mut buf).await?;
        if n == 0 {
            dst.shutdown().await?;
            return Ok(total);
        }

        let chunk = buf.split().freeze();
        side.tap.offer(&chunk);
        dst.write_all(&chunk).await?;

        total += n as u64;
        side.bytes.inc_by(n as u64);
    }
}

/// Relay both directions until both have reached EOF. The first I/O error
/// aborts the other direction as well.
pub async fn relay(
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    request: PumpSide,
    response: PumpSide,
) -> std::io::Result<RelaySummary> {
    let (client_read, client_write) = client.split();
    let (upstream_read, upstream_write) = upstream.split();

    let (sent, received) = tokio::try_join!(
        pump(client_read, upstream_write, request),
        pump(upstream_read, client_write, response),
    )?;

    Ok(RelaySummary { sent, received })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::tap::Direction;
    use tokio::net::TcpListener;

    fn side(direction: Direction) -> PumpSide {
        PumpSide {
            tap: TapHandle::disabled(direction),
            bytes: IntCounter::new("test_bytes", "test").unwrap(),
        }
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_relay_propagates_half_close() {
        // app <-> (client_side | proxy | upstream_side) <-> server
        let (mut app, mut client_side) = pair().await;
        let (mut upstream_side, mut server) = pair().await;

        let relay_task = tokio::spawn(async move {
            relay(
                &mut client_side,
                &mut upstream_side,
                side(Direction::Request),
                side(Direction::Response),
            )
            .await
        });

        app.write_all(b"ping").await.unwrap();
        app.shutdown().await.unwrap();

        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"ping");

        // the server can still answer after the client half-closed
        server.write_all(b"pong!").await.unwrap();
        server.shutdown().await.unwrap();

        let mut reply = Vec::new();
        app.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong!");

        let summary = relay_task.await.unwrap().unwrap();
        assert_eq!(summary, RelaySummary { sent: 4, received: 5 });
    }

    #[tokio::test]
    async fn test_relay_counts_bytes() {
        let (mut app, mut client_side) = pair().await;
        let (mut upstream_side, mut server) = pair().await;
        let request = side(Direction::Request);
        let counter = request.bytes.clone();

        let relay_task = tokio::spawn(async move {
            relay(&mut client_side, &mut upstream_side, request, side(Direction::Response)).await
        });

        app.write_all(&[7u8; 100_000]).await.unwrap();
        app.shutdown().await.unwrap();
        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        server.shutdown().await.unwrap();
        let mut rest = Vec::new();
        app.read_to_end(&mut rest).await.unwrap();

        relay_task.await.unwrap().unwrap();
        assert_eq!(got.len(), 100_000);
        assert_eq!(counter.get(), 100_000);
    }
}
