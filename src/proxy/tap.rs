//! Inspection taps
//!
//! Each relay pump offers its chunks to a tap through a bounded channel. The
//! tap task feeds a `MessageDecoder` and reports every decoded message head
//! to an `ObservationSink`. Taps never slow the relay down:
//! - offers use `try_send`, a full or closed queue disables that tap only
//! - decode errors end the tap task, the relay keeps going
//! - message bodies are skipped, never buffered

use crate::{InterposeError, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Largest accepted message head
pub const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;
/// Longest chunk-size or trailer line
const MAX_LINE_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// client -> upstream
    Request,
    /// upstream -> client
    Response,
}

impl Direction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Direction::Request => "request",
            Direction::Response => "response",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Request {
        method: String,
        path: String,
        host: Option<String>,
    },
    Response {
        status: u16,
        reason: String,
    },
}

impl Observation {
    pub fn direction(&self) -> Direction {
        match self {
            Observation::Request { .. } => Direction::Request,
            Observation::Response { .. } => Direction::Response,
        }
    }
}

impl std::fmt::Display for Observation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Observation::Request { method, path, host } => {
                write!(f, "{} {} {}", method, path, host.as_deref().unwrap_or("-"))
            }
            Observation::Response { status, reason } => write!(f, "{} {}", status, reason),
        }
    }
}

/// Receiver of decoded messages
pub trait ObservationSink: Send + Sync + 'static {
    fn observe(&self, conn_id: u64, observation: &Observation);
}

/// Logs every observation at info level
pub struct LogSink;

impl ObservationSink for LogSink {
    fn observe(&self, conn_id: u64, observation: &Observation) {
        info!(conn = conn_id, "{}", observation);
    }
}

/// How the body following a head is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    None,
    Length(u64),
    Chunked,
    UntilClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Head,
    Body(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkDataEnd,
    Trailers,
    UntilClose,
}

/// Incremental HTTP/1.x head decoder for one direction of a connection
pub struct MessageDecoder {
    direction: Direction,
    buf: BytesMut,
    state: DecodeState,
}

impl MessageDecoder {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            buf: BytesMut::new(),
            state: DecodeState::Head,
        }
    }

    /// Feed the next chunk of the stream and collect the message heads it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Observation>> {
        let mut observations = Vec::new();
        if self.state == DecodeState::UntilClose {
            return Ok(observations);
        }
        self.buf.extend_from_slice(chunk);

        loop {
            match self.state {
                DecodeState::Head => {
                    let Some((consumed, observation, framing)) = self.parse_head()? else {
                        break;
                    };
                    self.buf.advance(consumed);
                    observations.push(observation);
                    self.state = match framing {
                        Framing::None => DecodeState::Head,
                        Framing::Length(0) => DecodeState::Head,
                        Framing::Length(n) => DecodeState::Body(n),
                        Framing::Chunked => DecodeState::ChunkSize,
                        Framing::UntilClose => DecodeState::UntilClose,
                    };
                }
                DecodeState::Body(remaining) => {
                    let Some(left) = self.skip(remaining) else {
                        break;
                    };
                    self.state = if left == 0 {
                        DecodeState::Head
                    } else {
                        DecodeState::Body(left)
                    };
                }
                DecodeState::ChunkSize => {
                    let Some(line) = self.take_line()? else {
                        break;
                    };
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 {
                        DecodeState::Trailers
                    } else {
                        DecodeState::ChunkData(size)
                    };
                }
                DecodeState::ChunkData(remaining) => {
                    let Some(left) = self.skip(remaining) else {
                        break;
                    };
                    self.state = if left == 0 {
                        DecodeState::ChunkDataEnd
                    } else {
                        DecodeState::ChunkData(left)
                    };
                }
                DecodeState::ChunkDataEnd => {
                    let Some(line) = self.take_line()? else {
                        break;
                    };
                    if !line.is_empty() {
                        return Err(InterposeError::DecodeFailure(
                            "missing CRLF after chunk data".into(),
                        ));
                    }
                    self.state = DecodeState::ChunkSize;
                }
                DecodeState::Trailers => {
                    let Some(line) = self.take_line()? else {
                        break;
                    };
                    if line.is_empty() {
                        self.state = DecodeState::Head;
                    }
                }
                DecodeState::UntilClose => {
                    self.buf.clear();
                    break;
                }
            }
        }

        Ok(observations)
    }

    /// Drop up to `remaining` body bytes. None when the buffer is exhausted first.
    fn skip(&mut self, remaining: u64) -> Option<u64> {
        if self.buf.is_empty() {
            return None;
        }
        let n = remaining.min(self.buf.len() as u64);
        self.buf.advance(n as usize);
        Some(remaining - n)
    }

    /// Next CRLF-terminated line without its terminator
    fn take_line(&mut self) -> Result<Option<Bytes>> {
        match self.buf.windows(2).position(|w| w == b"\r\n") {
            Some(end) => {
                let line = self.buf.split_to(end).freeze();
                self.buf.advance(2);
                Ok(Some(line))
            }
            None if self.buf.len() > MAX_LINE_BYTES => Err(InterposeError::DecodeFailure(
                format!("line exceeds {} bytes", MAX_LINE_BYTES),
            )),
            None => Ok(None),
        }
    }

    fn parse_head(&self) -> Result<Option<(usize, Observation, Framing)>> {
        let parsed = match self.direction {
            Direction::Request => parse_request(&self.buf)?,
            Direction::Response => parse_response(&self.buf)?,
        };
        if parsed.is_none() && self.buf.len() > MAX_HEAD_BYTES {
            return Err(InterposeError::DecodeFailure(format!(
                "message head exceeds {} bytes",
                MAX_HEAD_BYTES
            )));
        }
        Ok(parsed)
    }
}

fn parse_request(buf: &[u8]) -> Result<Option<(usize, Observation, Framing)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    let consumed = match request.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(InterposeError::DecodeFailure(format!("request head: {}", e))),
    };

    let framing = match body_framing(request.headers)? {
        Framing::UntilClose | Framing::None => Framing::None,
        framing => framing,
    };
    let host = header(request.headers, "host").map(|h| h.trim().to_string());
    let observation = Observation::Request {
        method: request.method.unwrap_or_default().to_string(),
        path: request.path.unwrap_or_default().to_string(),
        host,
    };
    Ok(Some((consumed, observation, framing)))
}

fn parse_response(buf: &[u8]) -> Result<Option<(usize, Observation, Framing)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let consumed = match response.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(InterposeError::DecodeFailure(format!("response head: {}", e))),
    };

    let status = response.code.unwrap_or_default();
    let framing = match status {
        // protocol switch: the rest of the stream is no longer HTTP/1.x
        101 => Framing::UntilClose,
        100..=199 | 204 | 304 => Framing::None,
        _ => match body_framing(response.headers)? {
            Framing::None => Framing::UntilClose,
            framing => framing,
        },
    };
    let observation = Observation::Response {
        status,
        reason: response.reason.unwrap_or_default().to_string(),
    };
    Ok(Some((consumed, observation, framing)))
}

/// Body framing from the headers alone; `None` when neither length nor
/// transfer coding is given.
fn body_framing(headers: &[httparse::Header<'_>]) -> Result<Framing> {
    if let Some(coding) = header(headers, "transfer-encoding") {
        let last = coding.rsplit(',').next().unwrap_or_default().trim();
        return Ok(if last.eq_ignore_ascii_case("chunked") {
            Framing::Chunked
        } else {
            Framing::UntilClose
        });
    }
    match header(headers, "content-length") {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Framing::Length)
            .map_err(|_| InterposeError::DecodeFailure(format!("bad content-length {:?}", raw))),
        None => Ok(Framing::None),
    }
}

fn header<'h>(headers: &'h [httparse::Header<'_>], name: &str) -> Option<&'h str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .and_then(|h| std::str::from_utf8(h.value).ok())
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let digits = line.split(|b| *b == b';').next().unwrap_or_default();
    std::str::from_utf8(digits)
        .ok()
        .map(str::trim)
        .and_then(|hex| u64::from_str_radix(hex, 16).ok())
        .ok_or_else(|| {
            InterposeError::DecodeFailure(format!(
                "bad chunk size {:?}",
                String::from_utf8_lossy(line)
            ))
        })
}

/// Relay-side end of a tap
pub struct TapHandle {
    direction: Direction,
    tx: Option<mpsc::Sender<Bytes>>,
}

impl TapHandle {
    /// A tap that observes nothing
    pub fn disabled(direction: Direction) -> Self {
        Self {
            direction,
            tx: None,
        }
    }

    /// Offer a chunk without waiting. A full or closed queue disables the tap.
    pub fn offer(&mut self, chunk: &Bytes) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(chunk.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("{} tap fell behind, disabling it", self.direction);
                self.tx = None;
            }
            Err(TrySendError::Closed(_)) => {
                self.tx = None;
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.tx.is_some()
    }
}

/// How a tap task ended
#[derive(Debug)]
pub struct TapReport {
    pub direction: Direction,
    pub observations: usize,
    pub error: Option<InterposeError>,
}

/// Start a tap task decoding `direction` traffic of connection `conn_id`
pub fn spawn_tap(
    conn_id: u64,
    direction: Direction,
    queue_depth: usize,
    sink: Arc<dyn ObservationSink>,
) -> (TapHandle, JoinHandle<TapReport>) {
    let (tx, mut rx) = mpsc::channel::<Bytes>(queue_depth.max(1));

    let task = tokio::spawn(async move {
        let mut decoder = MessageDecoder::new(direction);
        let mut report = TapReport {
            direction,
            observations: 0,
            error: None,
        };

        while let Some(chunk) = rx.recv().await {
            match decoder.feed(&chunk) {
                Ok(observations) => {
                    for observation in &observations {
                        sink.observe(conn_id, observation);
                    }
                    report.observations += observations.len();
                }
                Err(e) => {
                    debug!(conn = conn_id, "{} tap stopped: {}", direction, e);
                    report.error = Some(e);
                    break;
                }
            }
        }

        report
    });

    (
        TapHandle {
            direction,
            tx: Some(tx),
        },
        task,
    )
}
