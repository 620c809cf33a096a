//! HTTP request forwarding.
//!
//! Dials the upstream once per request, relays the translated head, streams
//! both bodies without buffering them whole, and maps upstream failures onto
//! 502/503/504 responses. The response head is relayed byte-for-byte; it is
//! parsed only to learn the body framing.

use crate::config::{Config, ProxyError};
use crate::proxy::headers::{self, RequestHead};
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

/// Response heads larger than this are treated as a transport failure.
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// What to do with the client connection after an exchange completes.
#[derive(Debug)]
pub enum Persistence {
    /// Serve another request; holds bytes already read past the message.
    KeepAlive(Vec<u8>),
    Close,
}

/// Body framing derived from a header set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    None,
    Length(u64),
    Chunked,
    /// Responses without framing headers run to EOF.
    Eof,
}

/// Outcome of the client-facing half of an exchange.
enum RespOutcome {
    /// Response fully relayed. `close_delimited` means the body had no
    /// framing and the client connection cannot be reused.
    Done { close_delimited: bool },
    /// Timeout or transport failure; an error response was written if
    /// nothing had been sent yet.
    Failed,
}

/// What the upstream-facing half learned about the client.
enum ClientSignal {
    /// Client closed or its read side failed.
    Gone,
    /// Bytes past the current message (a pipelined request).
    More(Vec<u8>),
    /// Writing the body to the upstream failed; the client itself is fine.
    UpstreamWriteFailed,
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Forwards one request to the upstream and relays the response.
///
/// Opens a fresh upstream connection, never reused afterwards. `body_carry`
/// holds body bytes already read while parsing the head.
pub async fn forward(
    client: &mut TcpStream,
    head: &RequestHead,
    body_carry: Vec<u8>,
    peer_ip: Option<IpAddr>,
    config: &Config,
) -> Persistence {
    let req_framing = match request_framing(&head.headers) {
        Ok(framing) => framing,
        Err(e) => {
            warn!(error = %e, "unparsable request framing");
            let _ = write_plain_response(client, 400, "Bad Request", "Bad Request").await;
            return Persistence::Close;
        }
    };

    let deadline = Instant::now() + config.request_timeout;

    let mut upstream = match timeout_at(deadline, TcpStream::connect(config.upstream_addr())).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
            return respond_error(client, &ProxyError::UpstreamUnavailable).await;
        }
        Ok(Err(e)) => {
            return respond_error(client, &ProxyError::Transport(e)).await;
        }
        Err(_) => {
            return respond_error(client, &ProxyError::UpstreamTimeout).await;
        }
    };
    super::listener::configure_tcp_stream(&upstream);

    let translated = headers::translate_headers(&head.headers, peer_ip, config);
    let head_bytes =
        headers::serialize_request_head(&head.method, &head.path, head.version, &translated);

    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();

    if let Err(e) = upstream_write.write_all(head_bytes.as_bytes()).await {
        return respond_error(&mut client_write, &ProxyError::Transport(e)).await;
    }

    let headers_sent = AtomicBool::new(false);
    let body_done = AtomicBool::new(false);

    // Upstream-facing half: stream the request body, then keep one read
    // pending so a client disconnect is noticed while the upstream works.
    let upstream_leg = async {
        match pump_body(&mut client_read, &mut upstream_write, body_carry, req_framing).await {
            Ok(rest) => {
                body_done.store(true, Ordering::Relaxed);
                let _ = upstream_write.flush().await;
                if rest.is_empty() {
                    let mut probe = [0u8; 1024];
                    match client_read.read(&mut probe).await {
                        Ok(0) | Err(_) => ClientSignal::Gone,
                        Ok(n) => ClientSignal::More(probe[..n].to_vec()),
                    }
                } else {
                    ClientSignal::More(rest)
                }
            }
            Err(PumpError::Read(_)) => ClientSignal::Gone,
            Err(PumpError::Write(_)) => ClientSignal::UpstreamWriteFailed,
        }
    };

    let response_leg = response_leg(
        &mut upstream_read,
        &mut client_write,
        &head.method,
        deadline,
        &headers_sent,
    );

    tokio::pin!(upstream_leg);
    tokio::pin!(response_leg);

    let mut signal: Option<ClientSignal> = None;
    let outcome = loop {
        tokio::select! {
            outcome = &mut response_leg => break Some(outcome),
            s = &mut upstream_leg, if signal.is_none() => {
                if matches!(s, ClientSignal::Gone) && !headers_sent.load(Ordering::Relaxed) {
                    debug!("client disconnected before upstream replied");
                    break None;
                }
                signal = Some(s);
            }
        }
    };

    match outcome {
        // ClientAborted: drop the upstream silently, write nothing further.
        None => Persistence::Close,
        Some(RespOutcome::Failed) => Persistence::Close,
        Some(RespOutcome::Done { close_delimited }) => {
            if close_delimited || wants_close(head.version, &head.headers) {
                return Persistence::Close;
            }
            match signal {
                Some(ClientSignal::More(rest)) => Persistence::KeepAlive(rest),
                Some(ClientSignal::Gone | ClientSignal::UpstreamWriteFailed) => Persistence::Close,
                None if body_done.load(Ordering::Relaxed) => Persistence::KeepAlive(Vec::new()),
                None => Persistence::Close,
            }
        }
    }
}

/// Client-facing half: wait for the response head, relay it verbatim, then
/// stream the body. 1xx informational responses are relayed and skipped.
async fn response_leg<R, W>(
    upstream_read: &mut R,
    client_write: &mut W,
    method: &str,
    deadline: Instant,
    headers_sent: &AtomicBool,
) -> RespOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut carry = Vec::new();
    let (raw, parsed, leftover) = loop {
        match timeout_at(deadline, read_response_head(upstream_read, carry)).await {
            Err(_) => {
                warn!("no upstream response within the configured timeout");
                if !headers_sent.load(Ordering::Relaxed) {
                    let _ = write_plain_response(
                        client_write,
                        504,
                        "Gateway Timeout",
                        "Gateway Timeout",
                    )
                    .await;
                }
                return RespOutcome::Failed;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "upstream transport error before response head");
                if !headers_sent.load(Ordering::Relaxed) {
                    let _ =
                        write_plain_response(client_write, 502, "Bad Gateway", "Bad Gateway").await;
                }
                return RespOutcome::Failed;
            }
            Ok(Ok((raw, parsed, leftover))) => {
                if (100..200).contains(&parsed.status) && parsed.status != 101 {
                    headers_sent.store(true, Ordering::Relaxed);
                    if client_write.write_all(&raw).await.is_err() {
                        return RespOutcome::Failed;
                    }
                    carry = leftover;
                    continue;
                }
                break (raw, parsed, leftover);
            }
        }
    };

    let framing = response_framing(method, parsed.status, &parsed.headers);

    headers_sent.store(true, Ordering::Relaxed);
    if client_write.write_all(&raw).await.is_err() {
        return RespOutcome::Failed;
    }

    match pump_body(upstream_read, client_write, leftover, framing).await {
        Ok(_) => {
            let _ = client_write.flush().await;
            RespOutcome::Done {
                close_delimited: framing == Framing::Eof,
            }
        }
        Err(e) => {
            debug!(error = %e.inner(), "response streaming aborted");
            RespOutcome::Failed
        }
    }
}

/// Maps an error onto its client-visible response and closes the exchange.
async fn respond_error<W>(writer: &mut W, error: &ProxyError) -> Persistence
where
    W: AsyncWrite + Unpin,
{
    warn!(error = %error, "forwarding to upstream failed");
    let (status, reason, body) = match error {
        ProxyError::UpstreamUnavailable => {
            (503, "Service Unavailable", "Service Unavailable - App not ready")
        }
        ProxyError::UpstreamTimeout => (504, "Gateway Timeout", "Gateway Timeout"),
        _ => (502, "Bad Gateway", "Bad Gateway"),
    };
    let _ = write_plain_response(writer, status, reason, body).await;
    Persistence::Close
}

/// Writes a small text response in the proxy's own voice.
pub(crate) async fn write_plain_response<W>(
    writer: &mut W,
    status: u16,
    reason: &str,
    body: &str,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await
}

/// Parsed status and headers of an upstream response.
struct ResponseHead {
    status: u16,
    headers: Vec<(String, String)>,
}

/// Reads one response head, returning the raw head bytes for verbatim
/// relay, the parsed view, and any body bytes read past the head.
async fn read_response_head<R>(
    reader: &mut R,
    carry: Vec<u8>,
) -> io::Result<(Vec<u8>, ResponseHead, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = carry;
    loop {
        if !buf.is_empty() {
            let mut headers = [httparse::EMPTY_HEADER; 64];
            let mut resp = httparse::Response::new(&mut headers);
            match resp.parse(&buf) {
                Ok(httparse::Status::Complete(head_len)) => {
                    let Some(status) = resp.code else {
                        return Err(invalid_data("malformed status line"));
                    };
                    let parsed = ResponseHead {
                        status,
                        headers: resp
                            .headers
                            .iter()
                            .map(|h| {
                                (
                                    h.name.to_string(),
                                    String::from_utf8_lossy(h.value).to_string(),
                                )
                            })
                            .collect(),
                    };
                    let leftover = buf.split_off(head_len);
                    return Ok((buf, parsed, leftover));
                }
                Ok(httparse::Status::Partial) => {
                    if buf.len() >= MAX_HEAD_BYTES {
                        return Err(invalid_data("response head too large"));
                    }
                }
                Err(e) => return Err(invalid_data(e.to_string())),
            }
        }

        let mut chunk = [0u8; 4096];
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream closed before response head",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn framing_from_headers(
    headers: &[(String, String)],
    default: Framing,
) -> io::Result<Framing> {
    let mut chunked = false;
    let mut length: Option<u64> = None;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("transfer-encoding") {
            if value.to_lowercase().contains("chunked") {
                chunked = true;
            }
        } else if name.eq_ignore_ascii_case("content-length") && length.is_none() {
            let n = value
                .trim()
                .parse()
                .map_err(|_| invalid_data("invalid Content-Length"))?;
            length = Some(n);
        }
    }
    if chunked {
        return Ok(Framing::Chunked);
    }
    Ok(match length {
        Some(0) => Framing::None,
        Some(n) => Framing::Length(n),
        None => default,
    })
}

fn request_framing(headers: &[(String, String)]) -> io::Result<Framing> {
    framing_from_headers(headers, Framing::None)
}

fn response_framing(method: &str, status: u16, headers: &[(String, String)]) -> Framing {
    if method.eq_ignore_ascii_case("HEAD")
        || status == 204
        || status == 304
        || (100..200).contains(&status)
    {
        return Framing::None;
    }
    framing_from_headers(headers, Framing::Eof).unwrap_or(Framing::Eof)
}

/// Whether the request forbids reusing the client connection.
pub(crate) fn wants_close(version: u8, headers: &[(String, String)]) -> bool {
    let mut close = version == 0;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("connection") {
            for token in value.split(',') {
                let token = token.trim();
                if token.eq_ignore_ascii_case("close") {
                    close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") && version == 0 {
                    close = false;
                }
            }
        }
    }
    close
}

/// Pump failure, split by side so the caller can tell a vanished client
/// from a broken upstream.
enum PumpError {
    Read(io::Error),
    Write(io::Error),
}

impl PumpError {
    fn inner(&self) -> &io::Error {
        match self {
            Self::Read(e) | Self::Write(e) => e,
        }
    }
}

/// Streams one framed body from `reader` to `writer`.
///
/// `initial` holds bytes already read past the head. Returns bytes past the
/// end of the body (possible only for framed bodies fed from `initial`).
async fn pump_body<R, W>(
    reader: &mut R,
    writer: &mut W,
    initial: Vec<u8>,
    framing: Framing,
) -> Result<Vec<u8>, PumpError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        Framing::None => Ok(initial),
        Framing::Length(total) => {
            let cut = usize::try_from(total.min(initial.len() as u64)).unwrap_or(usize::MAX);
            if cut > 0 {
                writer
                    .write_all(&initial[..cut])
                    .await
                    .map_err(PumpError::Write)?;
            }
            let rest = initial[cut..].to_vec();
            let mut remaining = total - cut as u64;
            let mut buf = [0u8; 8192];
            while remaining > 0 {
                let want = usize::try_from(remaining.min(buf.len() as u64)).unwrap_or(buf.len());
                let n = reader.read(&mut buf[..want]).await.map_err(PumpError::Read)?;
                if n == 0 {
                    return Err(PumpError::Read(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "body ended before its declared length",
                    )));
                }
                writer.write_all(&buf[..n]).await.map_err(PumpError::Write)?;
                remaining -= n as u64;
            }
            Ok(rest)
        }
        Framing::Chunked => {
            let mut scanner = ChunkScanner::new();
            let mut buf = initial;
            loop {
                if !buf.is_empty() {
                    let (consumed, done) = scanner.advance(&buf).map_err(PumpError::Read)?;
                    let rest = buf.split_off(consumed);
                    if !buf.is_empty() {
                        writer.write_all(&buf).await.map_err(PumpError::Write)?;
                    }
                    if done {
                        return Ok(rest);
                    }
                    buf = rest;
                }
                if buf.is_empty() {
                    let mut chunk = [0u8; 8192];
                    let n = reader.read(&mut chunk).await.map_err(PumpError::Read)?;
                    if n == 0 {
                        return Err(PumpError::Read(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "chunked body ended before its terminator",
                        )));
                    }
                    buf = chunk[..n].to_vec();
                }
            }
        }
        Framing::Eof => {
            if !initial.is_empty() {
                writer.write_all(&initial).await.map_err(PumpError::Write)?;
            }
            let mut buf = [0u8; 8192];
            loop {
                let n = reader.read(&mut buf).await.map_err(PumpError::Read)?;
                if n == 0 {
                    return Ok(Vec::new());
                }
                writer.write_all(&buf[..n]).await.map_err(PumpError::Write)?;
            }
        }
    }
}

#[derive(Debug)]
enum ChunkState {
    /// Reading the chunk-size line.
    Size,
    /// Raw chunk bytes remaining.
    Data(u64),
    /// CRLF bytes still expected after chunk data.
    DataEnd(u8),
    /// Trailer section after the zero-size chunk.
    Trailer { line_len: usize },
}

/// Incremental scanner that finds the end of a chunked body without
/// altering it; every scanned byte is forwarded verbatim.
struct ChunkScanner {
    state: ChunkState,
    line: Vec<u8>,
}

impl ChunkScanner {
    fn new() -> Self {
        Self {
            state: ChunkState::Size,
            line: Vec::new(),
        }
    }

    /// Scans `buf`, returning how many bytes belong to the body and whether
    /// the terminator was reached. Consumes the whole buffer unless done.
    fn advance(&mut self, buf: &[u8]) -> io::Result<(usize, bool)> {
        let mut i = 0;
        while i < buf.len() {
            match self.state {
                ChunkState::Size => {
                    let b = buf[i];
                    i += 1;
                    if b == b'\n' {
                        let size = parse_chunk_size(&self.line)?;
                        self.line.clear();
                        self.state = if size == 0 {
                            ChunkState::Trailer { line_len: 0 }
                        } else {
                            ChunkState::Data(size)
                        };
                    } else {
                        if self.line.len() > 256 {
                            return Err(invalid_data("chunk size line too long"));
                        }
                        self.line.push(b);
                    }
                }
                ChunkState::Data(remaining) => {
                    let take = usize::try_from(remaining.min((buf.len() - i) as u64))
                        .unwrap_or(buf.len() - i);
                    i += take;
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        ChunkState::DataEnd(2)
                    } else {
                        ChunkState::Data(left)
                    };
                }
                ChunkState::DataEnd(expected) => {
                    let take = (expected as usize).min(buf.len() - i);
                    i += take;
                    let left = expected - take as u8;
                    self.state = if left == 0 {
                        ChunkState::Size
                    } else {
                        ChunkState::DataEnd(left)
                    };
                }
                ChunkState::Trailer { line_len } => {
                    let b = buf[i];
                    i += 1;
                    if b == b'\n' {
                        if line_len == 0 {
                            return Ok((i, true));
                        }
                        self.state = ChunkState::Trailer { line_len: 0 };
                    } else if b != b'\r' {
                        self.state = ChunkState::Trailer {
                            line_len: line_len + 1,
                        };
                    }
                }
            }
        }
        Ok((i, false))
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let s = std::str::from_utf8(line).map_err(|e| invalid_data(e.to_string()))?;
    let s = s.trim_end_matches('\r');
    let s = s.split(';').next().unwrap_or("");
    u64::from_str_radix(s.trim(), 16).map_err(|_| invalid_data("invalid chunk size"))
}
