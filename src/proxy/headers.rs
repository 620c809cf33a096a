//! Request head parsing and host header translation.
//!
//! The edge network delivers requests with the real external hostname in a
//! dedicated header; the translation here rewrites it into a standard
//! `Host` header so the upstream application needs no framework-specific
//! configuration. Parsing keeps header names exactly as received so the
//! forwarded head matches what the client sent.

use crate::config::Config;
use std::fmt::Write as _;
use std::io;
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Header preserved on the outbound request for debugging.
pub const ORIGINAL_HOST_HEADER: &str = "X-Quant-Original-Host";
/// Filled with `https` when the edge did not set it.
pub const FORWARDED_PROTO_HEADER: &str = "X-Forwarded-Proto";
/// Filled with the peer IP when the edge did not set it.
pub const FORWARDED_FOR_HEADER: &str = "X-Forwarded-For";

/// Request heads larger than this are treated as malformed.
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Parsed request line and headers of one inbound request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    /// Minor HTTP version, `1` for HTTP/1.1.
    pub version: u8,
    /// Ordered header list, names case-preserved.
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// First value of a header, matched case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Reads one request head from the stream.
///
/// `carry` holds bytes already read past the previous message on a
/// persistent connection. Returns the parsed head plus any bytes read past
/// the end of the head (the start of the body), or `None` on a clean EOF
/// before the first byte of a new request.
///
/// # Errors
///
/// `InvalidData` for malformed or oversized heads, `UnexpectedEof` when the
/// peer closes mid-head.
pub async fn read_request_head<R>(
    stream: &mut R,
    carry: Vec<u8>,
) -> io::Result<Option<(RequestHead, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = carry;
    loop {
        if !buf.is_empty() {
            let mut headers = [httparse::EMPTY_HEADER; 64];
            let mut req = httparse::Request::new(&mut headers);
            match req.parse(&buf) {
                Ok(httparse::Status::Complete(head_len)) => {
                    let head = parse_request(&req)?;
                    let leftover = buf.split_off(head_len);
                    return Ok(Some((head, leftover)));
                }
                Ok(httparse::Status::Partial) => {
                    if buf.len() >= MAX_HEAD_BYTES {
                        return Err(invalid_data("request head too large"));
                    }
                }
                Err(e) => return Err(invalid_data(e.to_string())),
            }
        }

        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid request head",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn parse_request(req: &httparse::Request<'_, '_>) -> io::Result<RequestHead> {
    let (Some(method), Some(path), Some(version)) = (req.method, req.path, req.version) else {
        return Err(invalid_data("malformed request line"));
    };

    let mut headers = Vec::with_capacity(req.headers.len());
    for header in req.headers.iter() {
        let value = std::str::from_utf8(header.value)
            .map_err(|e| invalid_data(e.to_string()))?;
        headers.push((header.name.to_string(), value.to_string()));
    }

    Ok(RequestHead {
        method: method.to_string(),
        path: path.to_string(),
        version,
        headers,
    })
}

/// Translates an inbound header set into the outbound set.
///
/// Rules, in order: the configured origin-host header (case-insensitive)
/// replaces the `Host` value and is preserved as `X-Quant-Original-Host`,
/// then `X-Forwarded-Proto` and `X-Forwarded-For` are filled in only when
/// absent. Everything else passes through unchanged, order and name case
/// preserved. The inbound set is not modified.
#[must_use]
pub fn translate_headers(
    headers: &[(String, String)],
    peer_ip: Option<IpAddr>,
    config: &Config,
) -> Vec<(String, String)> {
    let orig_host = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(&config.orig_host_header))
        .map(|(_, value)| value.clone());

    let mut out = Vec::with_capacity(headers.len() + 3);
    let mut saw_host = false;
    let mut saw_proto = false;
    let mut saw_for = false;

    for (name, value) in headers {
        if name.eq_ignore_ascii_case(&config.orig_host_header) {
            continue;
        }
        if name.eq_ignore_ascii_case("host") {
            saw_host = true;
            if let Some(ref orig) = orig_host {
                out.push((name.clone(), orig.clone()));
                continue;
            }
        } else if name.eq_ignore_ascii_case(FORWARDED_PROTO_HEADER) {
            saw_proto = true;
        } else if name.eq_ignore_ascii_case(FORWARDED_FOR_HEADER) {
            saw_for = true;
        } else if name.eq_ignore_ascii_case(ORIGINAL_HOST_HEADER) && orig_host.is_some() {
            // Replaced below with the fresh value.
            continue;
        }
        out.push((name.clone(), value.clone()));
    }

    if let Some(orig) = orig_host {
        if !saw_host {
            out.push(("Host".to_string(), orig.clone()));
        }
        out.push((ORIGINAL_HOST_HEADER.to_string(), orig));
    }
    if !saw_proto {
        out.push((FORWARDED_PROTO_HEADER.to_string(), "https".to_string()));
    }
    if !saw_for && let Some(ip) = peer_ip {
        out.push((FORWARDED_FOR_HEADER.to_string(), ip.to_string()));
    }

    out
}

/// Whether the head asks for a protocol upgrade: an `Upgrade` header plus a
/// `Connection` header listing the `upgrade` token.
#[must_use]
pub fn is_upgrade_request(headers: &[(String, String)]) -> bool {
    let has_upgrade = headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("upgrade"));
    has_upgrade
        && headers.iter().any(|(name, value)| {
            name.eq_ignore_ascii_case("connection")
                && value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
}

/// Serializes a request line and header set back onto the wire.
#[must_use]
pub fn serialize_request_head(
    method: &str,
    path: &str,
    version: u8,
    headers: &[(String, String)],
) -> String {
    let mut out = String::new();
    let _ = write!(out, "{method} {path} HTTP/1.{version}\r\n");
    for (name, value) in headers {
        let _ = write!(out, "{name}: {value}\r\n");
    }
    out.push_str("\r\n");
    out
}
