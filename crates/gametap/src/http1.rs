//! Minimal HTTP/1.1 head and body codec.
//!
//! The proxy never speaks HTTP on its own behalf beyond one request/response
//! exchange at a time, so heads are parsed by hand and bodies are buffered in
//! full before dispatch. Header names keep their original spelling and order
//! so forwarded requests stay as close to the client's bytes as possible.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

pub(crate) const IO_CHUNK_SIZE: usize = 8 * 1024;
const MAX_CHUNK_SIZE_LINE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HttpBodyMode {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

/// A stream plus whatever was read past the last parsed boundary.
pub(crate) struct BufferedConn<S> {
    pub(crate) stream: S,
    pub(crate) read_buf: Vec<u8>,
}

impl<S> BufferedConn<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }
}

impl<S: AsyncRead + Unpin> BufferedConn<S> {
    async fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let read = self.stream.read(&mut chunk).await?;
        self.read_buf.extend_from_slice(&chunk[..read]);
        Ok(read)
    }
}

/// Reads one HTTP head (through the blank line). `Ok(None)` means the peer
/// closed cleanly before sending anything.
pub(crate) async fn read_head<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    max_bytes: usize,
) -> io::Result<Option<Vec<u8>>> {
    loop {
        if let Some(start) = find_subsequence(&conn.read_buf, b"\r\n\r\n") {
            let end = start + 4;
            return Ok(Some(conn.read_buf.drain(..end).collect()));
        }

        if conn.read_buf.len() > max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "HTTP head exceeded configured limit",
            ));
        }

        let read = conn.fill().await?;
        if read == 0 {
            if conn.read_buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before HTTP head completed",
            ));
        }
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub(crate) raw: Vec<u8>,
    pub(crate) body_mode: HttpBodyMode,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }

    /// Origin-form target for the outbound request line.
    pub(crate) fn path_and_query(&self) -> String {
        if self.target.starts_with('/') {
            return self.target.clone();
        }
        for scheme in ["http://", "https://", "ws://", "wss://"] {
            if let Some(rest) = self.target.strip_prefix(scheme) {
                return match rest.find('/') {
                    Some(index) => rest[index..].to_string(),
                    None => "/".to_string(),
                };
            }
        }
        self.target.clone()
    }

    /// Authority to dial: the absolute-URI authority when the client sent
    /// one, otherwise the `Host` header.
    pub(crate) fn target_authority(&self) -> Option<String> {
        for scheme in ["http://", "https://", "ws://", "wss://"] {
            if let Some(rest) = self.target.strip_prefix(scheme) {
                let authority = rest.split('/').next().unwrap_or("");
                if !authority.is_empty() {
                    return Some(authority.to_string());
                }
            }
        }
        self.host().map(str::to_string)
    }
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub(crate) body_mode: HttpBodyMode,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }
}

pub(crate) fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header, _)| header.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

pub(crate) fn parse_request_head(raw: &[u8]) -> io::Result<RequestHead> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| invalid_data("request head was not valid UTF-8"))?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| invalid_data("request line is missing"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| invalid_data("request method is missing"))?;
    let target = parts
        .next()
        .ok_or_else(|| invalid_data("request target is missing"))?;
    let version = parts
        .next()
        .ok_or_else(|| invalid_data("HTTP version is missing"))?;
    if !version.starts_with("HTTP/1.") || parts.next().is_some() {
        return Err(invalid_data("malformed request line"));
    }

    let headers = parse_header_lines(lines)?;
    let body_mode = request_body_mode(&headers)?;

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        headers,
        raw: raw.to_vec(),
        body_mode,
    })
}

pub(crate) fn parse_response_head(raw: &[u8], request_method: &str) -> io::Result<ResponseHead> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| invalid_data("response head was not valid UTF-8"))?;
    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| invalid_data("status line is missing"))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| invalid_data("response version is missing"))?;
    if !version.starts_with("HTTP/1.") {
        return Err(invalid_data("unsupported response version"));
    }
    let status = parts
        .next()
        .ok_or_else(|| invalid_data("response status is missing"))?
        .parse::<u16>()
        .map_err(|_| invalid_data("invalid response status code"))?;
    let reason = parts.next().unwrap_or("").to_string();

    let headers = parse_header_lines(lines)?;
    let body_mode = response_body_mode(&headers, request_method, status);

    Ok(ResponseHead {
        status,
        reason,
        headers,
        body_mode,
    })
}

fn parse_header_lines<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> io::Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| invalid_data("header line is missing a colon"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

fn request_body_mode(headers: &[(String, String)]) -> io::Result<HttpBodyMode> {
    if let Some(encoding) = header_value(headers, "transfer-encoding") {
        if encoding.to_ascii_lowercase().contains("chunked") {
            return Ok(HttpBodyMode::Chunked);
        }
    }
    if let Some(length) = header_value(headers, "content-length") {
        let length = length
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid_data("invalid content-length"))?;
        return Ok(if length == 0 {
            HttpBodyMode::None
        } else {
            HttpBodyMode::ContentLength(length)
        });
    }
    Ok(HttpBodyMode::None)
}

fn response_body_mode(
    headers: &[(String, String)],
    request_method: &str,
    status: u16,
) -> HttpBodyMode {
    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return HttpBodyMode::None;
    }
    if let Some(encoding) = header_value(headers, "transfer-encoding") {
        if encoding.to_ascii_lowercase().contains("chunked") {
            return HttpBodyMode::Chunked;
        }
    }
    if let Some(length) = header_value(headers, "content-length") {
        if let Ok(length) = length.trim().parse::<u64>() {
            return if length == 0 {
                HttpBodyMode::None
            } else {
                HttpBodyMode::ContentLength(length)
            };
        }
    }
    HttpBodyMode::CloseDelimited
}

#[derive(Debug)]
pub(crate) enum BodyReadError {
    TooLarge,
    Io(io::Error),
}

impl From<io::Error> for BodyReadError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Buffers the whole body in memory, bounded by `max_bytes`.
pub(crate) async fn read_body<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    mode: HttpBodyMode,
    max_bytes: usize,
) -> Result<Vec<u8>, BodyReadError> {
    match mode {
        HttpBodyMode::None => Ok(Vec::new()),
        HttpBodyMode::ContentLength(length) => {
            if length > max_bytes as u64 {
                return Err(BodyReadError::TooLarge);
            }
            let needed = length as usize;
            while conn.read_buf.len() < needed {
                let read = conn.fill().await?;
                if read == 0 {
                    return Err(BodyReadError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-body",
                    )));
                }
            }
            Ok(conn.read_buf.drain(..needed).collect())
        }
        HttpBodyMode::Chunked => read_chunked_body(conn, max_bytes).await,
        HttpBodyMode::CloseDelimited => {
            let mut body = std::mem::take(&mut conn.read_buf);
            loop {
                if body.len() > max_bytes {
                    return Err(BodyReadError::TooLarge);
                }
                let mut chunk = [0_u8; IO_CHUNK_SIZE];
                let read = conn.stream.read(&mut chunk).await?;
                if read == 0 {
                    return Ok(body);
                }
                body.extend_from_slice(&chunk[..read]);
            }
        }
    }
}

async fn read_chunked_body<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    max_bytes: usize,
) -> Result<Vec<u8>, BodyReadError> {
    let mut body = Vec::new();
    loop {
        let size_line = read_line(conn).await?;
        let size_text = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| BodyReadError::Io(invalid_data("invalid chunk size")))?;

        if size == 0 {
            // trailers, if any, run until the blank line
            loop {
                let trailer = read_line(conn).await?;
                if trailer.is_empty() {
                    break;
                }
            }
            return Ok(body);
        }
        if body.len() + size > max_bytes {
            return Err(BodyReadError::TooLarge);
        }

        while conn.read_buf.len() < size + 2 {
            let read = conn.fill().await?;
            if read == 0 {
                return Err(BodyReadError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-chunk",
                )));
            }
        }
        body.extend_from_slice(&conn.read_buf[..size]);
        if &conn.read_buf[size..size + 2] != b"\r\n" {
            return Err(BodyReadError::Io(invalid_data(
                "chunk data not followed by CRLF",
            )));
        }
        conn.read_buf.drain(..size + 2);
    }
}

async fn read_line<S: AsyncRead + Unpin>(conn: &mut BufferedConn<S>) -> io::Result<String> {
    loop {
        if let Some(end) = find_subsequence(&conn.read_buf, b"\r\n") {
            let line: Vec<u8> = conn.read_buf.drain(..end + 2).collect();
            return String::from_utf8(line[..end].to_vec())
                .map_err(|_| invalid_data("line was not valid UTF-8"));
        }
        if conn.read_buf.len() > MAX_CHUNK_SIZE_LINE {
            return Err(invalid_data("line exceeded limit"));
        }
        let read = conn.fill().await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-line",
            ));
        }
    }
}

pub(crate) fn encode_request_head(
    method: &str,
    target: &str,
    headers: &[(String, String)],
) -> Vec<u8> {
    let mut head = format!("{method} {target} HTTP/1.1\r\n");
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head.into_bytes()
}

pub(crate) fn encode_response_head(
    status: u16,
    reason: &str,
    headers: &[(String, String)],
) -> Vec<u8> {
    let mut head = if reason.is_empty() {
        format!("HTTP/1.1 {status}\r\n")
    } else {
        format!("HTTP/1.1 {status} {reason}\r\n")
    };
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head.into_bytes()
}

/// Headers for the rebuilt message: everything end-to-end is kept verbatim,
/// hop-by-hop and framing headers are replaced with our own.
pub(crate) fn forwarded_headers(
    original: &[(String, String)],
    body_len: usize,
) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = original
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name) && !name.eq_ignore_ascii_case("content-length"))
        .cloned()
        .collect();
    headers.push(("Content-Length".to_string(), body_len.to_string()));
    headers.push(("Connection".to_string(), "close".to_string()));
    headers
}

pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    const HOP_BY_HOP: [&str; 7] = [
        "connection",
        "proxy-connection",
        "keep-alive",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ];
    HOP_BY_HOP.iter().any(|header| name.eq_ignore_ascii_case(header))
}

pub(crate) fn is_websocket_upgrade(head: &RequestHead) -> bool {
    let connection_upgrade = head.header("connection").is_some_and(|value| {
        value
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    });
    connection_upgrade
        && head
            .header("upgrade")
            .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
        && head
            .header("sec-websocket-version")
            .is_some_and(|value| value.trim() == "13")
}

pub(crate) async fn write_simple_response<S: AsyncWrite + Unpin>(
    stream: &mut S,
    status: &str,
    body: &str,
) -> io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConnectTarget {
    pub(crate) authority: String,
    pub(crate) hostname: String,
    pub(crate) port: u16,
}

pub(crate) fn parse_connect_target(target: &str) -> io::Result<ConnectTarget> {
    let mut target = target.trim();
    while let Some(rest) = target.strip_prefix('/') {
        target = rest;
    }
    if target.is_empty() {
        return Err(invalid_data("empty CONNECT target"));
    }

    let (hostname, port) = split_authority(target, 443)?;
    let hostname = if hostname.parse::<std::net::IpAddr>().is_ok() {
        hostname
    } else {
        hostname.to_ascii_lowercase()
    };

    let authority = if hostname.contains(':') {
        format!("[{hostname}]:{port}")
    } else {
        format!("{hostname}:{port}")
    };
    Ok(ConnectTarget {
        authority,
        hostname,
        port,
    })
}

/// Splits `host[:port]` (bracketed IPv6 included) into host and port.
pub(crate) fn split_authority(authority: &str, default_port: u16) -> io::Result<(String, u16)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (address, rest) = rest
            .split_once(']')
            .ok_or_else(|| invalid_data("unterminated bracketed address"))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| invalid_data("invalid port"))?,
            None => default_port,
        };
        return Ok((address.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((name, port)) if !name.is_empty() && !name.contains(':') => Ok((
            name.to_string(),
            port.parse::<u16>()
                .map_err(|_| invalid_data("invalid port"))?,
        )),
        Some(_) => Err(invalid_data("invalid authority")),
        None => Ok((authority.to_string(), default_port)),
    }
}

fn invalid_data(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

/// Replays already-consumed bytes ahead of the live stream. Writes pass
/// straight through. Used to hand a parsed-and-buffered upgrade request back
/// to the WebSocket acceptor.
pub(crate) struct PrefixedIo<S> {
    prefix: Vec<u8>,
    offset: usize,
    stream: S,
}

impl<S> PrefixedIo<S> {
    pub(crate) fn new(prefix: Vec<u8>, stream: S) -> Self {
        Self {
            prefix,
            offset: 0,
            stream,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedIo<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let remaining = &this.prefix[this.offset..];
            let take = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..take]);
            this.offset += take;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedIo<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
