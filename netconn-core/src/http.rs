//! HTTP/1.0 client codec: request formatting and incremental response-head parsing,
//! plus the per-connection request/response state.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::event::ConnError;
use crate::url::HttpUrl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Head,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Head => "HEAD",
        }
    }
}

/// Unsupported HTTP method: a configuration error, never a network condition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported http method: {0}")]
pub struct InvalidMethod(pub String);

impl FromStr for HttpMethod {
    type Err = InvalidMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "HEAD" => Ok(HttpMethod::Head),
            other => Err(InvalidMethod(other.to_string())),
        }
    }
}

/// Numeric method ids as used by C-style hosts (1 = GET, 2 = POST, 3 = HEAD).
impl TryFrom<i32> for HttpMethod {
    type Error = InvalidMethod;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(HttpMethod::Get),
            2 => Ok(HttpMethod::Post),
            3 => Ok(HttpMethod::Head),
            other => Err(InvalidMethod(other.to_string())),
        }
    }
}

/// Header map with case-insensitive keys (stored lower-cased).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: BTreeMap<String, String>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace.
    pub fn set(&mut self, key: &str, value: &str) {
        self.entries
            .insert(key.to_ascii_lowercase(), value.to_string());
    }

    /// Insert, or join onto an existing value with `", "`.
    pub fn append(&mut self, key: &str, value: &str) {
        let key = key.to_ascii_lowercase();
        match self.entries.get_mut(&key) {
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => {
                self.entries.insert(key, value.to_string());
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Request line, one `key: value` line per header, then the empty line.
pub fn format_request(method: HttpMethod, path: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + path.len());
    out.extend_from_slice(method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(path.as_bytes());
    out.extend_from_slice(b" HTTP/1.0\r\n");
    for (key, value) in headers.iter() {
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineHandler {
    StatusLine,
    HeaderLine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadStatus {
    /// No empty line yet; read more (at most `remaining_capacity()` bytes).
    NeedMore,
    /// Status and headers parsed. Bytes after the head are available as leftover.
    Complete,
}

/// Incremental parser for a response status line and header block.
///
/// Bytes accumulate in one buffer capped at `max_bytes`. The cursor marks the start of the
/// first unparsed line; once the head is complete it marks the first unread body byte.
#[derive(Debug)]
pub struct ResponseHead {
    buf: Vec<u8>,
    pos: usize,
    handler: LineHandler,
    status: Option<u16>,
    headers: HeaderMap,
    max_bytes: usize,
    complete: bool,
}

impl ResponseHead {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            handler: LineHandler::StatusLine,
            status: None,
            headers: HeaderMap::new(),
            max_bytes,
            complete: false,
        }
    }

    /// Append received bytes and parse every complete line in the buffer.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<HeadStatus, ConnError> {
        self.buf.extend_from_slice(bytes);
        if self.complete {
            return Ok(HeadStatus::Complete);
        }
        while let Some(nl) = self.buf[self.pos..].iter().position(|&b| b == b'\n') {
            let start = self.pos;
            let mut end = start + nl;
            self.pos = end + 1;
            if end > start && self.buf[end - 1] == b'\r' {
                end -= 1;
            }
            let line = std::str::from_utf8(&self.buf[start..end])
                .map_err(|_| ConnError::Protocol)?
                .to_owned();
            self.handle_line(&line)?;
            if self.complete {
                return Ok(HeadStatus::Complete);
            }
        }
        if self.buf.len() >= self.max_bytes {
            tracing::warn!(limit = self.max_bytes, "http response head exceeds buffer");
            return Err(ConnError::Internal);
        }
        Ok(HeadStatus::NeedMore)
    }

    fn handle_line(&mut self, line: &str) -> Result<(), ConnError> {
        match self.handler {
            LineHandler::StatusLine => {
                let code = parse_status_line(line)?;
                tracing::trace!(code, "http status line");
                self.status = Some(code);
                self.handler = LineHandler::HeaderLine;
            }
            LineHandler::HeaderLine => {
                if line.is_empty() {
                    self.complete = true;
                    return Ok(());
                }
                let (key, value) = split_header_line(line)?;
                tracing::trace!(key, value, "http header line");
                self.headers.append(key, value);
            }
        }
        Ok(())
    }

    /// Bytes that may be requested by the next read without overflowing the buffer.
    pub fn remaining_capacity(&self) -> usize {
        self.max_bytes.saturating_sub(self.buf.len())
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Buffered body bytes received together with the head and not yet consumed.
    pub fn leftover_len(&self) -> usize {
        if self.complete {
            self.buf.len() - self.pos
        } else {
            0
        }
    }

    /// Consume up to `max` leftover body bytes.
    pub fn take_leftover(&mut self, max: usize) -> Vec<u8> {
        let n = self.leftover_len().min(max);
        let out = self.buf[self.pos..self.pos + n].to_vec();
        self.pos += n;
        out
    }
}

/// `HTTP/<version> <code>[ <reason>]` -> code.
fn parse_status_line(line: &str) -> Result<u16, ConnError> {
    let rest = line.strip_prefix("HTTP/").ok_or(ConnError::Protocol)?;
    let (version, rest) = rest.split_once(' ').ok_or(ConnError::Protocol)?;
    if version.is_empty() {
        return Err(ConnError::Protocol);
    }
    let code = rest.split(' ').next().unwrap_or("");
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ConnError::Protocol);
    }
    match code.parse::<u16>() {
        Ok(c) if c >= 100 => Ok(c),
        _ => Err(ConnError::Protocol),
    }
}

/// `key: value`; the first colon must be followed by a space.
fn split_header_line(line: &str) -> Result<(&str, &str), ConnError> {
    let colon = line.find(':').ok_or(ConnError::Protocol)?;
    let value = line[colon + 1..]
        .strip_prefix(' ')
        .ok_or(ConnError::Protocol)?;
    let key = &line[..colon];
    if key.is_empty() {
        return Err(ConnError::Protocol);
    }
    Ok((key, value))
}

/// Request/response lifecycle of an HTTP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpState {
    /// Request headers may still be changed.
    Setup,
    /// Request head sent (or queued); body writes allowed.
    Writing,
    /// Request complete; response head being read. Body writes still allowed.
    Finishing,
    /// Response head parsed; headers and body readable.
    Finished,
}

/// HTTP-specific part of a connection.
#[derive(Debug)]
pub struct HttpConnection {
    pub url: HttpUrl,
    pub method: HttpMethod,
    pub state: HttpState,
    pub request_headers: HeaderMap,
    pub head: ResponseHead,
    /// Set once the socket connect sub-operation succeeded.
    pub connected: bool,
}

impl HttpConnection {
    pub fn new(url: HttpUrl, method: HttpMethod, max_header_bytes: usize) -> Self {
        let mut request_headers = HeaderMap::new();
        request_headers.set("host", &url.host);
        Self {
            url,
            method,
            state: HttpState::Setup,
            request_headers,
            head: ResponseHead::new(max_header_bytes),
            connected: false,
        }
    }

    pub fn request_bytes(&self) -> Vec<u8> {
        format_request(self.method, &self.url.path, &self.request_headers)
    }

    /// Body writes are allowed while the request is open.
    pub fn writable(&self) -> bool {
        matches!(self.state, HttpState::Writing | HttpState::Finishing)
    }
}
