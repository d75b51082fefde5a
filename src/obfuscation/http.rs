//! HTTP disguise preambles and head parsing
//!
//! The client announces a chunked `POST` upload, the server answers with a
//! chunked `200 OK`. WebSocket clients get a `101 Switching Protocols`.

use super::{random_bytes, BrowserProfile};
use crate::conn::ConnError;
use base64::Engine;
use bytes::Bytes;
use ring::digest;
use tracing::debug;

/// Largest disguise head accepted before the stream is declared malformed
pub const MAX_HEAD_LEN: usize = 8192;

/// Maximum number of header fields in a disguise head
const MAX_HEADERS: usize = 32;

/// RFC 6455 key suffix
const WEBSOCKET_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const PATH_ROOTS: [&str; 6] = ["upload", "api/v1", "sync", "cdn", "static", "media"];

/// A parsed request or response head
#[derive(Debug, Clone)]
pub struct HttpHead {
    len: usize,
    headers: Vec<(String, Vec<u8>)>,
}

impl HttpHead {
    fn new(len: usize, headers: &[httparse::Header<'_>]) -> Self {
        Self {
            len,
            headers: headers
                .iter()
                .map(|h| (h.name.to_string(), h.value.to_vec()))
                .collect(),
        }
    }

    /// Number of bytes the head occupies, including the blank line
    pub fn head_len(&self) -> usize {
        self.len
    }

    /// All values of header `name` (case-insensitive)
    pub fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// First value of header `name`
    pub fn value(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// Whether header `name` lists `token` (comma separated, case-insensitive)
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.values(name).any(|v| {
            v.split(|&b| b == b',')
                .any(|t| t.trim_ascii().eq_ignore_ascii_case(token.as_bytes()))
        })
    }
}

/// Parse a request head. `Ok(None)` means more bytes are needed.
pub fn parse_request(buf: &[u8]) -> Result<Option<HttpHead>, ConnError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => Ok(Some(HttpHead::new(len, req.headers))),
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => {
            debug!("Rejected request head: {}", e);
            Err(ConnError::Malformed)
        }
    }
}

/// Parse a response head. `Ok(None)` means more bytes are needed.
pub fn parse_response(buf: &[u8]) -> Result<Option<HttpHead>, ConnError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(buf) {
        Ok(httparse::Status::Complete(len)) => Ok(Some(HttpHead::new(len, resp.headers))),
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => {
            debug!("Rejected response head: {}", e);
            Err(ConnError::Malformed)
        }
    }
}

/// Client preamble: a chunked upload to the masquerade host
pub fn client_request(host: &str, profile: BrowserProfile) -> Bytes {
    format!(
        "POST {} HTTP/1.1\r\n\
         Host: {host}\r\n\
         X-Online-Host: {host}\r\n\
         User-Agent: {}\r\n\
         Accept: */*\r\n\
         Content-Type: application/octet-stream\r\n\
         Transfer-Encoding: chunked\r\n\
         Connection: keep-alive\r\n\
         \r\n",
        random_path(),
        profile.user_agent(),
    )
    .into()
}

/// Server preamble answering [`client_request`]
pub fn server_response() -> Bytes {
    Bytes::from_static(
        b"HTTP/1.1 200 OK\r\n\
          Server: nginx\r\n\
          Content-Type: application/octet-stream\r\n\
          Transfer-Encoding: chunked\r\n\
          Connection: keep-alive\r\n\
          Cache-Control: no-store\r\n\
          \r\n",
    )
}

/// Server preamble accepting a WebSocket upgrade
pub fn websocket_response(key: Option<&[u8]>) -> Bytes {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Server: nginx\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        websocket_accept(key),
    )
    .into()
}

/// `Sec-WebSocket-Accept` for a client key, or a random value without one
fn websocket_accept(key: Option<&[u8]>) -> String {
    let engine = base64::engine::general_purpose::STANDARD;
    match key {
        Some(key) => {
            let mut ctx = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
            ctx.update(key.trim_ascii());
            ctx.update(WEBSOCKET_GUID);
            engine.encode(ctx.finish())
        }
        None => {
            let mut fake = [0u8; 20];
            random_bytes(&mut fake);
            engine.encode(fake)
        }
    }
}

fn random_path() -> String {
    let mut buf = [0u8; 17];
    random_bytes(&mut buf);

    let root = PATH_ROOTS[buf[0] as usize % PATH_ROOTS.len()];
    let len = 8 + (buf[1] as usize % 8);
    let segment: String = buf[2..2 + len]
        .iter()
        .map(|b| {
            let idx = b % 36;
            if idx < 10 {
                (b'0' + idx) as char
            } else {
                (b'a' + idx - 10) as char
            }
        })
        .collect();

    format!("/{}/{}", root, segment)
}
