//! Server-side disguise detection
//!
//! Sniffs the first bytes of an accepted connection:
//!
//! | First bytes                    | Result                              |
//! |--------------------------------|-------------------------------------|
//! | `POST`                         | [`ChunkedConn`] (server role)       |
//! | `GET ` + WebSocket upgrade     | `101` preamble, then raw bytes      |
//! | `0x16` + ClientHello           | `RecordConn` (server role)          |
//! | anything else                  | passthrough, every byte replayed    |

use super::chunked::{ChunkedConn, DEFAULT_DRAIN_TIMEOUT};
use super::tls::{self, MAX_HELLO_RECORD, RECORD_HEADER_LEN, VERSION_SSL30, VERSION_TLS12};
use super::{http, record};
use crate::conn::{read_full, BoxConn, Conn, ConnError, LeftoverConn};
use crate::pool::ConnPool;
use bytes::Bytes;
use std::sync::Weak;
use std::time::Duration;
use tracing::debug;

/// Size of the one sniffing read
pub const INITIAL_READ_SIZE: usize = 16 * 1024;

/// Disguise detected on an accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisguiseKind {
    Chunked,
    WebSocket,
    Tls,
    Passthrough,
}

impl std::fmt::Display for DisguiseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DisguiseKind::Chunked => "chunked",
            DisguiseKind::WebSocket => "websocket",
            DisguiseKind::Tls => "tls",
            DisguiseKind::Passthrough => "passthrough",
        };
        f.write_str(name)
    }
}

/// A classified connection, ready for the relay
pub struct Classified {
    pub kind: DisguiseKind,
    pub conn: BoxConn,
}

impl Classified {
    pub fn new(kind: DisguiseKind, conn: BoxConn) -> Self {
        Self { kind, conn }
    }
}

/// Builds the server-side wrapper for each accepted connection
#[derive(Clone)]
pub struct Classifier {
    pool: Option<Weak<dyn ConnPool>>,
    drain_timeout: Duration,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    pub fn new() -> Self {
        Self {
            pool: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Chunked sessions that close gracefully go back to `pool`
    pub fn with_pool(mut self, pool: Weak<dyn ConnPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Sniff `raw` and wrap it. On error `raw` has already been closed.
    pub async fn classify(&self, raw: BoxConn) -> Result<Classified, ConnError> {
        let mut buf = vec![0u8; INITIAL_READ_SIZE];
        let n = match raw.read(&mut buf).await {
            Ok(0) => {
                let _ = raw.close().await;
                return Err(ConnError::ShortRead);
            }
            Ok(n) => n,
            Err(e) => {
                let _ = raw.close().await;
                return Err(e);
            }
        };
        buf.truncate(n);

        let classified = if buf.starts_with(b"POST") {
            self.chunked(raw, buf)
        } else if buf.starts_with(b"GET ") {
            websocket(raw, buf)
        } else if buf[0] == tls::CONTENT_HANDSHAKE {
            tls_hello(raw, buf).await?
        } else {
            passthrough(raw, buf)
        };

        debug!(
            "Classified {:?} as {}",
            classified.conn.peer_addr(),
            classified.kind
        );
        Ok(classified)
    }

    /// A server session over an already buffered head
    pub fn chunked(&self, raw: BoxConn, buf: Vec<u8>) -> Classified {
        let conn = ChunkedConn::server(LeftoverConn::with_pending_read(raw, buf))
            .with_pool(self.pool.clone())
            .with_drain_timeout(self.drain_timeout);
        Classified::new(DisguiseKind::Chunked, Box::new(conn))
    }
}

fn passthrough(raw: BoxConn, buf: Vec<u8>) -> Classified {
    Classified::new(
        DisguiseKind::Passthrough,
        Box::new(LeftoverConn::with_pending_read(raw, buf)),
    )
}

fn websocket(raw: BoxConn, buf: Vec<u8>) -> Classified {
    let head = match http::parse_request(&buf) {
        Ok(Some(head))
            if head.has_token("Upgrade", "websocket") && head.has_token("Connection", "upgrade") =>
        {
            head
        }
        _ => return passthrough(raw, buf),
    };

    let response = http::websocket_response(head.value("Sec-WebSocket-Key"));
    let rest = Bytes::from(buf).slice(head.head_len()..);
    Classified::new(
        DisguiseKind::WebSocket,
        Box::new(LeftoverConn::with_pending(raw, rest, Some(response))),
    )
}

async fn tls_hello(raw: BoxConn, mut buf: Vec<u8>) -> Result<Classified, ConnError> {
    if buf.len() < RECORD_HEADER_LEN {
        return Ok(passthrough(raw, buf));
    }
    let version = u16::from_be_bytes([buf[1], buf[2]]);
    if !(VERSION_SSL30..=VERSION_TLS12).contains(&version) {
        return Ok(passthrough(raw, buf));
    }

    let record_len = RECORD_HEADER_LEN + u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if record_len > buf.len() {
        if record_len > MAX_HELLO_RECORD {
            return Ok(passthrough(raw, buf));
        }
        let have = buf.len();
        buf.resize(record_len, 0);
        if let Err(e) = read_full(&raw, &mut buf[have..]).await {
            debug!("Short ClientHello: {}", e);
            let _ = raw.close().await;
            return Err(e);
        }
    }

    match tls::parse_client_hello(&buf) {
        Some(hello) => {
            let after_hello = Bytes::from(buf).slice(hello.len..);
            Ok(Classified::new(
                DisguiseKind::Tls,
                record::accept(raw, &hello, after_hello),
            ))
        }
        None => Ok(passthrough(raw, buf)),
    }
}
