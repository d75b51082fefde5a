//! HTTP chunked transfer-encoding disguise
//!
//! Every write becomes one chunk:
//! ```text
//! <hex length>\r\n<payload>\r\n
//! ```
//! and `0\r\n\r\n` ends the session. Ending the session is a handshake:
//! each side sends the last chunk and drains the peer's stream until the
//! peer's last chunk arrives, after which the underlying connection is
//! clean and can be handed to the reuse pool for the next session.
//!
//! Session lifecycle:
//! ```text
//! Active --close--> Closing --drain--> Draining --last chunk--> Closed (pooled)
//!                      \__________________\___any failure_____> Closed (hard)
//! ```

use super::http::{self, MAX_HEAD_LEN};
use crate::conn::{Conn, ConnError, LeftoverConn};
use crate::pool::ConnPool;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// How long a graceful close waits for the peer's last chunk
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest chunk size line (hex digits plus stray carriage returns)
const MAX_SIZE_LINE: usize = 18;

const TERMINATOR: &[u8; 2] = b"\r\n";
const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

const HEAD_READ_SIZE: usize = 4096;
const DRAIN_BUF_SIZE: usize = 16 * 1024;

/// Which end of the disguise exchange this connection plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the request preamble, expects a response head
    Client,
    /// Expects a request head, sends the response preamble
    Server,
}

/// Progress of the one-time disguise header exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderState {
    /// No exchange in progress (a recycled client waiting for reuse)
    Idle,
    /// Server waiting for the client's request head
    AwaitRequest,
    /// Client waiting for the server's response head
    AwaitResponse,
    /// Head consumed; only chunks remain
    Established,
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closing,
    Draining,
    Closed,
}

/// Outcome of one pass of the chunk parser
enum ChunkRead {
    Data(usize),
    EndOfStream,
}

/// Chunk parser position, guarded by the read lock
#[derive(Default)]
struct ChunkReader {
    /// Bytes left in the current chunk including its `\r\n`; 0 means a
    /// size line comes next
    remaining: usize,
    /// The current chunk is the zero-length last chunk
    last_chunk: bool,
    end_of_stream: bool,
    /// Size line scanned so far, kept so an interrupted read can resume
    size_line: Vec<u8>,
}

/// A connection disguised as a chunked HTTP exchange
pub struct ChunkedConn {
    inner: Arc<LeftoverConn>,
    role: Role,
    pool: Option<Weak<dyn ConnPool>>,
    drain_timeout: Duration,
    header: Mutex<HeaderState>,
    state: Mutex<SessionState>,
    close_lock: tokio::sync::Mutex<()>,
    reader: tokio::sync::Mutex<ChunkReader>,
    writer: tokio::sync::Mutex<()>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ChunkedConn {
    fn build(inner: Arc<LeftoverConn>, role: Role, header: HeaderState) -> Self {
        Self {
            inner,
            role,
            pool: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            header: Mutex::new(header),
            state: Mutex::new(SessionState::Active),
            close_lock: tokio::sync::Mutex::new(()),
            reader: tokio::sync::Mutex::new(ChunkReader::default()),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    /// Client side. Call [`ChunkedConn::begin_request`] before use to queue
    /// the request preamble; without it the connection speaks bare chunks.
    pub fn client(inner: LeftoverConn) -> Self {
        Self::build(Arc::new(inner), Role::Client, HeaderState::Idle)
    }

    /// Server side. The request head is expected in the first bytes read,
    /// and the response preamble goes out with the first write.
    pub fn server(inner: LeftoverConn) -> Self {
        inner.set_pending_write(http::server_response());
        Self::build(Arc::new(inner), Role::Server, HeaderState::AwaitRequest)
    }

    /// Return the connection to `pool` on graceful close
    pub fn with_pool(mut self, pool: Option<Weak<dyn ConnPool>>) -> Self {
        self.pool = pool;
        self
    }

    /// Bound the wait for the peer's last chunk during close
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Queue the client request preamble to go out with the first write and
    /// expect the server's response head on the first read.
    pub fn begin_request(&self, preamble: Bytes) {
        self.inner.set_pending_write(preamble);
        *lock(&self.header) = HeaderState::AwaitResponse;
    }

    /// Get the role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Get the header exchange state
    pub fn header_state(&self) -> HeaderState {
        *lock(&self.header)
    }

    /// Get the session state
    pub fn session_state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn is_active(&self) -> bool {
        self.session_state() == SessionState::Active
    }

    fn ensure_active(&self) -> Result<(), ConnError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(ConnError::Closed)
        }
    }

    fn set_state(&self, next: SessionState) {
        *lock(&self.state) = next;
    }

    /// A fresh instance over the same connection with the disguise reset
    fn recycle(&self) -> ChunkedConn {
        let header = match self.role {
            Role::Client => HeaderState::Idle,
            Role::Server => {
                self.inner.set_pending_write(http::server_response());
                HeaderState::AwaitRequest
            }
        };
        Self::build(Arc::clone(&self.inner), self.role, header)
            .with_pool(self.pool.clone())
            .with_drain_timeout(self.drain_timeout)
    }

    /// Read from the wire, consuming the disguise head first if one is due
    async fn next(&self, buf: &mut [u8]) -> Result<usize, ConnError> {
        let header = self.header_state();
        if matches!(header, HeaderState::AwaitRequest | HeaderState::AwaitResponse) {
            self.consume_head(header).await?;
        }
        self.inner.read(buf).await
    }

    async fn consume_head(&self, expect: HeaderState) -> Result<(), ConnError> {
        let mut head = BytesMut::with_capacity(HEAD_READ_SIZE);
        let mut buf = vec![0u8; HEAD_READ_SIZE];

        loop {
            let n = self.inner.read(&mut buf).await?;
            if n == 0 {
                return Err(ConnError::ShortRead);
            }
            head.extend_from_slice(&buf[..n]);

            let parsed = match expect {
                HeaderState::AwaitRequest => http::parse_request(&head),
                _ => http::parse_response(&head),
            };
            match parsed {
                Ok(Some(parsed)) => {
                    // Anything past the head is chunk data
                    self.inner.unread(&head[parsed.head_len()..]);
                    *lock(&self.header) = HeaderState::Established;
                    trace!("Consumed {} byte disguise head", parsed.head_len());
                    return Ok(());
                }
                Ok(None) if head.len() < MAX_HEAD_LEN => continue,
                _ => {
                    debug!("Bad disguise head from {:?}", self.inner.peer_addr());
                    self.set_state(SessionState::Closed);
                    let _ = self.inner.close().await;
                    return Err(ConnError::Malformed);
                }
            }
        }
    }

    async fn next_byte(&self) -> Result<u8, ConnError> {
        let mut b = [0u8; 1];
        if self.next(&mut b).await? == 0 {
            return Err(ConnError::ShortRead);
        }
        Ok(b[0])
    }

    /// Consume what is left of the current chunk's `\r\n`
    async fn read_terminator(&self, rd: &mut ChunkReader) -> Result<(), ConnError> {
        while rd.remaining > 0 {
            let b = self.next_byte().await?;
            if b != TERMINATOR[2 - rd.remaining] {
                debug!("Bad chunk terminator byte {:#04x}", b);
                return Err(ConnError::Malformed);
            }
            rd.remaining -= 1;
        }
        Ok(())
    }

    async fn read_size_line(&self, rd: &mut ChunkReader) -> Result<usize, ConnError> {
        loop {
            let b = self.next_byte().await?;
            match b {
                b'\n' => break,
                b'\r' | b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                    if rd.size_line.len() >= MAX_SIZE_LINE {
                        debug!("Chunk size line too long");
                        return Err(ConnError::Malformed);
                    }
                    rd.size_line.push(b);
                }
                _ => {
                    debug!("Unexpected chunk size byte {:#04x}", b);
                    return Err(ConnError::Malformed);
                }
            }
        }

        let line = std::mem::take(&mut rd.size_line);
        let digits: String = line
            .iter()
            .filter(|&&b| b != b'\r')
            .map(|&b| b as char)
            .collect();
        if digits.is_empty() {
            debug!("Empty chunk size line");
            return Err(ConnError::Malformed);
        }
        usize::from_str_radix(&digits, 16).map_err(|_| ConnError::Malformed)
    }

    /// One pass of the chunk parser
    async fn read_chunk(
        &self,
        rd: &mut ChunkReader,
        buf: &mut [u8],
    ) -> Result<ChunkRead, ConnError> {
        if rd.end_of_stream {
            return Ok(ChunkRead::EndOfStream);
        }
        if buf.is_empty() {
            return Ok(ChunkRead::Data(0));
        }

        // Tail of the previous chunk
        if (1..=2).contains(&rd.remaining) && !rd.last_chunk {
            self.read_terminator(rd).await?;
        }

        if rd.remaining == 0 {
            let size = self.read_size_line(rd).await?;
            rd.remaining = size.checked_add(2).ok_or(ConnError::Malformed)?;
            rd.last_chunk = size == 0;
            trace!("Chunk of {} bytes", size);
        }

        if rd.last_chunk {
            self.read_terminator(rd).await?;
            rd.end_of_stream = true;
            trace!("Peer sent last chunk");
            return Ok(ChunkRead::EndOfStream);
        }

        let before = rd.remaining;
        let want = before.min(buf.len());
        let n = self.next(&mut buf[..want]).await?;
        if n == 0 {
            return Err(ConnError::ShortRead);
        }
        rd.remaining -= n;

        // Drop terminator bytes that landed in the caller's buffer
        let data = n.min(before - 2);
        if buf[data..n] != TERMINATOR[..n - data] {
            debug!("Bad chunk terminator");
            return Err(ConnError::Malformed);
        }
        Ok(ChunkRead::Data(data))
    }

    async fn hard_close(&self) -> Result<(), ConnError> {
        self.set_state(SessionState::Closed);
        self.inner.close().await
    }

    /// Send the last chunk and read until the peer's last chunk
    async fn drain(&self) -> Result<(), ConnError> {
        let _writer = self.writer.lock().await;
        self.inner.write(LAST_CHUNK).await?;

        // Kick a blocked reader loose, then take over the read side
        self.inner.set_read_deadline(Some(Instant::now()));
        let mut rd = self.reader.lock().await;
        self.inner
            .set_read_deadline(Some(Instant::now() + self.drain_timeout));
        self.set_state(SessionState::Draining);

        let mut scratch = vec![0u8; DRAIN_BUF_SIZE];
        let mut result = Ok(());
        while !rd.end_of_stream {
            if let Err(e) = self.read_chunk(&mut rd, &mut scratch).await {
                result = Err(e);
                break;
            }
        }
        self.inner.set_read_deadline(None);
        result
    }
}

#[async_trait]
impl Conn for ChunkedConn {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, ConnError> {
        let mut rd = self.reader.lock().await;
        self.ensure_active()?;

        loop {
            match self.read_chunk(&mut rd, buf).await {
                // Only terminator bytes this pass
                Ok(ChunkRead::Data(0)) if !buf.is_empty() => continue,
                Ok(ChunkRead::Data(n)) => return Ok(n),
                Ok(ChunkRead::EndOfStream) => return Ok(0),
                Err(e) if self.is_active() => return Err(e),
                // A rejected head closes the session itself
                Err(ConnError::Malformed) => return Err(ConnError::Malformed),
                // Interrupted by close
                Err(_) => return Err(ConnError::Closed),
            }
        }
    }

    async fn write_vectored(&self, bufs: &[&[u8]]) -> Result<usize, ConnError> {
        let _writer = self.writer.lock().await;
        self.ensure_active()?;

        let total: usize = bufs.iter().map(|b| b.len()).sum();
        if total == 0 {
            // A zero chunk would end the stream; just flush any preamble
            self.inner.write(&[]).await?;
            return Ok(0);
        }

        let size = format!("{:x}\r\n", total);
        let mut slices = Vec::with_capacity(bufs.len() + 2);
        slices.push(size.as_bytes());
        slices.extend_from_slice(bufs);
        slices.push(TERMINATOR);

        self.inner.write_vectored(&slices).await?;
        trace!("Wrote {} byte chunk", total);
        Ok(total)
    }

    async fn close(&self) -> Result<(), ConnError> {
        let _close = self.close_lock.lock().await;
        {
            let mut state = lock(&self.state);
            if *state != SessionState::Active {
                return Ok(());
            }
            *state = SessionState::Closing;
        }

        let pool = self.pool.as_ref().and_then(Weak::upgrade);
        let pool = match pool {
            Some(pool) if self.header_state() == HeaderState::Established => pool,
            _ => return self.hard_close().await,
        };

        match self.drain().await {
            Ok(()) => {}
            Err(e) if e.is_timeout() => {
                debug!("No last chunk within {:?}, closing", self.drain_timeout);
                return self.hard_close().await;
            }
            Err(e) => {
                debug!("Graceful close failed, closing: {}", e);
                return self.hard_close().await;
            }
        }

        match pool.put(self.recycle()) {
            Ok(()) => {
                self.set_state(SessionState::Closed);
                debug!("Returned {:?} connection to pool", self.role);
                Ok(())
            }
            Err(_rejected) => {
                warn!("Pool rejected connection, closing");
                self.hard_close().await
            }
        }
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.inner.set_read_deadline(deadline)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr()
    }
}
