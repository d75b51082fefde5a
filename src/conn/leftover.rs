//! Connection with pending read and write blocks
//!
//! Bytes pulled off the wire while sniffing or parsing a disguise header are
//! pushed back here and replayed before the next real read. A disguise
//! preamble queued as a pending write goes out fused with the caller's first
//! write, in a single vectored write.

use super::{BoxConn, Conn, ConnError};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// A connection that replays read-ahead bytes and prepends a queued preamble
pub struct LeftoverConn {
    inner: BoxConn,
    pending_read: Mutex<Bytes>,
    pending_write: Mutex<Option<Bytes>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl LeftoverConn {
    /// Wrap a connection with nothing pending
    pub fn new(inner: BoxConn) -> Self {
        Self::with_pending(inner, Bytes::new(), None)
    }

    /// Wrap a connection that must first replay `read`
    pub fn with_pending_read(inner: BoxConn, read: impl Into<Bytes>) -> Self {
        Self::with_pending(inner, read, None)
    }

    /// Wrap a connection with both pending blocks
    pub fn with_pending(inner: BoxConn, read: impl Into<Bytes>, write: Option<Bytes>) -> Self {
        Self {
            inner,
            pending_read: Mutex::new(read.into()),
            pending_write: Mutex::new(write.filter(|w| !w.is_empty())),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Queue a block to be sent ahead of the next write, replacing any
    /// block not yet sent.
    pub fn set_pending_write(&self, block: impl Into<Bytes>) {
        let block = block.into();
        *lock(&self.pending_write) = (!block.is_empty()).then_some(block);
    }

    /// Push bytes back in front of any pending read block
    pub fn unread(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut pending = lock(&self.pending_read);
        if pending.is_empty() {
            *pending = Bytes::copy_from_slice(bytes);
        } else {
            let mut joined = BytesMut::with_capacity(bytes.len() + pending.len());
            joined.extend_from_slice(bytes);
            joined.extend_from_slice(&pending);
            *pending = joined.freeze();
        }
    }

    /// Whether either pending block still holds bytes
    pub fn has_pending(&self) -> bool {
        !lock(&self.pending_read).is_empty() || lock(&self.pending_write).is_some()
    }

    fn take_pending_read(&self, buf: &mut [u8]) -> Option<usize> {
        let mut pending = lock(&self.pending_read);
        if pending.is_empty() {
            return None;
        }
        let n = pending.len().min(buf.len());
        buf[..n].copy_from_slice(&pending[..n]);
        pending.advance(n);
        Some(n)
    }
}

/// Lock a pending block. A poisoned lock still holds consistent bytes since
/// every critical section is a plain swap or copy.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Conn for LeftoverConn {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, ConnError> {
        if let Some(n) = self.take_pending_read(buf) {
            return Ok(n);
        }
        self.inner.read(buf).await
    }

    async fn write_vectored(&self, bufs: &[&[u8]]) -> Result<usize, ConnError> {
        let _guard = self.write_lock.lock().await;

        let pending = lock(&self.pending_write).take();
        let Some(preamble) = pending else {
            return self.inner.write_vectored(bufs).await;
        };

        let mut slices = Vec::with_capacity(bufs.len() + 1);
        slices.push(&preamble[..]);
        slices.extend_from_slice(bufs);
        let result = self.inner.write_vectored(&slices).await;
        drop(slices);

        match result {
            Ok(_) => {
                trace!("Flushed {} byte preamble", preamble.len());
                Ok(bufs.iter().map(|b| b.len()).sum())
            }
            Err(e) => {
                *lock(&self.pending_write) = Some(preamble);
                Err(e)
            }
        }
    }

    async fn close(&self) -> Result<(), ConnError> {
        self.inner.close().await
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.inner.set_read_deadline(deadline)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr()
    }
}
