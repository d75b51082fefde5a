//! [`Conn`] over any tokio stream halves, with interruptible read deadlines

use crate::conn::{Conn, ConnError};
use async_trait::async_trait;
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{
    split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf,
};
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep_until, Instant};
use tracing::trace;

/// Buffer size of each direction of an in-memory pipe
const PIPE_CAPACITY: usize = 64 * 1024;

/// Read deadline shared with blocked readers.
///
/// `interrupts` is bumped whenever a deadline that is already due gets set,
/// so a reader blocked before the call fails even if the deadline is
/// cleared again before the reader wakes up.
#[derive(Debug, Clone, Copy, Default)]
struct ReadDeadline {
    at: Option<Instant>,
    interrupts: u64,
}

fn is_due(at: Option<Instant>) -> bool {
    at.is_some_and(|at| at <= Instant::now())
}

/// A connection over separate read and write halves
pub struct StreamConn<R, W> {
    reader: Mutex<R>,
    writer: Mutex<Option<W>>,
    deadline: watch::Sender<ReadDeadline>,
    closed: AtomicBool,
    peer: Option<SocketAddr>,
}

impl<R, W> StreamConn<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Create a connection from stream halves
    pub fn new(reader: R, writer: W, peer: Option<SocketAddr>) -> Self {
        let (deadline, _) = watch::channel(ReadDeadline::default());
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(Some(writer)),
            deadline,
            closed: AtomicBool::new(false),
            peer,
        }
    }

    /// Check if the connection has been closed locally
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn interrupted(&self) -> ConnError {
        if self.is_closed() {
            ConnError::Closed
        } else {
            ConnError::Timeout
        }
    }
}

#[async_trait]
impl<R, W> Conn for StreamConn<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn read(&self, buf: &mut [u8]) -> Result<usize, ConnError> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }

        let mut deadline = self.deadline.subscribe();
        let start = *deadline.borrow_and_update();
        if is_due(start.at) {
            return Err(ConnError::Timeout);
        }

        let mut reader = self.reader.lock().await;
        loop {
            let current = *deadline.borrow_and_update();
            if current.interrupts != start.interrupts || is_due(current.at) {
                return Err(self.interrupted());
            }

            let expiry = async move {
                match current.at {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                res = reader.read(buf) => return Ok(res?),
                _ = expiry => return Err(self.interrupted()),
                _ = deadline.changed() => continue,
            }
        }
    }

    async fn write_vectored(&self, bufs: &[&[u8]]) -> Result<usize, ConnError> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ConnError::Closed)?;

        let total = bufs.iter().map(|b| b.len()).sum();
        let mut slices: Vec<IoSlice<'_>> = bufs
            .iter()
            .filter(|b| !b.is_empty())
            .map(|b| IoSlice::new(b))
            .collect();
        let mut remaining = &mut slices[..];

        while !remaining.is_empty() {
            let n = writer.write_vectored(remaining).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }
            IoSlice::advance_slices(&mut remaining, n);
        }
        writer.flush().await?;

        Ok(total)
    }

    async fn close(&self) -> Result<(), ConnError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Wake any blocked reader; it reports Closed from now on
        self.deadline.send_modify(|d| d.interrupts += 1);

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                trace!("Shutdown error ignored: {}", e);
            }
        }
        Ok(())
    }

    fn set_read_deadline(&self, at: Option<Instant>) {
        self.deadline.send_modify(|d| {
            d.at = at;
            if is_due(at) {
                d.interrupts += 1;
            }
        });
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// One end of an in-memory pipe
pub type PipeConn = StreamConn<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// Create a connected pair of in-memory connections
pub fn pipe() -> (PipeConn, PipeConn) {
    let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
    let (a_read, a_write) = split(a);
    let (b_read, b_write) = split(b);
    (
        StreamConn::new(a_read, a_write, None),
        StreamConn::new(b_read, b_write, None),
    )
}
