//! Byte-stream connection capability
//!
//! Every layer of the disguise stack implements [`Conn`] and wraps an owned
//! inner `Conn`. Wrappers are built innermost first:
//!
//! ```text
//! LeftoverConn(ticket) -> RecordConn -> LeftoverConn(read-ahead) -> TcpConn
//! ChunkedConn -> LeftoverConn(preamble / read-ahead) -> TcpConn
//! ```
//!
//! All methods take `&self`: one task may read while another writes and a
//! third closes the same connection.

mod leftover;

pub use leftover::LeftoverConn;

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;

/// Connection layer errors
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Any violation of a disguise wire format; the failed check is only
    /// logged
    #[error("Malformed stream")]
    Malformed,

    #[error("Short read")]
    ShortRead,

    #[error("Use of closed connection")]
    Closed,

    #[error("Read deadline exceeded")]
    Timeout,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

impl ConnError {
    /// Whether this error came from a read deadline
    pub fn is_timeout(&self) -> bool {
        match self {
            ConnError::Timeout => true,
            ConnError::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

/// A bidirectional byte stream
#[async_trait]
pub trait Conn: Send + Sync {
    /// Read into `buf`. `Ok(0)` on a non-empty buffer is a clean end of stream.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, ConnError>;

    /// Write all of `buf`, returning `buf.len()` on success.
    async fn write(&self, buf: &[u8]) -> Result<usize, ConnError> {
        self.write_vectored(&[buf]).await
    }

    /// Write every buffer in order as one logical write. Returns the total
    /// number of caller bytes; on error nothing is reported as written.
    async fn write_vectored(&self, bufs: &[&[u8]]) -> Result<usize, ConnError>;

    /// Close the connection.
    async fn close(&self) -> Result<(), ConnError>;

    /// Set or clear the read deadline. A deadline that is already due
    /// interrupts a blocked `read` with [`ConnError::Timeout`].
    fn set_read_deadline(&self, deadline: Option<Instant>);

    /// Remote address, if the transport has one
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Type-erased connection handed between layers
pub type BoxConn = Box<dyn Conn>;

#[async_trait]
impl<C: Conn + ?Sized> Conn for Box<C> {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, ConnError> {
        (**self).read(buf).await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, ConnError> {
        (**self).write(buf).await
    }

    async fn write_vectored(&self, bufs: &[&[u8]]) -> Result<usize, ConnError> {
        (**self).write_vectored(bufs).await
    }

    async fn close(&self) -> Result<(), ConnError> {
        (**self).close().await
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        (**self).set_read_deadline(deadline)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        (**self).peer_addr()
    }
}

#[async_trait]
impl<C: Conn + ?Sized> Conn for Arc<C> {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, ConnError> {
        (**self).read(buf).await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, ConnError> {
        (**self).write(buf).await
    }

    async fn write_vectored(&self, bufs: &[&[u8]]) -> Result<usize, ConnError> {
        (**self).write_vectored(bufs).await
    }

    async fn close(&self) -> Result<(), ConnError> {
        (**self).close().await
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        (**self).set_read_deadline(deadline)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        (**self).peer_addr()
    }
}

/// Fill `buf` completely, failing with [`ConnError::ShortRead`] on EOF.
pub async fn read_full<C: Conn + ?Sized>(conn: &C, buf: &mut [u8]) -> Result<(), ConnError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = conn.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(ConnError::ShortRead);
        }
        filled += n;
    }
    Ok(())
}
