//! TCP transport

use super::{StreamConn, TransportConfig};
use crate::conn::ConnError;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

/// A TCP connection
pub type TcpConn = StreamConn<OwnedReadHalf, OwnedWriteHalf>;

impl StreamConn<OwnedReadHalf, OwnedWriteHalf> {
    /// Dial `addr` within the configured connect timeout
    pub async fn connect(addr: &str, config: &TransportConfig) -> Result<Self, ConnError> {
        let stream = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| ConnError::ConnectionFailed(format!("Timed out connecting to {}", addr)))?
            .map_err(|e| ConnError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        debug!("Connected to {}", addr);
        Ok(Self::from_stream(stream, config))
    }

    /// Adopt an established stream (e.g. from `accept`)
    pub fn from_stream(stream: TcpStream, config: &TransportConfig) -> Self {
        if config.nodelay {
            stream.set_nodelay(true).ok();
        }
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer, peer)
    }
}
