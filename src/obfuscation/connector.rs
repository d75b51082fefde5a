//! Client-side disguised connections

use super::chunked::{ChunkedConn, DEFAULT_DRAIN_TIMEOUT};
use super::{http, random_bytes, BrowserProfile, RecordConn, DEFAULT_OBFS_HOST};
use crate::conn::{BoxConn, ConnError, LeftoverConn};
use crate::pool::ConnPool;
use crate::transport::{TcpConn, TransportConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Disguise spoken by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisguiseMode {
    /// Chunked HTTP upload with connection reuse
    #[default]
    Http,
    /// Plaintext TLS records
    Tls,
}

/// Dials the server and wraps the transport in the client disguise
pub struct Connector {
    server: String,
    mode: DisguiseMode,
    hosts: Vec<String>,
    profile: BrowserProfile,
    transport: TransportConfig,
    pool: Option<Arc<dyn ConnPool>>,
    drain_timeout: Duration,
}

impl Connector {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            mode: DisguiseMode::default(),
            hosts: Vec::new(),
            profile: BrowserProfile::default(),
            transport: TransportConfig::default(),
            pool: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_mode(mut self, mode: DisguiseMode) -> Self {
        self.mode = mode;
        self
    }

    /// Masquerade hosts; one is picked per session
    pub fn with_hosts(mut self, hosts: Vec<String>) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn with_profile(mut self, profile: BrowserProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Reuse connections from `pool`; chunked sessions are returned to it
    /// when they close gracefully
    pub fn with_pool(mut self, pool: Arc<dyn ConnPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn pool(&self) -> Option<&Arc<dyn ConnPool>> {
        self.pool.as_ref()
    }

    /// Pick the masquerade host for the next session
    pub fn masquerade_host(&self) -> &str {
        match self.hosts.len() {
            0 => DEFAULT_OBFS_HOST,
            1 => &self.hosts[0],
            n => {
                let mut buf = [0u8; 4];
                random_bytes(&mut buf);
                &self.hosts[u32::from_be_bytes(buf) as usize % n]
            }
        }
    }

    /// Open a session in the configured mode
    pub async fn connect(&self) -> Result<BoxConn, ConnError> {
        match self.mode {
            DisguiseMode::Http => Ok(Box::new(self.connect_http().await?)),
            DisguiseMode::Tls => Ok(Box::new(self.connect_tls().await?)),
        }
    }

    /// Chunked HTTP session, reusing a pooled connection when one is idle.
    ///
    /// Nothing is sent until the first write; the request preamble goes out
    /// fused with it.
    pub async fn connect_http(&self) -> Result<ChunkedConn, ConnError> {
        let conn = match self.pool.as_ref().and_then(|pool| pool.get_nonblocking()) {
            Some(conn) => {
                debug!("Reusing pooled connection to {}", self.server);
                conn
            }
            None => {
                let tcp = TcpConn::connect(&self.server, &self.transport).await?;
                ChunkedConn::client(LeftoverConn::new(Box::new(tcp)))
                    .with_pool(self.pool.as_ref().map(Arc::downgrade))
                    .with_drain_timeout(self.drain_timeout)
            }
        };

        let host = self.masquerade_host();
        conn.begin_request(http::client_request(host, self.profile.resolve()));
        debug!("Chunked session to {} as {}", self.server, host);
        Ok(conn)
    }

    /// TLS record session over a fresh connection
    pub async fn connect_tls(&self) -> Result<RecordConn, ConnError> {
        let tcp = TcpConn::connect(&self.server, &self.transport).await?;
        let host = self.masquerade_host();
        debug!("TLS session to {} as {}", self.server, host);
        Ok(RecordConn::client(Box::new(tcp), host, self.profile))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Conn;
    use crate::obfuscation::HeaderState;
    use crate::pool::IdlePool;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_masquerade_host_selection() {
        let connector = Connector::new("127.0.0.1:1");
        assert_eq!(connector.masquerade_host(), DEFAULT_OBFS_HOST);

        let connector = connector.with_hosts(vec!["a.example".into()]);
        assert_eq!(connector.masquerade_host(), "a.example");

        let hosts = vec!["a.example".to_string(), "b.example".to_string()];
        let connector = connector.with_hosts(hosts.clone());
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let picked = connector.masquerade_host();
            assert!(hosts.iter().any(|h| h == picked));
            seen.insert(picked.to_string());
        }
        assert_eq!(seen.len(), hosts.len());
    }

    #[test]
    fn test_mode_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: DisguiseMode,
        }
        let parsed: Wrapper = toml::from_str("mode = \"tls\"").unwrap();
        assert_eq!(parsed.mode, DisguiseMode::Tls);
    }

    #[tokio::test]
    async fn test_preamble_is_fused_with_first_write() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connector = Connector::new(addr.to_string()).with_hosts(vec!["cdn.example".into()]);
        let conn = connector.connect_http().await.unwrap();
        assert_eq!(conn.header_state(), HeaderState::AwaitResponse);

        let (mut socket, _) = listener.accept().await.unwrap();
        conn.write(b"payload").await.unwrap();

        let mut wire = Vec::new();
        let mut buf = [0u8; 4096];
        while !wire.ends_with(b"7\r\npayload\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0);
            wire.extend_from_slice(&buf[..n]);
        }
        let head = http::parse_request(&wire).unwrap().unwrap();
        assert_eq!(head.value("Host"), Some(&b"cdn.example"[..]));
        assert_eq!(head.value("X-Online-Host"), Some(&b"cdn.example"[..]));
        assert_eq!(&wire[head.head_len()..], b"7\r\npayload\r\n");
    }

    #[tokio::test]
    async fn test_pooled_connection_is_preferred() {
        let pool = Arc::new(IdlePool::default());
        let (a, _b) = crate::transport::pipe();
        pool.put(ChunkedConn::client(LeftoverConn::new(Box::new(a))))
            .ok();

        // Nothing listens here; only the pool can satisfy the request
        let connector = Connector::new("127.0.0.1:1").with_pool(pool.clone());
        let conn = connector.connect_http().await.unwrap();
        assert_eq!(conn.header_state(), HeaderState::AwaitResponse);
        assert!(pool.is_empty());
    }
}
