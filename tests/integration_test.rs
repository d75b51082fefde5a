//! Integration tests for Obfs Tunnel
//!
//! Tests the full client-server flow over loopback TCP including:
//! - Chunked HTTP sessions through the classifying listener
//! - Graceful close and connection reuse
//! - TLS record sessions
//! - WebSocket upgrade and passthrough classification
//! - End-to-end relaying to a target

use obfs_tunnel::conn::{read_full, Conn, ConnError};
use obfs_tunnel::obfuscation::{Connector, DisguiseKind, DisguiseMode, HeaderState};
use obfs_tunnel::pool::{ConnPool, IdlePool};
use obfs_tunnel::transport::{ListenerConfig, ObfsListener, TcpConn, TransportConfig};
use obfs_tunnel::tunnel;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

async fn listener() -> (ObfsListener, String) {
    let listener = ObfsListener::bind(
        "127.0.0.1:0",
        ListenerConfig::default(),
        TransportConfig::default(),
    )
    .await
    .expect("Failed to bind listener");
    let addr = listener.local_addr().to_string();
    (listener, addr)
}

async fn read_exact(conn: &dyn Conn, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    read_full(conn, &mut buf).await.unwrap();
    buf
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

/// Start a TCP echo server
async fn echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// Test a chunked session through the listener with small and large reads
#[tokio::test]
async fn test_chunked_session() {
    let (listener, addr) = listener().await;
    let connector = Connector::new(addr);

    let client = connector.connect_http().await.unwrap();
    client.write(b"hello").await.unwrap();

    let accepted = listener.accept().await.unwrap();
    assert_eq!(accepted.kind, DisguiseKind::Chunked);
    let server = accepted.conn;
    assert_eq!(read_exact(&*server, 5).await, b"hello");

    let data = payload(64 * 1024);
    let send = {
        let data = data.clone();
        tokio::spawn(async move {
            for piece in data.chunks(5000) {
                server.write(piece).await.unwrap();
            }
            server
        })
    };

    // Byte at a time first, then large reads
    let mut got = Vec::new();
    let mut one = [0u8; 1];
    for _ in 0..100 {
        assert_eq!(client.read(&mut one).await.unwrap(), 1);
        got.push(one[0]);
    }
    let mut buf = vec![0u8; 64 * 1024];
    while got.len() < data.len() {
        let n = client.read(&mut buf).await.unwrap();
        assert!(n > 0);
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(got, data);
    assert_eq!(client.header_state(), HeaderState::Established);
    send.await.unwrap();
}

/// Test that a graceful close returns the transport for the next session
#[tokio::test]
async fn test_graceful_close_reuses_connection() {
    let (listener, addr) = listener().await;
    let pool = Arc::new(IdlePool::new(4, Duration::from_secs(60)));
    let connector = Connector::new(addr).with_pool(pool.clone());

    // First session
    let client = Arc::new(connector.connect_http().await.unwrap());
    client.write(b"one").await.unwrap();
    let server = listener.accept().await.unwrap().conn;
    let first_peer = server.peer_addr();
    assert_eq!(read_exact(&*server, 3).await, b"one");
    server.write(b"ack").await.unwrap();
    assert_eq!(read_exact(&*client, 3).await, b"ack");

    let closing = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.close().await })
    };
    let mut buf = [0u8; 16];
    assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    server.close().await.unwrap();
    closing.await.unwrap().unwrap();
    assert_eq!(pool.len(), 1);

    // Second session rides the same TCP connection
    let client = connector.connect_http().await.unwrap();
    assert!(pool.is_empty());
    client.write(b"two").await.unwrap();

    let accepted = listener.accept().await.unwrap();
    assert_eq!(accepted.kind, DisguiseKind::Chunked);
    assert_eq!(accepted.conn.peer_addr(), first_peer);
    assert_eq!(read_exact(&*accepted.conn, 3).await, b"two");
    accepted.conn.write(b"ok").await.unwrap();
    assert_eq!(read_exact(&client, 2).await, b"ok");
}

/// Test that concurrent closes on both ends settle cleanly
#[tokio::test]
async fn test_concurrent_close() {
    let (listener, addr) = listener().await;
    let pool = Arc::new(IdlePool::default());
    let connector = Connector::new(addr).with_pool(pool.clone());

    let client = connector.connect_http().await.unwrap();
    client.write(b"x").await.unwrap();
    let server = listener.accept().await.unwrap().conn;
    assert_eq!(read_exact(&*server, 1).await, b"x");
    server.write(b"y").await.unwrap();
    assert_eq!(read_exact(&client, 1).await, b"y");

    let (a, b, c) = tokio::join!(client.close(), client.close(), server.close());
    a.unwrap();
    b.unwrap();
    c.unwrap();
    assert_eq!(pool.len(), 1);

    assert!(matches!(client.write(b"late").await, Err(ConnError::Closed)));
}

/// Test TLS record sessions for a range of payload sizes
#[tokio::test]
async fn test_tls_record_session() {
    let (listener, addr) = listener().await;
    let connector = Connector::new(addr)
        .with_mode(DisguiseMode::Tls)
        .with_hosts(vec!["www.example.com".into()]);

    let client = connector.connect().await.unwrap();
    client.write(b"hello").await.unwrap();

    let accepted = listener.accept().await.unwrap();
    assert_eq!(accepted.kind, DisguiseKind::Tls);
    let server = accepted.conn;
    assert_eq!(read_exact(&*server, 5).await, b"hello");

    for len in [0, 1, 1000, 16384] {
        let data = payload(len);
        assert_eq!(server.write(&data).await.unwrap(), len);
        assert_eq!(read_exact(&*client, len).await, data);

        assert_eq!(client.write(&data).await.unwrap(), len);
        assert_eq!(read_exact(&*server, len).await, data);
    }
}

/// Test the WebSocket upgrade handshake
#[tokio::test]
async fn test_websocket_upgrade() {
    let (listener, addr) = listener().await;
    let raw = TcpConn::connect(&addr, &TransportConfig::default()).await.unwrap();
    raw.write(
        b"GET /chat HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\n\
          Connection: keep-alive, Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
    )
    .await
    .unwrap();

    let accepted = listener.accept().await.unwrap();
    assert_eq!(accepted.kind, DisguiseKind::WebSocket);
    accepted.conn.write(b"frame").await.unwrap();

    let mut wire = Vec::new();
    let mut buf = [0u8; 1024];
    while !wire.ends_with(b"frame") {
        let n = raw.read(&mut buf).await.unwrap();
        assert!(n > 0);
        wire.extend_from_slice(&buf[..n]);
    }
    let text = String::from_utf8_lossy(&wire);
    assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
}

/// Test that unrecognized traffic is replayed byte for byte
#[tokio::test]
async fn test_passthrough_preserves_bytes() {
    let (listener, addr) = listener().await;
    let raw = TcpConn::connect(&addr, &TransportConfig::default()).await.unwrap();

    let first = b"\x05\x01\x00 socks greeting";
    raw.write(first).await.unwrap();
    let accepted = listener.accept().await.unwrap();
    assert_eq!(accepted.kind, DisguiseKind::Passthrough);

    raw.write(b" and more").await.unwrap();
    let expected = [&first[..], b" and more"].concat();
    assert_eq!(read_exact(&*accepted.conn, expected.len()).await, expected);
}

/// Test that a malformed chunk size line is rejected
#[tokio::test]
async fn test_malformed_chunk_line() {
    let (listener, addr) = listener().await;
    let raw = TcpConn::connect(&addr, &TransportConfig::default()).await.unwrap();
    raw.write(b"POST /upload HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n")
        .await
        .unwrap();

    let accepted = listener.accept().await.unwrap();
    assert_eq!(accepted.kind, DisguiseKind::Chunked);
    let mut buf = [0u8; 16];
    assert!(matches!(
        accepted.conn.read(&mut buf).await,
        Err(ConnError::Malformed)
    ));
}

/// Test end-to-end relaying to an echo target in both disguise modes
#[tokio::test]
async fn test_relay_through_disguise() {
    let target = echo_server().await;
    let (listener, addr) = listener().await;

    let server = tokio::spawn(async move {
        for _ in 0..2 {
            let accepted = listener.accept().await.unwrap();
            let target = target.clone();
            tokio::spawn(async move {
                let upstream = TcpConn::connect(&target, &TransportConfig::default())
                    .await
                    .unwrap();
                tunnel::relay(&*accepted.conn, &upstream).await;
            });
        }
        listener
    });

    for mode in [DisguiseMode::Http, DisguiseMode::Tls] {
        let connector = Connector::new(addr.clone()).with_mode(mode);
        let conn = connector.connect().await.unwrap();

        let data = payload(30_000);
        conn.write(&data).await.unwrap();
        assert_eq!(read_exact(&*conn, data.len()).await, data, "mode {:?}", mode);
        conn.close().await.unwrap();
    }

    server.await.unwrap();
}

#[test]
fn test_pool_trait_object() {
    let pool: Arc<dyn ConnPool> = Arc::new(IdlePool::default());
    assert!(pool.get_nonblocking().is_none());
}
