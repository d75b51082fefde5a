//! TLS record disguise
//!
//! Payload travels as plaintext TLS records. The server's first write is
//! announced by a fake ServerHello flight; the client's first write rides in
//! the session ticket extension of a fake ClientHello. Nothing is encrypted.

use super::tls::{
    self, CONTENT_APPLICATION_DATA, MAX_RECORD_PAYLOAD, MAX_TICKET_LEN, RECORD_HEADER_LEN,
};
use super::BrowserProfile;
use crate::conn::{read_full, BoxConn, Conn, ConnError, LeftoverConn};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// Server handshake records a client skips before payload
const SERVER_FLIGHT_RECORDS: usize = 2;

/// Which side of the fake handshake this connection plays
#[derive(Debug, Clone)]
pub enum RecordRole {
    /// Answers a client's ClientHello, echoing its session id
    Server { session_id: Bytes },
    /// Opens with a ClientHello naming `server_name`
    Client {
        server_name: String,
        profile: BrowserProfile,
    },
}

struct RecordReader {
    /// Payload bytes left in the current record
    frame_remaining: usize,
    hello_skipped: bool,
}

struct RecordWriter {
    handshake_sent: bool,
}

/// A connection disguised as a TLS session
pub struct RecordConn {
    inner: BoxConn,
    role: RecordRole,
    reader: Mutex<RecordReader>,
    writer: Mutex<RecordWriter>,
}

impl RecordConn {
    /// Server side, after the client's ClientHello has been consumed
    pub fn server(inner: BoxConn, session_id: Bytes) -> Self {
        Self::new(inner, RecordRole::Server { session_id })
    }

    /// Client side; the ClientHello goes out with the first write
    pub fn client(inner: BoxConn, server_name: impl Into<String>, profile: BrowserProfile) -> Self {
        Self::new(
            inner,
            RecordRole::Client {
                server_name: server_name.into(),
                profile: profile.resolve(),
            },
        )
    }

    fn new(inner: BoxConn, role: RecordRole) -> Self {
        let hello_skipped = matches!(role, RecordRole::Server { .. });
        Self {
            inner,
            role,
            reader: Mutex::new(RecordReader {
                frame_remaining: 0,
                hello_skipped,
            }),
            writer: Mutex::new(RecordWriter {
                handshake_sent: false,
            }),
        }
    }

    pub fn role(&self) -> &RecordRole {
        &self.role
    }

    /// Next record header, or `None` on a clean EOF before it
    async fn read_header(&self) -> Result<Option<[u8; RECORD_HEADER_LEN]>, ConnError> {
        let mut header = [0u8; RECORD_HEADER_LEN];
        let n = self.inner.read(&mut header).await?;
        if n == 0 {
            return Ok(None);
        }
        read_full(&self.inner, &mut header[n..]).await?;
        trace!("Record type {:#04x}, {} bytes", header[0], tls::record_len(&header));
        Ok(Some(header))
    }

    async fn skip_server_flight(&self) -> Result<(), ConnError> {
        let mut scratch = vec![0u8; MAX_RECORD_PAYLOAD];
        for _ in 0..SERVER_FLIGHT_RECORDS {
            let header = self.read_header().await?.ok_or(ConnError::ShortRead)?;
            let len = tls::record_len(&header);
            read_full(&self.inner, &mut scratch[..len]).await?;
        }
        Ok(())
    }
}

/// Split caller buffers into record-sized pieces; the first piece may use a
/// different limit.
fn split_pieces<'a>(bufs: &[&'a [u8]], first_limit: usize) -> Vec<&'a [u8]> {
    let mut pieces = Vec::with_capacity(bufs.len());
    for buf in bufs {
        let mut rest = *buf;
        while !rest.is_empty() {
            let limit = if pieces.is_empty() {
                first_limit
            } else {
                MAX_RECORD_PAYLOAD
            };
            let (head, tail) = rest.split_at(rest.len().min(limit));
            pieces.push(head);
            rest = tail;
        }
    }
    pieces
}

#[async_trait]
impl Conn for RecordConn {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, ConnError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut rd = self.reader.lock().await;

        if !rd.hello_skipped {
            self.skip_server_flight().await?;
            rd.hello_skipped = true;
        }

        // Empty records carry nothing; keep going
        while rd.frame_remaining == 0 {
            match self.read_header().await? {
                Some(header) => rd.frame_remaining = tls::record_len(&header),
                None => return Ok(0),
            }
        }

        let want = rd.frame_remaining.min(buf.len());
        let n = self.inner.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(ConnError::ShortRead);
        }
        rd.frame_remaining -= n;
        Ok(n)
    }

    async fn write_vectored(&self, bufs: &[&[u8]]) -> Result<usize, ConnError> {
        let mut wr = self.writer.lock().await;
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        if total == 0 {
            return Ok(0);
        }

        let first_limit = match (&self.role, wr.handshake_sent) {
            (RecordRole::Client { .. }, false) => MAX_TICKET_LEN,
            _ => MAX_RECORD_PAYLOAD,
        };
        let pieces = split_pieces(bufs, first_limit);
        let headers: Vec<_> = pieces
            .iter()
            .map(|p| tls::record_header(CONTENT_APPLICATION_DATA, p.len()))
            .collect();

        // The first piece of the session is framed by the handshake itself
        let handshake = if wr.handshake_sent {
            None
        } else {
            Some(match &self.role {
                RecordRole::Server { session_id } => tls::server_hello(session_id, pieces[0].len()),
                RecordRole::Client {
                    server_name,
                    profile,
                } => tls::client_hello(server_name, pieces[0], *profile),
            })
        };

        let mut slices: Vec<&[u8]> = Vec::with_capacity(pieces.len() * 2 + 1);
        let mut framed = pieces.iter().zip(&headers);
        if let Some(handshake) = &handshake {
            slices.push(handshake);
            if let Some((first, _)) = framed.next() {
                if matches!(self.role, RecordRole::Server { .. }) {
                    slices.push(first);
                }
            }
        }
        for (piece, header) in framed {
            slices.push(header);
            slices.push(piece);
        }

        self.inner.write_vectored(&slices).await?;
        if !wr.handshake_sent {
            trace!("Sent handshake with {} byte first piece", pieces[0].len());
            wr.handshake_sent = true;
        }
        Ok(total)
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

/// Build the server-side stack for an accepted ClientHello.
///
/// `after_hello` holds bytes read past the hello record; the ticket payload
/// is delivered first, then `after_hello` de-framed as records.
pub fn accept(raw: BoxConn, hello: &tls::ClientHello, after_hello: Bytes) -> BoxConn {
    let buffered = LeftoverConn::with_pending_read(raw, after_hello);
    let record = RecordConn::server(Box::new(buffered), hello.session_id.clone());
    Box::new(LeftoverConn::with_pending_read(
        Box::new(record),
        hello.session_ticket.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::pipe;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 241) as u8).collect()
    }

    async fn read_exactly(conn: &dyn Conn, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        read_full(conn, &mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_server_to_client_roundtrip() {
        let (a, b) = pipe();
        let server = RecordConn::server(Box::new(a), Bytes::from_static(&[7u8; 32]));
        let client = RecordConn::client(Box::new(b), "www.example.com", BrowserProfile::Chrome);

        for len in [0, 1, 1000, 16384] {
            let data = payload(len);
            assert_eq!(server.write(&data).await.unwrap(), len);
            assert_eq!(read_exactly(&client, len).await, data);
        }
    }

    #[tokio::test]
    async fn test_server_first_write_layout() {
        let (a, raw) = pipe();
        let session_id = Bytes::from_static(&[0xab; 32]);
        let server = RecordConn::server(Box::new(a), session_id.clone());
        server.write(b"hello").await.unwrap();
        server.write(b"world").await.unwrap();

        let expected_flight = tls::server_hello(&session_id, 5);
        let flight = read_exactly(&raw, expected_flight.len()).await;
        assert_eq!(&flight[..3], &[0x16, 0x03, 0x03]);
        // Random bytes differ; the echoed session id does not
        assert_eq!(&flight[44..76], &session_id[..]);
        assert_eq!(&flight[flight.len() - 2..], &[0x00, 0x05]);

        assert_eq!(read_exactly(&raw, 5).await, b"hello");
        assert_eq!(
            read_exactly(&raw, 10).await,
            b"\x17\x03\x03\x00\x05world"
        );
    }

    #[tokio::test]
    async fn test_client_first_write_is_client_hello() {
        let (a, raw) = pipe();
        let client = RecordConn::client(Box::new(a), "cdn.example.org", BrowserProfile::Firefox);
        client.write_vectored(&[b"first ", b"piece"]).await.unwrap();
        client.write(b"next").await.unwrap();

        let mut buf = vec![0u8; 4096];
        let mut got = Vec::new();
        let hello = loop {
            let n = raw.read(&mut buf).await.unwrap();
            got.extend_from_slice(&buf[..n]);
            if let Some(hello) = tls::parse_client_hello(&got) {
                break hello;
            }
        };
        // Each caller buffer is framed on its own; only the first rides in
        // the ticket
        assert_eq!(&hello.session_ticket[..], b"first ");
        assert_eq!(hello.server_name.as_deref(), Some("cdn.example.org"));

        let expected = b"\x17\x03\x03\x00\x05piece\x17\x03\x03\x00\x04next";
        let mut rest = got.split_off(hello.len);
        while rest.len() < expected.len() {
            let n = raw.read(&mut buf).await.unwrap();
            rest.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&rest[..], &expected[..]);
    }

    #[tokio::test]
    async fn test_large_write_is_split() {
        let (a, b) = pipe();
        let server = RecordConn::server(Box::new(a), Bytes::new());
        let client = RecordConn::client(Box::new(b), "a.example", BrowserProfile::Chrome);

        let data = payload(40_000);
        let send = {
            let data = data.clone();
            tokio::spawn(async move {
                server.write(&data).await.unwrap();
                server
            })
        };
        assert_eq!(read_exactly(&client, data.len()).await, data);
        send.await.unwrap();
    }

    #[tokio::test]
    async fn test_reads_records_of_any_type() {
        let (a, raw) = pipe();
        let server = RecordConn::server(Box::new(a), Bytes::new());
        raw.write(b"\x17\x03\x03\x00\x00\x16\x03\x01\x00\x03abc\x17\x03\x03\x00\x02de")
            .await
            .unwrap();

        assert_eq!(read_exactly(&server, 5).await, b"abcde");
    }

    #[tokio::test]
    async fn test_eof_at_record_boundary() {
        let (a, raw) = pipe();
        let server = RecordConn::server(Box::new(a), Bytes::new());
        raw.write(b"\x17\x03\x03\x00\x02hi").await.unwrap();
        raw.close().await.unwrap();

        assert_eq!(read_exactly(&server, 2).await, b"hi");
        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_eof_inside_record() {
        let (a, raw) = pipe();
        let server = RecordConn::server(Box::new(a), Bytes::new());
        raw.write(b"\x17\x03\x03\x00\x08hi").await.unwrap();
        raw.close().await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).await.unwrap(), 2);
        assert!(matches!(server.read(&mut buf).await, Err(ConnError::ShortRead)));
    }

    #[test]
    fn test_split_pieces() {
        let big = vec![0u8; MAX_RECORD_PAYLOAD + 10];
        let pieces = split_pieces(&[b"", &big, b"xy"], 4);
        let lens: Vec<_> = pieces.iter().map(|p| p.len()).collect();
        assert_eq!(lens, vec![4, MAX_RECORD_PAYLOAD, 6, 2]);
    }
}
