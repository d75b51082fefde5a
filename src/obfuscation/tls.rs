//! Cosmetic TLS handshake messages
//!
//! Nothing here does real TLS. The ClientHello parser extracts just enough
//! (session id, session ticket, SNI) to answer in kind, and the generators
//! produce plausible plaintext handshake flights around tunnel payload.
//!
//! Record format:
//! ```text
//! +--------+--------+--------+--------+--------+------------
//! |  Type  |     Version     |     Length      |  Payload...
//! +--------+--------+--------+--------+--------+------------
//! ```

use super::{random_bytes, BrowserProfile};
use bytes::{BufMut, Bytes, BytesMut};

/// Record header size in bytes
pub const RECORD_HEADER_LEN: usize = 5;

/// Largest plaintext record payload
pub const MAX_RECORD_PAYLOAD: usize = 16384;

/// Largest ClientHello record accepted from a client
pub const MAX_HELLO_RECORD: usize = RECORD_HEADER_LEN + MAX_RECORD_PAYLOAD;

/// Largest payload piece carried in a ClientHello session ticket
pub const MAX_TICKET_LEN: usize = 15 * 1024;

pub const CONTENT_CHANGE_CIPHER_SPEC: u8 = 0x14;
pub const CONTENT_HANDSHAKE: u8 = 0x16;
pub const CONTENT_APPLICATION_DATA: u8 = 0x17;

pub const VERSION_SSL30: u16 = 0x0300;
pub const VERSION_TLS10: u16 = 0x0301;
pub const VERSION_TLS12: u16 = 0x0303;

const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const HANDSHAKE_SERVER_HELLO: u8 = 0x02;

const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_STATUS_REQUEST: u16 = 0x0005;
const EXT_SUPPORTED_GROUPS: u16 = 0x000a;
const EXT_EC_POINT_FORMATS: u16 = 0x000b;
const EXT_SIGNATURE_ALGORITHMS: u16 = 0x000d;
const EXT_ALPN: u16 = 0x0010;
const EXT_EXTENDED_MASTER_SECRET: u16 = 0x0017;
const EXT_SESSION_TICKET: u16 = 0x0023;
const EXT_RENEGOTIATION_INFO: u16 = 0xff01;

/// TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
const SERVER_CIPHER_SUITE: u16 = 0xc02f;

const SIGNATURE_ALGORITHMS: [u16; 8] = [
    0x0403, 0x0804, 0x0401, 0x0503, 0x0805, 0x0501, 0x0806, 0x0601,
];

/// The fields of a client's ClientHello the disguise cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    /// Bytes taken by the ClientHello record, header included
    pub len: usize,
    pub session_id: Bytes,
    pub session_ticket: Bytes,
    pub server_name: Option<String>,
}

/// Bounds-checked big-endian reader
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() < n {
            return None;
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }

    /// A u8-length-prefixed vector
    fn vec8(&mut self) -> Option<&'a [u8]> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    /// A u16-length-prefixed vector
    fn vec16(&mut self) -> Option<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }
}

/// Parse the ClientHello record at the start of `buf`.
///
/// Returns `None` unless `buf` holds one complete handshake record carrying
/// one complete ClientHello.
pub fn parse_client_hello(buf: &[u8]) -> Option<ClientHello> {
    let mut record = Reader::new(buf);
    if record.u8()? != CONTENT_HANDSHAKE {
        return None;
    }
    let _version = record.u16()?;
    let body = record.vec16()?;
    let len = RECORD_HEADER_LEN + body.len();

    let mut handshake = Reader::new(body);
    if handshake.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let hello_len = handshake.u24()?;
    let mut hello = Reader::new(handshake.take(hello_len)?);

    let _client_version = hello.u16()?;
    let _random = hello.take(32)?;
    let session_id = hello.vec8()?;
    if session_id.len() > 32 {
        return None;
    }
    let _cipher_suites = hello.vec16()?;
    let _compression = hello.vec8()?;

    let mut session_ticket: &[u8] = &[];
    let mut server_name = None;

    if !hello.is_empty() {
        let mut extensions = Reader::new(hello.vec16()?);
        while !extensions.is_empty() {
            let ext_type = extensions.u16()?;
            let data = extensions.vec16()?;
            match ext_type {
                EXT_SESSION_TICKET => session_ticket = data,
                EXT_SERVER_NAME => server_name = parse_server_name(data),
                _ => {}
            }
        }
    }

    Some(ClientHello {
        len,
        session_id: Bytes::copy_from_slice(session_id),
        session_ticket: Bytes::copy_from_slice(session_ticket),
        server_name,
    })
}

fn parse_server_name(data: &[u8]) -> Option<String> {
    let mut list = Reader::new(Reader::new(data).vec16()?);
    while !list.is_empty() {
        let name_type = list.u8()?;
        let name = list.vec16()?;
        if name_type == 0 {
            return String::from_utf8(name.to_vec()).ok();
        }
    }
    None
}

/// Record header for `len` payload bytes
pub fn record_header(content_type: u8, len: usize) -> [u8; RECORD_HEADER_LEN] {
    let [hi, lo] = (len as u16).to_be_bytes();
    let [vhi, vlo] = VERSION_TLS12.to_be_bytes();
    [content_type, vhi, vlo, hi, lo]
}

/// Payload length declared by a record header
pub fn record_len(header: &[u8; RECORD_HEADER_LEN]) -> usize {
    u16::from_be_bytes([header[3], header[4]]) as usize
}

/// Server handshake flight answering a ClientHello.
///
/// ServerHello echoing `session_id`, a ChangeCipherSpec, then the header of
/// a handshake record of `disguised_len` bytes; the caller's first payload
/// piece must follow directly as that record's body.
pub fn server_hello(session_id: &[u8], disguised_len: usize) -> BytesMut {
    let mut hello = BytesMut::with_capacity(128);
    hello.put_u16(VERSION_TLS12);
    hello.put_slice(&random32());
    hello.put_u8(session_id.len() as u8);
    hello.put_slice(session_id);
    hello.put_u16(SERVER_CIPHER_SUITE);
    hello.put_u8(0);

    let mut extensions = BytesMut::with_capacity(32);
    put_extension(&mut extensions, EXT_RENEGOTIATION_INFO, &[0]);
    put_extension(&mut extensions, EXT_EXTENDED_MASTER_SECRET, &[]);
    put_extension(&mut extensions, EXT_SESSION_TICKET, &[]);
    hello.put_u16(extensions.len() as u16);
    hello.put_slice(&extensions);

    let handshake_len = 4 + hello.len();
    let mut out = BytesMut::with_capacity(RECORD_HEADER_LEN * 3 + handshake_len + 1);
    out.put_slice(&record_header(CONTENT_HANDSHAKE, handshake_len));
    out.put_u8(HANDSHAKE_SERVER_HELLO);
    out.put_uint(hello.len() as u64, 3);
    out.put_slice(&hello);

    out.put_slice(&record_header(CONTENT_CHANGE_CIPHER_SPEC, 1));
    out.put_u8(1);

    out.put_slice(&record_header(CONTENT_HANDSHAKE, disguised_len));
    out
}

/// A complete ClientHello record carrying `ticket` in its session ticket
/// extension. `ticket` must not exceed [`MAX_TICKET_LEN`].
pub fn client_hello(server_name: &str, ticket: &[u8], profile: BrowserProfile) -> BytesMut {
    let shape = profile.hello_shape();
    let ticket = &ticket[..ticket.len().min(MAX_TICKET_LEN)];

    let mut extensions = BytesMut::with_capacity(256 + ticket.len());
    if !server_name.is_empty() && server_name.len() <= u8::MAX as usize {
        let mut sni = BytesMut::with_capacity(server_name.len() + 5);
        sni.put_u16(server_name.len() as u16 + 3);
        sni.put_u8(0);
        sni.put_u16(server_name.len() as u16);
        sni.put_slice(server_name.as_bytes());
        put_extension(&mut extensions, EXT_SERVER_NAME, &sni);
    }
    put_extension(&mut extensions, EXT_EXTENDED_MASTER_SECRET, &[]);
    put_extension(&mut extensions, EXT_RENEGOTIATION_INFO, &[0]);

    let mut groups = BytesMut::with_capacity(2 + shape.groups.len() * 2);
    groups.put_u16(shape.groups.len() as u16 * 2);
    shape.groups.iter().for_each(|g| groups.put_u16(*g));
    put_extension(&mut extensions, EXT_SUPPORTED_GROUPS, &groups);

    let mut formats = BytesMut::with_capacity(1 + shape.point_formats.len());
    formats.put_u8(shape.point_formats.len() as u8);
    formats.put_slice(shape.point_formats);
    put_extension(&mut extensions, EXT_EC_POINT_FORMATS, &formats);

    put_extension(&mut extensions, EXT_SESSION_TICKET, ticket);

    let mut alpn = BytesMut::with_capacity(16);
    let alpn_len: usize = shape.alpn.iter().map(|p| p.len() + 1).sum();
    alpn.put_u16(alpn_len as u16);
    for proto in shape.alpn {
        alpn.put_u8(proto.len() as u8);
        alpn.put_slice(proto);
    }
    put_extension(&mut extensions, EXT_ALPN, &alpn);
    put_extension(&mut extensions, EXT_STATUS_REQUEST, &[1, 0, 0, 0, 0]);

    let mut sigalgs = BytesMut::with_capacity(2 + SIGNATURE_ALGORITHMS.len() * 2);
    sigalgs.put_u16(SIGNATURE_ALGORITHMS.len() as u16 * 2);
    SIGNATURE_ALGORITHMS.iter().for_each(|s| sigalgs.put_u16(*s));
    put_extension(&mut extensions, EXT_SIGNATURE_ALGORITHMS, &sigalgs);

    let mut hello = BytesMut::with_capacity(128 + extensions.len());
    hello.put_u16(VERSION_TLS12);
    hello.put_slice(&random32());
    hello.put_u8(32);
    hello.put_slice(&random32());
    hello.put_u16(shape.cipher_suites.len() as u16 * 2);
    shape.cipher_suites.iter().for_each(|c| hello.put_u16(*c));
    hello.put_u8(1);
    hello.put_u8(0);
    hello.put_u16(extensions.len() as u16);
    hello.put_slice(&extensions);

    let handshake_len = 4 + hello.len();
    let mut out = BytesMut::with_capacity(RECORD_HEADER_LEN + handshake_len);
    out.put_u8(CONTENT_HANDSHAKE);
    out.put_u16(VERSION_TLS10);
    out.put_u16(handshake_len as u16);
    out.put_u8(HANDSHAKE_CLIENT_HELLO);
    out.put_uint(hello.len() as u64, 3);
    out.put_slice(&hello);
    out
}

fn put_extension(out: &mut BytesMut, ext_type: u16, data: &[u8]) {
    out.put_u16(ext_type);
    out.put_u16(data.len() as u16);
    out.put_slice(data);
}

fn random32() -> [u8; 32] {
    let mut buf = [0u8; 32];
    random_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_hello_parses_back() {
        let hello = client_hello("www.example.com", b"first payload", BrowserProfile::Chrome);
        let parsed = parse_client_hello(&hello).unwrap();

        assert_eq!(parsed.len, hello.len());
        assert_eq!(parsed.session_id.len(), 32);
        assert_eq!(&parsed.session_ticket[..], b"first payload");
        assert_eq!(parsed.server_name.as_deref(), Some("www.example.com"));
    }

    #[test]
    fn test_client_hello_fits_one_record() {
        let ticket = vec![0xaa; MAX_TICKET_LEN + 100];
        let hello = client_hello(&"h".repeat(255), &ticket, BrowserProfile::Firefox);
        assert!(hello.len() <= MAX_HELLO_RECORD);

        let parsed = parse_client_hello(&hello).unwrap();
        assert_eq!(parsed.session_ticket.len(), MAX_TICKET_LEN);
    }

    #[test]
    fn test_trailing_bytes_not_consumed() {
        let mut buf = client_hello("a.example", b"", BrowserProfile::Safari);
        let hello_len = buf.len();
        buf.extend_from_slice(b"\x17\x03\x03\x00\x02hi");

        let parsed = parse_client_hello(&buf).unwrap();
        assert_eq!(parsed.len, hello_len);
        assert!(parsed.session_ticket.is_empty());
    }

    #[test]
    fn test_truncated_hello_rejected() {
        let hello = client_hello("a.example", b"ticket", BrowserProfile::Chrome);
        assert!(parse_client_hello(&hello[..hello.len() - 1]).is_none());
        assert!(parse_client_hello(&hello[..3]).is_none());
    }

    #[test]
    fn test_not_a_client_hello() {
        let mut hello = client_hello("a.example", b"", BrowserProfile::Chrome);
        hello[5] = HANDSHAKE_SERVER_HELLO;
        assert!(parse_client_hello(&hello).is_none());
        assert!(parse_client_hello(b"\x17\x03\x03\x00\x00").is_none());
    }

    #[test]
    fn test_server_hello_layout() {
        let session_id = [7u8; 32];
        let flight = server_hello(&session_id, 1000);

        // ServerHello record
        assert_eq!(flight[0], CONTENT_HANDSHAKE);
        let hello_len = u16::from_be_bytes([flight[3], flight[4]]) as usize;
        assert_eq!(flight[5], HANDSHAKE_SERVER_HELLO);
        // version(2) + random(32) + session id length byte
        assert_eq!(flight[5 + 4 + 34] as usize, session_id.len());
        assert_eq!(&flight[5 + 4 + 35..5 + 4 + 35 + 32], &session_id);

        // ChangeCipherSpec, then the disguised record header
        let ccs = RECORD_HEADER_LEN + hello_len;
        assert_eq!(&flight[ccs..ccs + 6], &[0x14, 0x03, 0x03, 0x00, 0x01, 0x01]);
        let tail: [u8; 5] = flight[ccs + 6..].try_into().unwrap();
        assert_eq!(tail[0], CONTENT_HANDSHAKE);
        assert_eq!(record_len(&tail), 1000);
    }

    #[test]
    fn test_record_header() {
        let header = record_header(CONTENT_APPLICATION_DATA, 0x1234);
        assert_eq!(header, [0x17, 0x03, 0x03, 0x12, 0x34]);
        assert_eq!(record_len(&header), 0x1234);
    }
}
