//! Traffic disguise layer
//!
//! Makes tunnel traffic look like something a middlebox expects to see:
//!
//! 1. **Chunked HTTP**: a `POST` upload answered by a chunked `200 OK`, with
//!    graceful close and connection reuse ([`ChunkedConn`])
//! 2. **TLS records**: a fake plaintext handshake followed by application
//!    data records ([`RecordConn`])
//! 3. **WebSocket upgrade**: only the `101` handshake is mimicked
//!
//! Clients build disguised connections with [`Connector`]; servers sniff
//! accepted connections with [`Classifier`]. Unrecognized traffic passes
//! through untouched.

pub mod chunked;
pub mod classifier;
pub mod connector;
pub mod http;
pub mod profile;
pub mod record;
pub mod tls;

pub use chunked::{ChunkedConn, HeaderState, Role, SessionState, DEFAULT_DRAIN_TIMEOUT};
pub use classifier::{Classified, Classifier, DisguiseKind};
pub use connector::{Connector, DisguiseMode};
pub use profile::BrowserProfile;
pub use record::{RecordConn, RecordRole};

use ring::rand::{SecureRandom, SystemRandom};

/// Masquerade host used when none is configured
pub const DEFAULT_OBFS_HOST: &str = "www.bing.com";

/// Fill `buf` from the system CSPRNG
pub fn random_bytes(buf: &mut [u8]) {
    SystemRandom::new()
        .fill(buf)
        .expect("Failed to generate random bytes");
}
