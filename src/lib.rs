//! # Obfs Tunnel
//!
//! Traffic disguise for proxy tunnels. A client wraps its transport so the
//! tunnel looks like an ordinary chunked HTTP upload or a TLS session; the
//! server sniffs each accepted connection, unwraps whichever disguise it
//! finds and passes anything else through untouched.
//!
//! ## Features
//!
//! - **Chunked HTTP disguise** with a graceful close handshake and
//!   connection reuse
//! - **TLS record disguise** with fake ClientHello / ServerHello flights
//! - **WebSocket upgrade** mimicry
//! - **Passthrough** of unrecognized traffic, byte for byte
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     Relay Layer                      │
//! │          (copy both ways, close both on end)         │
//! ├─────────────────────────────────────────────────────┤
//! │                   Disguise Layer                     │
//! │   (ChunkedConn, RecordConn, Connector, Classifier)   │
//! ├─────────────────────────────────────────────────────┤
//! │                   Buffered Layer                     │
//! │       (LeftoverConn: pending read / write blocks)    │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │            (TCP, in-memory pipes, listener)          │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod conn;
pub mod obfuscation;
pub mod pool;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use conn::{BoxConn, Conn, ConnError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Conn(#[from] conn::ConnError),

    #[error("Configuration error: {0}")]
    Config(String),
}
