//! Transport layer implementations
//!
//! Provides the concrete connections the disguise layers wrap:
//! - TCP (dial with timeout, or adopt an accepted stream)
//! - In-memory pipes (for tests and local plumbing)
//! - A listener that classifies every accepted connection

mod listener;
mod stream;
mod tcp;

pub use listener::{ListenerConfig, ObfsListener};
pub use stream::{pipe, PipeConn, StreamConn};
pub use tcp::TcpConn;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Disable Nagle's algorithm on TCP sockets
    pub nodelay: bool,
}

impl TransportConfig {
    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            nodelay: true,
        }
    }
}
