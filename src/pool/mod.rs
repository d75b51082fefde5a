//! Reuse pool for disguised connections
//!
//! A chunked session that closes gracefully leaves its transport clean, so
//! the next session can skip the TCP dial. The pool only ever receives
//! connections from [`ChunkedConn`]'s close handshake.

use crate::obfuscation::ChunkedConn;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::trace;

/// Default number of idle connections kept
pub const DEFAULT_CAPACITY: usize = 16;

/// Default time an idle connection stays usable
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(60);

/// Store of idle, already-handshaken connections
pub trait ConnPool: Send + Sync {
    /// Take an idle connection without waiting
    fn get_nonblocking(&self) -> Option<ChunkedConn>;

    /// Offer a connection; a full pool hands it back
    fn put(&self, conn: ChunkedConn) -> Result<(), ChunkedConn>;
}

struct IdleConn {
    conn: ChunkedConn,
    since: Instant,
}

/// Bounded LIFO pool with an idle timeout
pub struct IdlePool {
    idle: Mutex<VecDeque<IdleConn>>,
    capacity: usize,
    max_idle: Duration,
}

impl IdlePool {
    pub fn new(capacity: usize, max_idle: Duration) -> Self {
        Self {
            idle: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            max_idle,
        }
    }

    /// Number of idle connections, stale ones included
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<IdleConn>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for IdlePool {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_MAX_IDLE)
    }
}

impl ConnPool for IdlePool {
    fn get_nonblocking(&self) -> Option<ChunkedConn> {
        let mut idle = self.lock();
        // Everything older than the freshest stale entry is stale too
        while let Some(entry) = idle.pop_back() {
            if entry.since.elapsed() <= self.max_idle {
                trace!("Reusing idle connection, {} left", idle.len());
                return Some(entry.conn);
            }
            trace!("Dropping {} stale idle connections", idle.len() + 1);
            idle.clear();
        }
        None
    }

    fn put(&self, conn: ChunkedConn) -> Result<(), ChunkedConn> {
        let mut idle = self.lock();
        if idle.len() >= self.capacity {
            return Err(conn);
        }
        idle.push_back(IdleConn {
            conn,
            since: Instant::now(),
        });
        Ok(())
    }
}
