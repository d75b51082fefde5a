//! Bidirectional relay between two connections
//!
//! Bytes are pumped both ways until either side ends; then both sides are
//! closed, which for a chunked session runs its close handshake and may
//! return the transport to the reuse pool.

use crate::conn::{Conn, ConnError};
use tracing::{debug, trace};

/// Copy buffer size per direction
pub const RELAY_BUF_SIZE: usize = 16 * 1024;

/// Bytes moved by a finished relay
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

async fn copy(from: &dyn Conn, to: &dyn Conn) -> (u64, Result<(), ConnError>) {
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = match from.read(&mut buf).await {
            Ok(0) => return (total, Ok(())),
            Ok(n) => n,
            Err(e) => return (total, Err(e)),
        };
        if let Err(e) = to.write(&buf[..n]).await {
            return (total, Err(e));
        }
        total += n as u64;
        trace!("Relayed {} bytes", n);
    }
}

async fn shutdown(a: &dyn Conn, b: &dyn Conn) {
    let (ra, rb) = tokio::join!(a.close(), b.close());
    for res in [ra, rb] {
        if let Err(e) = res {
            debug!("Close error: {}", e);
        }
    }
}

fn log_outcome(direction: &str, res: &Result<(), ConnError>) {
    match res {
        Ok(()) => {}
        // The other direction closed us
        Err(ConnError::Closed) => {}
        Err(e) => debug!("Relay {} ended: {}", direction, e),
    }
}

/// Pump bytes between `a` and `b` until one side ends, then close both
pub async fn relay(a: &dyn Conn, b: &dyn Conn) -> RelayStats {
    let forward = copy(a, b);
    let backward = copy(b, a);
    tokio::pin!(forward);
    tokio::pin!(backward);

    // The unfinished direction may hold a read or write lock that close
    // waits on, so it keeps being polled while both sides shut down
    let ((a_to_b, forward_res), (b_to_a, backward_res)) = tokio::select! {
        done = &mut forward => {
            let (_, rest) = tokio::join!(shutdown(a, b), &mut backward);
            (done, rest)
        }
        done = &mut backward => {
            let (_, rest) = tokio::join!(shutdown(a, b), &mut forward);
            (rest, done)
        }
    };

    log_outcome("a->b", &forward_res);
    log_outcome("b->a", &backward_res);
    debug!("Relay finished: {} bytes out, {} bytes back", a_to_b, b_to_a);
    RelayStats { a_to_b, b_to_a }
}
