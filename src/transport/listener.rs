//! Classifying TCP listener
//!
//! Every accepted socket is classified on its own task so one slow client
//! cannot stall the accept loop. Chunked sessions that close gracefully are
//! recycled straight back onto the accept queue: the next request on the
//! same socket arrives as a freshly accepted connection.

use super::{TcpConn, TransportConfig};
use crate::conn::ConnError;
use crate::obfuscation::{ChunkedConn, Classified, Classifier, DisguiseKind, DEFAULT_DRAIN_TIMEOUT};
use crate::pool::ConnPool;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Listener tuning
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Classified connections waiting for `accept`
    pub backlog: usize,
    /// Time a new connection gets to send its first bytes
    pub classify_timeout: Duration,
    /// Bound on the close handshake of chunked sessions
    pub drain_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            backlog: 128,
            classify_timeout: Duration::from_secs(30),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Re-queues recycled server sessions as new connections
struct RecyclePool {
    queue: mpsc::Sender<Classified>,
}

impl ConnPool for RecyclePool {
    fn get_nonblocking(&self) -> Option<ChunkedConn> {
        None
    }

    fn put(&self, conn: ChunkedConn) -> Result<(), ChunkedConn> {
        match self.queue.try_reserve() {
            Ok(permit) => {
                permit.send(Classified::new(DisguiseKind::Chunked, Box::new(conn)));
                Ok(())
            }
            Err(_) => Err(conn),
        }
    }
}

/// A listener yielding classified connections
pub struct ObfsListener {
    local_addr: SocketAddr,
    accepted: Mutex<mpsc::Receiver<Classified>>,
    // Keeps recycled sessions' pool reference alive
    _recycler: Arc<dyn ConnPool>,
    task: JoinHandle<()>,
}

impl ObfsListener {
    /// Bind `addr` and start accepting
    pub async fn bind(
        addr: &str,
        config: ListenerConfig,
        transport: TransportConfig,
    ) -> Result<Self, ConnError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let (tx, rx) = mpsc::channel(config.backlog.max(1));
        let recycler: Arc<dyn ConnPool> = Arc::new(RecyclePool { queue: tx.clone() });
        let classifier = Classifier::new()
            .with_pool(Arc::downgrade(&recycler))
            .with_drain_timeout(config.drain_timeout);

        let task = tokio::spawn(accept_loop(
            listener,
            classifier,
            tx,
            transport,
            config.classify_timeout,
        ));
        info!("Listening on {}", local_addr);

        Ok(Self {
            local_addr,
            accepted: Mutex::new(rx),
            _recycler: recycler,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next classified connection
    pub async fn accept(&self) -> Result<Classified, ConnError> {
        self.accepted
            .lock()
            .await
            .recv()
            .await
            .ok_or(ConnError::Closed)
    }
}

impl Drop for ObfsListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    classifier: Classifier,
    queue: mpsc::Sender<Classified>,
    transport: TransportConfig,
    classify_timeout: Duration,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        debug!("New connection from {}", peer);

        let classifier = classifier.clone();
        let queue = queue.clone();
        let raw = TcpConn::from_stream(stream, &transport);
        tokio::spawn(async move {
            match tokio::time::timeout(classify_timeout, classifier.classify(Box::new(raw))).await {
                Ok(Ok(classified)) => {
                    if queue.send(classified).await.is_err() {
                        debug!("Listener gone, dropping {}", peer);
                    }
                }
                Ok(Err(e)) => debug!("Dropped {}: {}", peer, e),
                Err(_) => debug!("{} sent nothing in {:?}", peer, classify_timeout),
            }
        });
    }
}
