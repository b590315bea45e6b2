//! Backend connection pool.
//!
//! Connections are dialed lazily through a [`Connector`] and leased exclusively:
//! a [`PooledConnection`] is moved out of the idle set by [`ConnectionPool::get`]
//! and moved back (or dropped) by [`ConnectionPool::release`]. The pool never
//! health-checks idle connections.

use crate::error::ProxyError;
use crate::metrics::Metrics;
use mongonet_protocol::{Decoder, Message};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Dials new connections to the backend.
///
/// Transport security is the connector's business; `connect` returns a stream
/// that is ready for wire messages.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self) -> impl Future<Output = Result<Self::Stream, ProxyError>> + Send;

    /// Backend address, for logs.
    fn addr(&self) -> &str;
}

/// A leased backend connection.
pub struct PooledConnection<S> {
    id: u64,
    stream: S,
    decoder: Decoder,
    bad: bool,
    closed: bool,
    created_at: Instant,
}

impl<S> PooledConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(id: u64, stream: S) -> Self {
        Self {
            id,
            stream,
            decoder: Decoder::new(),
            bad: false,
            closed: false,
            created_at: Instant::now(),
        }
    }

    /// Creation sequence number, starting at 1.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_bad(&self) -> bool {
        self.bad
    }

    /// Flags the connection so it is discarded on release.
    pub fn mark_bad(&mut self) {
        self.bad = true;
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Encodes and writes one message.
    pub async fn send(&mut self, message: &mut Message) -> Result<(), ProxyError> {
        let bytes = message.encode()?;
        if let Err(e) = self.stream.write_all(&bytes).await {
            self.bad = true;
            return Err(ProxyError::Backend(e));
        }
        Ok(())
    }

    /// Reads one complete message.
    pub async fn recv(&mut self) -> Result<Message, ProxyError> {
        loop {
            match self.decoder.decode_message() {
                Ok(Some(message)) => return Ok(message),
                Ok(None) => {}
                Err(e) => {
                    self.bad = true;
                    return Err(ProxyError::BackendDecode(e));
                }
            }
            match self.stream.read_buf(self.decoder.buffer_mut()).await {
                Ok(0) => {
                    self.bad = true;
                    return Err(ProxyError::BackendClosed);
                }
                Ok(_) => {}
                Err(e) => {
                    self.bad = true;
                    return Err(ProxyError::Backend(e));
                }
            }
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.stream.shutdown().await;
        }
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections dialed since startup.
    pub total_created: u64,
    /// Connections currently idle in the pool.
    pub idle: usize,
}

/// Counters shared between the pool and whoever reports on it.
#[derive(Debug, Default)]
pub struct PoolCounters {
    total_created: AtomicU64,
    idle: AtomicUsize,
}

impl PoolCounters {
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            total_created: self.total_created.load(Ordering::Relaxed),
            idle: self.idle.load(Ordering::Relaxed),
        }
    }
}

/// Idle connections to a single backend.
pub struct ConnectionPool<C: Connector> {
    connector: C,
    idle: Mutex<Vec<PooledConnection<C::Stream>>>,
    counters: Arc<PoolCounters>,
    max_idle: usize,
    metrics: Option<Arc<Metrics>>,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, max_idle: usize) -> Self {
        Self {
            connector,
            idle: Mutex::new(Vec::new()),
            counters: Arc::new(PoolCounters::default()),
            max_idle,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Leases an idle connection, dialing a new one when none is idle.
    pub async fn get(&self) -> Result<PooledConnection<C::Stream>, ProxyError> {
        let reused = self.idle.lock().pop();
        if let Some(conn) = reused {
            self.counters.idle.fetch_sub(1, Ordering::Relaxed);
            tracing::trace!("reusing backend connection #{}", conn.id);
            return Ok(conn);
        }

        let stream = self.connector.connect().await?;
        let id = self.counters.total_created.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(ref metrics) = self.metrics {
            metrics.backend_connections_total.inc();
        }
        tracing::debug!(
            "opened backend connection #{} to {}",
            id,
            self.connector.addr()
        );
        Ok(PooledConnection::new(id, stream))
    }

    /// Returns a lease. Bad connections and those beyond `max_idle` are closed.
    pub async fn release(&self, mut conn: PooledConnection<C::Stream>) {
        if conn.bad || conn.closed {
            tracing::debug!(
                "discarding backend connection #{} after {:?}",
                conn.id,
                conn.age()
            );
            conn.close().await;
            return;
        }

        let overflow = {
            let mut idle = self.idle.lock();
            if idle.len() < self.max_idle {
                idle.push(conn);
                self.counters.idle.fetch_add(1, Ordering::Relaxed);
                None
            } else {
                Some(conn)
            }
        };

        if let Some(mut conn) = overflow {
            tracing::debug!(
                "idle limit reached, closing backend connection #{} after {:?}",
                conn.id,
                conn.age()
            );
            conn.close().await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }

    /// Shared handle on the counters behind [`stats`](Self::stats).
    pub fn counters(&self) -> Arc<PoolCounters> {
        self.counters.clone()
    }

    /// Closes every idle connection.
    pub async fn clear(&self) {
        let drained: Vec<_> = {
            let mut idle = self.idle.lock();
            self.counters.idle.store(0, Ordering::Relaxed);
            idle.drain(..).collect()
        };
        for mut conn in drained {
            conn.close().await;
        }
    }
}
