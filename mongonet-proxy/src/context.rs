//! Proxy-wide state shared by every session.

use crate::metrics::Metrics;
use crate::pool::{ConnectionPool, Connector};
use crate::reply::RequestIds;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Proxy statistics.
#[derive(Debug, Default)]
pub struct ProxyStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    /// Requests answered without contacting the backend.
    pub short_circuited_total: AtomicU64,
    pub errors_total: AtomicU64,
}

impl ProxyStats {
    pub fn connections_active(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }
}

/// Built once at startup and handed to each session.
pub struct ProxyContext<C: Connector> {
    pub pool: ConnectionPool<C>,
    pub stats: ProxyStats,
    pub request_ids: RequestIds,
    pub metrics: Option<Arc<Metrics>>,
}

impl<C: Connector> ProxyContext<C> {
    pub fn new(connector: C, max_idle: usize) -> Self {
        Self {
            pool: ConnectionPool::new(connector, max_idle),
            stats: ProxyStats::default(),
            request_ids: RequestIds::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.pool = self.pool.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub(crate) fn record_error(&self, kind: &str) {
        self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.metrics {
            metrics.errors_total.with_label_values(&[kind]).inc();
        }
    }
}
