//! Prometheus metrics for the proxy.
//!
//! This module provides:
//! - A registry with connection, request and error counters
//! - An HTTP server exposing them at `/metrics`

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Request/response cycle duration buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

/// Prometheus metrics for the proxy.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Client connections accepted.
    pub connections_total: Counter,
    /// Client connections currently open.
    pub connections_active: Gauge,
    /// Client requests by opcode.
    pub requests_total: CounterVec,
    /// Interceptor outcomes: forwarded, handled or error.
    pub intercepts_total: CounterVec,
    /// Replies relayed from the backend by opcode.
    pub replies_total: CounterVec,
    /// Backend connections dialed.
    pub backend_connections_total: Counter,
    /// Session-ending errors by kind.
    pub errors_total: CounterVec,
    /// Cycle duration by request opcode.
    pub request_duration: HistogramVec,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = Counter::with_opts(Opts::new(
            "mongonet_connections_total",
            "Total number of client connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "mongonet_connections_active",
            "Number of currently open client connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let requests_total = CounterVec::new(
            Opts::new("mongonet_requests_total", "Client requests by opcode"),
            &["op"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let intercepts_total = CounterVec::new(
            Opts::new(
                "mongonet_intercepts_total",
                "Interceptor decisions by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(intercepts_total.clone()))?;

        let replies_total = CounterVec::new(
            Opts::new("mongonet_replies_total", "Backend replies relayed by opcode"),
            &["op"],
        )?;
        registry.register(Box::new(replies_total.clone()))?;

        let backend_connections_total = Counter::with_opts(Opts::new(
            "mongonet_backend_connections_total",
            "Total number of backend connections dialed",
        ))?;
        registry.register(Box::new(backend_connections_total.clone()))?;

        let errors_total = CounterVec::new(
            Opts::new("mongonet_errors_total", "Session errors by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "mongonet_request_duration_seconds",
                "Request/response cycle duration in seconds by opcode",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["op"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            requests_total,
            intercepts_total,
            replies_total,
            backend_connections_total,
            errors_total,
            request_duration,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server until `shutdown` fires.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(body) => {
                let mut response = text(StatusCode::OK, body);
                response.headers_mut().insert(
                    hyper::header::CONTENT_TYPE,
                    hyper::header::HeaderValue::from_static(
                        "text/plain; version=0.0.4; charset=utf-8",
                    ),
                );
                response
            }
            Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        "/health" | "/healthz" => text(StatusCode::OK, "OK"),
        _ => text(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}
