//! # mongonet-proxy
//!
//! Programmable proxy for the MongoDB wire protocol.
//!
//! This crate provides:
//! - A TCP (optionally TLS) listener with one session per client
//! - Interceptor hooks that can forward, rewrite or answer each request
//! - A pooled, lazily dialed set of backend connections
//! - Exhaust-cursor and moreToCome reply streaming
//! - Prometheus metrics and layered configuration

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod interceptor;
pub mod metrics;
pub mod pool;
pub mod reply;
pub mod server;
pub mod session;
pub mod stream;
pub mod tls;

pub use backend::TcpConnector;
pub use config::{
    BackendConfig, BackendTlsConfig, Config, ConfigError, MetricsConfig, NetworkConfig, TlsConfig,
};
pub use context::{ProxyContext, ProxyStats};
pub use error::ProxyError;
pub use interceptor::{
    InterceptError, Interception, InterceptorFactory, MongoError, ProxyInterceptor, Responder,
    ResponseInterceptor, SessionInfo,
};
pub use metrics::Metrics;
pub use pool::{ConnectionPool, Connector, PoolStats, PooledConnection};
pub use reply::{build_error_reply, build_reply, RequestIds};
pub use server::{Proxy, ProxyConfig};
pub use session::ProxySession;
