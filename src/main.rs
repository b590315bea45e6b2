//! mongonet - MongoDB wire-protocol proxy
//!
//! Listens for clients, forwards their traffic to one backend node, and answers
//! `isMaster` / `sni` locally through the ismaster rewriter.

mod ismaster;

use clap::Parser;
use ismaster::IsMasterRewriterFactory;
use mongonet_proxy::metrics::run_metrics_server;
use mongonet_proxy::{tls, Config, Metrics, Proxy, ProxyConfig, ProxyContext, TcpConnector};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// Command-line flags. Each one overrides the config file and environment.
#[derive(Parser, Debug)]
#[command(name = "mongonet", version, about = "MongoDB wire-protocol proxy")]
struct Args {
    /// YAML configuration file.
    #[arg(short, long, env = "MONGONET_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    host: Option<IpAddr>,

    /// Port to listen on.
    #[arg(long)]
    port: Option<u16>,

    /// Backend host.
    #[arg(long = "mongoHost", alias = "mongo-host")]
    mongo_host: Option<String>,

    /// Backend port.
    #[arg(long = "mongoPort", alias = "mongo-port")]
    mongo_port: Option<u16>,

    /// Maximum concurrent client connections.
    #[arg(long)]
    max_connections: Option<usize>,

    /// PEM certificate for the client-facing listener; enables TLS.
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key for the client-facing listener.
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Dial the backend over TLS.
    #[arg(long)]
    backend_tls: bool,

    /// Serve Prometheus metrics on this address.
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.host {
            config.network.bind_addr.set_ip(host);
        }
        if let Some(port) = self.port {
            config.network.bind_addr.set_port(port);
        }
        if self.mongo_host.is_some() || self.mongo_port.is_some() {
            let current_port = config
                .backend
                .addr
                .rsplit(':')
                .next()
                .and_then(|p| p.parse().ok())
                .unwrap_or(mongonet_protocol::DEFAULT_PORT);
            let host = self
                .mongo_host
                .unwrap_or_else(|| config.backend.host().to_string());
            let port = self.mongo_port.unwrap_or(current_port);
            config.backend.addr = if host.contains(':') {
                format!("[{}]:{}", host, port)
            } else {
                format!("{}:{}", host, port)
            };
        }
        if let Some(max) = self.max_connections {
            config.network.max_connections = max;
        }
        if let (Some(cert), Some(key)) = (self.tls_cert, self.tls_key) {
            config.tls.enabled = true;
            config.tls.cert_path = Some(cert);
            config.tls.key_path = Some(key);
        }
        if self.backend_tls {
            config.backend.tls.enabled = true;
        }
        if let Some(addr) = self.metrics_addr {
            config.metrics.enabled = true;
            config.metrics.bind_addr = addr;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load_from(path) {
            Ok(c) => {
                tracing::info!("Loaded config from {}", path.display());
                c
            }
            Err(e) => {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
        },
        None => Config::from_env(),
    };
    args.apply(&mut config);

    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    tracing::info!("Starting mongonet");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!(
        "  Backend: {}{}",
        config.backend.addr,
        if config.backend.tls.enabled { " (TLS)" } else { "" }
    );

    let mut proxy_config = ProxyConfig::new(config.network.bind_addr);
    proxy_config.max_connections = config.network.max_connections;
    if config.tls.enabled {
        proxy_config = proxy_config.with_tls(tls::create_tls_acceptor(&config.tls)?);
        tracing::info!("  TLS: enabled");
        if config.tls.require_client_cert {
            tracing::info!("  mTLS: enabled (client certificate required)");
        }
    } else {
        tracing::info!("  TLS: disabled");
    }

    let connector = TcpConnector::from_config(&config.backend)?;
    let mut context = ProxyContext::new(connector, config.backend.max_idle);

    let (metrics_shutdown, _) = broadcast::channel(1);
    let metrics_handle = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        context = context.with_metrics(metrics.clone());
        let addr = config.metrics.bind_addr;
        let rx = metrics_shutdown.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, rx).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        }))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let proxy = Arc::new(
        Proxy::new(proxy_config, context)
            .with_interceptor_factory(Arc::new(IsMasterRewriterFactory)),
    );

    let shutdown_proxy = proxy.clone();
    let shutdown_metrics = metrics_shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping proxy...");
        shutdown_proxy.shutdown();
        let _ = shutdown_metrics.send(());
    });

    proxy.run().await?;

    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    let stats = proxy.stats();
    tracing::info!(
        "Proxy stopped ({} connections, {} requests, {} answered locally)",
        stats.connections_total.load(std::sync::atomic::Ordering::Relaxed),
        stats.requests_total.load(std::sync::atomic::Ordering::Relaxed),
        stats.short_circuited_total.load(std::sync::atomic::Ordering::Relaxed),
    );
    Ok(())
}
