//! Client-facing listener.

use crate::context::{ProxyContext, ProxyStats};
use crate::error::ProxyError;
use crate::interceptor::{InterceptorFactory, SessionInfo};
use crate::pool::Connector;
use crate::session::ProxySession;
use crate::stream::ClientStream;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;

/// Listener configuration.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent client connections.
    pub max_connections: usize,
    /// TLS acceptor (if TLS is enabled).
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("bind_addr", &self.bind_addr)
            .field("max_connections", &self.max_connections)
            .field("tls_enabled", &self.tls_acceptor.is_some())
            .finish()
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9999)),
            max_connections: 1000,
            tls_acceptor: None,
        }
    }
}

impl ProxyConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(Arc::new(acceptor));
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }
}

/// Accepts clients and runs one [`ProxySession`] per connection.
pub struct Proxy<C: Connector> {
    config: ProxyConfig,
    context: Arc<ProxyContext<C>>,
    factory: Option<Arc<dyn InterceptorFactory>>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl<C: Connector> Proxy<C> {
    pub fn new(config: ProxyConfig, context: ProxyContext<C>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            context: Arc::new(context),
            factory: None,
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Every session gets an interceptor built by `factory`.
    pub fn with_interceptor_factory(mut self, factory: Arc<dyn InterceptorFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Binds the configured address and serves until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ProxyError> {
        let local_addr = listener.local_addr()?;
        self.running.store(true, Ordering::SeqCst);

        let tls_mode = if self.config.tls_enabled() {
            "TLS"
        } else {
            "plain"
        };
        tracing::info!(
            "Proxy listening on {} ({}), backend {}",
            local_addr,
            tls_mode,
            self.context.pool.connector().addr()
        );

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => self.accept(tcp_stream, addr, local_addr.port()),
                        Err(e) => tracing::error!("Accept error: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Proxy shutting down");
                    break;
                }
            }
        }

        self.context.pool.clear().await;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn accept(&self, tcp_stream: TcpStream, addr: SocketAddr, server_port: u16) {
        let stats = &self.context.stats;
        if stats.connections_active() >= self.config.max_connections as u64 {
            tracing::warn!("Connection limit reached, rejecting {}", addr);
            return;
        }
        if let Err(e) = tcp_stream.set_nodelay(true) {
            tracing::debug!("[{}] set_nodelay failed: {}", addr, e);
        }

        stats.connections_total.fetch_add(1, Ordering::Relaxed);
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.context.metrics {
            metrics.connections_total.inc();
            metrics.connections_active.inc();
        }

        let tls_acceptor = self.config.tls_acceptor.clone();
        let context = self.context.clone();
        let factory = self.factory.clone();
        let shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let result = Self::handle_connection(
                tcp_stream,
                addr,
                server_port,
                tls_acceptor,
                factory,
                context.clone(),
                shutdown,
            )
            .await;

            if let Err(e) = result {
                tracing::warn!("[{}] Connection refused: {}", addr, e);
                context.record_error(e.label());
            }

            context.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            if let Some(ref metrics) = context.metrics {
                metrics.connections_active.dec();
            }
            tracing::info!("Client disconnected: {}", addr);
        });
    }

    /// Handshake, interceptor setup, then the session. Session failures are
    /// recorded by the session itself.
    async fn handle_connection(
        tcp_stream: TcpStream,
        addr: SocketAddr,
        server_port: u16,
        tls_acceptor: Option<Arc<TlsAcceptor>>,
        factory: Option<Arc<dyn InterceptorFactory>>,
        context: Arc<ProxyContext<C>>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ProxyError> {
        let stream = Self::maybe_tls_accept(tcp_stream, tls_acceptor.as_deref(), addr).await?;
        let sni_name = stream.sni_name();
        let tls_status = if stream.is_tls() { " (TLS)" } else { "" };
        tracing::info!("Client connected: {}{}", addr, tls_status);

        let info = SessionInfo::new(addr, server_port, sni_name, context.pool.counters());
        let interceptor = match factory {
            Some(factory) => Some(factory.new_interceptor(&info)?),
            None => None,
        };

        let session = ProxySession::new(stream, info, context, interceptor).with_shutdown(shutdown);
        // Errors were logged and counted inside the session.
        let _ = session.run().await;
        Ok(())
    }

    async fn maybe_tls_accept(
        tcp_stream: TcpStream,
        acceptor: Option<&TlsAcceptor>,
        addr: SocketAddr,
    ) -> Result<ClientStream, ProxyError> {
        match acceptor {
            Some(acceptor) => {
                tracing::debug!("[{}] Performing TLS handshake", addr);
                let stream = acceptor
                    .accept(tcp_stream)
                    .await
                    .map_err(|e| ProxyError::TlsHandshake(e.to_string()))?;
                tracing::debug!("[{}] TLS handshake complete", addr);
                Ok(ClientStream::Tls { stream })
            }
            None => Ok(ClientStream::Plain { stream: tcp_stream }),
        }
    }

    /// Stops accepting and signals every live session.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.context.stats
    }

    pub fn context(&self) -> &Arc<ProxyContext<C>> {
        &self.context
    }
}
