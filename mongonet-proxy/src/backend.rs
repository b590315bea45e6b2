//! Dialing the backend node over TCP, optionally wrapped in TLS.

use crate::config::BackendConfig;
use crate::error::ProxyError;
use crate::pool::Connector;
use crate::stream::BackendStream;
use crate::tls::create_backend_connector;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Production [`Connector`]: plain TCP or TLS with SNI.
pub struct TcpConnector {
    addr: String,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl TcpConnector {
    /// Plain TCP to `addr`.
    pub fn plain(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            tls: None,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self, ProxyError> {
        let tls = if config.tls.enabled {
            Some(create_backend_connector(&config.tls, config.host())?)
        } else {
            None
        };
        Ok(Self {
            addr: config.addr.clone(),
            tls,
        })
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    fn connect_error(&self, source: std::io::Error) -> ProxyError {
        ProxyError::Connect {
            addr: self.addr.clone(),
            source,
        }
    }
}

impl Connector for TcpConnector {
    type Stream = BackendStream;

    async fn connect(&self) -> Result<BackendStream, ProxyError> {
        let tcp = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| self.connect_error(e))?;
        tcp.set_nodelay(true).map_err(|e| self.connect_error(e))?;

        match &self.tls {
            None => Ok(BackendStream::Plain { stream: tcp }),
            Some((connector, server_name)) => {
                tracing::debug!("TLS handshake with backend {}", self.addr);
                let stream = connector
                    .connect(server_name.clone(), tcp)
                    .await
                    .map_err(|e| self.connect_error(e))?;
                Ok(BackendStream::Tls { stream })
            }
        }
    }

    fn addr(&self) -> &str {
        &self.addr
    }
}
