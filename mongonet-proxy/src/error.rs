//! Proxy error types.

use crate::config::ConfigError;
use crate::interceptor::InterceptError;
use mongonet_protocol::{OpCode, ProtocolError};
use thiserror::Error;

/// Errors that end a session or stop the proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("client closed the connection mid-message ({buffered} bytes buffered)")]
    UnexpectedEof { buffered: usize },

    #[error("cannot connect to backend {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("backend I/O error: {0}")]
    Backend(#[source] std::io::Error),

    #[error("backend sent a malformed message: {0}")]
    BackendDecode(#[source] ProtocolError),

    #[error("backend closed the connection")]
    BackendClosed,

    #[error("backend sent {0} while an exhaust cursor was streaming")]
    UnexpectedExhaustReply(OpCode),

    #[error("interceptor error: {0}")]
    Intercept(#[from] InterceptError),

    #[error("connection check failed: {0}")]
    ConnectionCheck(InterceptError),

    #[error("proxy shutting down")]
    ShuttingDown,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ProxyError {
    /// Returns whether the error originated on the backend side of a session.
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            ProxyError::Connect { .. }
                | ProxyError::Backend(_)
                | ProxyError::BackendDecode(_)
                | ProxyError::BackendClosed
                | ProxyError::UnexpectedExhaustReply(_)
        )
    }

    /// Stable label for the errors counter.
    pub fn label(&self) -> &'static str {
        match self {
            ProxyError::Io(_) => "client_io",
            ProxyError::Protocol(_) => "client_decode",
            ProxyError::UnexpectedEof { .. } => "client_eof",
            ProxyError::Connect { .. } => "backend_connect",
            ProxyError::Backend(_) => "backend_io",
            ProxyError::BackendDecode(_) => "backend_decode",
            ProxyError::BackendClosed => "backend_closed",
            ProxyError::UnexpectedExhaustReply(_) => "exhaust_violation",
            ProxyError::Intercept(_) => "intercept",
            ProxyError::ConnectionCheck(_) => "connection_check",
            ProxyError::ShuttingDown => "shutdown",
            ProxyError::TlsConfig(_) | ProxyError::TlsHandshake(_) => "tls",
            ProxyError::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_classification() {
        let io = || std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(ProxyError::Backend(io()).is_backend());
        assert!(ProxyError::BackendClosed.is_backend());
        assert!(ProxyError::UnexpectedExhaustReply(OpCode::Msg).is_backend());
        assert!(!ProxyError::Io(io()).is_backend());
        assert!(!ProxyError::UnexpectedEof { buffered: 3 }.is_backend());
    }

    #[test]
    fn test_display() {
        let err = ProxyError::UnexpectedExhaustReply(OpCode::CommandReply);
        assert_eq!(
            err.to_string(),
            "backend sent OP_COMMAND_REPLY while an exhaust cursor was streaming"
        );
        assert_eq!(err.label(), "exhaust_violation");
    }
}
