//! Plain-or-TLS stream wrappers for both sides of the proxy.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;

pin_project! {
    /// An accepted client connection.
    #[project = ClientStreamProj]
    pub enum ClientStream {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: ServerTlsStream<TcpStream> },
    }
}

impl ClientStream {
    /// Returns whether this stream is TLS-encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(self, ClientStream::Tls { .. })
    }

    /// The SNI name the client asked for, if any.
    pub fn sni_name(&self) -> Option<String> {
        match self {
            ClientStream::Plain { .. } => None,
            ClientStream::Tls { stream } => stream.get_ref().1.server_name().map(str::to_string),
        }
    }
}

pin_project! {
    /// A dialed backend connection.
    #[project = BackendStreamProj]
    pub enum BackendStream {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: ClientTlsStream<TcpStream> },
    }
}

impl BackendStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, BackendStream::Tls { .. })
    }
}

macro_rules! delegate_io {
    ($ty:ident, $proj:ident) => {
        impl AsyncRead for $ty {
            fn poll_read(
                self: Pin<&mut Self>,
                cx: &mut Context<'_>,
                buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                match self.project() {
                    $proj::Plain { stream } => stream.poll_read(cx, buf),
                    $proj::Tls { stream } => stream.poll_read(cx, buf),
                }
            }
        }

        impl AsyncWrite for $ty {
            fn poll_write(
                self: Pin<&mut Self>,
                cx: &mut Context<'_>,
                buf: &[u8],
            ) -> Poll<io::Result<usize>> {
                match self.project() {
                    $proj::Plain { stream } => stream.poll_write(cx, buf),
                    $proj::Tls { stream } => stream.poll_write(cx, buf),
                }
            }

            fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                match self.project() {
                    $proj::Plain { stream } => stream.poll_flush(cx),
                    $proj::Tls { stream } => stream.poll_flush(cx),
                }
            }

            fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                match self.project() {
                    $proj::Plain { stream } => stream.poll_shutdown(cx),
                    $proj::Tls { stream } => stream.poll_shutdown(cx),
                }
            }
        }
    };
}

delegate_io!(ClientStream, ClientStreamProj);
delegate_io!(BackendStream, BackendStreamProj);
