use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::utils::GsError;

/// A gateway's transport: plain TCP or TLS over TCP.
///
/// The frontends that speak their protocol directly on a socket (MQTT and the
/// Industries WebSocket) accept either kind through this one type.
#[derive(Debug)]
pub enum GatewayStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl GatewayStream {
    /// Wraps an accepted socket, performing the TLS handshake if `acceptor` is set.
    ///
    /// # Errors
    ///
    /// Returns `GsError::Connection` if the handshake fails.
    pub async fn accept(tcp: TcpStream, acceptor: Option<&Arc<TlsAcceptor>>) -> Result<Self, GsError> {
        match acceptor {
            Some(acceptor) => {
                let tls = acceptor
                    .accept(tcp)
                    .await
                    .map_err(|e| GsError::Connection(format!("TLS handshake: {}", e)))?;
                Ok(GatewayStream::Tls(Box::new(tls)))
            }
            None => Ok(GatewayStream::Plain(tcp)),
        }
    }

    /// The DER encoded end-entity certificate the client presented, if any.
    pub fn peer_certificate(&self) -> Option<&[u8]> {
        match self {
            GatewayStream::Plain(_) => None,
            GatewayStream::Tls(tls) => tls
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| cert.0.as_slice()),
        }
    }
}

impl AsyncRead for GatewayStream {
    /// Polls the inner stream for readiness to read.
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            GatewayStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            GatewayStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for GatewayStream {
    /// Polls the inner stream for readiness to write.
    ///
    /// # Returns
    /// * `Poll::Ready(Ok(usize))` with the number of bytes written if successful.
    /// * `Poll::Pending` if the stream is not yet ready to be written to.
    /// * `Poll::Ready(Err(io::Error))` if an error occurs during writing.
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.get_mut() {
            GatewayStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            GatewayStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            GatewayStream::Plain(s) => Pin::new(s).poll_flush(cx),
            GatewayStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    /// Polls the inner stream to perform a graceful shutdown.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            GatewayStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            GatewayStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
