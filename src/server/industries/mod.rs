//! The Industries gateway frontend: Protobuf envelopes over a mutually
//! authenticated WebSocket.
//!
//! Gateways are identified by their client certificate, whose Common Name is the
//! gateway EUI. There are no API keys on this frontend.

pub mod gateway_config;
pub mod proto;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::gateway::{Connection, Frontend, Server};
use crate::model::GatewayIdentifiers;
use crate::server::middleware::rate_limit::Resource;
use crate::server::middleware::validation::MAX_WS_MESSAGE;
use crate::server::stream::GatewayStream;
use crate::server::ws::KeepaliveOptions;
use crate::utils::{Eui64, GsError};

pub const SUBPROTOCOL: &str = "v1.lora.data.gateway.thethings.industries";

#[derive(Debug, Default)]
pub struct IndustriesFrontend;

impl Frontend for IndustriesFrontend {
    fn protocol(&self) -> &'static str {
        "ttigw"
    }
}

#[derive(Debug, Clone)]
pub struct IndustriesOptions {
    pub keepalive: KeepaliveOptions,
    /// How long a gateway has to say hello after receiving its configuration.
    pub hello_timeout: Duration,
}

impl Default for IndustriesOptions {
    fn default() -> Self {
        Self {
            keepalive: KeepaliveOptions::default(),
            hello_timeout: Duration::from_secs(10),
        }
    }
}

/// Parses a certificate Common Name as gateway EUI: exactly 16 hex digits.
pub fn eui_from_common_name(cn: &str) -> Result<Eui64, GsError> {
    if cn.len() != 16 || !cn.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(GsError::InvalidArgument(format!(
            "certificate Common Name `{}` is not an EUI",
            cn
        )));
    }
    cn.parse()
}

/// The gateway EUI in the Common Name of a DER encoded client certificate.
///
/// # Errors
///
/// Returns `GsError::Unauthenticated` without certificate, and
/// `GsError::InvalidArgument` when the certificate or its Common Name is malformed.
pub fn certificate_eui(der: Option<&[u8]>) -> Result<Eui64, GsError> {
    let der = der.ok_or_else(|| GsError::Unauthenticated("no client certificate".into()))?;
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| GsError::InvalidArgument(format!("client certificate: {}", e)))?;
    let subject = cert.subject();
    let cn = subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| GsError::InvalidArgument("client certificate has no Common Name".into()))?;
    eui_from_common_name(cn)
}

fn offers_subprotocol(request: &Request) -> bool {
    request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|p| p.trim() == SUBPROTOCOL)
}

/// Accepts Industries gateways on `listener` until `shutdown` is cancelled.
///
/// `tls` must verify client certificates against the gateway CA bundle.
pub async fn serve(
    listener: TcpListener,
    tls: Arc<TlsAcceptor>,
    server: Arc<dyn Server>,
    options: IndustriesOptions,
    shutdown: CancellationToken,
) -> Result<(), GsError> {
    info!(address = %listener.local_addr()?, "Industries frontend listening");
    let frontend: Arc<dyn Frontend> = Arc::new(IndustriesFrontend);
    let options = Arc::new(options);
    loop {
        let (tcp, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "Failed to accept Industries connection");
                    continue;
                }
            },
        };
        let _ = tcp.set_nodelay(true);
        let server = Arc::clone(&server);
        let frontend = Arc::clone(&frontend);
        let options = Arc::clone(&options);
        let tls = Arc::clone(&tls);
        tokio::spawn(async move {
            if let Err(err) = handle(tcp, peer, tls, server, frontend, options).await {
                debug!(%peer, error = %err, "Industries gateway rejected");
            }
        });
    }
}

#[instrument(skip_all, fields(%peer))]
async fn handle(
    tcp: tokio::net::TcpStream,
    peer: SocketAddr,
    tls: Arc<TlsAcceptor>,
    server: Arc<dyn Server>,
    frontend: Arc<dyn Frontend>,
    options: Arc<IndustriesOptions>,
) -> Result<(), GsError> {
    let remote_ip = server.base_config().client_addr(peer.ip(), None);
    if let Err(err) = server.rate_limiter().check(&Resource::accept_ttigw(remote_ip)) {
        server
            .metrics()
            .rate_limited
            .with_label_values(&[frontend.protocol()])
            .inc();
        return Err(err);
    }

    let stream = GatewayStream::accept(tcp, Some(&tls)).await?;
    let eui = certificate_eui(stream.peer_certificate());

    let mut negotiated = false;
    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        if offers_subprotocol(request) {
            negotiated = true;
            response
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
        }
        Ok(response)
    };
    let config = WebSocketConfig {
        max_message_size: Some(MAX_WS_MESSAGE),
        ..Default::default()
    };
    let mut ws = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(config)).await?;

    let admitted = if negotiated {
        match eui {
            Ok(eui) => admit(server.as_ref(), &frontend, eui, remote_ip.to_string()).await,
            Err(err) => Err(err),
        }
    } else {
        Err(GsError::PermissionDenied(format!("subprotocol `{}` not offered", SUBPROTOCOL)))
    };
    let conn = match admitted {
        Ok(conn) => conn,
        Err(err) => {
            let code = if negotiated { err.close_code() } else { u16::from(CloseCode::Policy) };
            let _ = ws
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::from(code),
                    reason: err.to_string().into(),
                })))
                .await;
            return Err(err);
        }
    };
    session::serve(ws, server, conn, options).await;
    Ok(())
}

async fn admit(
    server: &dyn Server,
    frontend: &Arc<dyn Frontend>,
    eui: Eui64,
    remote_addr: String,
) -> Result<Arc<Connection>, GsError> {
    let ids = server
        .fill_gateway_context(GatewayIdentifiers::from_eui(eui))
        .await?;
    server.validate_gateway_id(&ids)?;
    server.connect(Arc::clone(frontend), ids, remote_addr).await
}
