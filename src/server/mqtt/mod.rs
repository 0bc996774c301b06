//! The MQTT frontend, in the v3 (Protobuf) and the legacy v2 dialect.
//!
//! Gateways connect as MQTT clients: they publish uplinks, statuses and TX
//! acknowledgments, and subscribe to their downlink topic. The server side of the
//! broker is implemented here; there is no general purpose routing between clients.

pub mod legacy;
pub mod legacy_proto;
pub mod packet;
pub mod protobuf;
pub mod session;
pub mod topics;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use legacy::LegacyFormat;
pub use protobuf::ProtobufFormat;
pub use topics::{TopicAccess, TopicLayout};

use crate::gateway::{Frontend, Server};
use crate::model::{DownlinkMessage, GatewayStatus, TxAcknowledgment, UplinkMessage};
use crate::server::stream::GatewayStream;
use crate::utils::GsError;

/// The payload codec and topic layout of one MQTT dialect.
///
/// Decoding errors are always `InvalidArgument`.
pub trait Format: Send + Sync + Debug {
    /// The protocol name reported in connection stats and metrics.
    fn protocol(&self) -> &'static str;

    fn layout(&self) -> &dyn TopicLayout;

    fn decode_uplink(&self, payload: &[u8]) -> Result<UplinkMessage, GsError>;

    fn decode_status(&self, payload: &[u8]) -> Result<GatewayStatus, GsError>;

    fn decode_tx_ack(&self, payload: &[u8]) -> Result<TxAcknowledgment, GsError>;

    /// Encodes a scheduled downlink for publication on the downlink topic.
    fn encode_downlink(&self, down: &DownlinkMessage) -> Result<Vec<u8>, GsError>;
}

/// An MQTT frontend bound to one dialect.
#[derive(Debug)]
pub struct MqttFrontend {
    format: Arc<dyn Format>,
}

impl MqttFrontend {
    pub fn new(format: Arc<dyn Format>) -> Self {
        Self { format }
    }

    pub fn format(&self) -> &Arc<dyn Format> {
        &self.format
    }
}

impl Frontend for MqttFrontend {
    fn protocol(&self) -> &'static str {
        self.format.protocol()
    }

    fn supports_downlink_claim(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct MqttOptions {
    /// How long a client has to send CONNECT after the socket opened.
    pub connect_timeout: Duration,
    pub max_packet_size: usize,
}

impl Default for MqttOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_packet_size: crate::server::middleware::validation::MAX_MQTT_PACKET,
        }
    }
}

/// Accepts MQTT clients on `listener` until `shutdown` is cancelled.
///
/// Every client is served on its own task.
pub async fn serve(
    listener: TcpListener,
    tls: Option<Arc<TlsAcceptor>>,
    server: Arc<dyn Server>,
    format: Arc<dyn Format>,
    options: MqttOptions,
    shutdown: CancellationToken,
) -> Result<(), GsError> {
    let frontend: Arc<dyn Frontend> = Arc::new(MqttFrontend::new(Arc::clone(&format)));
    info!(
        address = %listener.local_addr()?,
        protocol = frontend.protocol(),
        tls = tls.is_some(),
        "MQTT frontend listening"
    );
    loop {
        let (tcp, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "Failed to accept MQTT connection");
                    continue;
                }
            },
        };
        let _ = tcp.set_nodelay(true);
        let server = Arc::clone(&server);
        let frontend = Arc::clone(&frontend);
        let format = Arc::clone(&format);
        let options = options.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            let stream = match GatewayStream::accept(tcp, tls.as_ref()).await {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(%peer, error = %err, "MQTT client dropped during handshake");
                    return;
                }
            };
            if let Err(err) =
                session::serve_session(server, frontend, format, stream, peer, &options).await
            {
                debug!(%peer, error = %err, "MQTT session ended");
            }
        });
    }
}
