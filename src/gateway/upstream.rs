use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use super::connection::UpstreamMessage;
use crate::model::{GatewayIdentifiers, GatewayStatus, TxAcknowledgment, UplinkMessage};
use crate::utils::GsError;

/// Where the Gateway Server delivers traffic from its gateways.
///
/// Messages from one connection are delivered in the order they were received.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn handle_uplink(&self, ids: &GatewayIdentifiers, msg: UplinkMessage) -> Result<(), GsError>;

    async fn handle_status(&self, ids: &GatewayIdentifiers, status: GatewayStatus) -> Result<(), GsError>;

    async fn handle_tx_ack(&self, ids: &GatewayIdentifiers, ack: TxAcknowledgment) -> Result<(), GsError>;
}

/// Logs everything it receives.
#[derive(Debug, Default)]
pub struct LogUpstream;

#[async_trait]
impl Upstream for LogUpstream {
    async fn handle_uplink(&self, ids: &GatewayIdentifiers, msg: UplinkMessage) -> Result<(), GsError> {
        info!(
            gateway_uid = %ids.uid(),
            payload = %hex::encode(&msg.raw_payload),
            antennas = msg.rx_metadata.len(),
            "Uplink"
        );
        Ok(())
    }

    async fn handle_status(&self, ids: &GatewayIdentifiers, status: GatewayStatus) -> Result<(), GsError> {
        info!(gateway_uid = %ids.uid(), metrics = status.metrics.len(), "Gateway status");
        Ok(())
    }

    async fn handle_tx_ack(&self, ids: &GatewayIdentifiers, ack: TxAcknowledgment) -> Result<(), GsError> {
        info!(
            gateway_uid = %ids.uid(),
            result = ack.result,
            correlated = ack.downlink_message.is_some(),
            "TX acknowledgment"
        );
        Ok(())
    }
}

/// Forwards everything into a channel.
#[derive(Debug, Clone)]
pub struct ChannelUpstream {
    tx: mpsc::UnboundedSender<(GatewayIdentifiers, UpstreamMessage)>,
}

impl ChannelUpstream {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(GatewayIdentifiers, UpstreamMessage)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, ids: &GatewayIdentifiers, msg: UpstreamMessage) -> Result<(), GsError> {
        self.tx
            .send((ids.clone(), msg))
            .map_err(|_| GsError::Unavailable("upstream receiver dropped".into()))
    }
}

#[async_trait]
impl Upstream for ChannelUpstream {
    async fn handle_uplink(&self, ids: &GatewayIdentifiers, msg: UplinkMessage) -> Result<(), GsError> {
        self.forward(ids, UpstreamMessage::Uplink(msg))
    }

    async fn handle_status(&self, ids: &GatewayIdentifiers, status: GatewayStatus) -> Result<(), GsError> {
        self.forward(ids, UpstreamMessage::Status(status))
    }

    async fn handle_tx_ack(&self, ids: &GatewayIdentifiers, ack: TxAcknowledgment) -> Result<(), GsError> {
        self.forward(ids, UpstreamMessage::TxAck(ack))
    }
}
