use prost::Message;

use super::topics::{TopicLayout, V3Layout};
use super::Format;
use crate::model::{DownlinkMessage, GatewayDown, GatewayStatus, TxAcknowledgment, UplinkMessage};
use crate::utils::GsError;

/// The v3 dialect: the model messages, Protobuf encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtobufFormat;

impl Format for ProtobufFormat {
    fn protocol(&self) -> &'static str {
        "mqtt"
    }

    fn layout(&self) -> &dyn TopicLayout {
        &V3Layout
    }

    fn decode_uplink(&self, payload: &[u8]) -> Result<UplinkMessage, GsError> {
        Ok(UplinkMessage::decode(payload)?)
    }

    fn decode_status(&self, payload: &[u8]) -> Result<GatewayStatus, GsError> {
        Ok(GatewayStatus::decode(payload)?)
    }

    fn decode_tx_ack(&self, payload: &[u8]) -> Result<TxAcknowledgment, GsError> {
        Ok(TxAcknowledgment::decode(payload)?)
    }

    fn encode_downlink(&self, down: &DownlinkMessage) -> Result<Vec<u8>, GsError> {
        Ok(GatewayDown {
            downlink_message: Some(down.clone()),
        }
        .encode_to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{downlink_message, TxSettings};

    #[test]
    fn downlinks_are_wrapped_in_gateway_down() {
        let down = DownlinkMessage {
            raw_payload: vec![0x60, 1, 2],
            correlation_ids: vec!["gs:uplink:1".into()],
            settings: Some(downlink_message::Settings::Scheduled(TxSettings {
                frequency: 868_100_000,
                ..Default::default()
            })),
        };
        let bytes = ProtobufFormat.encode_downlink(&down).unwrap();
        let decoded = GatewayDown::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.downlink_message, Some(down));
    }

    #[test]
    fn garbage_is_invalid_argument() {
        let err = ProtobufFormat.decode_uplink(&[0xff, 0xff, 0xff]).unwrap_err();
        assert_eq!(err.code(), crate::utils::ErrorCode::InvalidArgument);
    }
}
