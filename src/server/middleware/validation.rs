use crate::model::UplinkMessage;
use crate::utils::GsError;

/// Maximum body of plain HTTP requests, including the Basic Station discovery.
pub const MAX_HTTP_BODY: usize = 4096;

/// Maximum size of one WebSocket message from a gateway.
pub const MAX_WS_MESSAGE: usize = 64 * 1024;

/// Maximum size of one MQTT packet from a gateway.
pub const MAX_MQTT_PACKET: usize = 64 * 1024;

/// Largest LoRaWAN PHYPayload.
pub const MAX_PHY_PAYLOAD: usize = 255;

/// Validates an uplink before it is forwarded upstream.
///
/// # Arguments
///
/// * `msg` - The uplink as decoded from the wire.
///
/// # Returns
///
/// * `Ok(())` if the uplink is well formed.
/// * `Err(GsError::InvalidArgument)` if the payload is empty or too long, or the
///   frame has no radio metadata.
pub fn validate_uplink(msg: &UplinkMessage) -> Result<(), GsError> {
    if msg.raw_payload.is_empty() {
        return Err(GsError::InvalidArgument("uplink without payload".into()));
    }
    if msg.raw_payload.len() > MAX_PHY_PAYLOAD {
        return Err(GsError::InvalidArgument(format!(
            "uplink payload of {} bytes exceeds {}",
            msg.raw_payload.len(),
            MAX_PHY_PAYLOAD
        )));
    }
    if msg.rx_metadata.is_empty() {
        return Err(GsError::InvalidArgument("uplink without RX metadata".into()));
    }
    Ok(())
}
