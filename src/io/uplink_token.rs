//! The opaque uplink token minted for every reception.
//!
//! It embeds everything needed to schedule a class A downlink relative to the uplink
//! later on, so that no per-uplink state is kept in the server.

use std::time::SystemTime;

use prost::Message;

use crate::model::{GatewayAntennaIdentifiers, GatewayIdentifiers, UplinkToken};
use crate::utils::{time, GsError};

/// Builds and encodes an uplink token.
pub fn mint(
    ids: &GatewayIdentifiers,
    antenna_index: u32,
    timestamp: u32,
    concentrator_time: i64,
    server_time: SystemTime,
    gateway_time: Option<SystemTime>,
) -> Vec<u8> {
    let token = UplinkToken {
        ids: Some(GatewayAntennaIdentifiers {
            gateway_ids: Some(ids.clone()),
            antenna_index,
        }),
        timestamp,
        server_time: Some(time::to_proto(server_time)),
        concentrator_time,
        gateway_time: gateway_time.map(time::to_proto),
    };
    token.encode_to_vec()
}

/// Decodes a token received back in a downlink path.
///
/// # Errors
///
/// Returns `GsError::InvalidArgument` when the token is empty or not a token.
pub fn decode(bytes: &[u8]) -> Result<UplinkToken, GsError> {
    if bytes.is_empty() {
        return Err(GsError::InvalidArgument("empty uplink token".into()));
    }
    let token = UplinkToken::decode(bytes)?;
    if token.ids.is_none() {
        return Err(GsError::InvalidArgument("uplink token without identifiers".into()));
    }
    Ok(token)
}

impl UplinkToken {
    pub fn gateway_ids(&self) -> Option<&GatewayIdentifiers> {
        self.ids.as_ref().and_then(|ids| ids.gateway_ids.as_ref())
    }

    pub fn antenna_index(&self) -> u32 {
        self.ids.as_ref().map(|ids| ids.antenna_index).unwrap_or_default()
    }

    pub fn server_time(&self) -> Option<SystemTime> {
        self.server_time.as_ref().and_then(time::from_proto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn mint_and_decode() {
        let ids = GatewayIdentifiers::from_id("test-gateway");
        let received = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let bytes = mint(&ids, 1, 10_000_000, 0x0001_0000_0098_9680, received, None);
        let token = decode(&bytes).unwrap();
        assert_eq!(token.gateway_ids().unwrap().gateway_id, "test-gateway");
        assert_eq!(token.antenna_index(), 1);
        assert_eq!(token.timestamp, 10_000_000);
        assert_eq!(token.concentrator_time, 0x0001_0000_0098_9680);
        assert_eq!(token.server_time(), Some(received));
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode(&[]).is_err());
        assert!(decode(&[0xff, 0xff, 0xff]).is_err());
    }
}
