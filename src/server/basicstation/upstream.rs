//! Station to server: uplink frames, version, TX confirmations and time sync.

use std::collections::HashMap;
use std::time::{Instant, SystemTime};

use crate::io::{uplink_token, DownlinkTokens};
use crate::model::{
    Band, GatewayIdentifiers, GatewayStatus, RxMetadata, TxAckResult, TxAcknowledgment,
    TxSettings, UplinkMessage,
};
use crate::utils::{time, GsError};

use super::messages::{
    JoinRequest, ProprietaryDataFrame, RadioMetadata, TimeSyncRequest, TimeSyncResponse,
    TxConfirmation, UplinkDataFrame, Version,
};

/// The 32-bit concentrator timestamp carried in the low bits of `xtime`.
pub fn xtime_timestamp(xtime: i64) -> u32 {
    (xtime & 0xFFFF_FFFF) as u32
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>, GsError> {
    hex::decode(value).map_err(|e| GsError::InvalidArgument(format!("{}: {}", field, e)))
}

/// Rebuilds the PHY payload of a join request.
pub fn join_request_payload(jreq: &JoinRequest) -> Vec<u8> {
    let mut payload = Vec::with_capacity(23);
    payload.push(jreq.mhdr);
    payload.extend(jreq.join_eui.0.iter().rev());
    payload.extend(jreq.dev_eui.0.iter().rev());
    payload.extend(jreq.dev_nonce.to_le_bytes());
    payload.extend(jreq.mic.to_le_bytes());
    payload
}

/// Rebuilds the PHY payload of a data frame.
///
/// # Errors
///
/// Returns `GsError::InvalidArgument` when `FOpts` or `FRMPayload` is not hex, or
/// `FPort` is out of range.
pub fn data_frame_payload(updf: &UplinkDataFrame) -> Result<Vec<u8>, GsError> {
    let fopts = decode_hex("FOpts", &updf.fopts)?;
    let frm_payload = decode_hex("FRMPayload", &updf.frm_payload)?;
    let mut payload = Vec::with_capacity(13 + fopts.len() + frm_payload.len());
    payload.push(updf.mhdr);
    payload.extend((updf.dev_addr as u32).to_le_bytes());
    payload.push(updf.fctrl);
    payload.extend(updf.fcnt.to_le_bytes());
    payload.extend(fopts);
    match updf.fport {
        -1 => {
            if !frm_payload.is_empty() {
                return Err(GsError::InvalidArgument("FRMPayload without FPort".into()));
            }
        }
        0..=255 => {
            payload.push(updf.fport as u8);
            payload.extend(frm_payload);
        }
        other => {
            return Err(GsError::InvalidArgument(format!("FPort {} out of range", other)));
        }
    }
    payload.extend(updf.mic.to_le_bytes());
    Ok(payload)
}

/// Reception context needed to turn a station frame into an uplink.
pub struct UplinkContext<'a> {
    pub ids: &'a GatewayIdentifiers,
    pub band: &'a Band,
    pub received_at: SystemTime,
}

fn to_uplink(
    raw_payload: Vec<u8>,
    radio: &RadioMetadata,
    ctx: &UplinkContext<'_>,
) -> Result<UplinkMessage, GsError> {
    let data_rate = ctx
        .band
        .data_rate(radio.data_rate)
        .ok_or_else(|| {
            GsError::InvalidArgument(format!(
                "data rate {} is not defined in band {}",
                radio.data_rate, ctx.band.id
            ))
        })?
        .to_data_rate();
    let info = &radio.up_info;
    let timestamp = xtime_timestamp(info.xtime);
    let gateway_time = time::from_unix_f64(info.rxtime);
    let gps_time = (info.gpstime > 0).then(|| time::to_proto(time::from_gps_micros(info.gpstime)));
    let antenna_index = u32::try_from(info.rctx).unwrap_or_default();

    Ok(UplinkMessage {
        raw_payload,
        settings: Some(TxSettings {
            data_rate: Some(data_rate),
            frequency: radio.frequency,
            timestamp,
            time: gps_time.clone(),
            ..Default::default()
        }),
        rx_metadata: vec![RxMetadata {
            gateway_ids: Some(ctx.ids.clone()),
            antenna_index,
            time: gateway_time.map(time::to_proto),
            timestamp,
            fine_timestamp: info.fts.filter(|fts| *fts >= 0).unwrap_or_default() as u64,
            rssi: info.rssi,
            channel_rssi: info.rssi,
            snr: info.snr,
            uplink_token: uplink_token::mint(
                ctx.ids,
                antenna_index,
                timestamp,
                info.xtime,
                ctx.received_at,
                gateway_time,
            ),
            gps_time,
            received_at: Some(time::to_proto(ctx.received_at)),
            ..Default::default()
        }],
        received_at: Some(time::to_proto(ctx.received_at)),
        crc_status: Some(true),
        ..Default::default()
    })
}

pub fn join_request_to_uplink(
    jreq: &JoinRequest,
    ctx: &UplinkContext<'_>,
) -> Result<UplinkMessage, GsError> {
    to_uplink(join_request_payload(jreq), &jreq.radio, ctx)
}

pub fn data_frame_to_uplink(
    updf: &UplinkDataFrame,
    ctx: &UplinkContext<'_>,
) -> Result<UplinkMessage, GsError> {
    to_uplink(data_frame_payload(updf)?, &updf.radio, ctx)
}

pub fn proprietary_to_uplink(
    propdf: &ProprietaryDataFrame,
    ctx: &UplinkContext<'_>,
) -> Result<UplinkMessage, GsError> {
    to_uplink(decode_hex("FRMPayload", &propdf.frm_payload)?, &propdf.radio, ctx)
}

/// The status reported when a station announces its version.
pub fn version_to_status(version: &Version, now: SystemTime) -> GatewayStatus {
    let platform = format!(
        "{} - Firmware {} - Protocol {}",
        version.model, version.firmware, version.protocol
    );
    let versions = HashMap::from([
        ("station".to_string(), version.station.clone()),
        ("firmware".to_string(), version.firmware.clone()),
        ("package".to_string(), version.package.clone()),
        ("platform".to_string(), platform),
    ]);
    let string_value = |s: &str| prost_types::Value {
        kind: Some(prost_types::value::Kind::StringValue(s.to_string())),
    };
    let advanced = prost_types::Struct {
        fields: [
            ("model".to_string(), string_value(&version.model)),
            ("features".to_string(), string_value(&version.features)),
        ]
        .into_iter()
        .collect(),
    };
    GatewayStatus {
        time: Some(time::to_proto(now)),
        versions,
        advanced: Some(advanced),
        ..Default::default()
    }
}

/// Resolves a `dntxed` to the acknowledgment of the downlink it confirms.
///
/// Returns `None` when `diid` is not a token this session issued, or it has been
/// overwritten since.
pub fn tx_confirmation_to_ack(
    tokens: &DownlinkTokens,
    confirmation: &TxConfirmation,
    now: Instant,
) -> Option<TxAcknowledgment> {
    let token = u16::try_from(confirmation.diid).ok()?;
    let (message, _) = tokens.get(token, now)?;
    Some(TxAcknowledgment {
        correlation_ids: message.correlation_ids.clone(),
        result: TxAckResult::Success as i32,
        downlink_message: Some(message),
    })
}

pub fn time_sync_response(request: &TimeSyncRequest, now: SystemTime) -> TimeSyncResponse {
    TimeSyncResponse {
        txtime: request.txtime,
        gpstime: time::to_gps_micros(now),
        mux_time: time::to_unix_f64(now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::band::EU_863_870;
    use crate::model::DownlinkMessage;
    use crate::server::basicstation::messages::UpInfo;
    use crate::utils::Eui64;
    use std::time::Duration;

    fn radio(xtime: i64) -> RadioMetadata {
        RadioMetadata {
            data_rate: 5,
            frequency: 868_100_000,
            up_info: UpInfo {
                rctx: 1,
                xtime,
                gpstime: 1_300_000_000_000_000,
                fts: None,
                rssi: -42.0,
                snr: 9.5,
                rxtime: 1_700_000_000.5,
            },
        }
    }

    fn updf(fport: i32, frm_payload: &str) -> UplinkDataFrame {
        UplinkDataFrame {
            mhdr: 0x40,
            dev_addr: 0x2601_1234,
            fctrl: 0x80,
            fcnt: 2,
            fopts: "0a0b".into(),
            fport,
            frm_payload: frm_payload.into(),
            mic: 0x0403_0201,
            radio: radio(0x0001_0000_0098_9680),
            ref_time: 0.0,
        }
    }

    #[test]
    fn data_frame_payload_layout() {
        let payload = data_frame_payload(&updf(1, "aabb")).unwrap();
        assert_eq!(
            payload,
            vec![0x40, 0x34, 0x12, 0x01, 0x26, 0x80, 0x02, 0x00, 0x0a, 0x0b, 0x01, 0xaa, 0xbb, 1, 2, 3, 4]
        );
        let no_port = data_frame_payload(&updf(-1, "")).unwrap();
        assert_eq!(no_port.len(), 1 + 4 + 1 + 2 + 2 + 4);

        assert!(data_frame_payload(&updf(-1, "aa")).is_err());
        assert!(data_frame_payload(&updf(256, "")).is_err());
        assert!(data_frame_payload(&updf(1, "zz")).is_err());
    }

    #[test]
    fn join_request_payload_is_little_endian() {
        let jreq = JoinRequest {
            mhdr: 0,
            join_eui: Eui64::from_u64(0x0102_0304_0506_0708),
            dev_eui: Eui64::from_u64(0x1112_1314_1516_1718),
            dev_nonce: 0x2122,
            mic: 0x3132_3334,
            radio: radio(1),
            ref_time: 0.0,
        };
        let payload = join_request_payload(&jreq);
        assert_eq!(payload.len(), 23);
        assert_eq!(&payload[1..9], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&payload[17..19], &[0x22, 0x21]);
        assert_eq!(&payload[19..], &[0x34, 0x33, 0x32, 0x31]);
    }

    #[test]
    fn uplink_carries_xtime_in_token() {
        let ids = GatewayIdentifiers::from_id("test-gateway");
        let band = Band::get(EU_863_870).unwrap();
        let received_at = SystemTime::now();
        let ctx = UplinkContext {
            ids: &ids,
            band,
            received_at,
        };
        let xtime = 0x0001_0000_0098_9680;
        let up = data_frame_to_uplink(&updf(1, "aa"), &ctx).unwrap();
        let settings = up.settings.as_ref().unwrap();
        assert_eq!(settings.timestamp, 10_000_000);
        assert_eq!(settings.data_rate.as_ref().unwrap().as_lora().unwrap().spreading_factor, 7);

        let md = &up.rx_metadata[0];
        assert_eq!(md.antenna_index, 1);
        assert_eq!(md.rssi, -42.0);
        assert_eq!(md.channel_rssi, -42.0);
        assert!(md.gps_time.is_some());
        let token = uplink_token::decode(&md.uplink_token).unwrap();
        assert_eq!(token.concentrator_time, xtime);
        assert_eq!(token.timestamp, 10_000_000);

        let mut bad = updf(1, "aa");
        bad.radio.data_rate = 12;
        assert!(data_frame_to_uplink(&bad, &ctx).is_err());
    }

    #[test]
    fn version_becomes_status() {
        let version = Version {
            station: "2.0.6".into(),
            firmware: "1.0".into(),
            package: "pkg".into(),
            model: "rpi".into(),
            protocol: 2,
            features: "rmtsh gps".into(),
        };
        let status = version_to_status(&version, SystemTime::now());
        assert_eq!(status.versions["platform"], "rpi - Firmware 1.0 - Protocol 2");
        assert_eq!(status.versions["station"], "2.0.6");
        assert!(status.advanced.unwrap().fields.contains_key("features"));
    }

    #[test]
    fn confirmations_resolve_issued_tokens() {
        let mut tokens = DownlinkTokens::new();
        let now = Instant::now();
        let down = DownlinkMessage {
            raw_payload: vec![0x60],
            correlation_ids: vec!["ns:downlink:1".into()],
            ..Default::default()
        };
        let diid = tokens.next(down.clone(), now);
        let confirmation = TxConfirmation {
            diid: i64::from(diid),
            dev_eui: Eui64::ZERO,
            rctx: 0,
            xtime: 0,
            txtime: 0.0,
            gpstime: 0,
        };
        let ack = tx_confirmation_to_ack(&tokens, &confirmation, now + Duration::from_secs(1)).unwrap();
        assert_eq!(ack.result, TxAckResult::Success as i32);
        assert_eq!(ack.downlink_message, Some(down));

        let unknown = TxConfirmation {
            diid: 70_000,
            ..confirmation
        };
        assert!(tx_confirmation_to_ack(&tokens, &unknown, now).is_none());
    }
}
