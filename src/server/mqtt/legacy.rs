use std::collections::HashMap;
use std::time::{Duration, UNIX_EPOCH};

use prost::Message;

use super::legacy_proto as legacy;
use super::topics::{TopicLayout, V2Layout};
use super::Format;
use crate::model::{
    data_rate, Band, DataRate, DownlinkMessage, GatewayStatus, Location, LocationSource,
    RxMetadata, TxAcknowledgment, TxSettings, UplinkMessage,
};
use crate::utils::{time, GsError};

/// Difference between EIRP and the ERP the legacy dialect carries.
pub const ERP_DELTA: f32 = 2.15;

/// The v2 dialect of the legacy Things Network stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyFormat;

fn invalid(message: impl Into<String>) -> GsError {
    GsError::InvalidArgument(message.into())
}

/// The band a legacy frequency plan number stands for.
pub fn band_id(plan: legacy::FrequencyPlan) -> &'static str {
    use legacy::FrequencyPlan::*;
    match plan {
        Eu863870 => "EU_863_870",
        Us902928 => "US_902_928",
        Cn779787 => "CN_779_787",
        Eu433 => "EU_433",
        Au915928 => "AU_915_928",
        Cn470510 => "CN_470_510",
        As923 | As920923 | As923925 => "AS_923",
        Kr920923 => "KR_920_923",
        In865867 => "IN_865_867",
        Ru864870 => "RU_864_870",
    }
}

/// Parses `SF<sf>BW<bw_khz>`.
fn parse_lora_data_rate(value: &str, coding_rate: &str) -> Result<DataRate, GsError> {
    let rest = value
        .strip_prefix("SF")
        .ok_or_else(|| invalid(format!("data rate `{}`", value)))?;
    let (sf, bw) = rest
        .split_once("BW")
        .ok_or_else(|| invalid(format!("data rate `{}`", value)))?;
    let spreading_factor: u32 = sf
        .parse()
        .map_err(|_| invalid(format!("spreading factor in `{}`", value)))?;
    let bandwidth_khz: u32 = bw
        .parse()
        .map_err(|_| invalid(format!("bandwidth in `{}`", value)))?;
    let bandwidth = bandwidth_khz
        .checked_mul(1000)
        .ok_or_else(|| invalid(format!("bandwidth in `{}`", value)))?;
    Ok(DataRate::lora(spreading_factor, bandwidth, coding_rate))
}

fn from_unix_nanos(nanos: i64) -> Option<prost_types::Timestamp> {
    (nanos > 0).then(|| time::to_proto(UNIX_EPOCH + Duration::from_nanos(nanos as u64)))
}

fn location(md: &legacy::LocationMetadata) -> Location {
    let source = match legacy::LocationSource::try_from(md.source) {
        Ok(legacy::LocationSource::Gps) => LocationSource::Gps,
        Ok(legacy::LocationSource::Config) => LocationSource::Config,
        Ok(legacy::LocationSource::Registry) => LocationSource::Registry,
        Ok(legacy::LocationSource::IpGeolocation) => LocationSource::IpGeolocation,
        _ => LocationSource::Unknown,
    };
    Location {
        latitude: f64::from(md.latitude),
        longitude: f64::from(md.longitude),
        altitude: md.altitude,
        accuracy: md.accuracy as i32,
        source: source as i32,
    }
}

/// The FCnt of a data frame, read from the frame header.
fn frame_counter(payload: &[u8]) -> u32 {
    let data_frame = matches!(payload.first().map(|mhdr| mhdr >> 5), Some(2..=5));
    if data_frame && payload.len() >= 8 {
        u32::from(u16::from_le_bytes([payload[6], payload[7]]))
    } else {
        0
    }
}

impl Format for LegacyFormat {
    fn protocol(&self) -> &'static str {
        "mqttv2"
    }

    fn layout(&self) -> &dyn TopicLayout {
        &V2Layout
    }

    fn decode_uplink(&self, payload: &[u8]) -> Result<UplinkMessage, GsError> {
        let up = legacy::UplinkMessage::decode(payload)?;
        let lorawan = up
            .protocol_metadata
            .and_then(|md| md.lorawan)
            .ok_or_else(|| invalid("legacy uplink without LoRaWAN metadata"))?;
        let gateway = up
            .gateway_metadata
            .ok_or_else(|| invalid("legacy uplink without gateway metadata"))?;

        let plan = legacy::FrequencyPlan::try_from(lorawan.frequency_plan)
            .map_err(|_| invalid(format!("frequency plan {}", lorawan.frequency_plan)))?;
        let data_rate = match legacy::Modulation::try_from(lorawan.modulation) {
            Ok(legacy::Modulation::Lora) => {
                parse_lora_data_rate(&lorawan.data_rate, &lorawan.coding_rate)?
            }
            Ok(legacy::Modulation::Fsk) => DataRate::fsk(lorawan.bit_rate),
            Err(_) => return Err(invalid(format!("modulation {}", lorawan.modulation))),
        };
        // Bands without tables here are passed through unchecked.
        if let Ok(band) = Band::get(band_id(plan)) {
            if band.data_rate_index(&data_rate).is_none() {
                return Err(invalid(format!(
                    "data rate `{}` not in band {}",
                    lorawan.data_rate, band.id
                )));
            }
        }

        let gateway_time = from_unix_nanos(gateway.time);
        let base = RxMetadata {
            timestamp: gateway.timestamp,
            time: gateway_time.clone(),
            rssi: gateway.rssi,
            channel_rssi: gateway.rssi,
            snr: gateway.snr,
            channel_index: gateway.channel,
            location: gateway.location.as_ref().map(location),
            ..Default::default()
        };
        let rx_metadata = if gateway.antennas.is_empty() {
            vec![base]
        } else {
            gateway
                .antennas
                .iter()
                .map(|antenna| RxMetadata {
                    antenna_index: antenna.antenna,
                    channel_index: antenna.channel,
                    rssi: antenna.rssi,
                    channel_rssi: if antenna.channel_rssi != 0.0 {
                        antenna.channel_rssi
                    } else {
                        antenna.rssi
                    },
                    snr: antenna.snr,
                    frequency_offset: antenna.frequency_offset,
                    ..base.clone()
                })
                .collect()
        };

        Ok(UplinkMessage {
            raw_payload: up.payload,
            settings: Some(TxSettings {
                data_rate: Some(data_rate),
                frequency: gateway.frequency,
                timestamp: gateway.timestamp,
                time: gateway_time,
                ..Default::default()
            }),
            rx_metadata,
            ..Default::default()
        })
    }

    fn decode_status(&self, payload: &[u8]) -> Result<GatewayStatus, GsError> {
        let status = legacy::Status::decode(payload)?;
        let mut versions = HashMap::new();
        for (key, value) in [
            ("platform", &status.platform),
            ("fpga", &status.fpga),
            ("dsp", &status.dsp),
            ("hal", &status.hal),
        ] {
            if !value.is_empty() {
                versions.insert(key.to_string(), value.clone());
            }
        }
        let mut metrics: HashMap<String, f32> = [
            ("lmnw", status.lm_nw),
            ("lmst", status.lm_st),
            ("lmok", status.lm_ok),
            ("lpps", status.l_pps),
            ("rxin", status.rx_in),
            ("rxok", status.rx_ok),
            ("txin", status.tx_in),
            ("txok", status.tx_ok),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value as f32))
        .collect();
        if let Some(os) = &status.os {
            metrics.extend(
                [
                    ("cpu_percentage", os.cpu_percentage),
                    ("load_1", os.load_1),
                    ("load_5", os.load_5),
                    ("load_15", os.load_15),
                    ("memory_percentage", os.memory_percentage),
                    ("temp", os.temperature),
                ]
                .into_iter()
                .map(|(key, value)| (key.to_string(), value)),
            );
        }
        Ok(GatewayStatus {
            time: from_unix_nanos(status.time),
            boot_time: from_unix_nanos(status.boot_time),
            versions,
            antenna_locations: status.location.as_ref().map(location).into_iter().collect(),
            ip: status.ip,
            metrics,
            advanced: None,
        })
    }

    fn decode_tx_ack(&self, _payload: &[u8]) -> Result<TxAcknowledgment, GsError> {
        Err(invalid("legacy format has no TX acknowledgments"))
    }

    fn encode_downlink(&self, down: &DownlinkMessage) -> Result<Vec<u8>, GsError> {
        let settings = down
            .scheduled()
            .ok_or_else(|| invalid("legacy downlink must be scheduled"))?;
        let tx = settings.downlink.clone().unwrap_or_default();
        let mut lorawan = legacy::LorawanTxConfiguration {
            f_cnt: frame_counter(&down.raw_payload),
            ..Default::default()
        };
        match settings.data_rate.as_ref().and_then(|dr| dr.modulation.as_ref()) {
            Some(data_rate::Modulation::Lora(lora)) => {
                lorawan.modulation = legacy::Modulation::Lora as i32;
                lorawan.data_rate =
                    format!("SF{}BW{}", lora.spreading_factor, lora.bandwidth / 1000);
                lorawan.coding_rate = lora.coding_rate.clone();
            }
            Some(data_rate::Modulation::Fsk(fsk)) => {
                lorawan.modulation = legacy::Modulation::Fsk as i32;
                lorawan.bit_rate = fsk.bit_rate;
            }
            None => return Err(invalid("legacy downlink without data rate")),
        }
        let message = legacy::DownlinkMessage {
            payload: down.raw_payload.clone(),
            protocol_configuration: Some(legacy::ProtocolTxConfiguration {
                lorawan: Some(lorawan),
            }),
            gateway_configuration: Some(legacy::GatewayTxConfiguration {
                timestamp: settings.timestamp,
                rf_chain: 0,
                frequency: settings.frequency,
                power: (tx.tx_power - ERP_DELTA).round() as i32,
                polarization_inversion: tx.invert_polarization,
                frequency_deviation: 0,
            }),
        };
        Ok(message.encode_to_vec())
    }
}
