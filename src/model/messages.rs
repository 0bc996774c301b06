//! The uniform message vocabulary exchanged between frontends and the Gateway Server.
//!
//! These are Protobuf messages: the MQTT v3 format and the gRPC frontend put them on
//! the wire as-is, every other frontend translates to and from them.

use std::collections::HashMap;

use super::ids::{GatewayAntennaIdentifiers, GatewayIdentifiers};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum LocationSource {
    Unknown = 0,
    Gps = 1,
    Config = 2,
    Registry = 3,
    IpGeolocation = 4,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Location {
    #[prost(double, tag = "1")]
    pub latitude: f64,
    #[prost(double, tag = "2")]
    pub longitude: f64,
    #[prost(int32, tag = "3")]
    pub altitude: i32,
    #[prost(int32, tag = "4")]
    pub accuracy: i32,
    #[prost(enumeration = "LocationSource", tag = "5")]
    pub source: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LoRaDataRate {
    /// Bandwidth in Hz.
    #[prost(uint32, tag = "1")]
    pub bandwidth: u32,
    #[prost(uint32, tag = "2")]
    pub spreading_factor: u32,
    #[prost(string, tag = "3")]
    pub coding_rate: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FskDataRate {
    #[prost(uint32, tag = "1")]
    pub bit_rate: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DataRate {
    #[prost(oneof = "data_rate::Modulation", tags = "1, 2")]
    pub modulation: Option<data_rate::Modulation>,
}

pub mod data_rate {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Modulation {
        #[prost(message, tag = "1")]
        Lora(super::LoRaDataRate),
        #[prost(message, tag = "2")]
        Fsk(super::FskDataRate),
    }
}

impl DataRate {
    pub fn lora(spreading_factor: u32, bandwidth: u32, coding_rate: &str) -> Self {
        DataRate {
            modulation: Some(data_rate::Modulation::Lora(LoRaDataRate {
                bandwidth,
                spreading_factor,
                coding_rate: coding_rate.to_string(),
            })),
        }
    }

    pub fn fsk(bit_rate: u32) -> Self {
        DataRate {
            modulation: Some(data_rate::Modulation::Fsk(FskDataRate { bit_rate })),
        }
    }

    pub fn as_lora(&self) -> Option<&LoRaDataRate> {
        match &self.modulation {
            Some(data_rate::Modulation::Lora(lora)) => Some(lora),
            _ => None,
        }
    }

    pub fn as_fsk(&self) -> Option<&FskDataRate> {
        match &self.modulation {
            Some(data_rate::Modulation::Fsk(fsk)) => Some(fsk),
            _ => None,
        }
    }

    /// Compares modulation parameters, ignoring the coding rate.
    pub fn same_modulation(&self, other: &DataRate) -> bool {
        match (&self.modulation, &other.modulation) {
            (Some(data_rate::Modulation::Lora(a)), Some(data_rate::Modulation::Lora(b))) => {
                a.spreading_factor == b.spreading_factor && a.bandwidth == b.bandwidth
            }
            (Some(data_rate::Modulation::Fsk(a)), Some(data_rate::Modulation::Fsk(b))) => {
                a.bit_rate == b.bit_rate
            }
            _ => false,
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TxSettings {
    #[prost(message, optional, tag = "1")]
    pub data_rate: Option<DataRate>,
    /// Frequency in Hz.
    #[prost(uint64, tag = "2")]
    pub frequency: u64,
    #[prost(bool, tag = "3")]
    pub enable_crc: bool,
    /// Concentrator timestamp in microseconds; rolls over every 2^32 µs.
    #[prost(uint32, tag = "4")]
    pub timestamp: u32,
    #[prost(message, optional, tag = "5")]
    pub time: Option<prost_types::Timestamp>,
    /// Only set for downlinks.
    #[prost(message, optional, tag = "6")]
    pub downlink: Option<tx_settings::Downlink>,
}

pub mod tx_settings {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Downlink {
        #[prost(uint32, tag = "1")]
        pub antenna_index: u32,
        /// EIRP in dBm.
        #[prost(float, tag = "2")]
        pub tx_power: f32,
        #[prost(bool, tag = "3")]
        pub invert_polarization: bool,
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RxMetadata {
    #[prost(message, optional, tag = "1")]
    pub gateway_ids: Option<GatewayIdentifiers>,
    #[prost(uint32, tag = "2")]
    pub antenna_index: u32,
    #[prost(message, optional, tag = "3")]
    pub time: Option<prost_types::Timestamp>,
    #[prost(uint32, tag = "4")]
    pub timestamp: u32,
    #[prost(uint64, tag = "5")]
    pub fine_timestamp: u64,
    #[prost(float, tag = "6")]
    pub rssi: f32,
    #[prost(float, tag = "7")]
    pub channel_rssi: f32,
    #[prost(float, tag = "8")]
    pub snr: f32,
    #[prost(message, optional, tag = "9")]
    pub location: Option<Location>,
    /// Opaque token minted by the Gateway Server, see `io::uplink_token`.
    #[prost(bytes = "vec", tag = "10")]
    pub uplink_token: Vec<u8>,
    #[prost(uint32, tag = "11")]
    pub channel_index: u32,
    #[prost(message, optional, tag = "12")]
    pub gps_time: Option<prost_types::Timestamp>,
    #[prost(message, optional, tag = "13")]
    pub received_at: Option<prost_types::Timestamp>,
    #[prost(int64, tag = "14")]
    pub frequency_offset: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UplinkMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub raw_payload: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub settings: Option<TxSettings>,
    #[prost(message, repeated, tag = "3")]
    pub rx_metadata: Vec<RxMetadata>,
    #[prost(message, optional, tag = "4")]
    pub received_at: Option<prost_types::Timestamp>,
    #[prost(string, repeated, tag = "5")]
    pub correlation_ids: Vec<String>,
    #[prost(bool, optional, tag = "6")]
    pub crc_status: Option<bool>,
}

impl UplinkMessage {
    /// The concentrator timestamp of the reception, if any metadata is present.
    pub fn timestamp(&self) -> u32 {
        self.settings
            .as_ref()
            .map(|s| s.timestamp)
            .filter(|ts| *ts != 0)
            .or_else(|| self.rx_metadata.first().map(|md| md.timestamp))
            .unwrap_or_default()
    }

    /// The best channel RSSI across the antennas that received the frame.
    pub fn best_channel_rssi(&self) -> f32 {
        self.rx_metadata
            .iter()
            .map(|md| md.channel_rssi)
            .fold(f32::NEG_INFINITY, f32::max)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Class {
    A = 0,
    B = 1,
    C = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum TxSchedulePriority {
    Lowest = 0,
    Low = 1,
    BelowNormal = 2,
    Normal = 3,
    AboveNormal = 4,
    High = 5,
    Highest = 6,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DownlinkPath {
    #[prost(oneof = "downlink_path::Path", tags = "1, 2")]
    pub path: Option<downlink_path::Path>,
}

pub mod downlink_path {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Path {
        #[prost(bytes, tag = "1")]
        UplinkToken(Vec<u8>),
        #[prost(message, tag = "2")]
        Fixed(super::GatewayAntennaIdentifiers),
    }
}

impl DownlinkPath {
    pub fn uplink_token(token: Vec<u8>) -> Self {
        DownlinkPath {
            path: Some(downlink_path::Path::UplinkToken(token)),
        }
    }

    pub fn fixed(ids: GatewayIdentifiers, antenna_index: u32) -> Self {
        DownlinkPath {
            path: Some(downlink_path::Path::Fixed(GatewayAntennaIdentifiers {
                gateway_ids: Some(ids),
                antenna_index,
            })),
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TxRequest {
    #[prost(enumeration = "Class", tag = "1")]
    pub class: i32,
    #[prost(message, repeated, tag = "2")]
    pub downlink_paths: Vec<DownlinkPath>,
    /// RX1 delay in seconds.
    #[prost(uint32, tag = "3")]
    pub rx1_delay: u32,
    #[prost(message, optional, tag = "4")]
    pub rx1_data_rate: Option<DataRate>,
    #[prost(uint64, tag = "5")]
    pub rx1_frequency: u64,
    #[prost(message, optional, tag = "6")]
    pub rx2_data_rate: Option<DataRate>,
    #[prost(uint64, tag = "7")]
    pub rx2_frequency: u64,
    #[prost(enumeration = "TxSchedulePriority", tag = "8")]
    pub priority: i32,
    #[prost(message, optional, tag = "9")]
    pub absolute_time: Option<prost_types::Timestamp>,
    #[prost(string, tag = "10")]
    pub frequency_plan_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DownlinkMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub raw_payload: Vec<u8>,
    #[prost(string, repeated, tag = "2")]
    pub correlation_ids: Vec<String>,
    #[prost(oneof = "downlink_message::Settings", tags = "3, 4")]
    pub settings: Option<downlink_message::Settings>,
}

pub mod downlink_message {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Settings {
        #[prost(message, tag = "3")]
        Request(super::TxRequest),
        #[prost(message, tag = "4")]
        Scheduled(super::TxSettings),
    }
}

impl DownlinkMessage {
    pub fn scheduled(&self) -> Option<&TxSettings> {
        match &self.settings {
            Some(downlink_message::Settings::Scheduled(settings)) => Some(settings),
            _ => None,
        }
    }

    pub fn request(&self) -> Option<&TxRequest> {
        match &self.settings {
            Some(downlink_message::Settings::Request(request)) => Some(request),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum TxAckResult {
    Success = 0,
    UnknownError = 1,
    TooLate = 2,
    TooEarly = 3,
    CollisionPacket = 4,
    CollisionBeacon = 5,
    TxFreq = 6,
    TxPower = 7,
    GpsUnlocked = 8,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TxAcknowledgment {
    #[prost(string, repeated, tag = "1")]
    pub correlation_ids: Vec<String>,
    #[prost(enumeration = "TxAckResult", tag = "2")]
    pub result: i32,
    #[prost(message, optional, tag = "3")]
    pub downlink_message: Option<DownlinkMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GatewayStatus {
    #[prost(message, optional, tag = "1")]
    pub time: Option<prost_types::Timestamp>,
    #[prost(message, optional, tag = "2")]
    pub boot_time: Option<prost_types::Timestamp>,
    #[prost(map = "string, string", tag = "3")]
    pub versions: HashMap<String, String>,
    #[prost(message, repeated, tag = "4")]
    pub antenna_locations: Vec<Location>,
    #[prost(string, repeated, tag = "5")]
    pub ip: Vec<String>,
    #[prost(map = "string, float", tag = "6")]
    pub metrics: HashMap<String, f32>,
    #[prost(message, optional, tag = "7")]
    pub advanced: Option<prost_types::Struct>,
}

/// Everything a gateway may send in one frame.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GatewayUp {
    #[prost(message, repeated, tag = "1")]
    pub uplink_messages: Vec<UplinkMessage>,
    #[prost(message, optional, tag = "2")]
    pub gateway_status: Option<GatewayStatus>,
    #[prost(message, optional, tag = "3")]
    pub tx_acknowledgment: Option<TxAcknowledgment>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GatewayDown {
    #[prost(message, optional, tag = "1")]
    pub downlink_message: Option<DownlinkMessage>,
}

/// The decoded form of the opaque uplink token carried in `RxMetadata`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct UplinkToken {
    #[prost(message, optional, tag = "1")]
    pub ids: Option<GatewayAntennaIdentifiers>,
    #[prost(uint32, tag = "2")]
    pub timestamp: u32,
    #[prost(message, optional, tag = "3")]
    pub server_time: Option<prost_types::Timestamp>,
    /// Concentrator time in microseconds; for Basic Station this is the full `xtime`.
    #[prost(int64, tag = "4")]
    pub concentrator_time: i64,
    #[prost(message, optional, tag = "5")]
    pub gateway_time: Option<prost_types::Timestamp>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MqttConnectionInfo {
    #[prost(string, tag = "1")]
    pub public_address: String,
    #[prost(string, tag = "2")]
    pub public_tls_address: String,
    #[prost(string, tag = "3")]
    pub username: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConcentratorConfig {
    #[prost(message, repeated, tag = "1")]
    pub channels: Vec<concentrator_config::Channel>,
    #[prost(message, optional, tag = "2")]
    pub lora_standard_channel: Option<concentrator_config::LoRaStandardChannel>,
    #[prost(message, optional, tag = "3")]
    pub fsk_channel: Option<concentrator_config::FskChannel>,
    #[prost(message, repeated, tag = "4")]
    pub radios: Vec<GatewayRadio>,
    #[prost(uint32, tag = "5")]
    pub clock_source: u32,
}

pub mod concentrator_config {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Channel {
        #[prost(uint64, tag = "1")]
        pub frequency: u64,
        #[prost(uint32, tag = "2")]
        pub radio: u32,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct LoRaStandardChannel {
        #[prost(uint64, tag = "1")]
        pub frequency: u64,
        #[prost(uint32, tag = "2")]
        pub radio: u32,
        #[prost(uint32, tag = "3")]
        pub spreading_factor: u32,
        #[prost(uint32, tag = "4")]
        pub bandwidth: u32,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct FskChannel {
        #[prost(uint64, tag = "1")]
        pub frequency: u64,
        #[prost(uint32, tag = "2")]
        pub radio: u32,
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GatewayRadio {
    #[prost(bool, tag = "1")]
    pub enable: bool,
    #[prost(string, tag = "2")]
    pub chip_type: String,
    #[prost(uint64, tag = "3")]
    pub frequency: u64,
    #[prost(float, tag = "4")]
    pub rssi_offset: f32,
    #[prost(message, optional, tag = "5")]
    pub tx_configuration: Option<gateway_radio::TxConfiguration>,
}

pub mod gateway_radio {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TxConfiguration {
        #[prost(uint64, tag = "1")]
        pub min_frequency: u64,
        #[prost(uint64, tag = "2")]
        pub max_frequency: u64,
        #[prost(uint64, tag = "3")]
        pub notch_frequency: u64,
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RoundTripTimes {
    #[prost(message, optional, tag = "1")]
    pub min: Option<prost_types::Duration>,
    #[prost(message, optional, tag = "2")]
    pub max: Option<prost_types::Duration>,
    #[prost(message, optional, tag = "3")]
    pub median: Option<prost_types::Duration>,
    #[prost(uint32, tag = "4")]
    pub count: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GatewayConnectionStats {
    #[prost(message, optional, tag = "1")]
    pub connected_at: Option<prost_types::Timestamp>,
    #[prost(message, optional, tag = "2")]
    pub disconnected_at: Option<prost_types::Timestamp>,
    #[prost(string, tag = "3")]
    pub protocol: String,
    #[prost(message, optional, tag = "4")]
    pub last_status_received_at: Option<prost_types::Timestamp>,
    #[prost(message, optional, tag = "5")]
    pub last_status: Option<GatewayStatus>,
    #[prost(message, optional, tag = "6")]
    pub last_uplink_received_at: Option<prost_types::Timestamp>,
    #[prost(uint64, tag = "7")]
    pub uplink_count: u64,
    #[prost(message, optional, tag = "8")]
    pub last_downlink_received_at: Option<prost_types::Timestamp>,
    #[prost(uint64, tag = "9")]
    pub downlink_count: u64,
    #[prost(message, optional, tag = "10")]
    pub last_tx_acknowledgment_received_at: Option<prost_types::Timestamp>,
    #[prost(uint64, tag = "11")]
    pub tx_acknowledgment_count: u64,
    #[prost(message, optional, tag = "12")]
    pub round_trip_times: Option<RoundTripTimes>,
    #[prost(string, tag = "13")]
    pub gateway_remote_address: String,
}
