//! Wire schema of the Industries gateway protocol.
//!
//! Every WebSocket binary frame carries exactly one envelope: [`GatewayMessage`]
//! upstream, [`NetworkServerMessage`] downstream.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum CodeRate {
    Cr45 = 0,
    Cr46 = 1,
    Cr47 = 2,
    Cr48 = 3,
}

impl CodeRate {
    pub fn as_str(self) -> &'static str {
        match self {
            CodeRate::Cr45 => "4/5",
            CodeRate::Cr46 => "4/6",
            CodeRate::Cr47 => "4/7",
            CodeRate::Cr48 => "4/8",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "4/5" => Some(CodeRate::Cr45),
            "4/6" => Some(CodeRate::Cr46),
            "4/7" => Some(CodeRate::Cr47),
            "4/8" => Some(CodeRate::Cr48),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Unknown = 0,
    TxTooLate = 1,
    TxTooEarly = 2,
    TxCollisionPacket = 3,
    TxCollisionBeacon = 4,
    TxFrequency = 5,
    TxPower = 6,
    TxGpsUnlocked = 7,
    ConfigurationFailed = 8,
    InvalidMessage = 9,
}

// Upstream.

#[derive(Clone, PartialEq, prost::Message)]
pub struct GatewayMessage {
    #[prost(uint32, tag = "15")]
    pub transaction_id: u32,
    #[prost(oneof = "gateway_message::Message", tags = "1, 2, 3, 4")]
    pub message: Option<gateway_message::Message>,
}

pub mod gateway_message {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "1")]
        ClientHello(super::ClientHelloNotification),
        #[prost(message, tag = "2")]
        UplinkMessages(super::UplinkMessagesNotification),
        #[prost(message, tag = "3")]
        TransmitDownlink(super::TransmitDownlinkResponse),
        #[prost(message, tag = "4")]
        Error(super::ErrorNotification),
    }
}

impl GatewayMessage {
    pub fn name(&self) -> &'static str {
        use gateway_message::Message;
        match &self.message {
            Some(Message::ClientHello(_)) => "client_hello",
            Some(Message::UplinkMessages(_)) => "uplink_messages",
            Some(Message::TransmitDownlink(_)) => "transmit_downlink",
            Some(Message::Error(_)) => "error",
            None => "empty",
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GatewayLocation {
    #[prost(double, tag = "1")]
    pub latitude: f64,
    #[prost(double, tag = "2")]
    pub longitude: f64,
    #[prost(int32, tag = "3")]
    pub altitude: i32,
    #[prost(int32, tag = "4")]
    pub accuracy: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ClientHelloNotification {
    #[prost(string, tag = "1")]
    pub model: String,
    #[prost(string, tag = "2")]
    pub hardware_version: String,
    #[prost(string, tag = "3")]
    pub firmware_version: String,
    #[prost(message, optional, tag = "4")]
    pub boot_time: Option<prost_types::Timestamp>,
    #[prost(string, repeated, tag = "5")]
    pub ip: Vec<String>,
    #[prost(message, optional, tag = "6")]
    pub location: Option<GatewayLocation>,
}

/// One received frame. `if_chain` indexes the configured board: multi-SF channels
/// first, then the LoRa service channel, then the FSK channel.
#[derive(Clone, PartialEq, prost::Message)]
pub struct UplinkMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub board: u32,
    #[prost(uint32, tag = "3")]
    pub if_chain: u32,
    #[prost(uint32, tag = "4")]
    pub spreading_factor: u32,
    #[prost(enumeration = "CodeRate", tag = "5")]
    pub code_rate: i32,
    /// Concentrator counter in microseconds.
    #[prost(uint32, tag = "6")]
    pub timestamp: u32,
    #[prost(message, optional, tag = "7")]
    pub gps_time: Option<prost_types::Timestamp>,
    #[prost(uint64, optional, tag = "8")]
    pub fine_timestamp: Option<u64>,
    #[prost(float, tag = "9")]
    pub rssi: f32,
    #[prost(float, tag = "10")]
    pub channel_rssi: f32,
    #[prost(float, tag = "11")]
    pub snr: f32,
    #[prost(int32, tag = "12")]
    pub frequency_offset: i32,
    #[prost(bool, tag = "13")]
    pub crc_ok: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UplinkMessagesNotification {
    #[prost(message, repeated, tag = "1")]
    pub messages: Vec<UplinkMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TransmitDownlinkResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ErrorNotification {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

// Downstream.

#[derive(Clone, PartialEq, prost::Message)]
pub struct NetworkServerMessage {
    #[prost(uint32, tag = "15")]
    pub transaction_id: u32,
    #[prost(oneof = "network_server_message::Message", tags = "1, 2, 3")]
    pub message: Option<network_server_message::Message>,
}

pub mod network_server_message {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "1")]
        ServerHello(super::ServerHelloNotification),
        #[prost(message, tag = "2")]
        ConfigureLoraGateway(super::ConfigureLoraGatewayRequest),
        #[prost(message, tag = "3")]
        TransmitDownlink(super::TransmitDownlinkRequest),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ServerHelloNotification {
    #[prost(string, tag = "1")]
    pub server_version: String,
    #[prost(message, optional, tag = "2")]
    pub time: Option<prost_types::Timestamp>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConfigureLoraGatewayRequest {
    #[prost(message, optional, tag = "1")]
    pub config: Option<GatewayConfig>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RfChain {
    #[prost(uint64, tag = "1")]
    pub frequency: u64,
    #[prost(bool, tag = "2")]
    pub tx_enable: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MultiSfChannel {
    #[prost(uint32, tag = "1")]
    pub rf_chain: u32,
    #[prost(int32, tag = "2")]
    pub frequency_offset: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LoraServiceChannel {
    #[prost(uint32, tag = "1")]
    pub rf_chain: u32,
    #[prost(int32, tag = "2")]
    pub frequency_offset: i32,
    #[prost(uint32, tag = "3")]
    pub spreading_factor: u32,
    #[prost(uint32, tag = "4")]
    pub bandwidth: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FskChannel {
    #[prost(uint32, tag = "1")]
    pub rf_chain: u32,
    #[prost(int32, tag = "2")]
    pub frequency_offset: i32,
    #[prost(uint32, tag = "3")]
    pub bit_rate: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Board {
    #[prost(message, repeated, tag = "1")]
    pub rf_chains: Vec<RfChain>,
    #[prost(message, repeated, tag = "2")]
    pub multi_sf: Vec<MultiSfChannel>,
    #[prost(message, optional, tag = "3")]
    pub lora_service: Option<LoraServiceChannel>,
    #[prost(message, optional, tag = "4")]
    pub fsk: Option<FskChannel>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TxChannelConfig {
    #[prost(uint64, tag = "1")]
    pub frequency: u64,
    #[prost(oneof = "tx_channel_config::Modulation", tags = "2, 3")]
    pub modulation: Option<tx_channel_config::Modulation>,
}

pub mod tx_channel_config {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Modulation {
        /// LoRa bandwidth in Hz.
        #[prost(uint32, tag = "2")]
        LoraBandwidth(u32),
        #[prost(uint32, tag = "3")]
        FskBitRate(u32),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GatewayConfig {
    #[prost(message, repeated, tag = "1")]
    pub boards: Vec<Board>,
    #[prost(message, repeated, tag = "2")]
    pub tx_channels: Vec<TxChannelConfig>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TransmitDownlinkRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
    #[prost(oneof = "transmit_downlink_request::Channel", tags = "2, 3")]
    pub channel: Option<transmit_downlink_request::Channel>,
    #[prost(oneof = "transmit_downlink_request::Timing", tags = "4, 5, 6")]
    pub timing: Option<transmit_downlink_request::Timing>,
    #[prost(uint32, tag = "7")]
    pub spreading_factor: u32,
    #[prost(enumeration = "CodeRate", tag = "8")]
    pub code_rate: i32,
    #[prost(float, tag = "9")]
    pub tx_power: f32,
    #[prost(bool, tag = "10")]
    pub invert_polarization: bool,
    #[prost(uint32, tag = "11")]
    pub board: u32,
    #[prost(uint32, tag = "12")]
    pub antenna: u32,
}

pub mod transmit_downlink_request {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Channel {
        /// Index into `GatewayConfig.tx_channels`.
        #[prost(uint32, tag = "2")]
        Index(u32),
        #[prost(message, tag = "3")]
        Inline(super::TxChannelConfig),
    }

    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Timing {
        /// Concentrator counter in microseconds.
        #[prost(uint32, tag = "4")]
        Timestamp(u32),
        #[prost(message, tag = "5")]
        GpsTime(prost_types::Timestamp),
        #[prost(bool, tag = "6")]
        Immediately(bool),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message as _;

    #[test]
    fn transaction_id_survives_envelope() {
        let msg = GatewayMessage {
            transaction_id: 0x1_0002,
            message: Some(gateway_message::Message::Error(ErrorNotification {
                code: ErrorCode::TxTooLate as i32,
                message: "too late".into(),
            })),
        };
        let decoded = GatewayMessage::decode(msg.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.transaction_id, 0x1_0002);
        assert_eq!(decoded.name(), "error");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn code_rates() {
        assert_eq!(CodeRate::parse("4/7"), Some(CodeRate::Cr47));
        assert_eq!(CodeRate::Cr45.as_str(), "4/5");
        assert_eq!(CodeRate::parse("5/4"), None);
    }
}
