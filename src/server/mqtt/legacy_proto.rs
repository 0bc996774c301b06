//! Wire schema of the legacy (v2) MQTT dialect.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Modulation {
    Lora = 0,
    Fsk = 1,
}

/// Regional plans as numbered by the legacy stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum FrequencyPlan {
    Eu863870 = 0,
    Us902928 = 1,
    Cn779787 = 2,
    Eu433 = 3,
    Au915928 = 5,
    Cn470510 = 6,
    As923 = 7,
    As920923 = 8,
    As923925 = 9,
    Kr920923 = 10,
    In865867 = 11,
    Ru864870 = 12,
}

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
pub struct LorawanMetadata {
    #[prost(enumeration = "Modulation", tag = "11")]
    pub modulation: i32,
    /// `SF<sf>BW<bw_khz>` for LoRa.
    #[prost(string, tag = "12")]
    pub data_rate: String,
    #[prost(uint32, tag = "13")]
    pub bit_rate: u32,
    #[prost(string, tag = "14")]
    pub coding_rate: String,
    #[prost(uint32, tag = "15")]
    pub f_cnt: u32,
    #[prost(enumeration = "FrequencyPlan", tag = "16")]
    pub frequency_plan: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ProtocolRxMetadata {
    #[prost(message, optional, tag = "1")]
    pub lorawan: Option<LorawanMetadata>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LocationMetadata {
    /// Unix time in nanoseconds.
    #[prost(int64, tag = "1")]
    pub time: i64,
    #[prost(float, tag = "2")]
    pub latitude: f32,
    #[prost(float, tag = "3")]
    pub longitude: f32,
    #[prost(int32, tag = "4")]
    pub altitude: i32,
    #[prost(uint32, tag = "5")]
    pub accuracy: u32,
    #[prost(enumeration = "LocationSource", tag = "6")]
    pub source: i32,
}

/// Per-antenna reception, the `R-Sig` block of legacy packet forwarders.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Antenna {
    #[prost(uint32, tag = "1")]
    pub antenna: u32,
    #[prost(uint32, tag = "2")]
    pub channel: u32,
    #[prost(float, tag = "3")]
    pub rssi: f32,
    #[prost(float, tag = "4")]
    pub channel_rssi: f32,
    #[prost(float, tag = "5")]
    pub snr: f32,
    #[prost(int64, tag = "6")]
    pub frequency_offset: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GatewayRxMetadata {
    #[prost(string, tag = "1")]
    pub gateway_id: String,
    #[prost(uint32, tag = "11")]
    pub timestamp: u32,
    /// Unix time in nanoseconds.
    #[prost(int64, tag = "12")]
    pub time: i64,
    #[prost(uint32, tag = "21")]
    pub rf_chain: u32,
    #[prost(uint32, tag = "22")]
    pub channel: u32,
    #[prost(message, repeated, tag = "30")]
    pub antennas: Vec<Antenna>,
    #[prost(uint64, tag = "31")]
    pub frequency: u64,
    #[prost(float, tag = "32")]
    pub rssi: f32,
    #[prost(float, tag = "33")]
    pub snr: f32,
    #[prost(message, optional, tag = "41")]
    pub location: Option<LocationMetadata>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UplinkMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
    #[prost(message, optional, tag = "11")]
    pub protocol_metadata: Option<ProtocolRxMetadata>,
    #[prost(message, optional, tag = "12")]
    pub gateway_metadata: Option<GatewayRxMetadata>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LorawanTxConfiguration {
    #[prost(enumeration = "Modulation", tag = "11")]
    pub modulation: i32,
    #[prost(string, tag = "12")]
    pub data_rate: String,
    #[prost(uint32, tag = "13")]
    pub bit_rate: u32,
    #[prost(string, tag = "14")]
    pub coding_rate: String,
    #[prost(uint32, tag = "15")]
    pub f_cnt: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ProtocolTxConfiguration {
    #[prost(message, optional, tag = "1")]
    pub lorawan: Option<LorawanTxConfiguration>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GatewayTxConfiguration {
    #[prost(uint32, tag = "11")]
    pub timestamp: u32,
    #[prost(uint32, tag = "21")]
    pub rf_chain: u32,
    #[prost(uint64, tag = "22")]
    pub frequency: u64,
    /// Radiated power in dBm ERP.
    #[prost(int32, tag = "23")]
    pub power: i32,
    #[prost(bool, tag = "31")]
    pub polarization_inversion: bool,
    #[prost(uint32, tag = "32")]
    pub frequency_deviation: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DownlinkMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
    #[prost(message, optional, tag = "11")]
    pub protocol_configuration: Option<ProtocolTxConfiguration>,
    #[prost(message, optional, tag = "12")]
    pub gateway_configuration: Option<GatewayTxConfiguration>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct OsMetrics {
    #[prost(float, tag = "1")]
    pub load_1: f32,
    #[prost(float, tag = "2")]
    pub load_5: f32,
    #[prost(float, tag = "3")]
    pub load_15: f32,
    #[prost(float, tag = "11")]
    pub cpu_percentage: f32,
    #[prost(float, tag = "21")]
    pub memory_percentage: f32,
    #[prost(float, tag = "31")]
    pub temperature: f32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Status {
    #[prost(uint32, tag = "1")]
    pub timestamp: u32,
    /// Unix time in nanoseconds.
    #[prost(int64, tag = "2")]
    pub time: i64,
    /// Unix time in nanoseconds.
    #[prost(int64, tag = "3")]
    pub boot_time: i64,
    #[prost(string, repeated, tag = "11")]
    pub ip: Vec<String>,
    #[prost(string, tag = "12")]
    pub platform: String,
    #[prost(string, tag = "15")]
    pub frequency_plan: String,
    #[prost(string, tag = "18")]
    pub fpga: String,
    #[prost(string, tag = "19")]
    pub dsp: String,
    #[prost(string, tag = "20")]
    pub hal: String,
    #[prost(message, optional, tag = "21")]
    pub location: Option<LocationMetadata>,
    #[prost(uint32, tag = "41")]
    pub rx_in: u32,
    #[prost(uint32, tag = "42")]
    pub rx_ok: u32,
    #[prost(uint32, tag = "43")]
    pub tx_in: u32,
    #[prost(uint32, tag = "44")]
    pub tx_ok: u32,
    #[prost(uint32, tag = "45")]
    pub lm_ok: u32,
    #[prost(uint32, tag = "46")]
    pub lm_st: u32,
    #[prost(uint32, tag = "47")]
    pub lm_nw: u32,
    #[prost(uint32, tag = "48")]
    pub l_pps: u32,
    #[prost(message, optional, tag = "51")]
    pub os: Option<OsMetrics>,
}
