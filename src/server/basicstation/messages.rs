//! The JSON messages of the LoRa Basic Station LNS protocol.
//!
//! Field names follow the station's wire format, which mixes `camelCase`,
//! `PascalCase` and upper case freely; the Rust names are normalised.

use serde::{Deserialize, Serialize};

use super::router_config::RouterConfig;
use crate::utils::{Eui64, GsError};

/// Serialises EUIs in the dashed form stations use (`01-02-03-04-05-06-07-08`).
pub mod dashed_eui {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::utils::Eui64;

    pub fn serialize<S: Serializer>(eui: &Eui64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&eui.to_dashed())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Eui64, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A message sent by the station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msgtype")]
pub enum Upstream {
    #[serde(rename = "version")]
    Version(Version),
    #[serde(rename = "jreq")]
    JoinRequest(JoinRequest),
    #[serde(rename = "updf")]
    UplinkDataFrame(UplinkDataFrame),
    #[serde(rename = "propdf")]
    ProprietaryDataFrame(ProprietaryDataFrame),
    #[serde(rename = "dntxed")]
    TxConfirmation(TxConfirmation),
    #[serde(rename = "timesync")]
    TimeSync(TimeSyncRequest),
    /// Message types this server does not act on (`rmtsh`, `event`, ...).
    #[serde(other)]
    Unknown,
}

impl Upstream {
    /// Parses one text frame.
    ///
    /// # Errors
    ///
    /// Returns `GsError::InvalidArgument` for frames that are not a station message.
    pub fn parse(text: &str) -> Result<Self, GsError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Upstream::Version(_) => "version",
            Upstream::JoinRequest(_) => "jreq",
            Upstream::UplinkDataFrame(_) => "updf",
            Upstream::ProprietaryDataFrame(_) => "propdf",
            Upstream::TxConfirmation(_) => "dntxed",
            Upstream::TimeSync(_) => "timesync",
            Upstream::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub station: String,
    #[serde(default)]
    pub firmware: String,
    #[serde(default)]
    pub package: String,
    pub model: String,
    pub protocol: u32,
    /// Space separated feature flags, such as `rmtsh gps`.
    #[serde(default)]
    pub features: String,
}

impl Version {
    pub fn feature_list(&self) -> impl Iterator<Item = &str> {
        self.features.split_whitespace()
    }
}

/// Reception details attached to every uplink.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpInfo {
    /// Radio context; the antenna the frame came in on.
    #[serde(default)]
    pub rctx: i64,
    pub xtime: i64,
    #[serde(default)]
    pub gpstime: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fts: Option<i64>,
    pub rssi: f32,
    pub snr: f32,
    /// Reception time, fractional Unix seconds.
    #[serde(default)]
    pub rxtime: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RadioMetadata {
    #[serde(rename = "DR")]
    pub data_rate: u8,
    #[serde(rename = "Freq")]
    pub frequency: u64,
    #[serde(rename = "upinfo")]
    pub up_info: UpInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    #[serde(rename = "MHdr")]
    pub mhdr: u8,
    #[serde(rename = "JoinEui", with = "dashed_eui")]
    pub join_eui: Eui64,
    #[serde(rename = "DevEui", with = "dashed_eui")]
    pub dev_eui: Eui64,
    #[serde(rename = "DevNonce")]
    pub dev_nonce: u16,
    #[serde(rename = "MIC")]
    pub mic: i32,
    #[serde(flatten)]
    pub radio: RadioMetadata,
    #[serde(rename = "RefTime", default)]
    pub ref_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UplinkDataFrame {
    #[serde(rename = "MHdr")]
    pub mhdr: u8,
    #[serde(rename = "DevAddr")]
    pub dev_addr: i32,
    #[serde(rename = "FCtrl")]
    pub fctrl: u8,
    #[serde(rename = "FCnt")]
    pub fcnt: u16,
    /// Hex encoded.
    #[serde(rename = "FOpts", default)]
    pub fopts: String,
    /// `-1` when the frame has no port.
    #[serde(rename = "FPort")]
    pub fport: i32,
    /// Hex encoded.
    #[serde(rename = "FRMPayload", default)]
    pub frm_payload: String,
    #[serde(rename = "MIC")]
    pub mic: i32,
    #[serde(flatten)]
    pub radio: RadioMetadata,
    #[serde(rename = "RefTime", default)]
    pub ref_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProprietaryDataFrame {
    /// The complete PHY payload, hex encoded.
    #[serde(rename = "FRMPayload")]
    pub frm_payload: String,
    #[serde(flatten)]
    pub radio: RadioMetadata,
    #[serde(rename = "RefTime", default)]
    pub ref_time: f64,
}

/// `dntxed`: the station transmitted a downlink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxConfirmation {
    pub diid: i64,
    #[serde(rename = "DevEui", with = "dashed_eui", default)]
    pub dev_eui: Eui64,
    #[serde(default)]
    pub rctx: i64,
    #[serde(default)]
    pub xtime: i64,
    #[serde(default)]
    pub txtime: f64,
    #[serde(default)]
    pub gpstime: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSyncRequest {
    /// The station's local time when it sent the request, echoed back.
    pub txtime: f64,
}

/// A message sent to the station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msgtype")]
pub enum Downstream {
    #[serde(rename = "router_config")]
    RouterConfig(RouterConfig),
    #[serde(rename = "dnmsg")]
    DownlinkMessage(DownlinkMessage),
    #[serde(rename = "timesync")]
    TimeSync(TimeSyncResponse),
}

impl Downstream {
    /// Renders the message as one text frame.
    pub fn to_json(&self) -> Result<String, GsError> {
        serde_json::to_string(self).map_err(|e| GsError::Internal(e.to_string()))
    }
}

/// `dnmsg`: a downlink for the station to transmit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownlinkMessage {
    #[serde(rename = "DevEui", with = "dashed_eui")]
    pub dev_eui: Eui64,
    /// Device class: 0 for A, 1 for B, 2 for C.
    #[serde(rename = "dC")]
    pub device_class: u8,
    /// Downlink ID, echoed in `dntxed`.
    pub diid: i64,
    /// PHY payload, hex encoded.
    pub pdu: String,
    #[serde(rename = "RxDelay", default, skip_serializing_if = "Option::is_none")]
    pub rx_delay: Option<u64>,
    #[serde(rename = "RX1DR", default, skip_serializing_if = "Option::is_none")]
    pub rx1_data_rate: Option<u8>,
    #[serde(rename = "RX1Freq", default, skip_serializing_if = "Option::is_none")]
    pub rx1_frequency: Option<u64>,
    #[serde(rename = "RX2DR", default, skip_serializing_if = "Option::is_none")]
    pub rx2_data_rate: Option<u8>,
    #[serde(rename = "RX2Freq", default, skip_serializing_if = "Option::is_none")]
    pub rx2_frequency: Option<u64>,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xtime: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpstime: Option<i64>,
    pub rctx: i64,
    #[serde(rename = "MuxTime")]
    pub mux_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSyncResponse {
    pub txtime: f64,
    /// Server time in microseconds since the GPS epoch.
    pub gpstime: i64,
    #[serde(rename = "MuxTime")]
    pub mux_time: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_updf() {
        let text = r#"{"msgtype":"updf","MHdr":64,"DevAddr":58772467,"FCtrl":0,"FCnt":164,
            "FOpts":"","FPort":1,"FRMPayload":"01","MIC":-1337,"RefTime":0.0,
            "DR":5,"Freq":868100000,"upinfo":{"rctx":0,"xtime":12666373963464220,
            "gpstime":0,"rssi":-36,"snr":10,"rxtime":1548059982.30}}"#;
        let Upstream::UplinkDataFrame(updf) = Upstream::parse(text).unwrap() else {
            panic!("not an updf");
        };
        assert_eq!(updf.dev_addr, 58_772_467);
        assert_eq!(updf.fport, 1);
        assert_eq!(updf.radio.data_rate, 5);
        assert_eq!(updf.radio.frequency, 868_100_000);
        assert_eq!(updf.radio.up_info.xtime, 12_666_373_963_464_220);
        assert_eq!(updf.radio.up_info.rssi, -36.0);
    }

    #[test]
    fn parses_jreq_euis() {
        let text = r#"{"msgtype":"jreq","MHdr":0,"JoinEui":"00-00-00-00-00-00-00-01",
            "DevEui":"01-02-03-04-05-06-07-08","DevNonce":1,"MIC":12345678,
            "DR":0,"Freq":868100000,"upinfo":{"xtime":1,"rssi":-60,"snr":9}}"#;
        let Upstream::JoinRequest(jreq) = Upstream::parse(text).unwrap() else {
            panic!("not a jreq");
        };
        assert_eq!(jreq.join_eui, Eui64::from_u64(1));
        assert_eq!(jreq.dev_eui, Eui64::from_u64(0x0102_0304_0506_0708));
    }

    #[test]
    fn unknown_message_types_are_tolerated() {
        assert_eq!(
            Upstream::parse(r#"{"msgtype":"rmtsh","rmtsh":[]}"#).unwrap(),
            Upstream::Unknown
        );
        assert!(Upstream::parse(r#"{"no":"msgtype"}"#).is_err());
        assert!(Upstream::parse("[1,2]").is_err());
    }

    #[test]
    fn dnmsg_omits_unused_windows() {
        let msg = Downstream::DownlinkMessage(DownlinkMessage {
            dev_eui: Eui64::ZERO,
            device_class: 2,
            diid: 7,
            pdu: "60".into(),
            rx_delay: None,
            rx1_data_rate: None,
            rx1_frequency: None,
            rx2_data_rate: Some(0),
            rx2_frequency: Some(869_525_000),
            priority: 3,
            xtime: Some(42),
            gpstime: None,
            rctx: 0,
            mux_time: 1.5,
        });
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["msgtype"], "dnmsg");
        assert_eq!(value["DevEui"], "00-00-00-00-00-00-00-00");
        assert_eq!(value["RX2Freq"], 869_525_000);
        assert!(value.get("RX1DR").is_none());
        assert!(value.get("gpstime").is_none());
    }
}
