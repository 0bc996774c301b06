//! The `router_config` message: the concentrator layout pushed to a station.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::model::band::BandDataRate;
use crate::model::FrequencyPlan;
use crate::utils::{time, GsError};

pub const HARDWARE_SPEC: &str = "sx1301/1";

/// Number of multi-SF IF chains of one SX1301.
pub const MULTI_SF_CHANNELS: usize = 8;

/// One entry of `sx1301_conf`: a radio, or an IF chain on a radio.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sx1301Entry {
    pub enable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freq: Option<u64>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub chip_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi_offset: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_enable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radio: Option<u32>,
    /// Offset from the radio's centre frequency in Hz.
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub if_offset: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spread_factor: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datarate: Option<u32>,
}

/// `radio_0`, `chan_multiSF_3`, `chan_Lora_std`, ... keyed as the station expects.
pub type Sx1301Config = BTreeMap<String, Sx1301Entry>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconConfig {
    #[serde(rename = "DR")]
    pub data_rate: u8,
    pub layout: [u32; 3],
    pub freqs: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    pub region: String,
    pub hwspec: String,
    pub freq_range: [u64; 2],
    #[serde(rename = "DRs")]
    pub data_rates: Vec<[i32; 3]>,
    pub sx1301_conf: Vec<Sx1301Config>,
    /// Disables clear channel assessment.
    pub nocca: bool,
    /// Disables duty cycle checks.
    pub nodc: bool,
    /// Disables dwell time checks.
    pub nodwell: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bcning: Option<BeaconConfig>,
    #[serde(rename = "MuxTime")]
    pub mux_time: f64,
}

/// Builds the router configuration for a station.
///
/// Stations that report the `prod` feature get duty cycle, dwell time and CCA
/// checks enabled; all other stations run with them disabled.
///
/// # Errors
///
/// Returns `GsError::InvalidArgument` when the plan refers to radios or data rates
/// that do not exist, and `GsError::NotFound` for an unknown band.
pub fn build<'a>(
    plan: &FrequencyPlan,
    features: impl IntoIterator<Item = &'a str>,
    now: SystemTime,
) -> Result<RouterConfig, GsError> {
    let band = plan.band()?;
    let production = features.into_iter().any(|f| f == "prod");
    Ok(RouterConfig {
        region: band.station_region.to_string(),
        hwspec: HARDWARE_SPEC.to_string(),
        freq_range: [band.frequency_range.0, band.frequency_range.1],
        data_rates: band.station_data_rates(),
        sx1301_conf: vec![sx1301_conf(plan)?],
        nocca: !production,
        nodc: !production,
        nodwell: !production,
        bcning: Some(BeaconConfig {
            data_rate: band.beacon.data_rate_index,
            layout: band.beacon.layout,
            freqs: band.beacon.frequencies.to_vec(),
        }),
        mux_time: time::to_unix_f64(now),
    })
}

fn if_offset(plan: &FrequencyPlan, radio: u32, frequency: u64) -> Result<i64, GsError> {
    let centre = plan
        .radios
        .get(radio as usize)
        .map(|r| r.frequency)
        .ok_or_else(|| {
            GsError::InvalidArgument(format!("plan `{}` has no radio {}", plan.id, radio))
        })?;
    Ok(frequency as i64 - centre as i64)
}

fn sx1301_conf(plan: &FrequencyPlan) -> Result<Sx1301Config, GsError> {
    let band = plan.band()?;
    let mut conf = Sx1301Config::new();
    for (i, radio) in plan.radios.iter().enumerate().take(2) {
        conf.insert(
            format!("radio_{}", i),
            Sx1301Entry {
                enable: radio.enable,
                freq: Some(radio.frequency),
                chip_type: Some(radio.chip_type.clone()),
                rssi_offset: Some(radio.rssi_offset),
                tx_enable: Some(radio.tx.is_some()),
                ..Default::default()
            },
        );
    }
    for i in 0..MULTI_SF_CHANNELS {
        let entry = match plan.uplink_channels.get(i) {
            Some(ch) => Sx1301Entry {
                enable: true,
                radio: Some(ch.radio),
                if_offset: Some(if_offset(plan, ch.radio, ch.frequency)?),
                ..Default::default()
            },
            None => Sx1301Entry::default(),
        };
        conf.insert(format!("chan_multiSF_{}", i), entry);
    }
    if let Some(ch) = &plan.lora_standard_channel {
        let Some(BandDataRate::LoRa {
            spreading_factor,
            bandwidth,
        }) = band.data_rate(ch.data_rate)
        else {
            return Err(GsError::InvalidArgument(format!(
                "plan `{}`: LoRa standard channel data rate {} is not LoRa",
                plan.id, ch.data_rate
            )));
        };
        conf.insert(
            "chan_Lora_std".to_string(),
            Sx1301Entry {
                enable: true,
                radio: Some(ch.radio),
                if_offset: Some(if_offset(plan, ch.radio, ch.frequency)?),
                bandwidth: Some(bandwidth),
                spread_factor: Some(spreading_factor),
                ..Default::default()
            },
        );
    }
    if let Some(ch) = &plan.fsk_channel {
        let Some(BandDataRate::Fsk { bit_rate }) = band.data_rate(ch.data_rate) else {
            return Err(GsError::InvalidArgument(format!(
                "plan `{}`: FSK channel data rate {} is not FSK",
                plan.id, ch.data_rate
            )));
        };
        conf.insert(
            "chan_FSK".to_string(),
            Sx1301Entry {
                enable: true,
                radio: Some(ch.radio),
                if_offset: Some(if_offset(plan, ch.radio, ch.frequency)?),
                datarate: Some(bit_rate),
                ..Default::default()
            },
        );
    }
    Ok(conf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::frequency_plan::{eu_863_870_ttn, us_902_928_fsb_2};

    #[test]
    fn eu_plan() {
        let plan = eu_863_870_ttn();
        let cfg = build(&plan, ["rmtsh", "gps"], SystemTime::now()).unwrap();
        assert_eq!(cfg.region, "EU863");
        assert_eq!(cfg.hwspec, HARDWARE_SPEC);
        assert_eq!(cfg.freq_range, [863_000_000, 870_000_000]);
        assert_eq!(cfg.data_rates.len(), 16);
        assert!(cfg.nocca && cfg.nodc && cfg.nodwell);

        let conf = &cfg.sx1301_conf[0];
        let radio_0 = &conf["radio_0"];
        assert_eq!(radio_0.freq, Some(plan.radios[0].frequency));
        let first = &plan.uplink_channels[0];
        let ch0 = &conf["chan_multiSF_0"];
        assert!(ch0.enable);
        assert_eq!(
            ch0.if_offset,
            Some(first.frequency as i64 - plan.radios[first.radio as usize].frequency as i64)
        );
        assert!(conf.contains_key("chan_Lora_std"));
        assert_eq!(conf["chan_FSK"].datarate, Some(50_000));

        let beacon = cfg.bcning.unwrap();
        assert_eq!(beacon.data_rate, 3);
        assert_eq!(beacon.freqs, vec![869_525_000]);
    }

    #[test]
    fn prod_enables_regulatory_checks() {
        let cfg = build(&eu_863_870_ttn(), ["prod"], SystemTime::now()).unwrap();
        assert!(!cfg.nocca && !cfg.nodc && !cfg.nodwell);
    }

    #[test]
    fn us_plan_has_no_fsk_and_eight_beacon_channels() {
        let cfg = build(&us_902_928_fsb_2(), [], SystemTime::now()).unwrap();
        assert_eq!(cfg.region, "US902");
        assert!(!cfg.sx1301_conf[0].contains_key("chan_FSK"));
        assert_eq!(cfg.bcning.unwrap().freqs.len(), 8);
    }

    #[test]
    fn serialises_station_field_names() {
        let cfg = build(&eu_863_870_ttn(), [], SystemTime::now()).unwrap();
        let value = serde_json::to_value(&cfg).unwrap();
        assert!(value.get("DRs").is_some());
        assert!(value["sx1301_conf"][0]["chan_multiSF_0"].get("if").is_some());
        assert_eq!(value["sx1301_conf"][0]["radio_0"]["type"], "SX1257");
    }
}
