use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use config::Config;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::band::{Band, EU_863_870, US_902_928};
use super::messages::{concentrator_config, gateway_radio, ConcentratorConfig, GatewayRadio};
use crate::utils::GsError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub frequency: u64,
    #[serde(default)]
    pub min_data_rate: u8,
    #[serde(default = "default_max_data_rate")]
    pub max_data_rate: u8,
    #[serde(default)]
    pub radio: u32,
}

fn default_max_data_rate() -> u8 {
    5
}

/// A single-data-rate channel (the LoRa service channel or the FSK channel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedChannel {
    pub frequency: u64,
    pub data_rate: u8,
    #[serde(default)]
    pub radio: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioTx {
    pub min_frequency: u64,
    pub max_frequency: u64,
    #[serde(default)]
    pub notch_frequency: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Radio {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default = "default_chip_type")]
    pub chip_type: String,
    pub frequency: u64,
    #[serde(default)]
    pub rssi_offset: f32,
    #[serde(default)]
    pub tx: Option<RadioTx>,
}

fn default_true() -> bool {
    true
}

fn default_chip_type() -> String {
    "SX1257".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rx2Channel {
    pub frequency: u64,
    pub data_rate: u8,
}

/// A frequency plan: the concentrator layout a gateway is configured with.
///
/// Plans are immutable once loaded and shared between connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyPlan {
    pub id: String,
    pub band_id: String,
    pub uplink_channels: Vec<Channel>,
    /// Downlink channels; empty means downlinks reuse the uplink channels.
    #[serde(default)]
    pub downlink_channels: Vec<Channel>,
    #[serde(default)]
    pub lora_standard_channel: Option<FixedChannel>,
    #[serde(default)]
    pub fsk_channel: Option<FixedChannel>,
    pub radios: Vec<Radio>,
    #[serde(default)]
    pub clock_source: u32,
    #[serde(default)]
    pub rx2_channel: Option<Rx2Channel>,
    #[serde(default)]
    pub max_eirp: Option<f32>,
}

impl FrequencyPlan {
    pub fn band(&self) -> Result<&'static Band, GsError> {
        Band::get(&self.band_id)
    }

    /// The channels downlinks may use, in plan order.
    pub fn downlink_channels(&self) -> &[Channel] {
        if self.downlink_channels.is_empty() {
            &self.uplink_channels
        } else {
            &self.downlink_channels
        }
    }

    /// The RX2 frequency and data rate index, falling back to the band defaults.
    pub fn rx2(&self) -> Result<(u64, u8), GsError> {
        match &self.rx2_channel {
            Some(rx2) => Ok((rx2.frequency, rx2.data_rate)),
            None => {
                let band = self.band()?;
                Ok((band.default_rx2_frequency, band.default_rx2_data_rate))
            }
        }
    }

    pub fn max_eirp(&self) -> Result<f32, GsError> {
        match self.max_eirp {
            Some(eirp) => Ok(eirp),
            None => Ok(self.band()?.default_max_eirp),
        }
    }

    /// Converts the plan to the concentrator configuration served over gRPC.
    pub fn to_concentrator_config(&self) -> Result<ConcentratorConfig, GsError> {
        let band = self.band()?;
        let lora_standard_channel = match &self.lora_standard_channel {
            Some(ch) => {
                let dr = band.data_rate(ch.data_rate).ok_or_else(|| {
                    GsError::InvalidArgument(format!(
                        "plan `{}` has unknown data rate {} on the LoRa standard channel",
                        self.id, ch.data_rate
                    ))
                })?;
                let (spreading_factor, bandwidth) = match dr {
                    super::band::BandDataRate::LoRa {
                        spreading_factor,
                        bandwidth,
                    } => (spreading_factor, bandwidth),
                    super::band::BandDataRate::Fsk { .. } => {
                        return Err(GsError::InvalidArgument(format!(
                            "plan `{}` has an FSK data rate on the LoRa standard channel",
                            self.id
                        )))
                    }
                };
                Some(concentrator_config::LoRaStandardChannel {
                    frequency: ch.frequency,
                    radio: ch.radio,
                    spreading_factor,
                    bandwidth,
                })
            }
            None => None,
        };
        Ok(ConcentratorConfig {
            channels: self
                .uplink_channels
                .iter()
                .map(|ch| concentrator_config::Channel {
                    frequency: ch.frequency,
                    radio: ch.radio,
                })
                .collect(),
            lora_standard_channel,
            fsk_channel: self
                .fsk_channel
                .as_ref()
                .map(|ch| concentrator_config::FskChannel {
                    frequency: ch.frequency,
                    radio: ch.radio,
                }),
            radios: self
                .radios
                .iter()
                .map(|radio| GatewayRadio {
                    enable: radio.enable,
                    chip_type: radio.chip_type.clone(),
                    frequency: radio.frequency,
                    rssi_offset: radio.rssi_offset,
                    tx_configuration: radio.tx.as_ref().map(|tx| gateway_radio::TxConfiguration {
                        min_frequency: tx.min_frequency,
                        max_frequency: tx.max_frequency,
                        notch_frequency: tx.notch_frequency,
                    }),
                })
                .collect(),
            clock_source: self.clock_source,
        })
    }
}

fn channel(frequency: u64, min_data_rate: u8, max_data_rate: u8, radio: u32) -> Channel {
    Channel {
        frequency,
        min_data_rate,
        max_data_rate,
        radio,
    }
}

/// The Things Network's default European plan.
pub fn eu_863_870_ttn() -> FrequencyPlan {
    FrequencyPlan {
        id: "EU_863_870_TTN".to_string(),
        band_id: EU_863_870.to_string(),
        uplink_channels: vec![
            channel(868_100_000, 0, 5, 1),
            channel(868_300_000, 0, 5, 1),
            channel(868_500_000, 0, 5, 1),
            channel(867_100_000, 0, 5, 0),
            channel(867_300_000, 0, 5, 0),
            channel(867_500_000, 0, 5, 0),
            channel(867_700_000, 0, 5, 0),
            channel(867_900_000, 0, 5, 0),
        ],
        downlink_channels: Vec::new(),
        lora_standard_channel: Some(FixedChannel {
            frequency: 868_300_000,
            data_rate: 6,
            radio: 1,
        }),
        fsk_channel: Some(FixedChannel {
            frequency: 868_800_000,
            data_rate: 7,
            radio: 1,
        }),
        radios: vec![
            Radio {
                enable: true,
                chip_type: default_chip_type(),
                frequency: 867_500_000,
                rssi_offset: -166.0,
                tx: Some(RadioTx {
                    min_frequency: 863_000_000,
                    max_frequency: 870_000_000,
                    notch_frequency: 0,
                }),
            },
            Radio {
                enable: true,
                chip_type: default_chip_type(),
                frequency: 868_500_000,
                rssi_offset: -166.0,
                tx: None,
            },
        ],
        clock_source: 0,
        rx2_channel: Some(Rx2Channel {
            frequency: 869_525_000,
            data_rate: 0,
        }),
        max_eirp: Some(16.15),
    }
}

/// The US plan using the second sub-band (channels 8-15 and 65).
pub fn us_902_928_fsb_2() -> FrequencyPlan {
    FrequencyPlan {
        id: "US_902_928_FSB_2".to_string(),
        band_id: US_902_928.to_string(),
        uplink_channels: vec![
            channel(903_900_000, 0, 3, 0),
            channel(904_100_000, 0, 3, 0),
            channel(904_300_000, 0, 3, 0),
            channel(904_500_000, 0, 3, 0),
            channel(904_700_000, 0, 3, 1),
            channel(904_900_000, 0, 3, 1),
            channel(905_100_000, 0, 3, 1),
            channel(905_300_000, 0, 3, 1),
        ],
        downlink_channels: (0..8)
            .map(|i| channel(923_300_000 + i * 600_000, 8, 13, 0))
            .collect(),
        lora_standard_channel: Some(FixedChannel {
            frequency: 904_600_000,
            data_rate: 4,
            radio: 0,
        }),
        fsk_channel: None,
        radios: vec![
            Radio {
                enable: true,
                chip_type: default_chip_type(),
                frequency: 904_300_000,
                rssi_offset: -166.0,
                tx: Some(RadioTx {
                    min_frequency: 923_000_000,
                    max_frequency: 928_000_000,
                    notch_frequency: 0,
                }),
            },
            Radio {
                enable: true,
                chip_type: default_chip_type(),
                frequency: 905_000_000,
                rssi_offset: -166.0,
                tx: None,
            },
        ],
        clock_source: 0,
        rx2_channel: Some(Rx2Channel {
            frequency: 923_300_000,
            data_rate: 8,
        }),
        max_eirp: None,
    }
}

/// The set of frequency plans known to this server, keyed by plan ID.
#[derive(Debug, Clone, Default)]
pub struct FrequencyPlanStore {
    plans: HashMap<String, Arc<FrequencyPlan>>,
}

impl FrequencyPlanStore {
    /// A store holding the built-in plans.
    pub fn builtin() -> Self {
        let mut store = Self::default();
        store.insert(eu_863_870_ttn());
        store.insert(us_902_928_fsb_2());
        store
    }

    pub fn insert(&mut self, plan: FrequencyPlan) {
        self.plans.insert(plan.id.clone(), Arc::new(plan));
    }

    /// Adds every plan file (`.yml`, `.yaml`, `.toml`, `.json`) found in `dir`.
    ///
    /// # Errors
    ///
    /// Returns `GsError::Configuration` if the directory cannot be read or a plan file
    /// does not parse.
    pub fn load_directory(&mut self, dir: &Path) -> Result<usize, GsError> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            GsError::Configuration(format!("frequency plan directory {:?}: {}", dir, e))
        })?;
        let mut loaded = 0;
        for entry in entries {
            let path = entry
                .map_err(|e| GsError::Configuration(e.to_string()))?
                .path();
            let supported = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yml" | "yaml" | "toml" | "json")
            );
            if !supported {
                debug!(?path, "Skipping non-plan file");
                continue;
            }
            let plan: FrequencyPlan = Config::builder()
                .add_source(config::File::from(path.as_path()))
                .build()
                .and_then(|c| c.try_deserialize())
                .map_err(|e| GsError::Configuration(format!("frequency plan {:?}: {}", path, e)))?;
            plan.band()?;
            info!(plan_id = %plan.id, "Loaded frequency plan");
            self.insert(plan);
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn get(&self, id: &str) -> Result<Arc<FrequencyPlan>, GsError> {
        self.plans
            .get(id)
            .cloned()
            .ok_or_else(|| GsError::NotFound(format!("frequency plan `{}`", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtin_plans_resolve_bands() {
        let store = FrequencyPlanStore::builtin();
        let eu = store.get("EU_863_870_TTN").unwrap();
        assert_eq!(eu.band().unwrap().id, EU_863_870);
        assert_eq!(eu.rx2().unwrap(), (869_525_000, 0));
        assert_eq!(eu.downlink_channels().len(), 8);

        let us = store.get("US_902_928_FSB_2").unwrap();
        assert_eq!(us.max_eirp().unwrap(), 30.0);
        assert_eq!(us.downlink_channels()[7].frequency, 927_500_000);
        assert!(store.get("AS_923").is_err());
    }

    #[test]
    fn concentrator_config_keeps_layout() {
        let config = eu_863_870_ttn().to_concentrator_config().unwrap();
        assert_eq!(config.channels.len(), 8);
        assert_eq!(config.radios.len(), 2);
        let std = config.lora_standard_channel.unwrap();
        assert_eq!((std.spreading_factor, std.bandwidth), (7, 250_000));
        assert_eq!(config.fsk_channel.unwrap().frequency, 868_800_000);
    }

    #[test]
    fn loads_plans_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("custom.yml")).unwrap();
        writeln!(
            file,
            "id: CUSTOM_EU\nband_id: EU_863_870\nuplink_channels:\n  - frequency: 868100000\n    radio: 0\nradios:\n  - frequency: 868500000\n"
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "not a plan").unwrap();

        let mut store = FrequencyPlanStore::default();
        assert_eq!(store.load_directory(dir.path()).unwrap(), 1);
        let plan = store.get("CUSTOM_EU").unwrap();
        assert_eq!(plan.uplink_channels[0].max_data_rate, 5);
        assert!(plan.radios[0].enable);
    }
}
