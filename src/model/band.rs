//! Regional band parameters used by the frontends.
//!
//! Only the parameters the frontends need are modelled: the data rate table, the
//! downlink frequency range, the default power and the RX2 and beacon defaults.

use super::messages::DataRate;
use crate::utils::GsError;

pub const EU_863_870: &str = "EU_863_870";
pub const US_902_928: &str = "US_902_928";

/// One entry of a band's data rate table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandDataRate {
    LoRa { spreading_factor: u32, bandwidth: u32 },
    Fsk { bit_rate: u32 },
}

impl BandDataRate {
    pub fn to_data_rate(self) -> DataRate {
        match self {
            BandDataRate::LoRa {
                spreading_factor,
                bandwidth,
            } => DataRate::lora(spreading_factor, bandwidth, "4/5"),
            BandDataRate::Fsk { bit_rate } => DataRate::fsk(bit_rate),
        }
    }

    pub fn bandwidth(self) -> u32 {
        match self {
            BandDataRate::LoRa { bandwidth, .. } => bandwidth,
            BandDataRate::Fsk { .. } => 0,
        }
    }

    fn matches(self, dr: &DataRate) -> bool {
        match (self, dr.as_lora(), dr.as_fsk()) {
            (
                BandDataRate::LoRa {
                    spreading_factor,
                    bandwidth,
                },
                Some(lora),
                _,
            ) => lora.spreading_factor == spreading_factor && lora.bandwidth == bandwidth,
            (BandDataRate::Fsk { bit_rate }, _, Some(fsk)) => fsk.bit_rate == bit_rate,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct Beacon {
    pub data_rate_index: u8,
    pub frequencies: &'static [u64],
    /// Basic Station beacon layout: time offset, info descriptor offset, total length.
    pub layout: [u32; 3],
}

#[derive(Debug)]
pub struct Band {
    pub id: &'static str,
    /// Region name as Basic Station expects it in `router_config`.
    pub station_region: &'static str,
    pub data_rates: &'static [(u8, BandDataRate)],
    pub frequency_range: (u64, u64),
    pub downlink_range: (u64, u64),
    pub default_max_eirp: f32,
    pub default_rx2_frequency: u64,
    pub default_rx2_data_rate: u8,
    pub beacon: Beacon,
}

static EU_868: Band = Band {
    id: EU_863_870,
    station_region: "EU863",
    data_rates: &[
        (0, BandDataRate::LoRa { spreading_factor: 12, bandwidth: 125_000 }),
        (1, BandDataRate::LoRa { spreading_factor: 11, bandwidth: 125_000 }),
        (2, BandDataRate::LoRa { spreading_factor: 10, bandwidth: 125_000 }),
        (3, BandDataRate::LoRa { spreading_factor: 9, bandwidth: 125_000 }),
        (4, BandDataRate::LoRa { spreading_factor: 8, bandwidth: 125_000 }),
        (5, BandDataRate::LoRa { spreading_factor: 7, bandwidth: 125_000 }),
        (6, BandDataRate::LoRa { spreading_factor: 7, bandwidth: 250_000 }),
        (7, BandDataRate::Fsk { bit_rate: 50_000 }),
    ],
    frequency_range: (863_000_000, 870_000_000),
    downlink_range: (863_000_000, 870_000_000),
    default_max_eirp: 16.15,
    default_rx2_frequency: 869_525_000,
    default_rx2_data_rate: 0,
    beacon: Beacon {
        data_rate_index: 3,
        frequencies: &[869_525_000],
        layout: [2, 8, 17],
    },
};

static US_915: Band = Band {
    id: US_902_928,
    station_region: "US902",
    data_rates: &[
        (0, BandDataRate::LoRa { spreading_factor: 10, bandwidth: 125_000 }),
        (1, BandDataRate::LoRa { spreading_factor: 9, bandwidth: 125_000 }),
        (2, BandDataRate::LoRa { spreading_factor: 8, bandwidth: 125_000 }),
        (3, BandDataRate::LoRa { spreading_factor: 7, bandwidth: 125_000 }),
        (4, BandDataRate::LoRa { spreading_factor: 8, bandwidth: 500_000 }),
        (8, BandDataRate::LoRa { spreading_factor: 12, bandwidth: 500_000 }),
        (9, BandDataRate::LoRa { spreading_factor: 11, bandwidth: 500_000 }),
        (10, BandDataRate::LoRa { spreading_factor: 10, bandwidth: 500_000 }),
        (11, BandDataRate::LoRa { spreading_factor: 9, bandwidth: 500_000 }),
        (12, BandDataRate::LoRa { spreading_factor: 8, bandwidth: 500_000 }),
        (13, BandDataRate::LoRa { spreading_factor: 7, bandwidth: 500_000 }),
    ],
    frequency_range: (902_000_000, 928_000_000),
    downlink_range: (923_300_000, 927_500_000),
    default_max_eirp: 30.0,
    default_rx2_frequency: 923_300_000,
    default_rx2_data_rate: 8,
    beacon: Beacon {
        data_rate_index: 8,
        frequencies: &[
            923_300_000,
            923_900_000,
            924_500_000,
            925_100_000,
            925_700_000,
            926_300_000,
            926_900_000,
            927_500_000,
        ],
        layout: [5, 11, 23],
    },
};

impl Band {
    /// Looks up a band by ID.
    ///
    /// # Errors
    ///
    /// Returns `GsError::NotFound` for bands this server has no tables for.
    pub fn get(id: &str) -> Result<&'static Band, GsError> {
        match id {
            EU_863_870 => Ok(&EU_868),
            US_902_928 => Ok(&US_915),
            other => Err(GsError::NotFound(format!("band `{}`", other))),
        }
    }

    pub fn data_rate(&self, index: u8) -> Option<BandDataRate> {
        self.data_rates
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, dr)| *dr)
    }

    /// Resolves a data rate to its index in this band.
    pub fn data_rate_index(&self, dr: &DataRate) -> Option<u8> {
        self.data_rates
            .iter()
            .find(|(_, candidate)| candidate.matches(dr))
            .map(|(i, _)| *i)
    }

    pub fn in_downlink_range(&self, frequency: u64) -> bool {
        frequency >= self.downlink_range.0 && frequency <= self.downlink_range.1
    }

    /// The data rate table in the 16-entry form of Basic Station's `DRs` field:
    /// `[sf, bw_khz, dnonly]`, with FSK as `[0, 0, 0]` and gaps as `[-1, 0, 0]`.
    pub fn station_data_rates(&self) -> Vec<[i32; 3]> {
        (0..16u8)
            .map(|i| match self.data_rate(i) {
                Some(BandDataRate::LoRa {
                    spreading_factor,
                    bandwidth,
                }) => {
                    let dnonly = i32::from(self.id == US_902_928 && i >= 8);
                    [spreading_factor as i32, (bandwidth / 1000) as i32, dnonly]
                }
                Some(BandDataRate::Fsk { .. }) => [0, 0, 0],
                None => [-1, 0, 0],
            })
            .collect()
    }
}
