//! The single-board gateway configuration derived from a frequency plan, and the
//! channel lookups both directions of traffic do against it.

use tracing::debug;

use super::proto::{
    transmit_downlink_request, tx_channel_config, Board, CodeRate, FskChannel, GatewayConfig,
    LoraServiceChannel, MultiSfChannel, RfChain, TxChannelConfig, UplinkMessage,
};
use crate::model::band::BandDataRate;
use crate::model::{DataRate, FrequencyPlan};
use crate::utils::GsError;

pub const MAX_RF_CHAINS: usize = 2;
pub const MULTI_SF_CHANNELS: usize = 8;
pub const MAX_TX_CHANNELS: usize = 16;

/// IF chain index of the LoRa service channel.
pub const LORA_SERVICE_IF_CHAIN: u32 = MULTI_SF_CHANNELS as u32;
/// IF chain index of the FSK channel.
pub const FSK_IF_CHAIN: u32 = LORA_SERVICE_IF_CHAIN + 1;

const MULTI_SF_BANDWIDTH: u32 = 125_000;

fn offset(plan: &FrequencyPlan, rf_chains: &[RfChain], radio: u32, frequency: u64) -> Result<i32, GsError> {
    let rf = rf_chains.get(radio as usize).ok_or_else(|| {
        GsError::InvalidArgument(format!(
            "plan `{}` references radio {} of {}",
            plan.id,
            radio,
            rf_chains.len()
        ))
    })?;
    i32::try_from(frequency as i64 - rf.frequency as i64)
        .map_err(|_| GsError::InvalidArgument(format!("frequency {} is out of radio range", frequency)))
}

fn push_tx(tx: &mut Vec<TxChannelConfig>, frequency: u64, bandwidth: u32) {
    let exists = tx.iter().any(|ch| {
        ch.frequency == frequency
            && ch.modulation == Some(tx_channel_config::Modulation::LoraBandwidth(bandwidth))
    });
    if exists {
        return;
    }
    if tx.len() == MAX_TX_CHANNELS {
        debug!(frequency, bandwidth, "TX channel table full");
        return;
    }
    tx.push(TxChannelConfig {
        frequency,
        modulation: Some(tx_channel_config::Modulation::LoraBandwidth(bandwidth)),
    });
}

/// Builds the configuration pushed to a gateway after the server hello.
///
/// The board has the plan's first two radios, its first eight uplink channels as
/// multi-SF channels, and its LoRa service and FSK channels. The TX table holds one
/// entry per distinct downlink `(frequency, bandwidth)`, RX2 included.
///
/// # Errors
///
/// Returns `GsError::InvalidArgument` when a channel references a radio beyond the
/// first two or lies too far from its radio, and `GsError::NotFound` for an
/// unknown band.
pub fn build(plan: &FrequencyPlan) -> Result<GatewayConfig, GsError> {
    let band = plan.band()?;
    let rf_chains: Vec<RfChain> = plan
        .radios
        .iter()
        .take(MAX_RF_CHAINS)
        .map(|radio| RfChain {
            frequency: radio.frequency,
            tx_enable: radio.tx.is_some(),
        })
        .collect();

    let multi_sf = plan
        .uplink_channels
        .iter()
        .take(MULTI_SF_CHANNELS)
        .map(|ch| {
            Ok(MultiSfChannel {
                rf_chain: ch.radio,
                frequency_offset: offset(plan, &rf_chains, ch.radio, ch.frequency)?,
            })
        })
        .collect::<Result<Vec<_>, GsError>>()?;

    let lora_service = match &plan.lora_standard_channel {
        Some(ch) => match band.data_rate(ch.data_rate) {
            Some(BandDataRate::LoRa {
                spreading_factor,
                bandwidth,
            }) => Some(LoraServiceChannel {
                rf_chain: ch.radio,
                frequency_offset: offset(plan, &rf_chains, ch.radio, ch.frequency)?,
                spreading_factor,
                bandwidth,
            }),
            _ => {
                return Err(GsError::InvalidArgument(format!(
                    "plan `{}` has no LoRa data rate on its service channel",
                    plan.id
                )))
            }
        },
        None => None,
    };

    let fsk = match &plan.fsk_channel {
        Some(ch) => match band.data_rate(ch.data_rate) {
            Some(BandDataRate::Fsk { bit_rate }) => Some(FskChannel {
                rf_chain: ch.radio,
                frequency_offset: offset(plan, &rf_chains, ch.radio, ch.frequency)?,
                bit_rate,
            }),
            _ => {
                return Err(GsError::InvalidArgument(format!(
                    "plan `{}` has no FSK data rate on its FSK channel",
                    plan.id
                )))
            }
        },
        None => None,
    };

    let mut tx_channels = Vec::new();
    for ch in plan.downlink_channels() {
        for index in ch.min_data_rate..=ch.max_data_rate {
            if let Some(BandDataRate::LoRa { bandwidth, .. }) = band.data_rate(index) {
                push_tx(&mut tx_channels, ch.frequency, bandwidth);
            }
        }
    }
    let (rx2_frequency, rx2_data_rate) = plan.rx2()?;
    if let Some(BandDataRate::LoRa { bandwidth, .. }) = band.data_rate(rx2_data_rate) {
        push_tx(&mut tx_channels, rx2_frequency, bandwidth);
    }

    Ok(GatewayConfig {
        boards: vec![Board {
            rf_chains,
            multi_sf,
            lora_service,
            fsk,
        }],
        tx_channels,
    })
}

/// Resolves the frequency and data rate an uplink was received with from its
/// board and IF chain.
///
/// # Errors
///
/// Returns `GsError::InvalidArgument` for an unconfigured board or IF chain.
pub fn resolve_uplink(config: &GatewayConfig, up: &UplinkMessage) -> Result<(u64, DataRate), GsError> {
    let board = config
        .boards
        .get(up.board as usize)
        .ok_or_else(|| GsError::InvalidArgument(format!("unknown board {}", up.board)))?;
    let frequency = |rf_chain: u32, frequency_offset: i32| -> Result<u64, GsError> {
        let rf = board
            .rf_chains
            .get(rf_chain as usize)
            .ok_or_else(|| GsError::InvalidArgument(format!("unknown RF chain {}", rf_chain)))?;
        Ok((rf.frequency as i64 + i64::from(frequency_offset)) as u64)
    };
    let code_rate = CodeRate::try_from(up.code_rate)
        .unwrap_or(CodeRate::Cr45)
        .as_str();

    match up.if_chain {
        i if (i as usize) < board.multi_sf.len() => {
            let ch = &board.multi_sf[i as usize];
            Ok((
                frequency(ch.rf_chain, ch.frequency_offset)?,
                DataRate::lora(up.spreading_factor, MULTI_SF_BANDWIDTH, code_rate),
            ))
        }
        LORA_SERVICE_IF_CHAIN => {
            let ch = board
                .lora_service
                .as_ref()
                .ok_or_else(|| GsError::InvalidArgument("no LoRa service channel".into()))?;
            Ok((
                frequency(ch.rf_chain, ch.frequency_offset)?,
                DataRate::lora(ch.spreading_factor, ch.bandwidth, code_rate),
            ))
        }
        FSK_IF_CHAIN => {
            let ch = board
                .fsk
                .as_ref()
                .ok_or_else(|| GsError::InvalidArgument("no FSK channel".into()))?;
            Ok((
                frequency(ch.rf_chain, ch.frequency_offset)?,
                DataRate::fsk(ch.bit_rate),
            ))
        }
        other => Err(GsError::InvalidArgument(format!("unknown IF chain {}", other))),
    }
}

/// The TX channel for a downlink: an index into the configured table when it has
/// the `(frequency, bandwidth)`, otherwise the channel inline.
pub fn tx_channel(config: &GatewayConfig, frequency: u64, data_rate: &DataRate) -> transmit_downlink_request::Channel {
    let modulation = match (data_rate.as_lora(), data_rate.as_fsk()) {
        (Some(lora), _) => tx_channel_config::Modulation::LoraBandwidth(lora.bandwidth),
        (None, Some(fsk)) => tx_channel_config::Modulation::FskBitRate(fsk.bit_rate),
        (None, None) => tx_channel_config::Modulation::LoraBandwidth(MULTI_SF_BANDWIDTH),
    };
    let index = config
        .tx_channels
        .iter()
        .position(|ch| ch.frequency == frequency && ch.modulation.as_ref() == Some(&modulation));
    match index {
        Some(index) => transmit_downlink_request::Channel::Index(index as u32),
        None => transmit_downlink_request::Channel::Inline(TxChannelConfig {
            frequency,
            modulation: Some(modulation),
        }),
    }
}
