//! Server to station: scheduled downlinks as `dnmsg`.

use std::time::{Duration, SystemTime};

use crate::gateway::scheduling::{ClockSync, Scheduled};
use crate::model::{Band, Class};
use crate::utils::{time, Eui64, GsError};

use super::messages::DownlinkMessage;

pub struct DownlinkContext<'a> {
    pub band: &'a Band,
    pub clock: Option<ClockSync>,
    pub now: SystemTime,
}

fn device_class(class: Class) -> u8 {
    match class {
        Class::A => 0,
        Class::B => 1,
        Class::C => 2,
    }
}

/// The `xtime` at which the concentrator timestamp reads `timestamp`, relative to the
/// last clock synchronisation.
fn xtime_for(clock: &ClockSync, timestamp: u32) -> i64 {
    let delta = timestamp.wrapping_sub(clock.timestamp) as i32;
    clock.concentrator_time + i64::from(delta)
}

/// Renders a scheduled downlink as `dnmsg` with downlink ID `diid`.
///
/// Class A downlinks reuse the `xtime` of the uplink they answer. Class B and C
/// downlinks transmit at their absolute GPS time if they have one, otherwise at the
/// `xtime` derived from the concentrator clock.
///
/// # Errors
///
/// * `InvalidArgument` when the downlink is not scheduled, has no data rate of the
///   band, or is a class A downlink without uplink token.
/// * `FailedPrecondition` for a class C downlink while the clock is not synchronised.
pub fn to_dnmsg(
    scheduled: &Scheduled,
    diid: u16,
    ctx: &DownlinkContext<'_>,
) -> Result<DownlinkMessage, GsError> {
    let settings = scheduled
        .settings()
        .ok_or_else(|| GsError::InvalidArgument("downlink is not scheduled".into()))?;
    let data_rate = settings
        .data_rate
        .as_ref()
        .and_then(|dr| ctx.band.data_rate_index(dr))
        .ok_or_else(|| {
            GsError::InvalidArgument(format!("data rate is not defined in band {}", ctx.band.id))
        })?;
    let rctx = settings
        .downlink
        .as_ref()
        .map(|d| i64::from(d.antenna_index))
        .unwrap_or_default();

    let mut msg = DownlinkMessage {
        dev_eui: Eui64::ZERO,
        device_class: device_class(scheduled.class),
        diid: i64::from(diid),
        pdu: hex::encode(&scheduled.message.raw_payload),
        rx_delay: None,
        rx1_data_rate: None,
        rx1_frequency: None,
        rx2_data_rate: None,
        rx2_frequency: None,
        priority: 0,
        xtime: None,
        gpstime: None,
        rctx,
        mux_time: time::to_unix_f64(ctx.now),
    };

    match scheduled.class {
        Class::A => {
            let token = scheduled.uplink_token.as_ref().ok_or_else(|| {
                GsError::InvalidArgument("class A downlink without uplink token".into())
            })?;
            msg.xtime = Some(token.concentrator_time);
            msg.rctx = i64::from(token.antenna_index());
            let delay = match scheduled.rx_window {
                0 => Duration::from_micros(u64::from(
                    settings.timestamp.wrapping_sub(token.timestamp),
                )),
                _ => scheduled.rx_delay,
            };
            if scheduled.rx_window == 2 {
                // The station counts RX2 from RxDelay plus one second.
                msg.rx_delay = Some(delay.saturating_sub(Duration::from_secs(1)).as_secs());
                msg.rx2_data_rate = Some(data_rate);
                msg.rx2_frequency = Some(settings.frequency);
            } else {
                msg.rx_delay = Some(delay.as_secs());
                msg.rx1_data_rate = Some(data_rate);
                msg.rx1_frequency = Some(settings.frequency);
            }
        }
        Class::B | Class::C => {
            msg.rx2_data_rate = Some(data_rate);
            msg.rx2_frequency = Some(settings.frequency);
            match scheduled.absolute_time {
                Some(at) => msg.gpstime = Some(time::to_gps_micros(at)),
                None => {
                    let clock = ctx.clock.as_ref().ok_or_else(|| {
                        GsError::FailedPrecondition("concentrator clock not synchronised".into())
                    })?;
                    msg.xtime = Some(xtime_for(clock, settings.timestamp));
                }
            }
        }
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::uplink_token;
    use crate::model::band::EU_863_870;
    use crate::model::{
        downlink_message, tx_settings, DataRate, DownlinkMessage as Down, GatewayIdentifiers,
        TxSettings,
    };
    use std::time::Instant;

    fn scheduled(class: Class, rx_window: u8, timestamp: u32) -> Scheduled {
        let token_bytes = uplink_token::mint(
            &GatewayIdentifiers::from_id("test-gateway"),
            1,
            10_000_000,
            0x0001_0000_0098_9680,
            SystemTime::now(),
            None,
        );
        Scheduled {
            message: Down {
                raw_payload: vec![0x60, 0xaa],
                correlation_ids: Vec::new(),
                settings: Some(downlink_message::Settings::Scheduled(TxSettings {
                    data_rate: Some(DataRate::lora(12, 125_000, "4/5")),
                    frequency: 869_525_000,
                    timestamp,
                    downlink: Some(tx_settings::Downlink {
                        antenna_index: 0,
                        tx_power: 16.15,
                        invert_polarization: true,
                    }),
                    ..Default::default()
                })),
            },
            class,
            rx_window,
            rx_delay: Duration::from_secs(if rx_window == 2 { 2 } else { 1 }),
            uplink_token: (class == Class::A)
                .then(|| uplink_token::decode(&token_bytes).unwrap()),
            absolute_time: None,
        }
    }

    fn ctx(clock: Option<ClockSync>) -> DownlinkContext<'static> {
        DownlinkContext {
            band: Band::get(EU_863_870).unwrap(),
            clock,
            now: SystemTime::now(),
        }
    }

    #[test]
    fn class_a_reuses_uplink_xtime() {
        let msg = to_dnmsg(&scheduled(Class::A, 1, 11_000_000), 7, &ctx(None)).unwrap();
        assert_eq!(msg.device_class, 0);
        assert_eq!(msg.diid, 7);
        assert_eq!(msg.xtime, Some(0x0001_0000_0098_9680));
        assert_eq!(msg.rctx, 1);
        assert_eq!(msg.rx_delay, Some(1));
        assert_eq!(msg.rx1_data_rate, Some(0));
        assert_eq!(msg.rx1_frequency, Some(869_525_000));
        assert_eq!(msg.rx2_frequency, None);
        assert_eq!(msg.pdu, "60aa");
    }

    #[test]
    fn class_a_rx2_window() {
        let msg = to_dnmsg(&scheduled(Class::A, 2, 12_000_000), 1, &ctx(None)).unwrap();
        assert_eq!(msg.rx_delay, Some(1));
        assert_eq!(msg.rx2_data_rate, Some(0));
        assert_eq!(msg.rx1_frequency, None);
    }

    #[test]
    fn class_c_uses_clock() {
        let clock = ClockSync {
            timestamp: 10_000_000,
            concentrator_time: 0x0001_0000_0098_9680,
            server_time: SystemTime::now(),
            synced_at: Instant::now(),
        };
        let msg = to_dnmsg(&scheduled(Class::C, 0, 10_500_000), 2, &ctx(Some(clock))).unwrap();
        assert_eq!(msg.device_class, 2);
        assert_eq!(msg.xtime, Some(0x0001_0000_0098_9680 + 500_000));
        assert_eq!(msg.rx2_frequency, Some(869_525_000));

        let err = to_dnmsg(&scheduled(Class::C, 0, 10_500_000), 2, &ctx(None)).unwrap_err();
        assert_eq!(err.code(), crate::utils::ErrorCode::FailedPrecondition);
    }

    #[test]
    fn absolute_time_uses_gps() {
        let mut down = scheduled(Class::C, 0, 0);
        let at = SystemTime::now() + Duration::from_secs(5);
        down.absolute_time = Some(at);
        let msg = to_dnmsg(&down, 3, &ctx(None)).unwrap();
        assert_eq!(msg.gpstime, Some(time::to_gps_micros(at)));
        assert_eq!(msg.xtime, None);
    }
}
