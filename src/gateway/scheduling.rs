//! Turns downlink requests into transmission settings for one gateway.
//!
//! Only the timing and radio parameters are resolved here. Duty cycle and
//! collision accounting are left to the gateways themselves.

use std::time::{Duration, Instant, SystemTime};

use crate::io::uplink_token;
use crate::model::{
    downlink_message, downlink_path, tx_settings, Class, DataRate, DownlinkMessage, DownlinkPath,
    FrequencyPlan, TxRequest, TxSettings, UplinkToken,
};
use crate::utils::{time, GsError};

/// Minimum lead time between scheduling and transmission.
pub const SCHEDULE_MARGIN: Duration = Duration::from_millis(100);

/// Delay added to immediate class C downlinks when the concentrator clock is known.
pub const CLASS_C_DELAY: Duration = Duration::from_millis(300);

/// The relation between the concentrator clock and server time, taken at an uplink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSync {
    pub timestamp: u32,
    /// Full-width concentrator time in microseconds (`xtime` for Basic Station).
    pub concentrator_time: i64,
    pub server_time: SystemTime,
    pub synced_at: Instant,
}

impl ClockSync {
    /// The 32-bit concentrator timestamp at `now`.
    pub fn timestamp_at(&self, now: Instant) -> u32 {
        let elapsed = now.saturating_duration_since(self.synced_at).as_micros() as u32;
        self.timestamp.wrapping_add(elapsed)
    }

    /// The full concentrator time at `now`.
    pub fn concentrator_time_at(&self, now: Instant) -> i64 {
        let elapsed = now.saturating_duration_since(self.synced_at).as_micros() as i64;
        self.concentrator_time + elapsed
    }

    /// The concentrator timestamp at which the wall clock reads `at`.
    pub fn timestamp_for(&self, at: SystemTime) -> u32 {
        match at.duration_since(self.server_time) {
            Ok(ahead) => self.timestamp.wrapping_add(ahead.as_micros() as u32),
            Err(behind) => self
                .timestamp
                .wrapping_sub(behind.duration().as_micros() as u32),
        }
    }
}

/// Inputs that do not come with the request itself.
pub struct ScheduleContext<'a> {
    pub plan: &'a FrequencyPlan,
    pub antenna_gain: f32,
    pub clock: Option<ClockSync>,
    pub now: SystemTime,
    pub now_instant: Instant,
}

/// A downlink in scheduled form, with what a frontend needs to put it on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Scheduled {
    pub message: DownlinkMessage,
    pub class: Class,
    /// 1 or 2 for class A windows, 0 otherwise.
    pub rx_window: u8,
    /// Delay from the uplink to the window that was picked.
    pub rx_delay: Duration,
    pub uplink_token: Option<UplinkToken>,
    pub absolute_time: Option<SystemTime>,
}

impl Scheduled {
    pub fn settings(&self) -> Option<&TxSettings> {
        self.message.scheduled()
    }
}

struct Window {
    name: &'static str,
    frequency: u64,
    data_rate: Option<DataRate>,
}

fn decode_path(path: &DownlinkPath) -> Result<(Option<UplinkToken>, u32), GsError> {
    match &path.path {
        Some(downlink_path::Path::UplinkToken(bytes)) => {
            let token = uplink_token::decode(bytes)?;
            let antenna = token.antenna_index();
            Ok((Some(token), antenna))
        }
        Some(downlink_path::Path::Fixed(ids)) => Ok((None, ids.antenna_index)),
        None => Err(GsError::InvalidArgument("empty downlink path".into())),
    }
}

/// Resolves a downlink into scheduled form.
///
/// A message that is already scheduled passes through unchanged.
///
/// # Errors
///
/// * `InvalidArgument` for a malformed path or message.
/// * `Aborted` with one detail per attempted window when no window fits.
pub fn schedule(
    message: DownlinkMessage,
    path: &DownlinkPath,
    ctx: &ScheduleContext<'_>,
) -> Result<Scheduled, GsError> {
    let (token, antenna_index) = decode_path(path)?;
    match message.settings.clone() {
        Some(downlink_message::Settings::Scheduled(settings)) => {
            let absolute_time = settings.time.as_ref().and_then(time::from_proto);
            Ok(Scheduled {
                class: if token.is_some() { Class::A } else { Class::C },
                rx_window: 0,
                rx_delay: Duration::ZERO,
                uplink_token: token,
                absolute_time,
                message,
            })
        }
        Some(downlink_message::Settings::Request(request)) => {
            let class = Class::try_from(request.class)
                .map_err(|_| GsError::InvalidArgument(format!("unknown class {}", request.class)))?;
            match class {
                Class::A => {
                    let token = token.ok_or_else(|| {
                        GsError::InvalidArgument("class A downlink requires an uplink token".into())
                    })?;
                    schedule_class_a(message, &request, token, antenna_index, ctx)
                }
                Class::B | Class::C => {
                    schedule_class_bc(message, &request, class, token, antenna_index, ctx)
                }
            }
        }
        None => Err(GsError::InvalidArgument("downlink without settings".into())),
    }
}

fn rx2_window(request: &TxRequest, plan: &FrequencyPlan) -> Result<Window, GsError> {
    if request.rx2_frequency != 0 {
        return Ok(Window {
            name: "rx2",
            frequency: request.rx2_frequency,
            data_rate: request.rx2_data_rate.clone(),
        });
    }
    let (frequency, index) = plan.rx2()?;
    let data_rate = plan.band()?.data_rate(index).map(|dr| dr.to_data_rate());
    Ok(Window {
        name: "rx2",
        frequency,
        data_rate: request.rx2_data_rate.clone().or(data_rate),
    })
}

fn check_window(window: &Window, ctx: &ScheduleContext<'_>) -> Result<DataRate, String> {
    let band = ctx.plan.band().map_err(|e| e.to_string())?;
    if !band.in_downlink_range(window.frequency) {
        return Err(format!(
            "{}: frequency {} Hz is outside the downlink range",
            window.name, window.frequency
        ));
    }
    window
        .data_rate
        .clone()
        .ok_or_else(|| format!("{}: no data rate", window.name))
}

fn tx_settings(
    data_rate: DataRate,
    frequency: u64,
    timestamp: u32,
    time: Option<SystemTime>,
    antenna_index: u32,
    ctx: &ScheduleContext<'_>,
) -> Result<TxSettings, GsError> {
    Ok(TxSettings {
        data_rate: Some(data_rate),
        frequency,
        enable_crc: false,
        timestamp,
        time: time.map(time::to_proto),
        downlink: Some(tx_settings::Downlink {
            antenna_index,
            tx_power: ctx.plan.max_eirp()? - ctx.antenna_gain,
            invert_polarization: true,
        }),
    })
}

fn with_settings(mut message: DownlinkMessage, settings: TxSettings) -> DownlinkMessage {
    message.settings = Some(downlink_message::Settings::Scheduled(settings));
    message
}

fn schedule_class_a(
    message: DownlinkMessage,
    request: &TxRequest,
    token: UplinkToken,
    antenna_index: u32,
    ctx: &ScheduleContext<'_>,
) -> Result<Scheduled, GsError> {
    let rx1_delay = Duration::from_secs(u64::from(request.rx1_delay.max(1)));
    let mut windows = Vec::with_capacity(2);
    if request.rx1_frequency != 0 {
        windows.push((
            1u8,
            rx1_delay,
            Window {
                name: "rx1",
                frequency: request.rx1_frequency,
                data_rate: request.rx1_data_rate.clone(),
            },
        ));
    }
    windows.push((2u8, rx1_delay + Duration::from_secs(1), rx2_window(request, ctx.plan)?));

    let mut details = Vec::new();
    for (rx_window, delay, window) in windows {
        if let Some(received) = token.server_time() {
            if received + delay < ctx.now + SCHEDULE_MARGIN {
                details.push(format!("{}: too late", window.name));
                continue;
            }
        }
        let data_rate = match check_window(&window, ctx) {
            Ok(dr) => dr,
            Err(detail) => {
                details.push(detail);
                continue;
            }
        };
        let timestamp = token.timestamp.wrapping_add(delay.as_micros() as u32);
        let settings = tx_settings(data_rate, window.frequency, timestamp, None, antenna_index, ctx)?;
        return Ok(Scheduled {
            message: with_settings(message, settings),
            class: Class::A,
            rx_window,
            rx_delay: delay,
            uplink_token: Some(token),
            absolute_time: None,
        });
    }
    Err(GsError::aborted("no class A window available", details))
}

fn schedule_class_bc(
    message: DownlinkMessage,
    request: &TxRequest,
    class: Class,
    token: Option<UplinkToken>,
    antenna_index: u32,
    ctx: &ScheduleContext<'_>,
) -> Result<Scheduled, GsError> {
    let window = rx2_window(request, ctx.plan)?;
    let absolute_time = request.absolute_time.as_ref().and_then(time::from_proto);
    let mut details = Vec::new();
    if class == Class::B && absolute_time.is_none() {
        details.push("class B: absolute time required".to_string());
        return Err(GsError::aborted("no class B window available", details));
    }
    if let Some(at) = absolute_time {
        if at < ctx.now + SCHEDULE_MARGIN {
            details.push(format!("{}: too late", window.name));
            return Err(GsError::aborted("absolute time has passed", details));
        }
    }
    let data_rate = match check_window(&window, ctx) {
        Ok(dr) => dr,
        Err(detail) => {
            details.push(detail);
            return Err(GsError::aborted("no downlink window available", details));
        }
    };
    let timestamp = match (absolute_time, ctx.clock) {
        (Some(at), Some(clock)) => clock.timestamp_for(at),
        (None, Some(clock)) => clock.timestamp_at(ctx.now_instant + CLASS_C_DELAY),
        // Without a clock the gateway transmits immediately or at the absolute time.
        (_, None) => 0,
    };
    let settings = tx_settings(data_rate, window.frequency, timestamp, absolute_time, antenna_index, ctx)?;
    Ok(Scheduled {
        message: with_settings(message, settings),
        class,
        rx_window: 0,
        rx_delay: Duration::ZERO,
        uplink_token: token,
        absolute_time,
    })
}
