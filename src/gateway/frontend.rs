use std::fmt;

/// How a frontend's gateways account for regional duty cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DutyCycleStyle {
    /// The server schedules within the duty cycle.
    Default,
    /// The gateway enforces duty cycle itself; windows are only blocked, not checked.
    BlockingWindows,
}

/// The capabilities a protocol frontend declares to the Gateway Server.
pub trait Frontend: Send + Sync + fmt::Debug {
    /// Protocol name, reported in connection stats.
    fn protocol(&self) -> &'static str;

    /// Whether gateways on this frontend can be claimed through downlink messages.
    fn supports_downlink_claim(&self) -> bool {
        false
    }

    fn duty_cycle_style(&self) -> DutyCycleStyle {
        DutyCycleStyle::Default
    }
}
