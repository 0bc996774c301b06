//! Time conversions shared by the frontends.
//!
//! Gateways speak in several clocks: Unix time, GPS time (used by Basic Station and
//! for class B/C absolute downlinks) and the free-running concentrator counter.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds between the Unix epoch and the GPS epoch (1980-01-06T00:00:00Z).
const GPS_EPOCH_UNIX_SECS: u64 = 315_964_800;

/// Leap seconds between UTC and GPS time since 2017-01-01.
const GPS_LEAP_SECONDS: u64 = 18;

/// Converts a wall clock instant to microseconds since the GPS epoch.
pub fn to_gps_micros(t: SystemTime) -> i64 {
    let unix = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    let gps = unix.saturating_sub(Duration::from_secs(GPS_EPOCH_UNIX_SECS))
        + Duration::from_secs(GPS_LEAP_SECONDS);
    gps.as_micros() as i64
}

/// Converts microseconds since the GPS epoch back to a wall clock instant.
pub fn from_gps_micros(micros: i64) -> SystemTime {
    let gps = Duration::from_micros(micros.max(0) as u64);
    let unix = (gps + Duration::from_secs(GPS_EPOCH_UNIX_SECS))
        .saturating_sub(Duration::from_secs(GPS_LEAP_SECONDS));
    UNIX_EPOCH + unix
}

/// Converts a wall clock instant to fractional Unix seconds, as used in JSON payloads.
pub fn to_unix_f64(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Converts fractional Unix seconds to a wall clock instant. Non-positive,
/// non-finite or unrepresentable inputs yield `None`.
pub fn from_unix_f64(secs: f64) -> Option<SystemTime> {
    if !secs.is_finite() || secs <= 0.0 {
        return None;
    }
    let since_epoch = Duration::try_from_secs_f64(secs).ok()?;
    UNIX_EPOCH.checked_add(since_epoch)
}

/// Converts a wall clock instant to a protobuf timestamp.
pub fn to_proto(t: SystemTime) -> prost_types::Timestamp {
    prost_types::Timestamp::from(t)
}

/// Converts a protobuf timestamp to a wall clock instant, if representable.
pub fn from_proto(ts: &prost_types::Timestamp) -> Option<SystemTime> {
    SystemTime::try_from(ts.clone()).ok()
}

/// Converts a duration to its protobuf counterpart.
pub fn duration_to_proto(d: Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}

/// Converts a protobuf duration to a standard duration; negative values clamp to zero.
pub fn duration_from_proto(d: &prost_types::Duration) -> Duration {
    if d.seconds < 0 || d.nanos < 0 {
        return Duration::ZERO;
    }
    Duration::new(d.seconds as u64, d.nanos as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gps_round_trip() {
        let t = UNIX_EPOCH + Duration::from_micros(1_700_000_000_123_456);
        let gps = to_gps_micros(t);
        assert_eq!(from_gps_micros(gps), t);
    }

    #[test]
    fn gps_epoch_is_offset_by_leap_seconds() {
        let t = UNIX_EPOCH + Duration::from_secs(GPS_EPOCH_UNIX_SECS);
        assert_eq!(to_gps_micros(t), (GPS_LEAP_SECONDS * 1_000_000) as i64);
    }

    #[test]
    fn unix_floats() {
        assert!(from_unix_f64(0.0).is_none());
        assert!(from_unix_f64(f64::NAN).is_none());
        let t = from_unix_f64(1_600_000_000.5).unwrap();
        assert!((to_unix_f64(t) - 1_600_000_000.5).abs() < 1e-6);
    }

    #[test]
    fn unix_floats_beyond_the_clock_are_dropped() {
        assert!(from_unix_f64(1e20).is_none());
        assert!(from_unix_f64(f64::MAX).is_none());
        assert!(from_unix_f64(f64::INFINITY).is_none());
    }

    #[test]
    fn proto_conversions() {
        let t = UNIX_EPOCH + Duration::from_millis(1_234_567);
        assert_eq!(from_proto(&to_proto(t)), Some(t));
        let d = Duration::from_millis(1500);
        assert_eq!(duration_from_proto(&duration_to_proto(d)), d);
    }
}
