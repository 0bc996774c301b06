use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime};

use serde_json::{json, Value};

use crate::model::{GatewayConnectionStats, GatewayStatus, RoundTripTimes};
use crate::utils::time;

/// Round-trip time samples over a decaying window.
#[derive(Debug)]
pub struct RttWindow {
    samples: VecDeque<(Instant, Duration)>,
    max_samples: usize,
    max_age: Duration,
}

/// Summary of the round-trip times currently in the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttSummary {
    pub min: Duration,
    pub max: Duration,
    /// The requested percentile.
    pub percentile: Duration,
    pub count: usize,
}

impl Default for RttWindow {
    fn default() -> Self {
        Self::new(20, Duration::from_secs(30 * 60))
    }
}

impl RttWindow {
    pub fn new(max_samples: usize, max_age: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
            max_age,
        }
    }

    pub fn record(&mut self, rtt: Duration, now: Instant) {
        if self.samples.len() == self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back((now, rtt));
    }

    /// Summarises the samples recorded within the window ending at `now`.
    ///
    /// `percentile` is in `0..=100`; 50 yields the median.
    pub fn stats(&self, percentile: u32, now: Instant) -> Option<RttSummary> {
        let mut values: Vec<Duration> = self
            .samples
            .iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) <= self.max_age)
            .map(|(_, rtt)| *rtt)
            .collect();
        if values.is_empty() {
            return None;
        }
        values.sort();
        let rank = (values.len() - 1) * percentile.min(100) as usize / 100;
        Some(RttSummary {
            min: values[0],
            max: values[values.len() - 1],
            percentile: values[rank],
            count: values.len(),
        })
    }
}

/// A snapshot of a connection's counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStats {
    pub protocol: String,
    pub connected_at: Option<SystemTime>,
    pub disconnected_at: Option<SystemTime>,
    pub remote_addr: String,
    pub last_status_received_at: Option<SystemTime>,
    pub last_status: Option<GatewayStatus>,
    pub last_uplink_received_at: Option<SystemTime>,
    pub uplink_count: u64,
    pub last_downlink_received_at: Option<SystemTime>,
    pub downlink_count: u64,
    pub last_tx_ack_received_at: Option<SystemTime>,
    pub tx_ack_count: u64,
    pub round_trip_times: Option<RttSummary>,
}

impl ConnectionStats {
    pub fn to_proto(&self) -> GatewayConnectionStats {
        let ts = |t: &Option<SystemTime>| t.map(time::to_proto);
        GatewayConnectionStats {
            connected_at: ts(&self.connected_at),
            disconnected_at: ts(&self.disconnected_at),
            protocol: self.protocol.clone(),
            last_status_received_at: ts(&self.last_status_received_at),
            last_status: self.last_status.clone(),
            last_uplink_received_at: ts(&self.last_uplink_received_at),
            uplink_count: self.uplink_count,
            last_downlink_received_at: ts(&self.last_downlink_received_at),
            downlink_count: self.downlink_count,
            last_tx_acknowledgment_received_at: ts(&self.last_tx_ack_received_at),
            tx_acknowledgment_count: self.tx_ack_count,
            round_trip_times: self.round_trip_times.map(|rtt| RoundTripTimes {
                min: Some(time::duration_to_proto(rtt.min)),
                max: Some(time::duration_to_proto(rtt.max)),
                median: Some(time::duration_to_proto(rtt.percentile)),
                count: rtt.count as u32,
            }),
            gateway_remote_address: self.remote_addr.clone(),
        }
    }

    /// JSON rendering for the HTTP API, with times as fractional Unix seconds.
    pub fn to_json(&self) -> Value {
        let ts = |t: &Option<SystemTime>| t.map(time::to_unix_f64);
        json!({
            "protocol": self.protocol,
            "connected_at": ts(&self.connected_at),
            "disconnected_at": ts(&self.disconnected_at),
            "gateway_remote_address": self.remote_addr,
            "last_status_received_at": ts(&self.last_status_received_at),
            "last_uplink_received_at": ts(&self.last_uplink_received_at),
            "uplink_count": self.uplink_count,
            "last_downlink_received_at": ts(&self.last_downlink_received_at),
            "downlink_count": self.downlink_count,
            "last_tx_acknowledgment_received_at": ts(&self.last_tx_ack_received_at),
            "tx_acknowledgment_count": self.tx_ack_count,
            "round_trip_times": self.round_trip_times.map(|rtt| json!({
                "min_ms": rtt.min.as_secs_f64() * 1000.0,
                "max_ms": rtt.max.as_secs_f64() * 1000.0,
                "median_ms": rtt.percentile.as_secs_f64() * 1000.0,
                "count": rtt.count,
            })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtt_window_summarises_recent_samples() {
        let start = Instant::now();
        let mut window = RttWindow::new(5, Duration::from_secs(60));
        for ms in [30u64, 10, 20, 50, 40] {
            window.record(Duration::from_millis(ms), start);
        }
        let stats = window.stats(50, start).unwrap();
        assert_eq!(stats.min, Duration::from_millis(10));
        assert_eq!(stats.max, Duration::from_millis(50));
        assert_eq!(stats.percentile, Duration::from_millis(30));
        assert_eq!(stats.count, 5);

        // The oldest sample is evicted at capacity.
        window.record(Duration::from_millis(100), start);
        assert_eq!(window.stats(0, start).unwrap().min, Duration::from_millis(10));
        assert_eq!(window.stats(100, start).unwrap().max, Duration::from_millis(100));

        // Samples decay out of the window.
        assert!(window.stats(50, start + Duration::from_secs(61)).is_none());
    }

    #[test]
    fn stats_render() {
        let stats = ConnectionStats {
            protocol: "grpc".into(),
            uplink_count: 3,
            round_trip_times: Some(RttSummary {
                min: Duration::from_millis(1),
                max: Duration::from_millis(3),
                percentile: Duration::from_millis(2),
                count: 3,
            }),
            ..Default::default()
        };
        let proto = stats.to_proto();
        assert_eq!(proto.uplink_count, 3);
        assert_eq!(proto.round_trip_times.unwrap().count, 3);
        let json = stats.to_json();
        assert_eq!(json["protocol"], "grpc");
        assert_eq!(json["round_trip_times"]["median_ms"], 2.0);
    }
}
