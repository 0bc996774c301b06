//! Ping/pong liveness shared by the WebSocket frontends.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::utils::GsError;

/// Ping cadence and tolerance for missed pongs.
#[derive(Debug, Clone, Copy)]
pub struct KeepaliveOptions {
    pub ping_interval: Duration,
    /// Consecutive pings left unanswered before the connection is dropped.
    pub missed_pong_threshold: u32,
}

impl Default for KeepaliveOptions {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            missed_pong_threshold: 2,
        }
    }
}

/// Tracks the ping in flight and the missed pong count of one WebSocket.
///
/// The session drives it: it sleeps until [`Keepalive::deadline`], sends the payload
/// returned by [`Keepalive::tick`] as a ping and feeds pongs to
/// [`Keepalive::pong`], which yields the round trip time.
#[derive(Debug)]
pub struct Keepalive {
    options: KeepaliveOptions,
    deadline: Instant,
    in_flight: Option<(u64, Instant)>,
    missed: u32,
    sequence: u64,
}

impl Keepalive {
    pub fn new(options: KeepaliveOptions) -> Self {
        let deadline = Instant::now() + jittered(options.ping_interval);
        Self {
            options,
            deadline,
            in_flight: None,
            missed: 0,
            sequence: 0,
        }
    }

    /// When the next ping is due.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Accounts for the previous ping and returns the payload of the next one.
    ///
    /// # Errors
    ///
    /// Returns `GsError::Unavailable` once `missed_pong_threshold` pings in a row went
    /// unanswered.
    pub fn tick(&mut self, now: Instant) -> Result<Vec<u8>, GsError> {
        if self.in_flight.take().is_some() {
            self.missed += 1;
            if self.missed >= self.options.missed_pong_threshold {
                return Err(GsError::Unavailable(format!(
                    "{} pongs missed",
                    self.missed
                )));
            }
        }
        self.sequence = self.sequence.wrapping_add(1);
        self.in_flight = Some((self.sequence, now));
        self.deadline = now + jittered(self.options.ping_interval);
        Ok(self.sequence.to_be_bytes().to_vec())
    }

    /// Handles a pong. Returns the round trip time if it answers the ping in flight.
    pub fn pong(&mut self, payload: &[u8], now: Instant) -> Option<Duration> {
        let (sequence, sent_at) = self.in_flight?;
        let answered = <[u8; 8]>::try_from(payload)
            .map(u64::from_be_bytes)
            .map_or(false, |seq| seq == sequence);
        if !answered {
            return None;
        }
        self.in_flight = None;
        self.missed = 0;
        Some(now.saturating_duration_since(sent_at))
    }
}

/// Spreads `interval` by up to 10% either way.
fn jittered(interval: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    interval.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> KeepaliveOptions {
        KeepaliveOptions {
            ping_interval: Duration::from_secs(10),
            missed_pong_threshold: 3,
        }
    }

    #[test]
    fn pings_every_ten_seconds_by_default() {
        assert_eq!(KeepaliveOptions::default().ping_interval, Duration::from_secs(10));
    }

    #[test]
    fn deadline_is_jittered_within_bounds() {
        let start = Instant::now();
        for _ in 0..50 {
            let ka = Keepalive::new(options());
            let wait = ka.deadline() - start;
            assert!(wait >= Duration::from_secs(9), "{:?}", wait);
            assert!(wait <= Duration::from_millis(11_100), "{:?}", wait);
        }
    }

    #[test]
    fn pong_yields_round_trip_and_resets_misses() {
        let mut ka = Keepalive::new(options());
        let t0 = Instant::now();
        ka.tick(t0).unwrap();
        let ping = ka.tick(t0 + Duration::from_secs(10)).unwrap();
        assert_eq!(ka.missed, 1);

        assert_eq!(ka.pong(b"bogus", t0), None);
        let rtt = ka.pong(&ping, t0 + Duration::from_millis(10_040));
        assert_eq!(rtt, Some(Duration::from_millis(40)));
        assert_eq!(ka.missed, 0);
        // A duplicate pong is ignored.
        assert_eq!(ka.pong(&ping, t0 + Duration::from_secs(11)), None);
    }

    #[test]
    fn drops_after_threshold() {
        let mut ka = Keepalive::new(options());
        let t0 = Instant::now();
        ka.tick(t0).unwrap();
        ka.tick(t0 + Duration::from_secs(10)).unwrap();
        ka.tick(t0 + Duration::from_secs(20)).unwrap();
        let err = ka.tick(t0 + Duration::from_secs(30)).unwrap_err();
        assert_eq!(err.code(), crate::utils::ErrorCode::Unavailable);
    }
}
