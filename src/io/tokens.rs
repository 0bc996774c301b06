//! Correlation of downlinks with their TX acknowledgments.
//!
//! Each downlink sent to a gateway gets a 16-bit token. The token travels with the
//! downlink (as `diid`, transaction ID or correlation ID) and comes back in the
//! acknowledgment, which is how the acknowledgment finds the original message.

use std::time::Instant;

use crate::model::DownlinkMessage;

/// Number of slots; the ring holds the last `CAPACITY` downlinks.
pub const CAPACITY: usize = 64;

const CORRELATION_PREFIX: &str = "gs:token:";

#[derive(Debug, Clone)]
struct Slot {
    token: u16,
    message: DownlinkMessage,
    issued_at: Instant,
}

/// Fixed ring of outstanding downlinks.
///
/// Retention is bounded by the ring, not by a clock: an acknowledgment is only
/// resolved if fewer than `CAPACITY` downlinks were issued after its own.
#[derive(Debug)]
pub struct DownlinkTokens {
    slots: Vec<Option<Slot>>,
    last: u16,
}

impl Default for DownlinkTokens {
    fn default() -> Self {
        Self {
            slots: vec![None; CAPACITY],
            last: 0,
        }
    }
}

impl DownlinkTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `message` and returns its token. Tokens increase by one and wrap; zero
    /// is never issued since gateways use it for unsolicited messages.
    pub fn next(&mut self, message: DownlinkMessage, now: Instant) -> u16 {
        self.last = self.last.checked_add(1).unwrap_or(1);
        let token = self.last;
        self.slots[token as usize % CAPACITY] = Some(Slot {
            token,
            message,
            issued_at: now,
        });
        token
    }

    /// Returns the message issued with `token` and its age, if still held.
    pub fn get(&self, token: u16, now: Instant) -> Option<(DownlinkMessage, std::time::Duration)> {
        match &self.slots[token as usize % CAPACITY] {
            Some(slot) if slot.token == token => Some((
                slot.message.clone(),
                now.saturating_duration_since(slot.issued_at),
            )),
            _ => None,
        }
    }
}

/// Formats a token as correlation ID: `gs:token:<hex>`.
pub fn format_correlation_id(token: u16) -> String {
    format!("{}{:04x}", CORRELATION_PREFIX, token)
}

/// Finds the first token correlation ID in `ids`.
pub fn parse_token_from_correlation_ids<S: AsRef<str>>(ids: &[S]) -> Option<u16> {
    ids.iter().find_map(|id| {
        id.as_ref()
            .strip_prefix(CORRELATION_PREFIX)
            .and_then(|hex| u16::from_str_radix(hex, 16).ok())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn down(payload: u8) -> DownlinkMessage {
        DownlinkMessage {
            raw_payload: vec![payload],
            ..Default::default()
        }
    }

    #[test]
    fn tokens_resolve_until_overwritten() {
        let mut tokens = DownlinkTokens::new();
        let now = Instant::now();
        let first = tokens.next(down(1), now);
        let second = tokens.next(down(2), now);
        assert_eq!(second, first.wrapping_add(1));

        let (msg, _) = tokens.get(first, now).unwrap();
        assert_eq!(msg.raw_payload, vec![1]);
        // Retrieval does not consume the slot.
        assert!(tokens.get(first, now).is_some());

        for i in 0..CAPACITY {
            tokens.next(down(i as u8), now);
        }
        assert!(tokens.get(first, now).is_none());
        assert!(tokens.get(second, now).is_none());
    }

    #[test]
    fn tokens_wrap() {
        let mut tokens = DownlinkTokens::new();
        let now = Instant::now();
        tokens.last = u16::MAX - 1;
        let a = tokens.next(down(1), now);
        let b = tokens.next(down(2), now);
        assert_eq!((a, b), (u16::MAX, 1));
        assert_eq!(tokens.get(a, now).unwrap().0.raw_payload, vec![1]);
        assert_eq!(tokens.get(b, now).unwrap().0.raw_payload, vec![2]);
    }

    #[test]
    fn unknown_token_misses() {
        let mut tokens = DownlinkTokens::new();
        assert!(tokens.get(42, Instant::now()).is_none());
        assert!(tokens.get(0, Instant::now()).is_none());
        tokens.next(down(1), Instant::now());
        assert!(tokens.get(0, Instant::now()).is_none());
    }

    #[test]
    fn correlation_ids() {
        assert_eq!(format_correlation_id(0x2a), "gs:token:002a");
        let ids = vec![
            "gs:uplink:abc".to_string(),
            format_correlation_id(0xbeef),
            format_correlation_id(1),
        ];
        assert_eq!(parse_token_from_correlation_ids(&ids), Some(0xbeef));
        assert_eq!(parse_token_from_correlation_ids(&["gs:token:zz"]), None);
        assert_eq!(parse_token_from_correlation_ids::<String>(&[]), None);
    }
}
