use std::collections::HashMap;

use crate::model::UplinkMessage;

/// Groups uplinks by payload and reception time, keeping the copy received with the
/// strongest channel RSSI.
///
/// Each winner stays at the position it was received in. The dropped copies are
/// returned separately so callers can report them.
///
/// # Arguments
///
/// * `messages` - One batch of uplinks received from a single gateway.
///
/// # Returns
///
/// A tuple of the unique uplinks and the repeats that were filtered out.
pub fn unique_by_rssi(messages: Vec<UplinkMessage>) -> (Vec<UplinkMessage>, Vec<UplinkMessage>) {
    if messages.len() < 2 {
        return (messages, Vec::new());
    }

    let mut winners: Vec<Option<UplinkMessage>> = Vec::with_capacity(messages.len());
    let mut by_key: HashMap<(Vec<u8>, u32), usize> = HashMap::new();
    let mut repeats = Vec::new();

    for msg in messages {
        let key = (msg.raw_payload.clone(), rounded_timestamp(&msg));
        match by_key.get(&key) {
            Some(&index) => {
                let current = winners[index]
                    .as_ref()
                    .map(|w| w.best_channel_rssi())
                    .unwrap_or(f32::NEG_INFINITY);
                if msg.best_channel_rssi() > current {
                    let replaced = winners[index].take();
                    repeats.extend(replaced);
                    winners.push(Some(msg));
                    by_key.insert(key, winners.len() - 1);
                } else {
                    repeats.push(msg);
                }
            }
            None => {
                winners.push(Some(msg));
                by_key.insert(key, winners.len() - 1);
            }
        }
    }

    (winners.into_iter().flatten().collect(), repeats)
}

/// The concentrator timestamp rounded to milliseconds.
fn rounded_timestamp(msg: &UplinkMessage) -> u32 {
    msg.timestamp().wrapping_add(500) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RxMetadata, TxSettings};

    fn uplink(payload: &[u8], timestamp: u32, rssi: f32) -> UplinkMessage {
        UplinkMessage {
            raw_payload: payload.to_vec(),
            settings: Some(TxSettings {
                timestamp,
                ..Default::default()
            }),
            rx_metadata: vec![RxMetadata {
                channel_rssi: rssi,
                timestamp,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn keeps_strongest_copy() {
        let batch = vec![
            uplink(b"frame", 1000, -42.0),
            uplink(b"frame", 1000, -69.0),
            uplink(b"frame", 1000, -69.0),
        ];
        let (unique, repeats) = unique_by_rssi(batch);
        assert_eq!(unique.len(), 1);
        assert_eq!(unique[0].best_channel_rssi(), -42.0);
        assert_eq!(repeats.len(), 2);
    }

    #[test]
    fn stronger_late_copy_replaces_earlier() {
        let batch = vec![
            uplink(b"a", 1000, -90.0),
            uplink(b"b", 1000, -50.0),
            uplink(b"a", 1200, -30.0),
        ];
        let (unique, repeats) = unique_by_rssi(batch);
        let payloads: Vec<_> = unique.iter().map(|m| m.raw_payload.clone()).collect();
        assert_eq!(payloads, vec![b"b".to_vec(), b"a".to_vec()]);
        assert_eq!(unique[1].best_channel_rssi(), -30.0);
        assert_eq!(repeats[0].best_channel_rssi(), -90.0);
    }

    #[test]
    fn different_times_are_distinct() {
        let batch = vec![uplink(b"a", 1000, -90.0), uplink(b"a", 5000, -30.0)];
        let (unique, repeats) = unique_by_rssi(batch);
        assert_eq!(unique.len(), 2);
        assert!(repeats.is_empty());
    }

    #[test]
    fn idempotent() {
        let batch = vec![
            uplink(b"a", 1000, -90.0),
            uplink(b"b", 1000, -50.0),
            uplink(b"a", 1000, -30.0),
            uplink(b"c", 1000, -10.0),
            uplink(b"b", 1000, -70.0),
        ];
        let (once, _) = unique_by_rssi(batch);
        let (twice, repeats) = unique_by_rssi(once.clone());
        assert_eq!(once, twice);
        assert!(repeats.is_empty());
    }
}
