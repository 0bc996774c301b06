use std::time::SystemTime;

use tokio::sync::broadcast;
use tracing::{debug, info};

pub const GATEWAY_CONNECT: &str = "gs.gateway.connect";
pub const GATEWAY_DISCONNECT: &str = "gs.gateway.disconnect";
pub const UP_REPEAT: &str = "gs.io.up.repeat";
pub const TX_SUCCESS: &str = "gs.down.tx.success";
pub const TX_FAIL: &str = "gs.down.tx.fail";

/// An observable event about a gateway connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: &'static str,
    pub gateway_uid: String,
    pub time: SystemTime,
    /// Free-form detail, such as the disconnect error.
    pub detail: Option<String>,
}

/// Fan-out of events to any number of subscribers.
///
/// Publishing never blocks; slow subscribers lose the oldest events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, name: &'static str, gateway_uid: &str, detail: Option<String>) {
        match name {
            GATEWAY_CONNECT | GATEWAY_DISCONNECT => {
                info!(event = name, gateway_uid, detail = ?detail, "Gateway event")
            }
            _ => debug!(event = name, gateway_uid, detail = ?detail, "Gateway event"),
        }
        let _ = self.tx.send(Event {
            name,
            gateway_uid: gateway_uid.to_string(),
            time: SystemTime::now(),
            detail,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(GATEWAY_CONNECT, "gw", None);
        bus.publish(UP_REPEAT, "gw", Some("2 copies".into()));

        let first = rx.recv().await.unwrap();
        assert_eq!((first.name, first.gateway_uid.as_str()), (GATEWAY_CONNECT, "gw"));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.detail.as_deref(), Some("2 copies"));
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        EventBus::new(4).publish(GATEWAY_DISCONNECT, "gw", None);
    }
}
