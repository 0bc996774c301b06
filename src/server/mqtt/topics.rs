//! Topic layouts of the two MQTT dialects and the per-session topic ACL.

use std::fmt::Debug;

/// What a gateway's publication on a topic means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Birth,
    LastWill,
    Uplink,
    Status,
    TxAck,
}

/// The topic names a dialect uses for one gateway.
pub trait TopicLayout: Send + Sync + Debug {
    fn birth_topic(&self, uid: &str) -> Option<String>;
    fn last_will_topic(&self, uid: &str) -> Option<String>;
    fn uplink_topic(&self, uid: &str) -> String;
    fn status_topic(&self, uid: &str) -> String;
    fn tx_ack_topic(&self, uid: &str) -> Option<String>;
    fn downlink_topic(&self, uid: &str) -> String;
}

/// `v3/<uid>/{up,status,down/ack,down}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct V3Layout;

impl TopicLayout for V3Layout {
    fn birth_topic(&self, _uid: &str) -> Option<String> {
        None
    }

    fn last_will_topic(&self, _uid: &str) -> Option<String> {
        None
    }

    fn uplink_topic(&self, uid: &str) -> String {
        format!("v3/{}/up", uid)
    }

    fn status_topic(&self, uid: &str) -> String {
        format!("v3/{}/status", uid)
    }

    fn tx_ack_topic(&self, uid: &str) -> Option<String> {
        Some(format!("v3/{}/down/ack", uid))
    }

    fn downlink_topic(&self, uid: &str) -> String {
        format!("v3/{}/down", uid)
    }
}

/// `<uid>/{up,status,down}` with the literal `connect` and `disconnect` topics.
#[derive(Debug, Clone, Copy, Default)]
pub struct V2Layout;

impl TopicLayout for V2Layout {
    fn birth_topic(&self, _uid: &str) -> Option<String> {
        Some("connect".to_string())
    }

    fn last_will_topic(&self, _uid: &str) -> Option<String> {
        Some("disconnect".to_string())
    }

    fn uplink_topic(&self, uid: &str) -> String {
        format!("{}/up", uid)
    }

    fn status_topic(&self, uid: &str) -> String {
        format!("{}/status", uid)
    }

    fn tx_ack_topic(&self, _uid: &str) -> Option<String> {
        None
    }

    fn downlink_topic(&self, uid: &str) -> String {
        format!("{}/down", uid)
    }
}

/// The topics one authenticated gateway may touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicAccess {
    reads: Vec<String>,
    writes: Vec<(String, TopicKind)>,
}

impl TopicAccess {
    pub fn new(layout: &dyn TopicLayout, uid: &str) -> Self {
        let mut writes = Vec::with_capacity(5);
        if let Some(topic) = layout.birth_topic(uid) {
            writes.push((topic, TopicKind::Birth));
        }
        if let Some(topic) = layout.last_will_topic(uid) {
            writes.push((topic, TopicKind::LastWill));
        }
        writes.push((layout.uplink_topic(uid), TopicKind::Uplink));
        writes.push((layout.status_topic(uid), TopicKind::Status));
        if let Some(topic) = layout.tx_ack_topic(uid) {
            writes.push((topic, TopicKind::TxAck));
        }
        Self {
            reads: vec![layout.downlink_topic(uid)],
            writes,
        }
    }

    /// Only exact topic names match; wildcards are never granted.
    pub fn can_read(&self, filter: &str) -> bool {
        self.reads.iter().any(|topic| topic == filter)
    }

    pub fn classify_write(&self, topic: &str) -> Option<TopicKind> {
        self.writes
            .iter()
            .find(|(candidate, _)| candidate == topic)
            .map(|(_, kind)| *kind)
    }

    pub fn downlink_topic(&self) -> &str {
        &self.reads[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v3_grants_exact_topics_only() {
        let access = TopicAccess::new(&V3Layout, "gw-1");
        assert!(access.can_read("v3/gw-1/down"));
        assert!(!access.can_read("v3/+/down"));
        assert!(!access.can_read("v3/gw-2/down"));
        assert_eq!(access.classify_write("v3/gw-1/up"), Some(TopicKind::Uplink));
        assert_eq!(access.classify_write("v3/gw-1/down/ack"), Some(TopicKind::TxAck));
        assert_eq!(access.classify_write("v3/gw-1/down"), None);
        assert_eq!(access.classify_write("connect"), None);
    }

    #[test]
    fn v2_has_birth_and_will_but_no_ack() {
        let access = TopicAccess::new(&V2Layout, "gw-1");
        assert_eq!(access.downlink_topic(), "gw-1/down");
        assert_eq!(access.classify_write("connect"), Some(TopicKind::Birth));
        assert_eq!(access.classify_write("disconnect"), Some(TopicKind::LastWill));
        assert_eq!(access.classify_write("gw-1/status"), Some(TopicKind::Status));
        assert_eq!(access.classify_write("gw-1/down/ack"), None);
    }
}
