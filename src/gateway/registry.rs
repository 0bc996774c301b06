use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::connection::Connection;
use super::stats::ConnectionStats;
use crate::utils::GsError;

/// Live connections by gateway uid, plus the final stats of recently ended ones.
pub struct ConnectionRegistry {
    live: DashMap<String, Weak<Connection>>,
    ended: DashMap<String, (ConnectionStats, Instant)>,
    stats_ttl: Duration,
}

impl ConnectionRegistry {
    pub fn new(stats_ttl: Duration) -> Self {
        Self {
            live: DashMap::new(),
            ended: DashMap::new(),
            stats_ttl,
        }
    }

    /// Registers a connection, returning the one it replaces.
    pub fn insert(&self, conn: &Arc<Connection>) -> Option<Arc<Connection>> {
        let uid = conn.uid().to_string();
        self.ended.remove(&uid);
        self.live
            .insert(uid, Arc::downgrade(conn))
            .and_then(|previous| previous.upgrade())
    }

    pub fn get(&self, uid: &str) -> Option<Arc<Connection>> {
        self.live.get(uid).and_then(|conn| conn.upgrade())
    }

    /// Removes `conn` if it is still the registered connection for its uid and keeps its
    /// final stats for the grace period.
    pub fn remove(&self, conn: &Connection, stats: ConnectionStats) {
        let uid = conn.uid();
        let removed = self
            .live
            .remove_if(uid, |_, registered| {
                std::ptr::eq(registered.as_ptr(), conn as *const Connection)
            })
            .is_some();
        if removed {
            self.ended.insert(uid.to_string(), (stats, Instant::now()));
        }
    }

    /// The stats of a live connection, or of one that ended within the grace period.
    ///
    /// # Errors
    ///
    /// Returns `GsError::NotFound` when the gateway is not connected and its last
    /// stats have expired.
    pub fn stats(&self, uid: &str) -> Result<ConnectionStats, GsError> {
        if let Some(conn) = self.get(uid) {
            return Ok(conn.stats());
        }
        let now = Instant::now();
        let ttl = self.stats_ttl;
        if let Some(entry) = self.ended.get(uid) {
            let (stats, ended_at) = entry.value();
            if now.duration_since(*ended_at) <= ttl {
                return Ok(stats.clone());
            }
        }
        self.ended.remove_if(uid, |_, (_, ended_at)| now.duration_since(*ended_at) > ttl);
        Err(GsError::NotFound(format!("no connection stats for `{}`", uid)))
    }

    /// Drops expired stats.
    pub fn prune(&self) {
        let ttl = self.stats_ttl;
        self.ended.retain(|_, (_, ended_at)| ended_at.elapsed() <= ttl);
        self.live.retain(|_, conn| conn.strong_count() > 0);
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn uids(&self) -> Vec<String> {
        self.live.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::gateway::connection::ConnectionOptions;
    use crate::gateway::events::EventBus;
    use crate::gateway::frontend::Frontend;
    use crate::model::frequency_plan::eu_863_870_ttn;
    use crate::model::Gateway;
    use crate::utils::ErrorCode;

    #[derive(Debug)]
    struct TestFrontend;

    impl Frontend for TestFrontend {
        fn protocol(&self) -> &'static str {
            "test"
        }
    }

    fn connect(registry: &Arc<ConnectionRegistry>) -> Arc<Connection> {
        let plan = Arc::new(eu_863_870_ttn());
        let gateway = Gateway {
            gateway_id: "test-gateway".into(),
            frequency_plan_id: plan.id.clone(),
            ..Default::default()
        };
        let conn = Arc::new(
            Connection::new(
                gateway,
                Arc::new(TestFrontend),
                "127.0.0.1:1".into(),
                HashMap::from([(plan.id.clone(), plan)]),
                ConnectionOptions::default(),
                EventBus::default(),
                Arc::downgrade(registry),
            )
            .unwrap(),
        );
        registry.insert(&conn);
        conn
    }

    #[test]
    fn stats_live_between_connect_and_ttl() {
        let registry = Arc::new(ConnectionRegistry::new(Duration::from_millis(50)));
        assert_eq!(registry.stats("test-gateway").unwrap_err().code(), ErrorCode::NotFound);

        let conn = connect(&registry);
        assert_eq!(registry.stats("test-gateway").unwrap().protocol, "test");
        assert_eq!(registry.len(), 1);

        conn.disconnect(GsError::Canceled);
        assert!(registry.is_empty());
        let stats = registry.stats("test-gateway").unwrap();
        assert!(stats.disconnected_at.is_some());

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(registry.stats("test-gateway").unwrap_err().code(), ErrorCode::NotFound);
    }

    #[test]
    fn stale_disconnect_keeps_the_replacement() {
        let registry = Arc::new(ConnectionRegistry::new(Duration::from_secs(60)));
        let first = connect(&registry);
        let second = connect(&registry);
        first.disconnect(GsError::Canceled);
        assert!(Arc::ptr_eq(&registry.get("test-gateway").unwrap(), &second));
        assert!(registry.stats("test-gateway").unwrap().disconnected_at.is_none());
    }
}
