//! The cluster: this component's identity, its peers and the shared keys.

pub mod auth;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info};

use crate::utils::GsError;
pub use auth::{ClusterKeys, VerifiedContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    GatewayServer,
    NetworkServer,
    ApplicationServer,
    IdentityServer,
    DeviceRepository,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    pub roles: Vec<Role>,
    /// gRPC target, e.g. `http://dr.cluster.local:8884`.
    pub target: String,
}

/// A cluster peer; its gRPC channel is dialed lazily.
#[derive(Debug)]
pub struct Peer {
    pub name: String,
    pub roles: HashSet<Role>,
    pub target: String,
    channel: Option<Channel>,
    healthy: AtomicBool,
}

impl Peer {
    fn new(config: &PeerConfig) -> Result<Self, GsError> {
        let channel = if config.target.is_empty() {
            None
        } else {
            let endpoint = Endpoint::from_shared(config.target.clone()).map_err(|e| {
                GsError::Configuration(format!("peer `{}` target: {}", config.name, e))
            })?;
            Some(endpoint.connect_lazy())
        };
        Ok(Self {
            name: config.name.clone(),
            roles: config.roles.iter().copied().collect(),
            target: config.target.clone(),
            healthy: AtomicBool::new(channel.is_some()),
            channel,
        })
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// The peer's channel, if it has one and was not marked unhealthy.
    pub fn conn(&self) -> Option<Channel> {
        if self.healthy.load(Ordering::Acquire) {
            self.channel.clone()
        } else {
            None
        }
    }

    /// Records the outcome of a call so that lookups skip broken peers.
    pub fn set_healthy(&self, healthy: bool) {
        if self.healthy.swap(healthy, Ordering::AcqRel) != healthy {
            debug!(peer = %self.name, healthy, "Peer health changed");
        }
    }
}

pub struct Cluster {
    self_name: String,
    peers: BTreeMap<String, Arc<Peer>>,
    keys: ClusterKeys,
    tls: bool,
}

impl Cluster {
    /// Builds the cluster directory.
    ///
    /// # Errors
    ///
    /// Returns `GsError::Configuration` for malformed keys or peer targets.
    pub fn new(
        self_name: &str,
        peers: &[PeerConfig],
        hex_keys: &[String],
        tls: bool,
    ) -> Result<Self, GsError> {
        let keys = ClusterKeys::from_hex(hex_keys)?;
        let mut directory = BTreeMap::new();
        for config in peers {
            let peer = Peer::new(config)?;
            info!(peer = %peer.name, roles = ?peer.roles, "Registered cluster peer");
            directory.insert(peer.name.clone(), Arc::new(peer));
        }
        Ok(Self {
            self_name: self_name.to_string(),
            peers: directory,
            keys,
            tls,
        })
    }

    pub fn self_name(&self) -> &str {
        &self.self_name
    }

    pub fn keys(&self) -> &ClusterKeys {
        &self.keys
    }

    pub fn tls(&self) -> bool {
        self.tls
    }

    /// Returns the live peer with `role`.
    ///
    /// With several candidates the first by name wins.
    ///
    /// # Errors
    ///
    /// Returns `GsError::Unavailable` when no peer with the role is reachable.
    pub fn get_peer(&self, role: Role) -> Result<Arc<Peer>, GsError> {
        self.peers
            .values()
            .find(|peer| peer.has_role(role) && peer.conn().is_some())
            .cloned()
            .ok_or_else(|| GsError::Unavailable(format!("no peer with role {:?}", role)))
    }
}
