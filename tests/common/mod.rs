#![allow(dead_code)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use lorawan_gs::gateway::{
    ChannelUpstream, GatewayServer, GatewayServerOptions, Server, StaticRegistry, UpstreamMessage,
};
use lorawan_gs::model::gateway::GatewayAntenna;
use lorawan_gs::model::{FrequencyPlanStore, Gateway, GatewayIdentifiers, Right, Rights};
use lorawan_gs::server::middleware::rate_limit::Profile;
use lorawan_gs::server::{HealthMetrics, RateLimiter};
use lorawan_gs::utils::Eui64;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const GATEWAY_ID: &str = "test-gateway";
pub const API_KEY: &str = "test-key";
pub const EUI: u64 = 0x0102_0304_0506_0708;
pub const PLAN: &str = "EU_863_870_TTN";

pub fn gateway() -> Gateway {
    Gateway {
        gateway_id: GATEWAY_ID.to_string(),
        eui: Some(Eui64::from_u64(EUI)),
        frequency_plan_id: PLAN.to_string(),
        frequency_plan_ids: vec![PLAN.to_string()],
        antennas: vec![GatewayAntenna::default()],
        ..Default::default()
    }
}

pub fn ids() -> GatewayIdentifiers {
    GatewayIdentifiers {
        gateway_id: GATEWAY_ID.to_string(),
        eui: Eui64::from_u64(EUI).0.to_vec(),
    }
}

/// A Gateway Server with one registered gateway and its upstream captured in a channel.
pub struct Harness {
    pub gs: GatewayServer,
    pub server: Arc<dyn Server>,
    pub metrics: HealthMetrics,
    pub upstream: mpsc::UnboundedReceiver<(GatewayIdentifiers, UpstreamMessage)>,
    pub shutdown: CancellationToken,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_profiles(&[])
    }

    pub fn with_profiles(profiles: &[Profile]) -> Self {
        let registry = StaticRegistry::new();
        registry
            .add_gateway(gateway(), API_KEY, Rights::new([Right::GatewayAll]))
            .unwrap();
        let (upstream, rx) = ChannelUpstream::new();
        let metrics = HealthMetrics::new().unwrap();
        let gs = GatewayServer::new(
            Arc::new(registry),
            Arc::new(FrequencyPlanStore::builtin()),
            RateLimiter::new(profiles).unwrap(),
            Arc::new(upstream),
            metrics.clone(),
            GatewayServerOptions::default(),
        );
        Self {
            server: Arc::new(gs.clone()),
            gs,
            metrics,
            upstream: rx,
            shutdown: CancellationToken::new(),
        }
    }

    /// The next message delivered upstream.
    pub async fn next_upstream(&mut self) -> (GatewayIdentifiers, UpstreamMessage) {
        within(self.upstream.recv()).await.expect("upstream closed")
    }

    /// Waits until the test gateway is connected.
    pub async fn wait_connected(&self) {
        within(async {
            while self.gs.get_connection(&ids()).is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn profile(name: &str, max_per_min: u32, class: &str) -> Profile {
    Profile {
        name: name.to_string(),
        max_per_min,
        max_burst: None,
        associations: vec![class.to_string()],
    }
}

pub async fn listener() -> TcpListener {
    TcpListener::bind("127.0.0.1:0").await.unwrap()
}

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// Fails the test when `future` takes longer than five seconds.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}
