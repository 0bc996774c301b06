//! The Gateway Server core the protocol frontends plug into.
//!
//! Frontends authenticate a gateway, call [`Server::connect`] and then pump traffic
//! through the returned [`Connection`]. The [`GatewayServer`] drains every connection
//! into an [`Upstream`] and keeps the connection registry.

pub mod connection;
pub mod events;
pub mod frontend;
pub mod identity;
pub mod registry;
pub mod scheduling;
pub mod stats;
pub mod upstream;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use connection::{Connection, ConnectionOptions, DisconnectGuard, UpstreamMessage};
pub use events::{Event, EventBus};
pub use frontend::{DutyCycleStyle, Frontend};
pub use identity::{IdentityRegistry, StaticRegistry};
pub use registry::ConnectionRegistry;
pub use stats::ConnectionStats;
pub use upstream::{ChannelUpstream, LogUpstream, Upstream};

use crate::model::gateway::AntennaLocation;
use crate::model::{
    DownlinkMessage, DownlinkPath, FrequencyPlan, FrequencyPlanStore, Gateway, GatewayIdentifiers,
    GatewayStatus, Rights,
};
use crate::server::health::HealthMetrics;
use crate::server::middleware::rate_limit::RateLimiter;
use crate::utils::GsError;

/// Settings shared by the outer HTTP and WebSocket boundaries.
#[derive(Debug, Clone, Default)]
pub struct BaseConfig {
    /// Proxies whose forwarding headers are trusted for the client address.
    pub trusted_proxies: Vec<IpAddr>,
}

impl BaseConfig {
    /// Resolves the client address, honouring `X-Forwarded-For` from trusted proxies.
    pub fn client_addr(&self, peer: IpAddr, forwarded_for: Option<&str>) -> IpAddr {
        if !self.trusted_proxies.contains(&peer) {
            return peer;
        }
        forwarded_for
            .and_then(|value| value.split(',').next())
            .and_then(|first| first.trim().parse().ok())
            .unwrap_or(peer)
    }
}

/// What the frontends need from the Gateway Server.
#[async_trait]
pub trait Server: Send + Sync {
    /// Admits a gateway and returns its connection.
    ///
    /// A live connection for the same gateway is disconnected with `aborted`.
    async fn connect(
        &self,
        frontend: Arc<dyn Frontend>,
        ids: GatewayIdentifiers,
        remote_addr: String,
    ) -> Result<Arc<Connection>, GsError>;

    /// Resolves identifiers that carry only an EUI, or only an ID, to the canonical pair.
    async fn fill_gateway_context(&self, ids: GatewayIdentifiers) -> Result<GatewayIdentifiers, GsError>;

    fn validate_gateway_id(&self, ids: &GatewayIdentifiers) -> Result<(), GsError>;

    async fn get_gateway(&self, ids: &GatewayIdentifiers) -> Result<Gateway, GsError>;

    async fn get_frequency_plans(
        &self,
        ids: &GatewayIdentifiers,
    ) -> Result<HashMap<String, Arc<FrequencyPlan>>, GsError>;

    /// Evaluates the `Authorization` value presented for a gateway.
    async fn authorize(&self, ids: &GatewayIdentifiers, authorization: Option<&str>) -> Result<Rights, GsError>;

    fn rate_limiter(&self) -> &RateLimiter;

    fn base_config(&self) -> &BaseConfig;

    fn metrics(&self) -> &HealthMetrics;

    fn connection_stats(&self, ids: &GatewayIdentifiers) -> Result<ConnectionStats, GsError>;
}

/// Gateway Server behaviour that is not tied to one frontend.
#[derive(Debug, Clone)]
pub struct GatewayServerOptions {
    pub connection: ConnectionOptions,
    /// How long the stats of a disconnected gateway remain available.
    pub stats_ttl: Duration,
    /// Minimum interval between antenna location updates from status messages.
    pub update_location_debounce: Duration,
    pub base: BaseConfig,
}

impl Default for GatewayServerOptions {
    fn default() -> Self {
        Self {
            connection: ConnectionOptions::default(),
            stats_ttl: Duration::from_secs(60),
            update_location_debounce: Duration::from_secs(60 * 60),
            base: BaseConfig::default(),
        }
    }
}

/// The Gateway Server: admits connections, drains them upstream and schedules downlinks.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct GatewayServer {
    inner: Arc<Inner>,
}

struct Inner {
    identity: Arc<dyn IdentityRegistry>,
    plans: Arc<FrequencyPlanStore>,
    rate_limiter: RateLimiter,
    upstream: Arc<dyn Upstream>,
    metrics: HealthMetrics,
    events: EventBus,
    connections: Arc<ConnectionRegistry>,
    options: GatewayServerOptions,
}

impl GatewayServer {
    pub fn new(
        identity: Arc<dyn IdentityRegistry>,
        plans: Arc<FrequencyPlanStore>,
        rate_limiter: RateLimiter,
        upstream: Arc<dyn Upstream>,
        metrics: HealthMetrics,
        options: GatewayServerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                identity,
                plans,
                rate_limiter,
                upstream,
                metrics,
                events: EventBus::default(),
                connections: Arc::new(ConnectionRegistry::new(options.stats_ttl)),
                options,
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.connections
    }

    pub fn get_connection(&self, ids: &GatewayIdentifiers) -> Option<Arc<Connection>> {
        self.inner.connections.get(ids.uid())
    }

    /// Schedules a downlink on a connected gateway.
    ///
    /// The downlink paths are tried in order; the first one that refers to a connected
    /// gateway and can be scheduled wins.
    ///
    /// # Errors
    ///
    /// * `InvalidArgument` when the message is not a request or has no paths.
    /// * `Aborted` with one detail per path that failed.
    pub fn schedule_downlink(&self, msg: DownlinkMessage) -> Result<DownlinkMessage, GsError> {
        let paths = match msg.request() {
            Some(request) => request.downlink_paths.clone(),
            None => {
                return Err(GsError::InvalidArgument(
                    "downlink to schedule must be a request".into(),
                ))
            }
        };
        if paths.is_empty() {
            return Err(GsError::InvalidArgument("downlink without paths".into()));
        }
        let mut details = Vec::new();
        for path in &paths {
            let ids = match path_gateway(path) {
                Ok(ids) => ids,
                Err(err) => {
                    details.push(err.to_string());
                    continue;
                }
            };
            let Some(conn) = self.get_connection(&ids) else {
                details.push(format!("gateway `{}` not connected", ids.uid()));
                continue;
            };
            match conn.schedule_down(path, msg.clone()) {
                Ok(scheduled) => return Ok(scheduled),
                Err(GsError::Aborted { details: windows, .. }) => details.extend(windows),
                Err(err) => details.push(err.to_string()),
            }
        }
        Err(GsError::aborted("no downlink path available", details))
    }

    /// Disconnects live gateways whose registry record changed in a way that affects
    /// their connection.
    pub fn spawn_update_watcher(&self, shutdown: CancellationToken) {
        let mut updates = self.inner.identity.subscribe_updates();
        let server = self.clone();
        tokio::spawn(async move {
            loop {
                let updated = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    update = updates.recv() => update,
                };
                match updated {
                    Ok(gateway) => {
                        let Some(conn) = server.inner.connections.get(&gateway.gateway_id) else {
                            continue;
                        };
                        if conn.gateway().connection_relevant_change(&gateway) {
                            info!(gateway_uid = %gateway.gateway_id, "Gateway record changed, disconnecting");
                            conn.disconnect(GsError::aborted("gateway record changed", Vec::new()));
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed gateway updates");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        });
    }

    /// Forwards a connection's upstream traffic until it disconnects.
    fn spawn_upstream(&self, conn: Arc<Connection>) {
        let Some(mut rx) = conn.take_upstream() else {
            return;
        };
        let server = self.clone();
        tokio::spawn(async move {
            let inner = &server.inner;
            let protocol = conn.frontend().protocol();
            let mut last_location_update: Option<Instant> = None;
            loop {
                let msg = tokio::select! {
                    msg = rx.recv() => msg,
                    // Deliver what was already accepted from the gateway, then stop.
                    _ = conn.context().cancelled() => rx.try_recv().ok(),
                };
                let Some(msg) = msg else {
                    break;
                };
                let ids = conn.ids();
                let res = match msg {
                    UpstreamMessage::Uplink(up) => {
                        inner.metrics.uplinks_received.with_label_values(&[protocol]).inc();
                        inner.upstream.handle_uplink(ids, up).await
                    }
                    UpstreamMessage::Status(status) => {
                        inner.metrics.statuses_received.with_label_values(&[protocol]).inc();
                        server
                            .update_location_from_status(&conn, &status, &mut last_location_update)
                            .await;
                        inner.upstream.handle_status(ids, status).await
                    }
                    UpstreamMessage::TxAck(ack) => {
                        inner.metrics.tx_acks_received.with_label_values(&[protocol]).inc();
                        inner.upstream.handle_tx_ack(ids, ack).await
                    }
                };
                if let Err(err) = res {
                    warn!(gateway_uid = %ids.uid(), error = %err, "Upstream rejected message");
                }
            }
            inner.metrics.connections.with_label_values(&[protocol]).dec();
            debug!(gateway_uid = %conn.uid(), "Upstream drained");
        });
    }

    async fn update_location_from_status(
        &self,
        conn: &Connection,
        status: &GatewayStatus,
        last_update: &mut Option<Instant>,
    ) {
        if !conn.gateway().update_location_from_status || status.antenna_locations.is_empty() {
            return;
        }
        if let Some(at) = last_update {
            if at.elapsed() < self.inner.options.update_location_debounce {
                return;
            }
        }
        *last_update = Some(Instant::now());
        let locations = status
            .antenna_locations
            .iter()
            .map(AntennaLocation::from_proto)
            .collect();
        if let Err(err) = self
            .inner
            .identity
            .update_antenna_locations(conn.ids(), locations)
            .await
        {
            warn!(gateway_uid = %conn.uid(), error = %err, "Failed to update antenna locations");
        }
    }

    fn frequency_plans_of(&self, ids: &[String]) -> Result<HashMap<String, Arc<FrequencyPlan>>, GsError> {
        ids.iter()
            .map(|id| Ok((id.clone(), self.inner.plans.get(id)?)))
            .collect()
    }
}

#[async_trait]
impl Server for GatewayServer {
    #[instrument(skip(self, frontend), fields(protocol = frontend.protocol()))]
    async fn connect(
        &self,
        frontend: Arc<dyn Frontend>,
        ids: GatewayIdentifiers,
        remote_addr: String,
    ) -> Result<Arc<Connection>, GsError> {
        let gateway = self.inner.identity.get_gateway(&ids).await?;
        let plans = self.frequency_plans_of(&gateway.plan_ids())?;
        let protocol = frontend.protocol();
        let conn = Arc::new(Connection::new(
            gateway,
            frontend,
            remote_addr,
            plans,
            self.inner.options.connection,
            self.inner.events.clone(),
            Arc::downgrade(&self.inner.connections),
        )?);
        if let Some(previous) = self.inner.connections.insert(&conn) {
            previous.disconnect(GsError::aborted("gateway reconnected", Vec::new()));
        }
        self.inner.metrics.connections.with_label_values(&[protocol]).inc();
        self.inner.events.publish(
            events::GATEWAY_CONNECT,
            conn.uid(),
            Some(format!("{} from {}", protocol, conn.remote_addr())),
        );
        self.spawn_upstream(Arc::clone(&conn));
        Ok(conn)
    }

    async fn fill_gateway_context(&self, ids: GatewayIdentifiers) -> Result<GatewayIdentifiers, GsError> {
        ids.validate()?;
        let gateway = self.inner.identity.get_gateway(&ids).await?;
        Ok(gateway.ids())
    }

    fn validate_gateway_id(&self, ids: &GatewayIdentifiers) -> Result<(), GsError> {
        ids.validate()?;
        if ids.gateway_id.is_empty() {
            return Err(GsError::InvalidArgument("gateway ID is required".into()));
        }
        Ok(())
    }

    async fn get_gateway(&self, ids: &GatewayIdentifiers) -> Result<Gateway, GsError> {
        self.inner.identity.get_gateway(ids).await
    }

    async fn get_frequency_plans(
        &self,
        ids: &GatewayIdentifiers,
    ) -> Result<HashMap<String, Arc<FrequencyPlan>>, GsError> {
        let gateway = self.inner.identity.get_gateway(ids).await?;
        self.frequency_plans_of(&gateway.plan_ids())
    }

    async fn authorize(&self, ids: &GatewayIdentifiers, authorization: Option<&str>) -> Result<Rights, GsError> {
        self.inner.identity.authorize(ids, authorization).await
    }

    fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.rate_limiter
    }

    fn base_config(&self) -> &BaseConfig {
        &self.inner.options.base
    }

    fn metrics(&self) -> &HealthMetrics {
        &self.inner.metrics
    }

    fn connection_stats(&self, ids: &GatewayIdentifiers) -> Result<ConnectionStats, GsError> {
        self.inner.connections.stats(ids.uid())
    }
}

fn path_gateway(path: &DownlinkPath) -> Result<GatewayIdentifiers, GsError> {
    use crate::model::downlink_path::Path;
    match &path.path {
        Some(Path::UplinkToken(bytes)) => crate::io::uplink_token::decode(bytes)?
            .gateway_ids()
            .cloned()
            .ok_or_else(|| GsError::InvalidArgument("uplink token without gateway".into())),
        Some(Path::Fixed(ids)) => ids
            .gateway_ids
            .clone()
            .ok_or_else(|| GsError::InvalidArgument("fixed path without gateway".into())),
        None => Err(GsError::InvalidArgument("empty downlink path".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_for_is_only_trusted_from_proxies() {
        let proxy: IpAddr = "10.0.0.1".parse().unwrap();
        let base = BaseConfig {
            trusted_proxies: vec![proxy],
        };
        let client: IpAddr = "192.0.2.7".parse().unwrap();
        assert_eq!(base.client_addr(proxy, Some("192.0.2.7, 10.0.0.1")), client);
        assert_eq!(base.client_addr(proxy, Some("garbage")), proxy);
        assert_eq!(base.client_addr(client, Some("203.0.113.1")), client);
    }
}
