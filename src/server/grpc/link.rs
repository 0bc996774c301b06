use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, instrument, warn};

use super::service::{self, Gs, GtwGs};
use crate::cluster::ClusterKeys;
use crate::gateway::{Connection, Frontend, Server};
use crate::io::tokens::{format_correlation_id, parse_token_from_correlation_ids, DownlinkTokens};
use crate::model::{
    ConcentratorConfig, Empty, GatewayConnectionStats, GatewayDown, GatewayIdentifiers, GatewayUp,
    MqttConnectionInfo, Right,
};
use crate::server::health::HealthMetrics;
use crate::server::middleware::rate_limit::{RateLimitResult, Resource};
use crate::utils::GsError;

/// The gRPC frontend as seen by the Gateway Server.
#[derive(Debug)]
pub struct GrpcFrontend;

impl Frontend for GrpcFrontend {
    fn protocol(&self) -> &'static str {
        "grpc"
    }

    fn supports_downlink_claim(&self) -> bool {
        true
    }
}

/// Public addresses handed out by `GetMQTTConnectionInfo`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MqttInfo {
    #[serde(default)]
    pub public_address: String,
    #[serde(default)]
    pub public_tls_address: String,
}

#[derive(Debug, Clone, Default)]
pub struct GrpcOptions {
    pub mqtt: Option<MqttInfo>,
    pub mqtt_v2: Option<MqttInfo>,
    /// Keys that let cluster peers read connection stats without gateway rights.
    pub cluster_keys: Option<ClusterKeys>,
    /// Capacity of the per-stream downlink queue towards the client.
    pub downlink_buffer: usize,
}

/// Implements the `GtwGs` and `Gs` services on top of a [`Server`].
pub struct GrpcService {
    server: Arc<dyn Server>,
    frontend: Arc<dyn Frontend>,
    options: GrpcOptions,
}

impl GrpcService {
    pub fn new(server: Arc<dyn Server>, options: GrpcOptions) -> Self {
        Self {
            server,
            frontend: Arc::new(GrpcFrontend),
            options,
        }
    }

    fn rate_limit(&self, resource: &Resource) -> Result<RateLimitResult, GsError> {
        self.server.rate_limiter().check(resource).map_err(|err| {
            self.server
                .metrics()
                .rate_limited
                .with_label_values(&["grpc"])
                .inc();
            err
        })
    }

    /// Resolves the gateway, checks its ID and requires `right` for the presented key.
    async fn authenticate(
        &self,
        ids: GatewayIdentifiers,
        authorization: Option<&str>,
        right: Right,
    ) -> Result<GatewayIdentifiers, GsError> {
        let ids = self.server.fill_gateway_context(ids).await?;
        self.server.validate_gateway_id(&ids)?;
        self.server.authorize(&ids, authorization).await?.require(right)?;
        Ok(ids)
    }

    fn remote_addr(&self, peer: Option<SocketAddr>, metadata: &MetadataMap) -> String {
        match peer {
            Some(peer) => self
                .server
                .base_config()
                .client_addr(peer.ip(), metadata_str(metadata, "x-forwarded-for"))
                .to_string(),
            None => String::new(),
        }
    }

    async fn mqtt_connection_info(
        &self,
        request: Request<GatewayIdentifiers>,
        info: Option<&MqttInfo>,
        method: &str,
    ) -> Result<Response<MqttConnectionInfo>, Status> {
        let authorization = metadata_str(request.metadata(), "authorization").map(str::to_owned);
        let ids = self
            .authenticate(request.into_inner(), authorization.as_deref(), Right::GatewayInfo)
            .await?;
        let limit = self.rate_limit(&Resource::grpc_method(method, ids.uid()))?;
        let info = info.ok_or_else(|| GsError::Unimplemented("MQTT is not configured".into()))?;
        let mut response = Response::new(MqttConnectionInfo {
            public_address: info.public_address.clone(),
            public_tls_address: info.public_tls_address.clone(),
            username: ids.uid().to_string(),
        });
        limit.apply_to_metadata(response.metadata_mut());
        Ok(response)
    }
}

fn metadata_str<'a>(metadata: &'a MetadataMap, key: &str) -> Option<&'a str> {
    metadata
        .get(key)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

fn required_id(metadata: &MetadataMap) -> Result<GatewayIdentifiers, GsError> {
    metadata_str(metadata, "id")
        .map(GatewayIdentifiers::from_id)
        .ok_or_else(|| GsError::InvalidArgument("missing gateway ID in `id` metadata".into()))
}

#[tonic::async_trait]
impl GtwGs for GrpcService {
    type LinkGatewayStream = ReceiverStream<Result<GatewayDown, Status>>;

    async fn link_gateway(
        &self,
        request: Request<Streaming<GatewayUp>>,
    ) -> Result<Response<Self::LinkGatewayStream>, Status> {
        let ids = required_id(request.metadata())?;
        let authorization = metadata_str(request.metadata(), "authorization").map(str::to_owned);
        let ids = self
            .authenticate(ids, authorization.as_deref(), Right::GatewayLink)
            .await?;
        let limit = self.rate_limit(&Resource::grpc_stream_accept(
            service::LINK_GATEWAY,
            ids.uid(),
        ))?;
        let remote_addr = self.remote_addr(request.remote_addr(), request.metadata());
        let conn = self
            .server
            .connect(Arc::clone(&self.frontend), ids, remote_addr)
            .await?;
        info!(gateway_uid = %conn.uid(), remote_addr = %conn.remote_addr(), "Gateway linked");

        let (tx, rx) = mpsc::channel(self.options.downlink_buffer.max(1));
        tokio::spawn(run_link(
            Arc::clone(&self.server),
            conn,
            request.into_inner(),
            tx,
        ));
        let mut response = Response::new(ReceiverStream::new(rx));
        limit.apply_to_metadata(response.metadata_mut());
        Ok(response)
    }

    async fn get_concentrator_config(
        &self,
        request: Request<Empty>,
    ) -> Result<Response<ConcentratorConfig>, Status> {
        let ids = required_id(request.metadata())?;
        let authorization = metadata_str(request.metadata(), "authorization").map(str::to_owned);
        let ids = self
            .authenticate(ids, authorization.as_deref(), Right::GatewayInfo)
            .await?;
        let limit = self.rate_limit(&Resource::grpc_method(
            service::GET_CONCENTRATOR_CONFIG,
            ids.uid(),
        ))?;
        let gateway = self.server.get_gateway(&ids).await?;
        let plans = self.server.get_frequency_plans(&ids).await?;
        let plan = plans.get(&gateway.frequency_plan_id).ok_or_else(|| {
            GsError::NotFound(format!("frequency plan `{}`", gateway.frequency_plan_id))
        })?;
        let mut response = Response::new(plan.to_concentrator_config()?);
        limit.apply_to_metadata(response.metadata_mut());
        Ok(response)
    }

    async fn get_mqtt_connection_info(
        &self,
        request: Request<GatewayIdentifiers>,
    ) -> Result<Response<MqttConnectionInfo>, Status> {
        self.mqtt_connection_info(
            request,
            self.options.mqtt.as_ref(),
            service::GET_MQTT_CONNECTION_INFO,
        )
        .await
    }

    async fn get_mqtt_v2_connection_info(
        &self,
        request: Request<GatewayIdentifiers>,
    ) -> Result<Response<MqttConnectionInfo>, Status> {
        self.mqtt_connection_info(
            request,
            self.options.mqtt_v2.as_ref(),
            service::GET_MQTT_V2_CONNECTION_INFO,
        )
        .await
    }
}

#[tonic::async_trait]
impl Gs for GrpcService {
    async fn get_gateway_connection_stats(
        &self,
        request: Request<GatewayIdentifiers>,
    ) -> Result<Response<GatewayConnectionStats>, Status> {
        let verified = match &self.options.cluster_keys {
            Some(keys) => keys.inspect(request.metadata())?,
            None => crate::cluster::VerifiedContext::anonymous(),
        };
        let authorization = metadata_str(request.metadata(), "authorization").map(str::to_owned);
        let ids = request.into_inner();
        ids.validate()?;
        let ids = if verified.is_cluster_authenticated() {
            ids
        } else {
            self.authenticate(ids, authorization.as_deref(), Right::GatewayStatusRead)
                .await?
        };
        let limit = self.server.rate_limiter().check_caller(
            &verified,
            &Resource::grpc_method(service::GET_GATEWAY_CONNECTION_STATS, ids.uid()),
        )?;
        let stats = self.server.connection_stats(&ids)?;
        let mut response = Response::new(stats.to_proto());
        limit.apply_to_metadata(response.metadata_mut());
        Ok(response)
    }
}

/// Pumps one `LinkGateway` stream until either side goes away.
///
/// Uplink traffic is read on a separate task; downlinks are written here, each tagged
/// with a `gs:token:` correlation ID that the gateway echoes in its TX acknowledgment.
#[instrument(skip_all, fields(gateway_uid = %conn.uid()))]
pub async fn run_link<S>(
    server: Arc<dyn Server>,
    conn: Arc<Connection>,
    stream: S,
    tx: mpsc::Sender<Result<GatewayDown, Status>>,
) where
    S: Stream<Item = Result<GatewayUp, Status>> + Unpin + Send + 'static,
{
    let _guard = conn.disconnect_on_drop();
    let tokens = Arc::new(Mutex::new(DownlinkTokens::new()));
    let reader = tokio::spawn(read_link(
        Arc::clone(&server),
        Arc::clone(&conn),
        stream,
        Arc::clone(&tokens),
    ));
    let protocol = conn.frontend().protocol();

    loop {
        let scheduled = tokio::select! {
            biased;
            _ = tx.closed() => {
                conn.disconnect(GsError::Canceled);
                break;
            }
            down = conn.recv_down() => down,
        };
        let Some(scheduled) = scheduled else {
            break;
        };
        let mut message = scheduled.message;
        let token = tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .next(message.clone(), Instant::now());
        message.correlation_ids.push(format_correlation_id(token));
        let down = GatewayDown {
            downlink_message: Some(message),
        };
        if tx.send(Ok(down)).await.is_err() {
            conn.disconnect(GsError::Canceled);
            break;
        }
        server
            .metrics()
            .downlinks_sent
            .with_label_values(&[protocol])
            .inc();
    }

    match conn.error() {
        Some(GsError::Canceled) | None => {}
        Some(err) => {
            debug!(error = %err, "Closing link with error");
            let _ = tx.send(Err(Status::from(err))).await;
        }
    }
    let _ = reader.await;
}

async fn read_link<S>(
    server: Arc<dyn Server>,
    conn: Arc<Connection>,
    mut stream: S,
    tokens: Arc<Mutex<DownlinkTokens>>,
) where
    S: Stream<Item = Result<GatewayUp, Status>> + Unpin + Send + 'static,
{
    let _guard = conn.disconnect_on_drop();
    let resource = Resource::gateway_up(conn.uid());
    loop {
        let msg = tokio::select! {
            biased;
            _ = conn.context().cancelled() => return,
            msg = stream.next() => msg,
        };
        let up = match msg {
            Some(Ok(up)) => up,
            Some(Err(status)) => {
                debug!(gateway_uid = %conn.uid(), status = %status, "Link stream failed");
                conn.disconnect(GsError::Connection(status.message().to_string()));
                return;
            }
            None => {
                debug!(gateway_uid = %conn.uid(), "Link closed by gateway");
                conn.disconnect(GsError::Canceled);
                return;
            }
        };
        if let Err(err) = server.rate_limiter().check(&resource) {
            server.metrics().rate_limited.with_label_values(&["grpc"]).inc();
            warn!(gateway_uid = %conn.uid(), "Gateway exceeded uplink rate");
            conn.disconnect(err);
            return;
        }
        match handle_gateway_up(&conn, up, &tokens, server.metrics()).await {
            Ok(()) => {}
            Err(GsError::Canceled) => return,
            Err(err) => warn!(gateway_uid = %conn.uid(), error = %err, "Dropped gateway message"),
        }
    }
}

async fn handle_gateway_up(
    conn: &Connection,
    up: GatewayUp,
    tokens: &Mutex<DownlinkTokens>,
    metrics: &HealthMetrics,
) -> Result<(), GsError> {
    if !up.uplink_messages.is_empty() {
        let repeats = conn.handle_uplinks(up.uplink_messages).await?;
        metrics.uplink_repeats.inc_by(repeats as u64);
    }
    if let Some(status) = up.gateway_status {
        conn.handle_status(status).await?;
    }
    if let Some(mut ack) = up.tx_acknowledgment {
        if let Some(token) = parse_token_from_correlation_ids(&ack.correlation_ids) {
            let found = tokens
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(token, Instant::now());
            match found {
                Some((down, _)) => ack.downlink_message = Some(down),
                None => debug!(gateway_uid = %conn.uid(), token, "TX acknowledgment for evicted downlink"),
            }
        }
        conn.handle_tx_ack(ack).await?;
    }
    Ok(())
}
