use std::net::SocketAddr;

use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::gateway::{GatewayServer, Server};
use crate::model::GatewayIdentifiers;
use crate::server::middleware::rate_limit::Resource;
use crate::server::middleware::validation::MAX_HTTP_BODY;
use crate::utils::GsError;

/// Prometheus metrics of the Gateway Server frontends.
#[derive(Clone)]
pub struct HealthMetrics {
    /// Connected gateways per protocol.
    pub connections: IntGaugeVec,
    pub uplinks_received: IntCounterVec,
    pub statuses_received: IntCounterVec,
    pub tx_acks_received: IntCounterVec,
    pub downlinks_sent: IntCounterVec,
    /// Uplinks dropped as repeats of a stronger copy.
    pub uplink_repeats: IntCounter,
    /// Requests and connections rejected by the rate limiter, per frontend.
    pub rate_limited: IntCounterVec,
    registry: Registry,
}

impl HealthMetrics {
    /// Creates the metrics and registers them with a fresh Prometheus registry.
    ///
    /// # Errors
    ///
    /// Returns `GsError::Internal` if a metric cannot be registered.
    pub fn new() -> Result<Self, GsError> {
        let registry = Registry::new();
        let per_protocol = |name: &str, help: &str| {
            IntCounterVec::new(Opts::new(name, help).namespace("gs"), &["protocol"])
        };
        let connections = IntGaugeVec::new(
            Opts::new("connections", "Connected gateways").namespace("gs"),
            &["protocol"],
        )
        .map_err(metric_error)?;
        let uplinks_received =
            per_protocol("uplinks_received_total", "Uplinks received").map_err(metric_error)?;
        let statuses_received =
            per_protocol("statuses_received_total", "Statuses received").map_err(metric_error)?;
        let tx_acks_received = per_protocol("tx_acks_received_total", "TX acknowledgments received")
            .map_err(metric_error)?;
        let downlinks_sent =
            per_protocol("downlinks_sent_total", "Downlinks sent").map_err(metric_error)?;
        let uplink_repeats = IntCounter::with_opts(
            Opts::new("uplink_repeats_total", "Repeated uplinks dropped").namespace("gs"),
        )
        .map_err(metric_error)?;
        let rate_limited = IntCounterVec::new(
            Opts::new("rate_limited_total", "Rate limited requests").namespace("gs"),
            &["frontend"],
        )
        .map_err(metric_error)?;

        registry.register(Box::new(connections.clone())).map_err(metric_error)?;
        registry.register(Box::new(uplinks_received.clone())).map_err(metric_error)?;
        registry.register(Box::new(statuses_received.clone())).map_err(metric_error)?;
        registry.register(Box::new(tx_acks_received.clone())).map_err(metric_error)?;
        registry.register(Box::new(downlinks_sent.clone())).map_err(metric_error)?;
        registry.register(Box::new(uplink_repeats.clone())).map_err(metric_error)?;
        registry.register(Box::new(rate_limited.clone())).map_err(metric_error)?;

        Ok(Self {
            connections,
            uplinks_received,
            statuses_received,
            tx_acks_received,
            downlinks_sent,
            uplink_repeats,
            rate_limited,
            registry,
        })
    }

    /// Exposes the current state of all registered metrics in Prometheus text format.
    pub fn expose_metrics(&self) -> Result<String, GsError> {
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_error)?;
        String::from_utf8(buffer).map_err(|e| GsError::Internal(e.to_string()))
    }
}

fn metric_error(err: prometheus::Error) -> GsError {
    GsError::Internal(format!("metrics: {}", err))
}

#[derive(Clone)]
struct HttpState {
    server: GatewayServer,
    metrics: HealthMetrics,
}

/// Builds the HTTP API: metrics, health and connection stats.
pub fn router(server: GatewayServer, metrics: HealthMetrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/api/v3/gs/gateways/:gateway_id/connection/stats",
            get(connection_stats_handler),
        )
        .layer(DefaultBodyLimit::max(MAX_HTTP_BODY))
        .with_state(HttpState { server, metrics })
}

/// Serves the HTTP API on `listener` until `shutdown` is cancelled.
///
/// # Arguments
///
/// * `listener` - A bound listener; its local address is logged.
/// * `server` - The Gateway Server whose connections are reported.
/// * `metrics` - The metrics exposed on `/metrics`.
/// * `shutdown` - Stops the server gracefully when cancelled.
pub async fn serve_http(
    listener: TcpListener,
    server: GatewayServer,
    metrics: HealthMetrics,
    shutdown: CancellationToken,
) -> Result<(), GsError> {
    let listener = listener.into_std()?;
    info!(address = %listener.local_addr()?, "HTTP API listening");
    axum::Server::from_tcp(listener)
        .map_err(|e| GsError::Connection(e.to_string()))?
        .serve(router(server, metrics).into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| GsError::Connection(e.to_string()))
}

async fn metrics_handler(State(state): State<HttpState>) -> Response {
    match state.metrics.expose_metrics() {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn connection_stats_handler(
    State(state): State<HttpState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(gateway_id): Path<String>,
) -> Result<Response, GsError> {
    let resource = Resource::http(
        "gs:connection_stats",
        "/api/v3/gs/gateways/{gateway_id}/connection/stats",
        &remote.ip().to_string(),
    );
    let limit = state.server.rate_limiter().check(&resource).map_err(|err| {
        state.metrics.rate_limited.with_label_values(&["http"]).inc();
        err
    })?;
    let ids = GatewayIdentifiers::from_id(gateway_id);
    ids.validate()?;
    let stats = state.server.connection_stats(&ids)?;
    let mut response = (StatusCode::OK, Json(stats.to_json())).into_response();
    limit.apply_to_headers(response.headers_mut());
    Ok(response)
}
