//! The LoRa Basic Station frontend: discovery and traffic over WebSocket, JSON framed.

pub mod discover;
pub mod downstream;
pub mod messages;
pub mod router_config;
pub mod session;
pub mod upstream;

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::gateway::{DutyCycleStyle, Frontend, Server};
use crate::model::{GatewayIdentifiers, Right};
use crate::server::middleware::rate_limit::Resource;
use crate::server::middleware::validation::{MAX_HTTP_BODY, MAX_WS_MESSAGE};
use crate::server::ws::KeepaliveOptions;
use crate::utils::{Eui64, GsError};

use session::PendingConnection;

#[derive(Debug, Default)]
pub struct BasicStationFrontend;

impl Frontend for BasicStationFrontend {
    fn protocol(&self) -> &'static str {
        "ws"
    }

    /// Stations enforce duty cycle themselves.
    fn duty_cycle_style(&self) -> DutyCycleStyle {
        DutyCycleStyle::BlockingWindows
    }
}

#[derive(Debug, Clone)]
pub struct BasicStationOptions {
    /// Admits stations that present no `Authorization` header at all.
    pub allow_unauthenticated: bool,
    pub keepalive: KeepaliveOptions,
    /// Time sync requests are ignored while the ping round trip exceeds this.
    pub max_round_trip_delay: Duration,
    /// Whether stations reach this endpoint over TLS; selects `wss` in discovery.
    pub tls: bool,
}

impl Default for BasicStationOptions {
    fn default() -> Self {
        Self {
            allow_unauthenticated: false,
            keepalive: KeepaliveOptions::default(),
            max_round_trip_delay: Duration::from_secs(3),
            tls: false,
        }
    }
}

#[derive(Clone)]
struct AppState {
    server: Arc<dyn Server>,
    frontend: Arc<dyn Frontend>,
    options: Arc<BasicStationOptions>,
}

/// Builds the `/router-info` and `/traffic/:id` routes.
pub fn router(server: Arc<dyn Server>, options: BasicStationOptions) -> Router {
    Router::new()
        .route("/router-info", get(discover_handler))
        .route("/traffic/:id", get(traffic_handler))
        .layer(DefaultBodyLimit::max(MAX_HTTP_BODY))
        .with_state(AppState {
            server,
            frontend: Arc::new(BasicStationFrontend),
            options: Arc::new(options),
        })
}

/// Serves the Basic Station endpoints on `listener` until `shutdown` is cancelled.
///
/// With `tls` set, the listener terminates TLS with that configuration.
pub async fn serve(
    listener: TcpListener,
    tls: Option<RustlsConfig>,
    server: Arc<dyn Server>,
    options: BasicStationOptions,
    shutdown: CancellationToken,
) -> Result<(), GsError> {
    info!(address = %listener.local_addr()?, tls = tls.is_some(), "Basic Station frontend listening");
    let app = router(server, options).into_make_service_with_connect_info::<SocketAddr>();
    let handle = Handle::new();
    let graceful = handle.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        graceful.graceful_shutdown(Some(Duration::from_secs(5)));
    });
    match tls {
        Some(tls) => axum_server::tls_rustls::from_tcp_rustls(listener, tls)
            .handle(handle)
            .serve(app)
            .await?,
        None => axum_server::from_tcp(listener).handle(handle).serve(app).await?,
    }
    Ok(())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn check_accept(state: &AppState, peer: SocketAddr, headers: &HeaderMap) -> Result<String, GsError> {
    let forwarded = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok());
    let remote_ip = state.server.base_config().client_addr(peer.ip(), forwarded);
    state
        .server
        .rate_limiter()
        .check(&Resource::accept_semtech_ws(remote_ip))
        .map_err(|err| {
            state
                .server
                .metrics()
                .rate_limited
                .with_label_values(&[state.frontend.protocol()])
                .inc();
            err
        })?;
    Ok(remote_ip.to_string())
}

async fn discover_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(err) = check_accept(&state, peer, &headers) {
        return err.into_response();
    }
    let host = header_str(&headers, &header::HOST).unwrap_or("localhost").to_string();
    let scheme = if state.options.tls { "wss" } else { "ws" };
    ws.max_message_size(MAX_WS_MESSAGE)
        .on_upgrade(move |socket| async move {
            if let Err(err) = discover::serve(socket, state.server.as_ref(), scheme, &host).await {
                debug!(%peer, error = %err, "Discovery failed");
            }
        })
}

/// The identifiers named in a traffic path: `eui-<hex>` or a gateway ID.
fn traffic_ids(id: &str) -> GatewayIdentifiers {
    id.strip_prefix("eui-")
        .and_then(|hex| hex.parse::<Eui64>().ok())
        .map(GatewayIdentifiers::from_eui)
        .unwrap_or_else(|| GatewayIdentifiers::from_id(id))
}

/// Normalises the station's `Authorization` header; stations send the bare key.
fn bearer(value: &str) -> String {
    let value = value.trim();
    if value
        .get(..7)
        .map_or(false, |scheme| scheme.eq_ignore_ascii_case("bearer "))
    {
        value.to_string()
    } else {
        format!("Bearer {}", value)
    }
}

async fn admit(
    state: &AppState,
    id: &str,
    authorization: Option<String>,
    remote_addr: String,
) -> Result<PendingConnection, GsError> {
    let ids = state.server.fill_gateway_context(traffic_ids(id)).await?;
    state.server.validate_gateway_id(&ids)?;
    match authorization {
        Some(authorization) => {
            state
                .server
                .authorize(&ids, Some(&authorization))
                .await?
                .require(Right::GatewayLink)?;
        }
        None if state.options.allow_unauthenticated => {
            debug!(gateway_uid = %ids.uid(), "Admitting unauthenticated station");
        }
        None => {
            return Err(GsError::Unauthenticated("missing Authorization header".into()));
        }
    }
    let conn = state
        .server
        .connect(Arc::clone(&state.frontend), ids, remote_addr)
        .await?;
    Ok(PendingConnection::new(conn))
}

async fn traffic_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, GsError> {
    let remote_addr = check_accept(&state, peer, &headers)?;
    let authorization = header_str(&headers, &header::AUTHORIZATION).map(bearer);
    let pending = admit(&state, &id, authorization, remote_addr).await?;
    let server = Arc::clone(&state.server);
    let options = Arc::clone(&state.options);
    Ok(ws
        .max_message_size(MAX_WS_MESSAGE)
        .on_upgrade(move |socket| session::serve(socket, server, pending, options)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traffic_path_ids() {
        assert_eq!(
            traffic_ids("eui-0102030405060708").eui64(),
            Some(Eui64::from_u64(0x0102_0304_0506_0708))
        );
        assert_eq!(traffic_ids("my-gateway").gateway_id, "my-gateway");
        assert_eq!(traffic_ids("eui-zz").gateway_id, "eui-zz");
    }

    #[test]
    fn bare_keys_become_bearer_tokens() {
        assert_eq!(bearer("NNSXS.KEY"), "Bearer NNSXS.KEY");
        assert_eq!(bearer("Bearer NNSXS.KEY"), "Bearer NNSXS.KEY");
        assert_eq!(bearer("bearer NNSXS.KEY"), "bearer NNSXS.KEY");
    }
}
