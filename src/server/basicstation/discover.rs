//! `/router-info`: tells a station which endpoint to open its traffic socket on.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::gateway::Server;
use crate::model::GatewayIdentifiers;
use crate::utils::{Eui64, GsError};

/// How long a station has to send its query once the socket is open.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoverResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muxs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DiscoverResponse {
    fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct DiscoverQuery {
    #[serde(default)]
    router: Value,
}

/// Reads the router EUI from a query: an ID6 string, any EUI notation, or a number.
fn parse_router(text: &str) -> Result<Eui64, String> {
    let query: DiscoverQuery =
        serde_json::from_str(text).map_err(|e| format!("Invalid request: {}", e))?;
    match query.router {
        Value::Null => Err("Empty router EUI provided".into()),
        Value::String(s) if s.trim().is_empty() => Err("Empty router EUI provided".into()),
        Value::String(s) => Eui64::parse_id6(&s).map_err(|e| format!("Invalid router EUI: {}", e)),
        Value::Number(n) => n
            .as_u64()
            .map(Eui64::from_u64)
            .ok_or_else(|| format!("Invalid router EUI: {}", n)),
        other => Err(format!("Invalid router EUI: {}", other)),
    }
}

/// Answers one discovery query.
///
/// The traffic URI is built from `scheme` and `host`, the address the station used
/// to reach this server.
pub async fn answer(server: &dyn Server, query: &str, scheme: &str, host: &str) -> DiscoverResponse {
    let eui = match parse_router(query) {
        Ok(eui) => eui,
        Err(message) => return DiscoverResponse::error(message),
    };
    if let Err(err) = server
        .fill_gateway_context(GatewayIdentifiers::from_eui(eui))
        .await
    {
        debug!(router = %eui, error = %err, "Discovery for unknown router");
        return DiscoverResponse::error(format!("Router not provisioned: {}", err));
    }
    let uri = match Url::parse(&format!("{}://{}", scheme, host))
        .and_then(|base| base.join(&format!("/traffic/{}", eui.to_gateway_id())))
    {
        Ok(uri) => uri,
        Err(err) => {
            warn!(%host, error = %err, "Cannot build traffic URI");
            return DiscoverResponse::error(format!("Invalid host `{}`", host));
        }
    };
    DiscoverResponse {
        router: Some(format!("router-{}", eui.to_id6())),
        muxs: Some(format!("muxs-{}", Eui64::ZERO.to_id6())),
        uri: Some(uri.to_string()),
        error: None,
    }
}

/// Serves one discovery socket: a single query, a single answer, then close.
pub async fn serve(mut socket: WebSocket, server: &dyn Server, scheme: &str, host: &str) -> Result<(), GsError> {
    let query = match tokio::time::timeout(QUERY_TIMEOUT, socket.recv()).await {
        Err(_) => return Err(GsError::Canceled),
        Ok(None) => return Ok(()),
        Ok(Some(Err(err))) => return Err(GsError::Connection(err.to_string())),
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(Message::Binary(bytes)))) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Some(Ok(_))) => String::new(),
    };
    let response = answer(server, &query, scheme, host).await;
    let text = serde_json::to_string(&response).map_err(|e| GsError::Internal(e.to_string()))?;
    socket
        .send(Message::Text(text))
        .await
        .map_err(|e| GsError::Connection(e.to_string()))?;
    let _ = socket.close().await;
    Ok(())
}
