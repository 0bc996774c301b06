mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, HttpBody};
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{ids, within, Harness, GATEWAY_ID};
use lorawan_gs::gateway::events::UP_REPEAT;
use lorawan_gs::gateway::{Server, UpstreamMessage};
use lorawan_gs::model::{RxMetadata, TxSettings, UplinkMessage};
use lorawan_gs::server::health;
use lorawan_gs::server::middleware::rate_limit::{HEADER_AVAILABLE, HEADER_LIMIT, HEADER_RETRY};
use lorawan_gs::server::GrpcFrontend;
use lorawan_gs::utils::GsError;
use serde_json::Value;
use tower::ServiceExt;

fn uplink(rssi: f32) -> UplinkMessage {
    UplinkMessage {
        raw_payload: vec![0x40, 0x0a, 0x0b, 0x0c, 0x0d, 0x00, 0x03, 0x00, 0x01, 0x99],
        settings: Some(TxSettings {
            frequency: 868_300_000,
            timestamp: 2_000_000,
            ..Default::default()
        }),
        rx_metadata: vec![RxMetadata {
            timestamp: 2_000_000,
            rssi,
            channel_rssi: rssi,
            ..Default::default()
        }],
        ..Default::default()
    }
}

async fn get(router: &Router, path: &str) -> (StatusCode, axum::http::HeaderMap, Value) {
    let mut request = Request::get(path).body(Body::empty()).unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 40000))));
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let mut body = response.into_body();
    let mut bytes = Vec::new();
    while let Some(chunk) = body.data().await {
        bytes.extend_from_slice(&chunk.unwrap());
    }
    (status, headers, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn repeated_uplinks_keep_strongest_copy() {
    let mut harness = Harness::new();
    let mut events = harness.gs.events().subscribe();
    let conn = harness
        .server
        .connect(Arc::new(GrpcFrontend), ids(), "127.0.0.1".into())
        .await
        .unwrap();

    let repeats = conn
        .handle_uplinks(vec![uplink(-69.0), uplink(-42.0), uplink(-69.0)])
        .await
        .unwrap();
    assert_eq!(repeats, 2);

    let (_, msg) = harness.next_upstream().await;
    let UpstreamMessage::Uplink(up) = msg else {
        panic!("expected uplink, got {:?}", msg);
    };
    assert_eq!(up.rx_metadata[0].channel_rssi, -42.0);
    assert!(harness.upstream.try_recv().is_err());

    let mut repeat_events = 0;
    while let Ok(event) = events.try_recv() {
        if event.name == UP_REPEAT {
            assert_eq!(event.gateway_uid, GATEWAY_ID);
            repeat_events += 1;
        }
    }
    assert_eq!(repeat_events, 2);
}

#[tokio::test]
async fn stats_outlive_the_connection() {
    let harness = Harness::new();
    assert!(matches!(
        harness.gs.connection_stats(&ids()),
        Err(GsError::NotFound(_))
    ));

    let conn = harness
        .server
        .connect(Arc::new(GrpcFrontend), ids(), "127.0.0.1".into())
        .await
        .unwrap();
    let live = harness.gs.connection_stats(&ids()).unwrap();
    assert_eq!(live.protocol, "grpc");
    assert!(live.disconnected_at.is_none());

    conn.disconnect(GsError::Canceled);
    assert!(harness.gs.get_connection(&ids()).is_none());
    let ended = harness.gs.connection_stats(&ids()).unwrap();
    assert!(ended.connected_at.is_some());
    assert!(ended.disconnected_at.is_some());
}

#[tokio::test]
async fn reconnect_replaces_previous_connection() {
    let harness = Harness::new();
    let first = harness
        .server
        .connect(Arc::new(GrpcFrontend), ids(), "127.0.0.1".into())
        .await
        .unwrap();
    let second = harness
        .server
        .connect(Arc::new(GrpcFrontend), ids(), "127.0.0.2".into())
        .await
        .unwrap();

    assert!(first.is_disconnected());
    assert!(matches!(first.error(), Some(GsError::Aborted { .. })));
    assert!(!second.is_disconnected());
    let current = harness.gs.get_connection(&ids()).unwrap();
    assert_eq!(current.remote_addr(), "127.0.0.2");
}

#[tokio::test]
async fn http_stats_are_rate_limited_with_headers() {
    let harness = Harness::with_profiles(&[common::profile("stats", 1, "http:gs:connection_stats")]);
    let _conn = harness
        .server
        .connect(Arc::new(GrpcFrontend), ids(), "127.0.0.1".into())
        .await
        .unwrap();
    let router = health::router(harness.gs.clone(), harness.metrics.clone());
    let path = format!("/api/v3/gs/gateways/{}/connection/stats", GATEWAY_ID);

    let (status, headers, body) = within(get(&router, &path)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["protocol"], "grpc");
    assert_eq!(headers[HEADER_LIMIT], "1");
    assert_eq!(headers[HEADER_AVAILABLE], "0");
    assert!(headers.get(HEADER_RETRY).is_none());

    let (status, headers, _) = within(get(&router, &path)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    let retry: u64 = headers[HEADER_RETRY].to_str().unwrap().parse().unwrap();
    assert!(retry >= 1);
    assert_eq!(harness.metrics.rate_limited.with_label_values(&["http"]).get(), 1);
}

#[tokio::test]
async fn http_stats_of_unknown_gateway_are_not_found() {
    let harness = Harness::new();
    let router = health::router(harness.gs.clone(), harness.metrics.clone());

    let (status, _, body) = within(get(&router, "/api/v3/gs/gateways/nobody/connection/stats")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nobody"));

    let (status, _, _) = within(get(&router, "/healthz")).await;
    assert_eq!(status, StatusCode::OK);
}
