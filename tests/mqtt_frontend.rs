mod common;

use std::sync::Arc;

use common::{ids, within, Harness, API_KEY, GATEWAY_ID};
use futures_util::{SinkExt, StreamExt};
use lorawan_gs::gateway::UpstreamMessage;
use lorawan_gs::io::parse_token_from_correlation_ids;
use lorawan_gs::model::{
    downlink_message, Class, DownlinkMessage, DownlinkPath, GatewayDown, GatewayStatus, RxMetadata,
    TxAckResult, TxAcknowledgment, TxRequest, UplinkMessage,
};
use lorawan_gs::server::mqtt::packet::{
    connect_with_login, ConnectReturnCode, MqttCodec, Packet, Publish, QoS, Subscribe,
    SubscribeFilter, SubscribeReasonCode,
};
use lorawan_gs::server::mqtt::{self, ProtobufFormat};
use lorawan_gs::server::MqttOptions;
use prost::Message;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

type Client = Framed<TcpStream, MqttCodec>;

async fn start(harness: &Harness) -> String {
    let listener = common::listener().await;
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(mqtt::serve(
        listener,
        None,
        Arc::clone(&harness.server),
        Arc::new(ProtobufFormat),
        MqttOptions::default(),
        harness.shutdown.clone(),
    ));
    address
}

async fn connect(address: &str, username: &str, password: &str) -> (Client, ConnectReturnCode) {
    let stream = TcpStream::connect(address).await.unwrap();
    let mut client = Framed::new(stream, MqttCodec::new(64 * 1024));
    client
        .send(Packet::Connect(connect_with_login("test-client", username, password)))
        .await
        .unwrap();
    match within(client.next()).await {
        Some(Ok(Packet::ConnAck(ack))) => (client, ack.code),
        other => panic!("expected CONNACK, got {:?}", other),
    }
}

/// Subscribes to `filter` and reports whether it was granted.
async fn subscribe(client: &mut Client, filter: &str) -> bool {
    client
        .send(Packet::Subscribe(Subscribe {
            pkid: 1,
            filters: vec![SubscribeFilter {
                path: filter.to_string(),
                qos: QoS::AtMostOnce,
            }],
        }))
        .await
        .unwrap();
    match within(client.next()).await {
        Some(Ok(Packet::SubAck(ack))) if ack.pkid == 1 => {
            assert_eq!(ack.return_codes.len(), 1);
            matches!(ack.return_codes[0], SubscribeReasonCode::Success(_))
        }
        other => panic!("expected SUBACK, got {:?}", other),
    }
}

async fn publish(client: &mut Client, topic: String, payload: Vec<u8>) {
    client
        .send(Packet::Publish(Publish::new(topic, QoS::AtMostOnce, payload)))
        .await
        .unwrap();
}

#[tokio::test]
async fn connect_subscribe_and_exchange_traffic() {
    let mut harness = Harness::new();
    let address = start(&harness).await;

    let (mut client, code) = connect(&address, GATEWAY_ID, API_KEY).await;
    assert_eq!(code, ConnectReturnCode::Success);
    let down_topic = format!("v3/{}/down", GATEWAY_ID);
    assert!(subscribe(&mut client, &down_topic).await);

    let uplink = UplinkMessage {
        raw_payload: vec![0x40, 0x11, 0x22, 0x33, 0x44, 0x00, 0x05, 0x00, 0x0a, 0x0b, 0x0c, 0x0d],
        rx_metadata: vec![RxMetadata {
            rssi: -60.0,
            channel_rssi: -60.0,
            snr: 4.0,
            timestamp: 42,
            ..Default::default()
        }],
        ..Default::default()
    };
    publish(&mut client, format!("v3/{}/up", GATEWAY_ID), uplink.encode_to_vec()).await;
    let (_, msg) = harness.next_upstream().await;
    match msg {
        UpstreamMessage::Uplink(up) => assert_eq!(up.raw_payload, uplink.raw_payload),
        other => panic!("expected uplink, got {:?}", other),
    }

    let mut status = Publish::new(
        format!("v3/{}/status", GATEWAY_ID),
        QoS::AtLeastOnce,
        GatewayStatus::default().encode_to_vec(),
    );
    status.pkid = 7;
    client.send(Packet::Publish(status)).await.unwrap();
    match within(client.next()).await {
        Some(Ok(Packet::PubAck(ack))) => assert_eq!(ack.pkid, 7),
        other => panic!("expected PUBACK, got {:?}", other),
    }
    let (_, msg) = harness.next_upstream().await;
    assert!(matches!(msg, UpstreamMessage::Status(_)), "{:?}", msg);

    let scheduled = harness
        .gs
        .schedule_downlink(DownlinkMessage {
            raw_payload: vec![0x60, 0x11, 0x22, 0x33, 0x44, 0x00, 0x00, 0x00],
            correlation_ids: Vec::new(),
            settings: Some(downlink_message::Settings::Request(TxRequest {
                class: Class::C as i32,
                downlink_paths: vec![DownlinkPath::fixed(ids(), 0)],
                ..Default::default()
            })),
        })
        .unwrap();
    let sent = match within(client.next()).await {
        Some(Ok(Packet::Publish(publish))) => {
            assert_eq!(publish.topic, down_topic);
            assert_eq!(publish.qos, QoS::AtMostOnce);
            GatewayDown::decode(publish.payload).unwrap().downlink_message.unwrap()
        }
        other => panic!("expected downlink publish, got {:?}", other),
    };
    assert_eq!(sent.raw_payload, scheduled.raw_payload);
    assert!(parse_token_from_correlation_ids(&sent.correlation_ids).is_some());

    let ack = TxAcknowledgment {
        correlation_ids: sent.correlation_ids.clone(),
        result: TxAckResult::Success as i32,
        downlink_message: None,
    };
    publish(&mut client, format!("v3/{}/down/ack", GATEWAY_ID), ack.encode_to_vec()).await;
    let (_, msg) = harness.next_upstream().await;
    let UpstreamMessage::TxAck(ack) = msg else {
        panic!("expected TX acknowledgment, got {:?}", msg);
    };
    assert_eq!(ack.result, TxAckResult::Success as i32);
    assert_eq!(ack.downlink_message, Some(scheduled));

    client.send(Packet::PingReq).await.unwrap();
    assert!(matches!(within(client.next()).await, Some(Ok(Packet::PingResp))));
}

#[tokio::test]
async fn acks_without_a_known_token_carry_no_downlink() {
    let mut harness = Harness::new();
    let address = start(&harness).await;
    let (mut client, code) = connect(&address, GATEWAY_ID, API_KEY).await;
    assert_eq!(code, ConnectReturnCode::Success);

    let forged = TxAcknowledgment {
        correlation_ids: vec!["gs:token:0042".to_string()],
        result: TxAckResult::Success as i32,
        downlink_message: Some(DownlinkMessage {
            raw_payload: vec![0x60, 0xff],
            ..Default::default()
        }),
    };
    publish(&mut client, format!("v3/{}/down/ack", GATEWAY_ID), forged.encode_to_vec()).await;
    let (_, msg) = harness.next_upstream().await;
    let UpstreamMessage::TxAck(ack) = msg else {
        panic!("expected TX acknowledgment, got {:?}", msg);
    };
    assert_eq!(ack.downlink_message, None);
}

#[tokio::test]
async fn subscriptions_are_limited_to_own_downlink_topic() {
    let harness = Harness::new();
    let address = start(&harness).await;

    let (mut client, code) = connect(&address, GATEWAY_ID, API_KEY).await;
    assert_eq!(code, ConnectReturnCode::Success);
    assert!(!subscribe(&mut client, "v3/other-gateway/down").await);
    assert!(!subscribe(&mut client, "v3/+/down").await);
    assert!(!subscribe(&mut client, "#").await);
}

#[tokio::test]
async fn wrong_key_is_not_authorized() {
    let harness = Harness::new();
    let address = start(&harness).await;

    let (_client, code) = connect(&address, GATEWAY_ID, "not-the-key").await;
    assert_eq!(code, ConnectReturnCode::NotAuthorized);
    assert!(harness.gs.get_connection(&ids()).is_none());
}

#[tokio::test]
async fn accept_rate_limit_answers_server_unavailable() {
    let harness = Harness::with_profiles(&[common::profile("accept", 3, "gs:accept:mqtt")]);
    let address = start(&harness).await;

    for _ in 0..3 {
        let (_client, code) = connect(&address, GATEWAY_ID, "not-the-key").await;
        assert_eq!(code, ConnectReturnCode::NotAuthorized);
    }
    let (_client, code) = connect(&address, GATEWAY_ID, API_KEY).await;
    assert_eq!(code, ConnectReturnCode::ServiceUnavailable);
    assert_eq!(
        harness.metrics.rate_limited.with_label_values(&["mqtt"]).get(),
        1
    );
}
