use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use prost::Message as _;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, instrument, warn};

use super::gateway_config;
use super::proto::{
    gateway_message, network_server_message, transmit_downlink_request, ClientHelloNotification,
    CodeRate, ConfigureLoraGatewayRequest, ErrorCode, ErrorNotification, GatewayConfig,
    GatewayMessage, NetworkServerMessage, ServerHelloNotification, TransmitDownlinkRequest,
    UplinkMessage as WireUplink,
};
use super::IndustriesOptions;
use crate::gateway::scheduling::Scheduled;
use crate::gateway::{Connection, Server};
use crate::io::DownlinkTokens;
use crate::model::{
    Class, GatewayStatus, Location, LocationSource, RxMetadata, TxAckResult, TxAcknowledgment,
    TxSettings, UplinkMessage,
};
use crate::server::middleware::rate_limit::Resource;
use crate::server::ws::Keepalive;
use crate::utils::{time, GsError};

const OUTGOING_BUFFER: usize = 32;

type Tokens = Arc<Mutex<DownlinkTokens>>;

fn encode(transaction_id: u32, message: network_server_message::Message) -> Message {
    Message::Binary(
        NetworkServerMessage {
            transaction_id,
            message: Some(message),
        }
        .encode_to_vec(),
    )
}

fn decode(frame: Message) -> Result<Option<GatewayMessage>, GsError> {
    match frame {
        Message::Binary(bytes) => GatewayMessage::decode(bytes.as_slice())
            .map(Some)
            .map_err(|e| GsError::Corruption(format!("undecodable gateway message: {}", e))),
        Message::Text(_) => Err(GsError::Corruption("text frame".into())),
        _ => Ok(None),
    }
}

pub fn client_hello_to_status(hello: &ClientHelloNotification, now: SystemTime) -> GatewayStatus {
    let versions = HashMap::from([
        ("model".to_string(), hello.model.clone()),
        ("hardware_version".to_string(), hello.hardware_version.clone()),
        ("firmware".to_string(), hello.firmware_version.clone()),
    ]);
    GatewayStatus {
        time: Some(time::to_proto(now)),
        boot_time: hello.boot_time.clone(),
        versions,
        antenna_locations: hello
            .location
            .iter()
            .map(|loc| Location {
                latitude: loc.latitude,
                longitude: loc.longitude,
                altitude: loc.altitude,
                accuracy: loc.accuracy,
                source: LocationSource::Gps as i32,
            })
            .collect(),
        ip: hello.ip.clone(),
        ..Default::default()
    }
}

/// Converts a received frame, resolving its channel through `config`.
pub fn to_uplink(config: &GatewayConfig, up: &WireUplink, received_at: SystemTime) -> Result<UplinkMessage, GsError> {
    let (frequency, data_rate) = gateway_config::resolve_uplink(config, up)?;
    Ok(UplinkMessage {
        raw_payload: up.payload.clone(),
        settings: Some(TxSettings {
            data_rate: Some(data_rate),
            frequency,
            timestamp: up.timestamp,
            time: up.gps_time.clone(),
            ..Default::default()
        }),
        rx_metadata: vec![RxMetadata {
            timestamp: up.timestamp,
            fine_timestamp: up.fine_timestamp.unwrap_or_default(),
            rssi: up.rssi,
            channel_rssi: up.channel_rssi,
            snr: up.snr,
            gps_time: up.gps_time.clone(),
            frequency_offset: i64::from(up.frequency_offset),
            received_at: Some(time::to_proto(received_at)),
            ..Default::default()
        }],
        received_at: Some(time::to_proto(received_at)),
        crc_status: Some(up.crc_ok),
        ..Default::default()
    })
}

/// Renders a scheduled downlink as a transmit request.
///
/// # Errors
///
/// Returns `GsError::InvalidArgument` when the downlink is not scheduled or has no
/// data rate.
pub fn to_transmit_downlink(scheduled: &Scheduled, config: &GatewayConfig) -> Result<TransmitDownlinkRequest, GsError> {
    let settings = scheduled
        .settings()
        .ok_or_else(|| GsError::InvalidArgument("downlink is not scheduled".into()))?;
    let data_rate = settings
        .data_rate
        .as_ref()
        .ok_or_else(|| GsError::InvalidArgument("downlink without data rate".into()))?;
    let downlink = settings.downlink.clone().unwrap_or_default();

    let timing = match (scheduled.class, scheduled.absolute_time) {
        (Class::A, _) => transmit_downlink_request::Timing::Timestamp(settings.timestamp),
        (_, Some(at)) => transmit_downlink_request::Timing::GpsTime(time::to_proto(at)),
        _ if settings.timestamp != 0 => transmit_downlink_request::Timing::Timestamp(settings.timestamp),
        _ => transmit_downlink_request::Timing::Immediately(true),
    };
    let (spreading_factor, code_rate) = match data_rate.as_lora() {
        Some(lora) => (
            lora.spreading_factor,
            CodeRate::parse(&lora.coding_rate).unwrap_or(CodeRate::Cr45),
        ),
        None => (0, CodeRate::Cr45),
    };

    Ok(TransmitDownlinkRequest {
        payload: scheduled.message.raw_payload.clone(),
        channel: Some(gateway_config::tx_channel(config, settings.frequency, data_rate)),
        timing: Some(timing),
        spreading_factor,
        code_rate: code_rate as i32,
        tx_power: downlink.tx_power,
        invert_polarization: downlink.invert_polarization,
        board: 0,
        antenna: downlink.antenna_index,
    })
}

/// The TX result a gateway error code stands for, if it is a transmission error.
pub fn tx_ack_result(code: ErrorCode) -> Option<TxAckResult> {
    match code {
        ErrorCode::TxTooLate => Some(TxAckResult::TooLate),
        ErrorCode::TxTooEarly => Some(TxAckResult::TooEarly),
        ErrorCode::TxCollisionPacket => Some(TxAckResult::CollisionPacket),
        ErrorCode::TxCollisionBeacon => Some(TxAckResult::CollisionBeacon),
        ErrorCode::TxFrequency => Some(TxAckResult::TxFreq),
        ErrorCode::TxPower => Some(TxAckResult::TxPower),
        ErrorCode::TxGpsUnlocked => Some(TxAckResult::GpsUnlocked),
        ErrorCode::Unknown | ErrorCode::ConfigurationFailed | ErrorCode::InvalidMessage => None,
    }
}

fn ack(tokens: &Tokens, transaction_id: u32, result: TxAckResult) -> Option<TxAcknowledgment> {
    let token = u16::try_from(transaction_id).ok()?;
    let (message, _) = tokens
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(token, Instant::now())?;
    Some(TxAcknowledgment {
        correlation_ids: message.correlation_ids.clone(),
        result: result as i32,
        downlink_message: Some(message),
    })
}

/// Resolves a gateway error notification to a TX acknowledgment.
///
/// Transmission errors map to their result; any other code is reported as an unknown
/// error, but only when the transaction is a downlink this session sent.
pub fn error_to_ack(tokens: &Tokens, transaction_id: u32, error: &ErrorNotification) -> Option<TxAcknowledgment> {
    let result = ErrorCode::try_from(error.code)
        .ok()
        .and_then(tx_ack_result)
        .unwrap_or(TxAckResult::UnknownError);
    ack(tokens, transaction_id, result)
}

/// Runs an admitted Industries gateway from the server hello until either side
/// goes away.
#[instrument(skip_all, fields(gateway_uid = %conn.uid(), remote_addr = %conn.remote_addr()))]
pub async fn serve<S>(
    ws: WebSocketStream<S>,
    server: Arc<dyn Server>,
    conn: Arc<Connection>,
    options: Arc<IndustriesOptions>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let _guard = conn.disconnect_on_drop();
    let (sink, stream) = ws.split();
    let (out, out_rx) = mpsc::channel(OUTGOING_BUFFER);
    let writer = tokio::spawn(write_loop(sink, out_rx, Arc::clone(&conn)));

    let mut session = Session {
        server,
        conn: Arc::clone(&conn),
        options,
        tokens: Arc::new(Mutex::new(DownlinkTokens::new())),
        out: out.clone(),
    };
    let err = match session.run(stream).await {
        Ok(()) => GsError::Canceled,
        Err(err) => err,
    };
    debug!(error = %err, "Gateway session ended");
    let _ = out
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::from(err.close_code()),
            reason: err.to_string().into(),
        })))
        .await;
    conn.disconnect(err);
    drop(session);
    drop(out);
    let _ = writer.await;
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<Message>,
    conn: Arc<Connection>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(err) = sink.send(msg).await {
            conn.disconnect(GsError::Connection(err.to_string()));
            return;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn schedule_loop(
    server: Arc<dyn Server>,
    conn: Arc<Connection>,
    config: Arc<GatewayConfig>,
    tokens: Tokens,
    out: mpsc::Sender<Message>,
) {
    let protocol = conn.frontend().protocol();
    while let Some(scheduled) = conn.recv_down().await {
        let request = match to_transmit_downlink(&scheduled, &config) {
            Ok(request) => request,
            Err(err) => {
                warn!(gateway_uid = %conn.uid(), error = %err, "Dropped downlink");
                continue;
            }
        };
        let transaction_id = tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .next(scheduled.message, Instant::now()) as u32;
        let frame = encode(
            transaction_id,
            network_server_message::Message::TransmitDownlink(request),
        );
        if out.send(frame).await.is_err() {
            return;
        }
        server
            .metrics()
            .downlinks_sent
            .with_label_values(&[protocol])
            .inc();
    }
}

struct Session {
    server: Arc<dyn Server>,
    conn: Arc<Connection>,
    options: Arc<IndustriesOptions>,
    tokens: Tokens,
    out: mpsc::Sender<Message>,
}

impl Session {
    async fn send(&self, message: network_server_message::Message) -> Result<(), GsError> {
        self.out
            .send(encode(0, message))
            .await
            .map_err(|_| GsError::Connection("writer closed".into()))
    }

    async fn client_hello<S>(&self, stream: &mut SplitStream<WebSocketStream<S>>) -> Result<ClientHelloNotification, GsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let read = async {
            loop {
                let frame = match stream.next().await {
                    None => return Err(GsError::Canceled),
                    Some(Err(err)) => return Err(GsError::from(err)),
                    Some(Ok(Message::Close(_))) => return Err(GsError::Canceled),
                    Some(Ok(frame)) => frame,
                };
                if let Some(msg) = decode(frame)? {
                    return Ok(msg);
                }
            }
        };
        let msg = tokio::time::timeout(self.options.hello_timeout, read)
            .await
            .map_err(|_| GsError::Corruption("no client hello".into()))??;
        let name = msg.name();
        match msg.message {
            Some(gateway_message::Message::ClientHello(hello)) => Ok(hello),
            _ => Err(GsError::Corruption(format!("expected client hello, got {}", name))),
        }
    }

    async fn run<S>(&mut self, mut stream: SplitStream<WebSocketStream<S>>) -> Result<(), GsError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let config = Arc::new(gateway_config::build(conn.primary_frequency_plan())?);

        self.send(network_server_message::Message::ServerHello(ServerHelloNotification {
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            time: Some(time::to_proto(SystemTime::now())),
        }))
        .await?;
        self.send(network_server_message::Message::ConfigureLoraGateway(
            ConfigureLoraGatewayRequest {
                config: Some(config.as_ref().clone()),
            },
        ))
        .await?;

        let hello = self.client_hello(&mut stream).await?;
        info!(
            model = %hello.model,
            firmware = %hello.firmware_version,
            "Gateway hello"
        );
        conn.handle_status(client_hello_to_status(&hello, SystemTime::now()))
            .await?;

        let scheduler = tokio::spawn(schedule_loop(
            Arc::clone(&self.server),
            Arc::clone(&conn),
            Arc::clone(&config),
            Arc::clone(&self.tokens),
            self.out.clone(),
        ));
        let res = self.read_loop(&mut stream, &config).await;
        scheduler.abort();
        res
    }

    async fn read_loop<S>(
        &mut self,
        stream: &mut SplitStream<WebSocketStream<S>>,
        config: &GatewayConfig,
    ) -> Result<(), GsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let conn = Arc::clone(&self.conn);
        let mut keepalive = Keepalive::new(self.options.keepalive);
        loop {
            tokio::select! {
                biased;
                _ = conn.context().cancelled() => {
                    return Err(conn.error().unwrap_or(GsError::Canceled));
                }
                _ = tokio::time::sleep_until(keepalive.deadline()) => {
                    let payload = keepalive.tick(tokio::time::Instant::now())?;
                    self.out
                        .send(Message::Ping(payload))
                        .await
                        .map_err(|_| GsError::Connection("writer closed".into()))?;
                }
                frame = stream.next() => match frame {
                    None | Some(Ok(Message::Close(_))) => return Ok(()),
                    Some(Err(err)) => return Err(GsError::from(err)),
                    Some(Ok(Message::Pong(payload))) => {
                        if let Some(rtt) = keepalive.pong(&payload, tokio::time::Instant::now()) {
                            conn.record_rtt(rtt, Instant::now());
                        }
                    }
                    Some(Ok(frame)) => {
                        if let Some(msg) = decode(frame)? {
                            match self.handle(msg, config).await {
                                Err(err @ (GsError::Canceled | GsError::Connection(_))) => return Err(err),
                                Err(err) => debug!(error = %err, "Dropped gateway message"),
                                Ok(()) => {}
                            }
                        }
                    }
                },
            }
        }
    }

    async fn handle(&self, msg: GatewayMessage, config: &GatewayConfig) -> Result<(), GsError> {
        let transaction_id = msg.transaction_id;
        match msg.message {
            Some(gateway_message::Message::ClientHello(hello)) => {
                self.conn
                    .handle_status(client_hello_to_status(&hello, SystemTime::now()))
                    .await
            }
            Some(gateway_message::Message::UplinkMessages(notification)) => {
                self.server
                    .rate_limiter()
                    .check(&Resource::gateway_up(self.conn.uid()))?;
                let now = SystemTime::now();
                let mut batch = Vec::with_capacity(notification.messages.len());
                for up in &notification.messages {
                    match to_uplink(config, up, now) {
                        Ok(up) => batch.push(up),
                        Err(err) => debug!(error = %err, "Dropped uplink"),
                    }
                }
                let repeats = self.conn.handle_uplinks(batch).await?;
                self.server.metrics().uplink_repeats.inc_by(repeats as u64);
                Ok(())
            }
            Some(gateway_message::Message::TransmitDownlink(_)) => {
                match ack(&self.tokens, transaction_id, TxAckResult::Success) {
                    Some(ack) => self.conn.handle_tx_ack(ack).await,
                    None => {
                        debug!(transaction_id, "Response for unknown downlink");
                        Ok(())
                    }
                }
            }
            Some(gateway_message::Message::Error(error)) => {
                match error_to_ack(&self.tokens, transaction_id, &error) {
                    Some(ack) => self.conn.handle_tx_ack(ack).await,
                    None => {
                        warn!(
                            transaction_id,
                            code = error.code,
                            message = %error.message,
                            "Gateway reported an error"
                        );
                        Ok(())
                    }
                }
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::uplink_token;
    use crate::model::frequency_plan::eu_863_870_ttn;
    use crate::model::{downlink_message, tx_settings, DataRate, DownlinkMessage, GatewayIdentifiers};
    use std::time::Duration;

    fn scheduled(class: Class, frequency: u64, data_rate: DataRate) -> Scheduled {
        let token = uplink_token::mint(
            &GatewayIdentifiers::from_id("test-gateway"),
            0,
            10_000_000,
            10_000_000,
            SystemTime::now(),
            None,
        );
        Scheduled {
            message: DownlinkMessage {
                raw_payload: vec![0x60, 0x01],
                correlation_ids: vec!["ns:downlink:1".into()],
                settings: Some(downlink_message::Settings::Scheduled(TxSettings {
                    data_rate: Some(data_rate),
                    frequency,
                    timestamp: 11_000_000,
                    downlink: Some(tx_settings::Downlink {
                        antenna_index: 0,
                        tx_power: 14.0,
                        invert_polarization: true,
                    }),
                    ..Default::default()
                })),
            },
            class,
            rx_window: 1,
            rx_delay: Duration::from_secs(1),
            uplink_token: (class == Class::A).then(|| uplink_token::decode(&token).unwrap()),
            absolute_time: None,
        }
    }

    #[test]
    fn downlink_indexes_tx_table() {
        let config = gateway_config::build(&eu_863_870_ttn()).unwrap();
        let req = to_transmit_downlink(
            &scheduled(Class::A, 868_100_000, DataRate::lora(7, 125_000, "4/5")),
            &config,
        )
        .unwrap();
        assert_eq!(req.channel, Some(transmit_downlink_request::Channel::Index(0)));
        assert_eq!(req.timing, Some(transmit_downlink_request::Timing::Timestamp(11_000_000)));
        assert_eq!(req.spreading_factor, 7);
        assert_eq!(req.code_rate, CodeRate::Cr45 as i32);
        assert!(req.invert_polarization);
        assert_eq!(req.payload, vec![0x60, 0x01]);
    }

    #[test]
    fn class_c_without_timestamp_is_immediate() {
        let config = gateway_config::build(&eu_863_870_ttn()).unwrap();
        let mut down = scheduled(Class::C, 869_525_000, DataRate::lora(12, 125_000, "4/5"));
        if let Some(downlink_message::Settings::Scheduled(settings)) = &mut down.message.settings {
            settings.timestamp = 0;
        }
        let req = to_transmit_downlink(&down, &config).unwrap();
        assert_eq!(req.timing, Some(transmit_downlink_request::Timing::Immediately(true)));

        let at = SystemTime::now() + Duration::from_secs(10);
        down.absolute_time = Some(at);
        let req = to_transmit_downlink(&down, &config).unwrap();
        assert_eq!(
            req.timing,
            Some(transmit_downlink_request::Timing::GpsTime(time::to_proto(at)))
        );
    }

    #[test]
    fn error_notifications_become_acks() {
        let tokens: Tokens = Arc::new(Mutex::new(DownlinkTokens::new()));
        let down = scheduled(Class::A, 868_100_000, DataRate::lora(7, 125_000, "4/5")).message;
        let id = tokens.lock().unwrap().next(down.clone(), Instant::now()) as u32;

        let too_late = ErrorNotification {
            code: ErrorCode::TxTooLate as i32,
            message: String::new(),
        };
        let ack = error_to_ack(&tokens, id, &too_late).unwrap();
        assert_eq!(ack.result, TxAckResult::TooLate as i32);
        assert_eq!(ack.downlink_message, Some(down));

        let other = ErrorNotification {
            code: ErrorCode::ConfigurationFailed as i32,
            message: String::new(),
        };
        let ack = error_to_ack(&tokens, id, &other).unwrap();
        assert_eq!(ack.result, TxAckResult::UnknownError as i32);

        assert!(error_to_ack(&tokens, id + 1, &too_late).is_none());
        assert!(error_to_ack(&tokens, id + 0x1_0000, &too_late).is_none());
        assert!(error_to_ack(&tokens, 0, &too_late).is_none());
    }

    #[test]
    fn uplink_conversion() {
        let config = gateway_config::build(&eu_863_870_ttn()).unwrap();
        let wire = WireUplink {
            payload: vec![0x40, 1, 2, 3, 4],
            if_chain: 0,
            spreading_factor: 7,
            code_rate: CodeRate::Cr45 as i32,
            timestamp: 42,
            rssi: -50.0,
            channel_rssi: -51.0,
            snr: 7.5,
            crc_ok: true,
            ..Default::default()
        };
        let up = to_uplink(&config, &wire, SystemTime::now()).unwrap();
        let settings = up.settings.unwrap();
        assert_eq!(settings.frequency, 868_100_000);
        assert_eq!(settings.data_rate, Some(DataRate::lora(7, 125_000, "4/5")));
        assert_eq!(up.rx_metadata[0].channel_rssi, -51.0);
        assert_eq!(up.rx_metadata[0].timestamp, 42);
        assert_eq!(up.crc_status, Some(true));
    }

    #[test]
    fn non_binary_frames_are_corruption() {
        let err = decode(Message::Text("hello".into())).unwrap_err();
        assert_eq!(err.code(), crate::utils::ErrorCode::Corruption);
        assert!(decode(Message::Binary(vec![0xff, 0xff])).is_err());
        assert!(decode(Message::Ping(vec![])).unwrap().is_none());
    }
}
