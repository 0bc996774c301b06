use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

use super::packet::{
    packet_name, ConnAck, ConnectReturnCode, MqttCodec, Packet, PubAck, PubComp, PubRec, Publish,
    QoS, SubAck, SubscribeReasonCode, UnsubAck,
};
use super::topics::{TopicAccess, TopicKind};
use super::{Format, MqttOptions};
use crate::gateway::{Connection, Frontend, Server};
use crate::io::{format_correlation_id, parse_token_from_correlation_ids, DownlinkTokens};
use crate::model::{GatewayIdentifiers, Right, TxAcknowledgment};
use crate::server::middleware::rate_limit::Resource;
use crate::utils::{ErrorCode, GsError};

type Transport<S> = Framed<S, MqttCodec>;

fn connack_code(err: &GsError) -> ConnectReturnCode {
    match err.code() {
        ErrorCode::Unauthenticated | ErrorCode::PermissionDenied | ErrorCode::NotFound => {
            ConnectReturnCode::NotAuthorized
        }
        ErrorCode::InvalidArgument => ConnectReturnCode::BadUserNamePassword,
        _ => ConnectReturnCode::ServiceUnavailable,
    }
}

async fn reject<S>(transport: &mut Transport<S>, code: ConnectReturnCode, err: GsError) -> GsError
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _ = transport
        .send(Packet::ConnAck(ConnAck {
            session_present: false,
            code,
        }))
        .await;
    err
}

/// Serves one MQTT client from CONNECT to disconnect.
///
/// # Errors
///
/// Returns the error that ended the session; a client that disconnects cleanly ends
/// it with `Ok(())`.
#[instrument(skip_all, fields(protocol = frontend.protocol(), %peer))]
pub async fn serve_session<S>(
    server: Arc<dyn Server>,
    frontend: Arc<dyn Frontend>,
    format: Arc<dyn Format>,
    stream: S,
    peer: SocketAddr,
    options: &MqttOptions,
) -> Result<(), GsError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut transport = Framed::new(stream, MqttCodec::new(options.max_packet_size));

    let connect = match tokio::time::timeout(options.connect_timeout, transport.next()).await {
        Err(_) => return Err(GsError::Canceled),
        Ok(None) => return Ok(()),
        Ok(Some(Err(err))) => return Err(err),
        Ok(Some(Ok(Packet::Connect(connect)))) => connect,
        Ok(Some(Ok(other))) => {
            return Err(GsError::InvalidArgument(format!(
                "expected CONNECT, got {}",
                packet_name(&other)
            )))
        }
    };

    let remote_ip = server.base_config().client_addr(peer.ip(), None);
    if let Err(err) = server.rate_limiter().check(&Resource::accept_mqtt(remote_ip)) {
        server
            .metrics()
            .rate_limited
            .with_label_values(&[frontend.protocol()])
            .inc();
        return Err(reject(&mut transport, ConnectReturnCode::ServiceUnavailable, err).await);
    }

    let Some(login) = connect.login.as_ref() else {
        let err = GsError::Unauthenticated("CONNECT without username and password".into());
        return Err(reject(&mut transport, ConnectReturnCode::BadUserNamePassword, err).await);
    };
    let authorization = format!("Bearer {}", login.password);
    let ids = match authenticate(server.as_ref(), &login.username, &authorization).await {
        Ok(ids) => ids,
        Err(err) => {
            let code = connack_code(&err);
            return Err(reject(&mut transport, code, err).await);
        }
    };

    let conn = match server
        .connect(Arc::clone(&frontend), ids, remote_ip.to_string())
        .await
    {
        Ok(conn) => conn,
        Err(err) => {
            let code = connack_code(&err);
            return Err(reject(&mut transport, code, err).await);
        }
    };
    let _guard = conn.disconnect_on_drop();
    transport
        .send(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }))
        .await
        .map_err(|err| {
            conn.disconnect(err.clone());
            err
        })?;
    info!(gateway_uid = %conn.uid(), client_id = %connect.client_id, "MQTT gateway connected");

    let mut session = Session {
        server,
        access: TopicAccess::new(format.layout(), conn.uid()),
        format,
        conn,
        subscribed: false,
        tokens: DownlinkTokens::new(),
    };
    let res = session.run(&mut transport).await;
    match &res {
        Ok(()) => session.conn.disconnect(GsError::Canceled),
        Err(err) => session.conn.disconnect(err.clone()),
    }
    res
}

async fn authenticate(
    server: &dyn Server,
    username: &str,
    authorization: &str,
) -> Result<GatewayIdentifiers, GsError> {
    let ids = server
        .fill_gateway_context(GatewayIdentifiers::from_id(username))
        .await?;
    server.validate_gateway_id(&ids)?;
    server
        .authorize(&ids, Some(authorization))
        .await?
        .require(Right::GatewayLink)?;
    Ok(ids)
}

struct Session {
    server: Arc<dyn Server>,
    format: Arc<dyn Format>,
    conn: Arc<Connection>,
    access: TopicAccess,
    subscribed: bool,
    tokens: DownlinkTokens,
}

impl Session {
    async fn run<S>(&mut self, transport: &mut Transport<S>) -> Result<(), GsError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let conn = Arc::clone(&self.conn);
        loop {
            tokio::select! {
                biased;
                _ = conn.context().cancelled() => {
                    return Err(conn.error().unwrap_or(GsError::Canceled));
                }
                packet = transport.next() => match packet {
                    None => return Ok(()),
                    Some(Err(err)) => return Err(err),
                    Some(Ok(Packet::Disconnect)) => return Ok(()),
                    Some(Ok(packet)) => self.handle_packet(transport, packet).await?,
                },
                down = conn.recv_down(), if self.subscribed => {
                    let Some(scheduled) = down else {
                        return Err(conn.error().unwrap_or(GsError::Canceled));
                    };
                    let mut message = scheduled.message;
                    let token = self.tokens.next(message.clone(), Instant::now());
                    message.correlation_ids.push(format_correlation_id(token));
                    match self.format.encode_downlink(&message) {
                        Ok(payload) => {
                            let publish =
                                Publish::new(self.access.downlink_topic(), QoS::AtMostOnce, payload);
                            transport.send(Packet::Publish(publish)).await?;
                            self.server
                                .metrics()
                                .downlinks_sent
                                .with_label_values(&[self.format.protocol()])
                                .inc();
                        }
                        Err(err) => warn!(error = %err, "Failed to encode downlink"),
                    }
                }
            }
        }
    }

    async fn handle_packet<S>(&mut self, transport: &mut Transport<S>, packet: Packet) -> Result<(), GsError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match packet {
            Packet::Publish(publish) => {
                let (qos, pkid) = (publish.qos, publish.pkid);
                self.handle_publish(publish).await?;
                match qos {
                    QoS::AtMostOnce => {}
                    QoS::AtLeastOnce => transport.send(Packet::PubAck(PubAck { pkid })).await?,
                    QoS::ExactlyOnce => transport.send(Packet::PubRec(PubRec { pkid })).await?,
                }
            }
            Packet::PubRel(rel) => {
                transport
                    .send(Packet::PubComp(PubComp { pkid: rel.pkid }))
                    .await?
            }
            Packet::PubAck(_) | Packet::PubRec(_) | Packet::PubComp(_) => {}
            Packet::Subscribe(subscribe) => {
                if subscribe.filters.is_empty() {
                    return Err(GsError::InvalidArgument("SUBSCRIBE without filters".into()));
                }
                let return_codes = subscribe
                    .filters
                    .iter()
                    .map(|filter| {
                        if self.access.can_read(&filter.path) {
                            self.subscribed = true;
                            SubscribeReasonCode::Success(QoS::AtMostOnce)
                        } else {
                            warn!(filter = %filter.path, "Denied subscription");
                            SubscribeReasonCode::Failure
                        }
                    })
                    .collect();
                transport
                    .send(Packet::SubAck(SubAck {
                        pkid: subscribe.pkid,
                        return_codes,
                    }))
                    .await?;
            }
            Packet::Unsubscribe(unsubscribe) => {
                if unsubscribe
                    .topics
                    .iter()
                    .any(|t| t == self.access.downlink_topic())
                {
                    self.subscribed = false;
                }
                transport
                    .send(Packet::UnsubAck(UnsubAck {
                        pkid: unsubscribe.pkid,
                    }))
                    .await?;
            }
            Packet::PingReq => transport.send(Packet::PingResp).await?,
            other => {
                return Err(GsError::InvalidArgument(format!(
                    "unexpected {} from client",
                    packet_name(&other)
                )))
            }
        }
        Ok(())
    }

    /// Replaces the acknowledged downlink with the one this session sent under the
    /// acknowledgment's token. Without a resolvable token there is none.
    fn correlate(&self, mut ack: TxAcknowledgment) -> TxAcknowledgment {
        let token = parse_token_from_correlation_ids(&ack.correlation_ids);
        ack.downlink_message = token
            .and_then(|token| self.tokens.get(token, Instant::now()))
            .map(|(down, _)| down);
        if ack.downlink_message.is_none() {
            debug!(?token, "TX acknowledgment for unknown downlink");
        }
        ack
    }

    async fn handle_publish(&self, publish: Publish) -> Result<(), GsError> {
        let Some(kind) = self.access.classify_write(&publish.topic) else {
            warn!(topic = %publish.topic, "Dropped publish on unauthorized topic");
            return Ok(());
        };
        let res = match kind {
            TopicKind::Birth | TopicKind::LastWill => Ok(()),
            TopicKind::Uplink => {
                self.server
                    .rate_limiter()
                    .check(&Resource::gateway_up(self.conn.uid()))?;
                match self.format.decode_uplink(&publish.payload) {
                    Ok(up) => self.conn.handle_uplinks(vec![up]).await.map(|_| ()),
                    Err(err) => Err(err),
                }
            }
            TopicKind::Status => match self.format.decode_status(&publish.payload) {
                Ok(status) => self.conn.handle_status(status).await,
                Err(err) => Err(err),
            },
            TopicKind::TxAck => match self.format.decode_tx_ack(&publish.payload) {
                Ok(ack) => self.conn.handle_tx_ack(self.correlate(ack)).await,
                Err(err) => Err(err),
            },
        };
        match res {
            Err(GsError::Canceled) => Err(GsError::Canceled),
            Err(err) => {
                debug!(topic = %publish.topic, error = %err, "Dropped gateway message");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }
}
