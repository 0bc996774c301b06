use std::sync::Arc;
use std::time::{Instant, SystemTime};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use tracing::{debug, info, instrument, warn};

use super::downstream::{self, DownlinkContext};
use super::messages::{Downstream, Upstream};
use super::upstream::{self, UplinkContext};
use super::{router_config, BasicStationOptions};
use crate::gateway::{Connection, Server};
use crate::io::DownlinkTokens;
use crate::model::{Band, UplinkMessage};
use crate::server::middleware::rate_limit::Resource;
use crate::server::ws::Keepalive;
use crate::utils::GsError;

/// Disconnects a connection that was admitted but never got its socket.
pub struct PendingConnection(Option<Arc<Connection>>);

impl PendingConnection {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self(Some(conn))
    }

    fn take(mut self) -> Option<Arc<Connection>> {
        self.0.take()
    }
}

impl Drop for PendingConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.0.take() {
            conn.disconnect(GsError::Connection("WebSocket upgrade failed".into()));
        }
    }
}

/// Runs the traffic socket of an admitted station until either side goes away.
#[instrument(skip_all, fields(gateway_uid = %pending.0.as_ref().map(|c| c.uid()).unwrap_or_default()))]
pub async fn serve(
    socket: WebSocket,
    server: Arc<dyn Server>,
    pending: PendingConnection,
    options: Arc<BasicStationOptions>,
) {
    let Some(conn) = pending.take() else {
        return;
    };
    let _guard = conn.disconnect_on_drop();
    let band = match conn.primary_frequency_plan().band() {
        Ok(band) => band,
        Err(err) => {
            conn.disconnect(err);
            return;
        }
    };
    info!(remote_addr = %conn.remote_addr(), "Station connected");
    let mut session = Session {
        server,
        conn: Arc::clone(&conn),
        band,
        options,
        tokens: DownlinkTokens::new(),
    };
    let mut socket = socket;
    let res = session.run(&mut socket).await;
    let err = match res {
        Ok(()) => GsError::Canceled,
        Err(err) => err,
    };
    debug!(error = %err, "Station session ended");
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: err.close_code(),
            reason: err.to_string().into(),
        })))
        .await;
    conn.disconnect(err);
}

struct Session {
    server: Arc<dyn Server>,
    conn: Arc<Connection>,
    band: &'static Band,
    options: Arc<BasicStationOptions>,
    tokens: DownlinkTokens,
}

async fn send(socket: &mut WebSocket, msg: &Downstream) -> Result<(), GsError> {
    socket
        .send(Message::Text(msg.to_json()?))
        .await
        .map_err(|e| GsError::Connection(e.to_string()))
}

impl Session {
    async fn run(&mut self, socket: &mut WebSocket) -> Result<(), GsError> {
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
                    socket
                        .send(Message::Ping(payload))
                        .await
                        .map_err(|e| GsError::Connection(e.to_string()))?;
                }
                msg = socket.recv() => match msg {
                    None | Some(Ok(Message::Close(_))) => return Ok(()),
                    Some(Err(err)) => return Err(GsError::Connection(err.to_string())),
                    Some(Ok(Message::Text(text))) => self.handle_text(socket, &text).await?,
                    Some(Ok(Message::Pong(payload))) => {
                        if let Some(rtt) = keepalive.pong(&payload, tokio::time::Instant::now()) {
                            conn.record_rtt(rtt, Instant::now());
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!("Dropped binary frame");
                    }
                    Some(Ok(Message::Ping(_))) => {}
                },
                down = conn.recv_down() => {
                    let Some(scheduled) = down else {
                        return Err(conn.error().unwrap_or(GsError::Canceled));
                    };
                    let ctx = DownlinkContext {
                        band: self.band,
                        clock: conn.clock(),
                        now: SystemTime::now(),
                    };
                    let diid = self.tokens.next(scheduled.message.clone(), Instant::now());
                    match downstream::to_dnmsg(&scheduled, diid, &ctx) {
                        Ok(dnmsg) => {
                            send(socket, &Downstream::DownlinkMessage(dnmsg)).await?;
                            self.server
                                .metrics()
                                .downlinks_sent
                                .with_label_values(&[conn.frontend().protocol()])
                                .inc();
                        }
                        Err(err) => warn!(error = %err, "Dropped downlink"),
                    }
                }
            }
        }
    }

    async fn handle_text(&mut self, socket: &mut WebSocket, text: &str) -> Result<(), GsError> {
        let msg = match Upstream::parse(text) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(error = %err, "Dropped malformed station message");
                return Ok(());
            }
        };
        let res = self.handle_message(socket, msg).await;
        match res {
            Err(err @ (GsError::Canceled | GsError::Connection(_))) => Err(err),
            Err(err) => {
                debug!(error = %err, "Dropped station message");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    async fn handle_message(&mut self, socket: &mut WebSocket, msg: Upstream) -> Result<(), GsError> {
        let now = SystemTime::now();
        let uplink_ctx = UplinkContext {
            ids: self.conn.ids(),
            band: self.band,
            received_at: now,
        };
        match msg {
            Upstream::Version(version) => {
                info!(
                    station = %version.station,
                    model = %version.model,
                    protocol = version.protocol,
                    "Station version"
                );
                let config = router_config::build(
                    self.conn.primary_frequency_plan(),
                    version.feature_list(),
                    now,
                )?;
                send(socket, &Downstream::RouterConfig(config)).await?;
                self.conn
                    .handle_status(upstream::version_to_status(&version, now))
                    .await
            }
            Upstream::JoinRequest(jreq) => {
                let up = upstream::join_request_to_uplink(&jreq, &uplink_ctx)?;
                self.handle_uplink(up, jreq.radio.up_info.xtime, now).await
            }
            Upstream::UplinkDataFrame(updf) => {
                let up = upstream::data_frame_to_uplink(&updf, &uplink_ctx)?;
                self.handle_uplink(up, updf.radio.up_info.xtime, now).await
            }
            Upstream::ProprietaryDataFrame(propdf) => {
                let up = upstream::proprietary_to_uplink(&propdf, &uplink_ctx)?;
                self.handle_uplink(up, propdf.radio.up_info.xtime, now).await
            }
            Upstream::TxConfirmation(confirmation) => {
                match upstream::tx_confirmation_to_ack(&self.tokens, &confirmation, Instant::now()) {
                    Some(ack) => self.conn.handle_tx_ack(ack).await,
                    None => {
                        debug!(diid = confirmation.diid, "TX confirmation for unknown downlink");
                        Ok(())
                    }
                }
            }
            Upstream::TimeSync(request) => {
                let rtt = self.conn.rtt_stats(90, Instant::now());
                if let Some(rtt) = rtt.filter(|rtt| rtt.max > self.options.max_round_trip_delay) {
                    debug!(max_rtt = ?rtt.max, "Skipped time sync on slow link");
                    return Ok(());
                }
                let response = upstream::time_sync_response(&request, now);
                send(socket, &Downstream::TimeSync(response)).await
            }
            Upstream::Unknown => Ok(()),
        }
    }

    async fn handle_uplink(&self, up: UplinkMessage, xtime: i64, now: SystemTime) -> Result<(), GsError> {
        self.server
            .rate_limiter()
            .check(&Resource::gateway_up(self.conn.uid()))?;
        self.conn
            .sync_clock(upstream::xtime_timestamp(xtime), xtime, now);
        self.conn.handle_uplinks(vec![up]).await.map(|_| ())
    }
}
