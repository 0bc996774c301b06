use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::{self, EventBus};
use super::frontend::Frontend;
use super::registry::ConnectionRegistry;
use super::scheduling::{self, ClockSync, ScheduleContext, Scheduled};
use super::stats::{ConnectionStats, RttSummary, RttWindow};
use crate::io::{unique_by_rssi, uplink_token};
use crate::model::{
    DownlinkMessage, DownlinkPath, FrequencyPlan, Gateway, GatewayIdentifiers, GatewayStatus,
    TxAcknowledgment, UplinkMessage,
};
use crate::server::middleware::validation;
use crate::utils::{time, GsError};

/// A message travelling from the gateway towards the upstream network server.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamMessage {
    Uplink(UplinkMessage),
    Status(GatewayStatus),
    TxAck(TxAcknowledgment),
}

/// Sizing of a connection's queues.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub upstream_buffer: usize,
    pub downstream_buffer: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            upstream_buffer: 64,
            downstream_buffer: 16,
        }
    }
}

struct State {
    stats: ConnectionStats,
    rtt: RttWindow,
    clock: Option<ClockSync>,
    error: Option<GsError>,
}

/// A live gateway connection, shared between its frontend tasks and the Gateway Server.
pub struct Connection {
    gateway: Gateway,
    ids: GatewayIdentifiers,
    frontend: Arc<dyn Frontend>,
    remote_addr: String,
    plans: HashMap<String, Arc<FrequencyPlan>>,
    primary_plan: Arc<FrequencyPlan>,
    token: CancellationToken,
    up_tx: mpsc::Sender<UpstreamMessage>,
    up_rx: Mutex<Option<mpsc::Receiver<UpstreamMessage>>>,
    down_tx: mpsc::Sender<Scheduled>,
    down_rx: tokio::sync::Mutex<mpsc::Receiver<Scheduled>>,
    state: Mutex<State>,
    disconnected: AtomicBool,
    /// Set once the frontend synchronises the clock itself.
    explicit_clock: AtomicBool,
    events: EventBus,
    registry: Weak<ConnectionRegistry>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("gateway_uid", &self.ids.uid())
            .field("protocol", &self.frontend.protocol())
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl Connection {
    /// Builds a connection for an admitted gateway.
    ///
    /// # Errors
    ///
    /// Returns `GsError::NotFound` when the gateway's primary frequency plan is not
    /// among `plans`.
    pub fn new(
        gateway: Gateway,
        frontend: Arc<dyn Frontend>,
        remote_addr: String,
        plans: HashMap<String, Arc<FrequencyPlan>>,
        options: ConnectionOptions,
        events: EventBus,
        registry: Weak<ConnectionRegistry>,
    ) -> Result<Self, GsError> {
        let primary_plan = plans
            .get(&gateway.frequency_plan_id)
            .cloned()
            .ok_or_else(|| {
                GsError::NotFound(format!("frequency plan `{}`", gateway.frequency_plan_id))
            })?;
        let (up_tx, up_rx) = mpsc::channel(options.upstream_buffer);
        let (down_tx, down_rx) = mpsc::channel(options.downstream_buffer);
        let stats = ConnectionStats {
            protocol: frontend.protocol().to_string(),
            connected_at: Some(SystemTime::now()),
            remote_addr: remote_addr.clone(),
            ..Default::default()
        };
        Ok(Self {
            ids: gateway.ids(),
            gateway,
            frontend,
            remote_addr,
            plans,
            primary_plan,
            token: CancellationToken::new(),
            up_tx,
            up_rx: Mutex::new(Some(up_rx)),
            down_tx,
            down_rx: tokio::sync::Mutex::new(down_rx),
            state: Mutex::new(State {
                stats,
                rtt: RttWindow::default(),
                clock: None,
                error: None,
            }),
            disconnected: AtomicBool::new(false),
            explicit_clock: AtomicBool::new(false),
            events,
            registry,
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a panic elsewhere; the counters stay usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ids(&self) -> &GatewayIdentifiers {
        &self.ids
    }

    pub fn uid(&self) -> &str {
        self.ids.uid()
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn frontend(&self) -> &Arc<dyn Frontend> {
        &self.frontend
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// The token cancelled when this connection is disconnected.
    pub fn context(&self) -> &CancellationToken {
        &self.token
    }

    pub fn primary_frequency_plan(&self) -> &Arc<FrequencyPlan> {
        &self.primary_plan
    }

    pub fn frequency_plans(&self) -> &HashMap<String, Arc<FrequencyPlan>> {
        &self.plans
    }

    /// Takes the receiving end of the upstream queue. Only the first call gets it.
    pub fn take_upstream(&self) -> Option<mpsc::Receiver<UpstreamMessage>> {
        self.up_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    async fn send_up(&self, message: UpstreamMessage) -> Result<(), GsError> {
        // Blocks when upstream is slow, which pushes back on the gateway's socket.
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(GsError::Canceled),
            res = self.up_tx.send(message) => res.map_err(|_| GsError::Canceled),
        }
    }

    /// Deduplicates one received batch and forwards the unique uplinks.
    ///
    /// Returns the number of repeats that were dropped.
    pub async fn handle_uplinks(&self, batch: Vec<UplinkMessage>) -> Result<usize, GsError> {
        let (unique, repeats) = unique_by_rssi(batch);
        for repeat in &repeats {
            self.events.publish(
                events::UP_REPEAT,
                self.uid(),
                Some(format!("{} bytes", repeat.raw_payload.len())),
            );
        }
        for msg in unique {
            self.handle_up(msg).await?;
        }
        Ok(repeats.len())
    }

    /// Stamps, tokenises and forwards one uplink.
    pub async fn handle_up(&self, mut msg: UplinkMessage) -> Result<(), GsError> {
        validation::validate_uplink(&msg)?;
        let now = SystemTime::now();
        msg.received_at = Some(time::to_proto(now));
        msg.correlation_ids
            .push(format!("gs:uplink:{}", uuid::Uuid::new_v4()));
        for md in &mut msg.rx_metadata {
            md.gateway_ids = Some(self.ids.clone());
            if md.uplink_token.is_empty() {
                let gateway_time = md.time.as_ref().and_then(time::from_proto);
                md.uplink_token = uplink_token::mint(
                    &self.ids,
                    md.antenna_index,
                    md.timestamp,
                    i64::from(md.timestamp),
                    now,
                    gateway_time,
                );
            }
            md.received_at = msg.received_at.clone();
        }
        {
            let mut state = self.state();
            state.stats.uplink_count += 1;
            state.stats.last_uplink_received_at = Some(now);
            if !self.explicit_clock.load(Ordering::Acquire) {
                let timestamp = msg.timestamp();
                if timestamp != 0 {
                    state.clock = Some(ClockSync {
                        timestamp,
                        concentrator_time: i64::from(timestamp),
                        server_time: now,
                        synced_at: Instant::now(),
                    });
                }
            }
        }
        self.send_up(UpstreamMessage::Uplink(msg)).await
    }

    pub async fn handle_status(&self, mut status: GatewayStatus) -> Result<(), GsError> {
        let now = SystemTime::now();
        if status.time.is_none() {
            status.time = Some(time::to_proto(now));
        }
        {
            let mut state = self.state();
            state.stats.last_status_received_at = Some(now);
            state.stats.last_status = Some(status.clone());
        }
        self.send_up(UpstreamMessage::Status(status)).await
    }

    pub async fn handle_tx_ack(&self, ack: TxAcknowledgment) -> Result<(), GsError> {
        {
            let mut state = self.state();
            state.stats.tx_ack_count += 1;
            state.stats.last_tx_ack_received_at = Some(SystemTime::now());
        }
        self.send_up(UpstreamMessage::TxAck(ack)).await
    }

    /// Records the relation between the concentrator clock and server time.
    ///
    /// Once called, uplink timestamps no longer move the clock.
    pub fn sync_clock(&self, timestamp: u32, concentrator_time: i64, server_time: SystemTime) {
        self.explicit_clock.store(true, Ordering::Release);
        self.state().clock = Some(ClockSync {
            timestamp,
            concentrator_time,
            server_time,
            synced_at: Instant::now(),
        });
    }

    pub fn clock(&self) -> Option<ClockSync> {
        self.state().clock
    }

    /// Schedules a downlink on this gateway and queues it for the frontend.
    ///
    /// # Errors
    ///
    /// * `Unavailable` when the connection is gone or its downlink queue is full.
    /// * Any error from resolving the request, see [`scheduling::schedule`].
    pub fn schedule_down(
        &self,
        path: &DownlinkPath,
        msg: DownlinkMessage,
    ) -> Result<DownlinkMessage, GsError> {
        if self.disconnected.load(Ordering::Acquire) {
            return Err(GsError::Unavailable(format!(
                "gateway `{}` is not connected",
                self.uid()
            )));
        }
        let plan = msg
            .request()
            .map(|r| r.frequency_plan_id.as_str())
            .filter(|id| !id.is_empty())
            .and_then(|id| self.plans.get(id))
            .unwrap_or(&self.primary_plan)
            .clone();
        let antenna_index = match &path.path {
            Some(crate::model::downlink_path::Path::Fixed(ids)) => ids.antenna_index,
            _ => 0,
        };
        let ctx = ScheduleContext {
            plan: &plan,
            antenna_gain: self.gateway.antenna_gain(antenna_index),
            clock: self.clock(),
            now: SystemTime::now(),
            now_instant: Instant::now(),
        };
        let scheduled = scheduling::schedule(msg, path, &ctx)?;
        let message = scheduled.message.clone();
        match self.down_tx.try_send(scheduled) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(gateway_uid = %self.uid(), "Downlink queue full");
                return Err(GsError::Unavailable("downlink queue full".into()));
            }
            Err(TrySendError::Closed(_)) => return Err(GsError::Canceled),
        }
        let mut state = self.state();
        state.stats.downlink_count += 1;
        state.stats.last_downlink_received_at = Some(SystemTime::now());
        Ok(message)
    }

    /// Waits for the next scheduled downlink. Returns `None` once disconnected.
    pub async fn recv_down(&self) -> Option<Scheduled> {
        let mut rx = self.down_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            down = rx.recv() => down,
        }
    }

    pub fn record_rtt(&self, rtt: Duration, at: Instant) {
        self.state().rtt.record(rtt, at);
    }

    pub fn rtt_stats(&self, percentile: u32, now: Instant) -> Option<RttSummary> {
        self.state().rtt.stats(percentile, now)
    }

    pub fn stats(&self) -> ConnectionStats {
        let state = self.state();
        let mut stats = state.stats.clone();
        stats.round_trip_times = state.rtt.stats(50, Instant::now());
        stats
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// The error this connection was disconnected with, if any.
    pub fn error(&self) -> Option<GsError> {
        self.state().error.clone()
    }

    /// Returns a guard that disconnects this connection when dropped.
    ///
    /// Frontends hold one for the lifetime of their session task so that a task that
    /// returns early or unwinds never leaves the gateway registered.
    pub fn disconnect_on_drop(self: &Arc<Self>) -> DisconnectGuard {
        DisconnectGuard(Arc::clone(self))
    }

    /// Disconnects the gateway. Only the first call has any effect.
    pub fn disconnect(&self, err: GsError) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(gateway_uid = %self.uid(), error = %err, "Disconnecting gateway");
        let stats = {
            let mut state = self.state();
            state.stats.disconnected_at = Some(SystemTime::now());
            state.error = Some(err.clone());
            let mut stats = state.stats.clone();
            stats.round_trip_times = state.rtt.stats(50, Instant::now());
            stats
        };
        self.token.cancel();
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self, stats);
        }
        self.events
            .publish(events::GATEWAY_DISCONNECT, self.uid(), Some(err.to_string()));
    }
}

/// See [`Connection::disconnect_on_drop`].
#[must_use = "the connection is disconnected as soon as the guard is dropped"]
pub struct DisconnectGuard(Arc<Connection>);

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.0.is_disconnected() {
            return;
        }
        let err = if std::thread::panicking() {
            GsError::Internal("session task panicked".into())
        } else {
            GsError::Canceled
        };
        self.0.disconnect(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::frontend::DutyCycleStyle;
    use crate::model::frequency_plan::eu_863_870_ttn;
    use crate::model::{downlink_message, RxMetadata, TxSettings};
    use crate::utils::ErrorCode;

    #[derive(Debug)]
    struct TestFrontend;

    impl Frontend for TestFrontend {
        fn protocol(&self) -> &'static str {
            "test"
        }

        fn duty_cycle_style(&self) -> DutyCycleStyle {
            DutyCycleStyle::BlockingWindows
        }
    }

    fn connection(options: ConnectionOptions) -> Connection {
        let plan = Arc::new(eu_863_870_ttn());
        let gateway = Gateway {
            gateway_id: "test-gateway".into(),
            frequency_plan_id: plan.id.clone(),
            ..Default::default()
        };
        let plans = HashMap::from([(plan.id.clone(), plan)]);
        Connection::new(
            gateway,
            Arc::new(TestFrontend),
            "127.0.0.1:1234".into(),
            plans,
            options,
            EventBus::default(),
            Weak::new(),
        )
        .unwrap()
    }

    fn uplink(payload: &[u8], rssi: f32) -> UplinkMessage {
        UplinkMessage {
            raw_payload: payload.to_vec(),
            settings: Some(TxSettings {
                data_rate: Some(crate::model::DataRate::lora(7, 125_000, "4/5")),
                frequency: 868_100_000,
                timestamp: 1000,
                ..Default::default()
            }),
            rx_metadata: vec![RxMetadata {
                timestamp: 1000,
                channel_rssi: rssi,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn scheduled_down() -> DownlinkMessage {
        DownlinkMessage {
            raw_payload: vec![0x60, 1, 2],
            settings: Some(downlink_message::Settings::Scheduled(TxSettings {
                frequency: 869_525_000,
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn uplinks_are_deduplicated_tokenised_and_counted() {
        let conn = connection(ConnectionOptions::default());
        let mut upstream = conn.take_upstream().unwrap();
        assert!(conn.take_upstream().is_none());

        let repeats = conn
            .handle_uplinks(vec![uplink(b"a", -69.0), uplink(b"a", -42.0), uplink(b"a", -69.0)])
            .await
            .unwrap();
        assert_eq!(repeats, 2);

        match upstream.recv().await.unwrap() {
            UpstreamMessage::Uplink(up) => {
                assert_eq!(up.rx_metadata[0].channel_rssi, -42.0);
                assert!(up.received_at.is_some());
                assert!(up.correlation_ids[0].starts_with("gs:uplink:"));
                let token = uplink_token::decode(&up.rx_metadata[0].uplink_token).unwrap();
                assert_eq!(token.timestamp, 1000);
                assert_eq!(token.gateway_ids().unwrap().gateway_id, "test-gateway");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(conn.stats().uplink_count, 1);
        assert_eq!(conn.clock().unwrap().timestamp, 1000);
    }

    #[tokio::test]
    async fn full_downlink_queue_is_unavailable() {
        let conn = connection(ConnectionOptions {
            upstream_buffer: 1,
            downstream_buffer: 1,
        });
        let path = DownlinkPath::fixed(conn.ids().clone(), 0);
        conn.schedule_down(&path, scheduled_down()).unwrap();
        let err = conn.schedule_down(&path, scheduled_down()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unavailable);

        let down = conn.recv_down().await.unwrap();
        assert_eq!(down.message, scheduled_down());
        assert_eq!(conn.stats().downlink_count, 1);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_cancels() {
        let conn = connection(ConnectionOptions::default());
        let mut events = conn.events.subscribe();
        conn.disconnect(GsError::Canceled);
        conn.disconnect(GsError::Internal("second".into()));

        assert!(conn.context().is_cancelled());
        assert!(conn.recv_down().await.is_none());
        assert!(matches!(conn.error(), Some(GsError::Canceled)));
        assert!(conn.stats().disconnected_at.is_some());

        let event = events.recv().await.unwrap();
        assert_eq!(event.name, events::GATEWAY_DISCONNECT);
        assert!(events.try_recv().is_err());

        let path = DownlinkPath::fixed(conn.ids().clone(), 0);
        assert_eq!(
            conn.schedule_down(&path, scheduled_down()).unwrap_err().code(),
            ErrorCode::Unavailable
        );
        assert_eq!(
            conn.handle_status(GatewayStatus::default()).await.unwrap_err().code(),
            ErrorCode::Canceled
        );
    }

    #[tokio::test]
    async fn gateway_supplied_receive_times_are_replaced() {
        let conn = connection(ConnectionOptions::default());
        let mut upstream = conn.take_upstream().unwrap();
        let stale = time::to_proto(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000));
        let mut msg = uplink(b"b", -50.0);
        msg.received_at = Some(stale.clone());
        msg.rx_metadata[0].received_at = Some(stale.clone());
        let before = SystemTime::now();
        conn.handle_up(msg).await.unwrap();

        let UpstreamMessage::Uplink(up) = upstream.recv().await.unwrap() else {
            panic!("expected uplink");
        };
        let received_at = time::from_proto(up.received_at.as_ref().unwrap()).unwrap();
        assert!(received_at >= before);
        assert_ne!(up.rx_metadata[0].received_at, Some(stale));
        assert_eq!(up.rx_metadata[0].received_at, up.received_at);
    }

    #[tokio::test]
    async fn panicking_session_disconnects_through_its_guard() {
        let conn = Arc::new(connection(ConnectionOptions::default()));
        let guard = conn.disconnect_on_drop();
        let task = tokio::spawn(async move {
            let _guard = guard;
            panic!("malformed frame");
        });
        assert!(task.await.unwrap_err().is_panic());

        assert!(conn.is_disconnected());
        assert!(conn.context().is_cancelled());
        assert!(matches!(conn.error(), Some(GsError::Internal(_))));
    }

    #[test]
    fn guard_keeps_the_first_disconnect_reason() {
        let conn = Arc::new(connection(ConnectionOptions::default()));
        {
            let _guard = conn.disconnect_on_drop();
            conn.disconnect(GsError::Connection("socket closed".into()));
        }
        assert!(matches!(conn.error(), Some(GsError::Connection(_))));

        let other = Arc::new(connection(ConnectionOptions::default()));
        drop(other.disconnect_on_drop());
        assert!(matches!(other.error(), Some(GsError::Canceled)));
    }

    #[test]
    fn rtt_is_reported_in_stats() {
        let conn = connection(ConnectionOptions::default());
        let now = Instant::now();
        conn.record_rtt(Duration::from_millis(20), now);
        conn.record_rtt(Duration::from_millis(40), now);
        let rtt = conn.rtt_stats(100, now).unwrap();
        assert_eq!(rtt.max, Duration::from_millis(40));
        assert_eq!(conn.stats().round_trip_times.unwrap().count, 2);
    }
}
