use crate::simulation::SimHandle;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use telem_core::{
    wire::{self, WireMsg},
    Device,
};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Mutex as AsyncMutex, Notify, RwLock,
};
use tracing::{debug, error, info, warn};

const GREETING: &str = "Connected to IoT telemetry stream";

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Outbound frames queued per session before new ones are dropped.
    pub session_buffer: usize,
    pub write_timeout: Duration,
    pub ping_interval: Duration,
    pub stale_after: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_buffer: 256,
            write_timeout: Duration::from_secs(2),
            ping_interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(30),
        }
    }
}

pub struct Session {
    conn_id: String,
    remote: SocketAddr,
    sender: mpsc::Sender<Message>,
    last_seen: AsyncMutex<Instant>,
    /// Fired once the hub drops the session, so the reader stops waiting
    /// on a peer that may never answer.
    released: Notify,
}

impl Session {
    pub fn new(conn_id: String, remote: SocketAddr, sender: mpsc::Sender<Message>) -> Self {
        Self {
            conn_id,
            remote,
            sender,
            last_seen: AsyncMutex::new(Instant::now()),
            released: Notify::new(),
        }
    }

    async fn touch(&self) {
        *self.last_seen.lock().await = Instant::now();
    }

    async fn last_seen(&self) -> Instant {
        *self.last_seen.lock().await
    }

    fn try_send_text(&self, text: &str) -> Result<(), TrySendError<Message>> {
        self.sender.try_send(Message::Text(text.to_string()))
    }

    fn close(&self, reason: &str) {
        let _ = self.sender.try_send(Message::Close(Some(CloseFrame {
            code: 1000,
            reason: reason.to_string().into(),
        })));
    }
}

/// Fans hub envelopes out to every connected session. Sends never wait on
/// a session: a full queue drops the frame, a closed one drops the session.
pub struct BroadcastHub {
    config: SessionConfig,
    conn_counter: AtomicU64,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl BroadcastHub {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            conn_counter: AtomicU64::new(0),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    pub async fn register(&self, session: Arc<Session>) {
        self.sessions
            .write()
            .await
            .insert(session.conn_id.clone(), session.clone());
        info!(
            event = "session_connected",
            conn_id = %session.conn_id,
            remote = %session.remote
        );
    }

    pub async fn remove(&self, session: &Session, reason: &str) {
        let removed = self.sessions.write().await.remove(&session.conn_id);
        if removed.is_none() {
            return;
        }
        session.close(reason);
        session.released.notify_one();
        info!(
            event = "session_disconnected",
            conn_id = %session.conn_id,
            remote = %session.remote,
            reason = reason
        );
    }

    #[cfg(test)]
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn is_registered(&self, conn_id: &str) -> bool {
        self.sessions.read().await.contains_key(conn_id)
    }

    async fn snapshot_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Returns how many sessions accepted the frame.
    pub async fn broadcast(&self, msg: &WireMsg) -> usize {
        let text = match wire::encode_text(msg) {
            Ok(value) => value,
            Err(err) => {
                error!(event = "encode_error", kind = msg.kind(), error = %err);
                return 0;
            }
        };
        let mut delivered = 0;
        for session in self.snapshot_sessions().await {
            match session.try_send_text(&text) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        event = "send_dropped",
                        conn_id = %session.conn_id,
                        kind = msg.kind()
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(event = "send_error", conn_id = %session.conn_id);
                    self.remove(&session, "send_error").await;
                }
            }
        }
        delivered
    }

    pub async fn broadcast_error(&self, message: &str) -> usize {
        self.broadcast(&WireMsg::Error {
            message: message.to_string(),
        })
        .await
    }

    fn send_to(&self, session: &Session, msg: &WireMsg) -> bool {
        match wire::encode_text(msg) {
            Ok(text) => session.try_send_text(&text).is_ok(),
            Err(err) => {
                error!(event = "encode_error", kind = msg.kind(), error = %err);
                false
            }
        }
    }

    pub fn start_stale_reaper(self: Arc<Self>) {
        if self.config.stale_after.is_zero() {
            return;
        }
        let stale_after = self.config.stale_after;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(stale_after / 2);
            loop {
                ticker.tick().await;
                for session in self.snapshot_sessions().await {
                    if session.last_seen().await.elapsed() > stale_after {
                        warn!(event = "stale_close", conn_id = %session.conn_id);
                        self.remove(&session, "stale").await;
                    }
                }
            }
        });
    }

    fn start_ping(self: Arc<Self>, session: Arc<Session>) {
        if self.config.ping_interval.is_zero() {
            return;
        }
        let interval = self.config.ping_interval;
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                ticker.tick().await;
                if !self.is_registered(&session.conn_id).await {
                    return;
                }
                let ping = session.sender.try_send(Message::Ping(Vec::new()));
                if let Err(TrySendError::Closed(_)) = ping {
                    warn!(event = "ping_failed", conn_id = %session.conn_id);
                    self.remove(&session, "ping_failed").await;
                    return;
                }
            }
        });
    }

    async fn send_greeting(&self, session: &Session, sim: &SimHandle) {
        let info = WireMsg::Info {
            message: GREETING.to_string(),
        };
        if !self.send_to(session, &info) {
            return;
        }
        match sim.devices().await {
            Ok(devices) => {
                let snapshot = WireMsg::DeviceSnapshot {
                    devices: devices.iter().map(Device::status_descriptor).collect(),
                };
                if self.send_to(session, &snapshot) {
                    debug!(
                        event = "snapshot_sent",
                        conn_id = %session.conn_id,
                        count = devices.len()
                    );
                }
            }
            Err(err) => warn!(
                event = "snapshot_error",
                conn_id = %session.conn_id,
                error = %err
            ),
        }
    }

    async fn handle_inbound(&self, session: &Session, data: &[u8], sim: &SimHandle) {
        let update = match wire::decode_inbound(data) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "message_invalid", conn_id = %session.conn_id, error = %err);
                self.broadcast_error(&format!("invalid message: {err}")).await;
                return;
            }
        };
        match sim.ingest(update).await {
            Ok(device) => debug!(
                event = "inbound_merged",
                conn_id = %session.conn_id,
                address = %device.address
            ),
            Err(err) => {
                warn!(event = "inbound_rejected", conn_id = %session.conn_id, error = %err);
                self.broadcast_error(&err.to_string()).await;
            }
        }
    }

    pub async fn handle_socket(
        self: Arc<Self>,
        socket: WebSocket,
        remote: SocketAddr,
        sim: SimHandle,
    ) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(self.config.session_buffer.max(1));
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                    Ok(Ok(())) if !closing => {}
                    _ => return,
                }
            }
        });

        let session = Arc::new(Session::new(self.next_conn_id(), remote, tx));
        self.register(session.clone()).await;
        self.clone().start_ping(session.clone());
        self.send_greeting(&session, &sim).await;

        loop {
            let next = tokio::select! {
                next = ws_receiver.next() => next,
                _ = session.released.notified() => {
                    debug!(event = "session_released", conn_id = %session.conn_id);
                    break;
                }
            };
            let Some(result) = next else {
                break;
            };
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %session.conn_id, error = %err);
                    break;
                }
            };
            let data = match msg {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = %session.conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {
                    session.touch().await;
                    continue;
                }
            };
            session.touch().await;
            self.handle_inbound(&session, &data, &sim).await;
        }

        self.remove(&session, "disconnect").await;
        drop(session);
        let _ = write_task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{self, SimulationConfig};
    use axum::{extract::ws::WebSocketUpgrade, routing::get, Router};
    use serde_json::Value;
    use tokio::sync::watch;

    fn quiet_sim(hub: Arc<BroadcastHub>) -> (SimHandle, watch::Sender<bool>) {
        let (stop, stop_rx) = watch::channel(false);
        let config = SimulationConfig {
            engine_tick: Duration::from_secs(3600),
            population_tick: Duration::from_secs(3600),
            liveness_tick: Duration::from_secs(3600),
            seed: Some(5),
            ..SimulationConfig::default()
        };
        let (sim, _task) = simulation::spawn(config, hub, stop_rx);
        (sim, stop)
    }

    fn session(id: &str, capacity: usize) -> (Arc<Session>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        let remote: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        (Arc::new(Session::new(id.to_string(), remote, tx)), rx)
    }

    fn text_of(msg: Message) -> Value {
        match msg {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_session() {
        let hub = BroadcastHub::new(SessionConfig::default());
        let (a, mut rx_a) = session("conn-a", 8);
        let (b, mut rx_b) = session("conn-b", 8);
        hub.register(a).await;
        hub.register(b).await;

        let delivered = hub
            .broadcast(&WireMsg::Info {
                message: "hello".to_string(),
            })
            .await;
        assert_eq!(delivered, 2);
        assert_eq!(text_of(rx_a.try_recv().unwrap())["message"], "hello");
        assert_eq!(text_of(rx_b.try_recv().unwrap())["type"], "info");
    }

    #[tokio::test]
    async fn full_session_is_skipped_without_blocking_others() {
        let hub = BroadcastHub::new(SessionConfig::default());
        let (slow, _rx_slow) = session("conn-slow", 1);
        slow.try_send_text("backlog").unwrap();
        let (fast, mut rx_fast) = session("conn-fast", 8);
        hub.register(slow).await;
        hub.register(fast).await;

        let delivered = hub.broadcast_error("bad frame").await;
        assert_eq!(delivered, 1);
        let frame = text_of(rx_fast.try_recv().unwrap());
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["message"], "bad frame");
        assert_eq!(hub.session_count().await, 2);
    }

    #[tokio::test]
    async fn closed_session_is_removed_on_send() {
        let hub = BroadcastHub::new(SessionConfig::default());
        let (gone, rx_gone) = session("conn-gone", 4);
        let (live, mut rx_live) = session("conn-live", 4);
        hub.register(gone).await;
        hub.register(live).await;
        drop(rx_gone);

        let delivered = hub
            .broadcast(&WireMsg::DeviceExit {
                ip: "192.168.1.106".to_string(),
                name: "IoT-Device-1".to_string(),
            })
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(hub.session_count().await, 1);
        assert!(rx_live.try_recv().is_ok());
    }

    #[tokio::test]
    async fn removed_session_gets_close_frame_and_misses_later_broadcasts() {
        let hub = BroadcastHub::new(SessionConfig::default());
        let (s, mut rx) = session("conn-1", 4);
        hub.register(s.clone()).await;
        hub.remove(&s, "test").await;
        assert!(matches!(rx.try_recv(), Ok(Message::Close(_))));

        hub.broadcast(&WireMsg::Info {
            message: "late".to_string(),
        })
        .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_inbound_frame_is_answered_with_error_broadcast() {
        let hub = Arc::new(BroadcastHub::new(SessionConfig::default()));
        let (sim, _stop) = quiet_sim(hub.clone());
        let (sender, _rx_sender) = session("conn-sender", 8);
        let (watcher, mut rx_watcher) = session("conn-watcher", 8);
        hub.register(sender.clone()).await;
        hub.register(watcher).await;

        hub.handle_inbound(&sender, b"{oops", &sim).await;
        let frame = text_of(rx_watcher.try_recv().unwrap());
        assert_eq!(frame["type"], "error");
        assert!(frame["message"]
            .as_str()
            .unwrap()
            .starts_with("invalid message: "));

        hub.handle_inbound(&sender, br#"{"type":"telemetry_update"}"#, &sim)
            .await;
        let frame = text_of(rx_watcher.try_recv().unwrap());
        assert_eq!(frame["type"], "error");
    }

    #[tokio::test]
    async fn inbound_update_for_unknown_device_broadcasts_not_found() {
        let hub = Arc::new(BroadcastHub::new(SessionConfig::default()));
        let (sim, _stop) = quiet_sim(hub.clone());
        let (sender, mut rx) = session("conn-sender", 8);
        hub.register(sender.clone()).await;

        hub.handle_inbound(
            &sender,
            br#"{"type":"telemetry_update","deviceId":"nope"}"#,
            &sim,
        )
        .await;
        let frame = text_of(rx.try_recv().unwrap());
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["message"], "device not found: nope");
    }

    #[tokio::test]
    async fn reaped_silent_session_releases_its_socket_task() {
        let hub = Arc::new(BroadcastHub::new(SessionConfig {
            stale_after: Duration::from_millis(200),
            ..SessionConfig::default()
        }));
        hub.clone().start_stale_reaper();
        let (sim, _stop) = quiet_sim(hub.clone());
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);

        let route_hub = hub.clone();
        let app = Router::new().route(
            "/ws",
            get(move |ws: WebSocketUpgrade| {
                let hub = route_hub.clone();
                let sim = sim.clone();
                let done = done_tx.clone();
                async move {
                    ws.on_upgrade(move |socket| async move {
                        let remote: SocketAddr = "127.0.0.1:9200".parse().unwrap();
                        hub.handle_socket(socket, remote, sim).await;
                        let _ = done.send(()).await;
                    })
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Handshake, then never read or write again.
        let (_silent, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();

        let finished = tokio::time::timeout(Duration::from_secs(5), done_rx.recv()).await;
        assert_eq!(finished.unwrap(), Some(()));
        assert_eq!(hub.session_count().await, 0);
    }
}
