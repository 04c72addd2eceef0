use futures_util::StreamExt;
use rand::Rng;
use telem_core::wire::{decode_text, WireMsg};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const BASE_DELAY_MS: u64 = 1000;
const MAX_DELAY_MS: u64 = 30_000;
const MAX_JITTER_MS: u64 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Connected,
    Disconnected,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Connecting => "connecting",
            Phase::Connected => "connected",
            Phase::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub phase: Phase,
    /// Consecutive failures since the last successful open.
    pub reconnect_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Identifies one transport attempt. Events from an attempt the client
/// has already let go of are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand {
    Connect(TransportId),
    Close(TransportId),
}

/// Delay before reconnect attempt `attempts` (0-indexed).
pub fn reconnect_delay<R: Rng>(attempts: u32, rng: &mut R) -> Duration {
    let base = BASE_DELAY_MS
        .saturating_mul(2u64.saturating_pow(attempts))
        .min(MAX_DELAY_MS);
    Duration::from_millis(base + rng.gen_range(0..=MAX_JITTER_MS))
}

/// Connection lifecycle without any I/O. The driver executes the returned
/// commands and feeds transport events back in.
#[derive(Debug)]
pub struct ResilientClient<R> {
    state: ConnectionState,
    transport: Option<TransportId>,
    next_transport: u64,
    reconnect_at: Option<Instant>,
    visible: bool,
    torn_down: bool,
    rng: R,
}

impl<R: Rng> ResilientClient<R> {
    pub fn new(rng: R) -> Self {
        Self {
            state: ConnectionState {
                phase: Phase::Disconnected,
                reconnect_attempts: 0,
            },
            transport: None,
            next_transport: 0,
            reconnect_at: None,
            visible: true,
            torn_down: false,
            rng,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn start(&mut self) -> Option<ClientCommand> {
        if self.torn_down || !self.visible || self.transport.is_some() {
            return None;
        }
        Some(self.connect())
    }

    fn connect(&mut self) -> ClientCommand {
        self.reconnect_at = None;
        self.next_transport += 1;
        let id = TransportId(self.next_transport);
        self.transport = Some(id);
        self.state.phase = Phase::Connecting;
        info!(
            event = "ws_connecting",
            attempt = self.state.reconnect_attempts
        );
        ClientCommand::Connect(id)
    }

    fn is_current(&self, id: TransportId) -> bool {
        !self.torn_down && self.transport == Some(id)
    }

    pub fn on_open(&mut self, id: TransportId) -> bool {
        if !self.is_current(id) {
            return false;
        }
        self.state = ConnectionState {
            phase: Phase::Connected,
            reconnect_attempts: 0,
        };
        info!(event = "ws_connected");
        true
    }

    /// Handles an error or close. Returns the scheduled reconnect delay, if
    /// any.
    pub fn on_closed(
        &mut self,
        id: TransportId,
        error: Option<&ClientError>,
        now: Instant,
    ) -> Option<Duration> {
        if !self.is_current(id) {
            return None;
        }
        self.transport = None;
        self.state.phase = Phase::Disconnected;
        if !self.visible {
            return None;
        }
        let delay = reconnect_delay(self.state.reconnect_attempts, &mut self.rng);
        self.reconnect_at = Some(now + delay);
        warn!(
            event = "ws_disconnected",
            error = ?error,
            attempt = self.state.reconnect_attempts,
            retry_ms = delay.as_millis() as u64
        );
        self.state.reconnect_attempts = self.state.reconnect_attempts.saturating_add(1);
        Some(delay)
    }

    /// Fires the reconnect timer when due.
    pub fn poll_reconnect(&mut self, now: Instant) -> Option<ClientCommand> {
        match self.reconnect_at {
            Some(at) if at <= now && !self.torn_down && self.transport.is_none() => {
                Some(self.connect())
            }
            _ => None,
        }
    }

    /// Hidden closes the transport without scheduling a retry. Visible
    /// reconnects at once when nothing is live.
    pub fn set_visible(&mut self, visible: bool) -> Option<ClientCommand> {
        if self.torn_down || self.visible == visible {
            return None;
        }
        self.visible = visible;
        if visible {
            info!(event = "ws_resume");
            return self.start();
        }
        info!(event = "ws_suspend");
        self.reconnect_at = None;
        self.state.phase = Phase::Disconnected;
        self.transport.take().map(ClientCommand::Close)
    }

    pub fn toggle_visible(&mut self) -> Option<ClientCommand> {
        self.set_visible(!self.visible)
    }

    /// Terminal. No event is acted on afterwards.
    pub fn teardown(&mut self) -> Option<ClientCommand> {
        if self.torn_down {
            return None;
        }
        self.torn_down = true;
        self.reconnect_at = None;
        self.state.phase = Phase::Disconnected;
        info!(event = "ws_teardown");
        self.transport.take().map(ClientCommand::Close)
    }

    /// Parses one inbound frame. Bad frames are logged and dropped without
    /// touching the connection state.
    pub fn on_frame(&mut self, id: TransportId, raw: &[u8]) -> Option<WireMsg> {
        if !self.is_current(id) {
            return None;
        }
        match decode_text(raw) {
            Ok(msg) => Some(msg),
            Err(err) => {
                warn!(event = "frame_discarded", error = %err);
                None
            }
        }
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    Opened(TransportId),
    Frame(TransportId, Vec<u8>),
    Closed(TransportId, Option<ClientError>),
}

/// Owns at most one live socket task.
pub struct TransportDriver {
    url: String,
    events: mpsc::Sender<TransportEvent>,
    active: Option<(TransportId, oneshot::Sender<()>)>,
}

impl TransportDriver {
    pub fn new(url: String, events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            url,
            events,
            active: None,
        }
    }

    pub fn execute(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Connect(id) => {
                self.close_active();
                let (close_tx, close_rx) = oneshot::channel();
                tokio::spawn(run_transport(
                    self.url.clone(),
                    id,
                    self.events.clone(),
                    close_rx,
                ));
                self.active = Some((id, close_tx));
            }
            ClientCommand::Close(id) => {
                if matches!(&self.active, Some((active, _)) if *active == id) {
                    self.close_active();
                }
            }
        }
    }

    fn close_active(&mut self) {
        if let Some((id, close_tx)) = self.active.take() {
            debug!(event = "ws_close_requested", transport = id.0);
            let _ = close_tx.send(());
        }
    }
}

async fn run_transport(
    url: String,
    id: TransportId,
    events: mpsc::Sender<TransportEvent>,
    mut close_rx: oneshot::Receiver<()>,
) {
    let connect = tokio::select! {
        result = connect_async(url.as_str()) => result,
        _ = &mut close_rx => return,
    };
    let (mut ws, _) = match connect {
        Ok(value) => value,
        Err(err) => {
            let _ = events
                .send(TransportEvent::Closed(
                    id,
                    Some(ClientError::Connect(err.to_string())),
                ))
                .await;
            return;
        }
    };
    if events.send(TransportEvent::Opened(id)).await.is_err() {
        let _ = ws.close(None).await;
        return;
    }

    let error = loop {
        tokio::select! {
            _ = &mut close_rx => {
                let _ = ws.close(None).await;
                return;
            }
            msg = ws.next() => {
                let frame = match msg {
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Binary(bytes))) => bytes,
                    Some(Ok(Message::Close(_))) | None => break None,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => break Some(ClientError::Transport(err.to_string())),
                };
                if events.send(TransportEvent::Frame(id, frame)).await.is_err() {
                    let _ = ws.close(None).await;
                    return;
                }
            }
        }
    };
    let _ = events.send(TransportEvent::Closed(id, error)).await;
}
