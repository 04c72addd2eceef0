mod activity;
mod client;
mod render;
mod ui;

use crate::activity::ActivityTracker;
use crate::client::{ClientCommand, ResilientClient, TransportDriver, TransportEvent};
use crate::render::RenderCoalescer;
use crate::ui::{render_ui, View};
use clap::Parser;
use crossterm::{
    event::{
        DisableFocusChange, EnableFocusChange, Event, EventStream, KeyCode, KeyEvent,
        KeyEventKind, KeyModifiers,
    },
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures_util::{Stream, StreamExt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use ratatui::{
    backend::{Backend, CrosstermBackend},
    Terminal,
};
use std::{fs::OpenOptions, io, path::PathBuf, sync::Mutex};
use telem_core::wire::WireMsg;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

const TRANSPORT_QUEUE_CAPACITY: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "telem-dashboard")]
struct Args {
    #[arg(long, env = "TELEM_WS_URL", default_value = "ws://127.0.0.1:8080/ws")]
    ws_url: String,
    #[arg(long, env = "TELEM_REST_BASE", default_value = "http://127.0.0.1:8080/api")]
    rest_base: String,
    #[arg(long, default_value_t = 16)]
    frame_ms: u64,
}

#[derive(Debug, Error)]
enum ConfigError {
    #[error("invalid {field} {value}: {reason}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("frame period must be greater than zero")]
    ZeroFrame,
}

#[derive(Clone, Debug)]
struct Config {
    ws_url: Url,
    rest_base: Url,
    frame: Duration,
}

impl Config {
    fn from_args(args: Args) -> Result<Self, ConfigError> {
        let ws_url = parse_url("ws url", &args.ws_url, &["ws", "wss"])?;
        let rest_base = parse_url("rest base", &args.rest_base, &["http", "https"])?;
        if args.frame_ms == 0 {
            return Err(ConfigError::ZeroFrame);
        }
        Ok(Self {
            ws_url,
            rest_base,
            frame: Duration::from_millis(args.frame_ms),
        })
    }
}

fn parse_url(field: &'static str, raw: &str, schemes: &[&str]) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        field,
        value: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw.trim()).map_err(|err| invalid(err.to_string()))?;
    if !schemes.contains(&url.scheme()) {
        return Err(invalid(format!("scheme must be one of {}", schemes.join("/"))));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

struct App {
    config: Config,
    client: ResilientClient<StdRng>,
    driver: TransportDriver,
    tracker: ActivityTracker,
    coalescer: RenderCoalescer,
    note: Option<String>,
}

impl App {
    fn new(config: Config, events: mpsc::Sender<TransportEvent>) -> Self {
        let driver = TransportDriver::new(config.ws_url.to_string(), events);
        let coalescer = RenderCoalescer::new(config.frame);
        Self {
            config,
            client: ResilientClient::new(StdRng::from_entropy()),
            driver,
            tracker: ActivityTracker::new(),
            coalescer,
            note: None,
        }
    }

    fn run_command(&mut self, command: Option<ClientCommand>) {
        if let Some(command) = command {
            self.driver.execute(command);
            self.coalescer.request_render(Instant::now());
        }
    }

    fn apply_transport_event(&mut self, event: TransportEvent, now: Instant) {
        if self.client.is_torn_down() {
            return;
        }
        match event {
            TransportEvent::Opened(id) => {
                if self.client.on_open(id) {
                    self.note = None;
                    self.coalescer.request_render(now);
                }
            }
            TransportEvent::Closed(id, err) => {
                if let Some(delay) = self.client.on_closed(id, err.as_ref(), now) {
                    self.note = Some(format!("reconnecting in {}ms", delay.as_millis()));
                }
                self.coalescer.request_render(now);
            }
            TransportEvent::Frame(id, raw) => {
                if let Some(msg) = self.client.on_frame(id, &raw) {
                    self.dispatch(msg, now);
                }
            }
        }
    }

    fn dispatch(&mut self, msg: WireMsg, now: Instant) {
        let render = &mut self.coalescer;
        match msg {
            WireMsg::Info { message } => {
                info!(event = "hub_info", message = %message);
            }
            WireMsg::Telemetry(payload) => {
                self.tracker.on_telemetry(&payload, now, render);
            }
            WireMsg::DeviceJoin { device } => {
                self.tracker.on_device_join(&device, now, render);
            }
            WireMsg::DeviceExit { ip, name } => {
                self.tracker.on_device_exit(&ip, &name, now, render);
            }
            WireMsg::DeviceSnapshot { devices } => {
                self.tracker.on_snapshot(&devices, now, render);
            }
            WireMsg::DeviceStatus(payload) => {
                self.tracker.on_device_status(&payload, now, render);
            }
            WireMsg::Error { message } => {
                warn!(event = "hub_error", message = %message);
                self.note = Some(format!("hub error: {message}"));
                render.request_render(now);
            }
        }
    }

    /// Cancels the reconnect timer, closes the socket, drops every decay
    /// and any pending frame.
    fn teardown(&mut self) {
        let command = self.client.teardown();
        if let Some(command) = command {
            self.driver.execute(command);
        }
        self.tracker.cancel_all();
        self.coalescer.cancel();
    }

    fn view(&self) -> View<'_> {
        View {
            connection: self.client.state(),
            visible: self.client.is_visible(),
            torn_down: self.client.is_torn_down(),
            ws_url: self.config.ws_url.as_str(),
            rest_base: self.config.rest_base.as_str(),
            tracker: &self.tracker,
            note: self.note.as_deref(),
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let config = match Config::from_args(Args::parse()) {
        Ok(config) => config,
        Err(err) => {
            error!(event = "config_invalid", error = %err);
            return Err(err.into());
        }
    };
    info!(event = "dashboard_start", ws_url = %config.ws_url, rest_base = %config.rest_base);

    let (transport_tx, mut transport_rx) = mpsc::channel(TRANSPORT_QUEUE_CAPACITY);
    let mut app = App::new(config, transport_tx);

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableFocusChange)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    let mut events = EventStream::new();

    let command = app.client.start();
    app.run_command(command);
    app.coalescer.request_render(Instant::now());

    let outcome = run_dashboard(&mut app, &mut terminal, &mut transport_rx, &mut events).await;
    info!(event = "dashboard_stop", renders = app.coalescer.renders());
    let restored = restore_terminal(&mut terminal);
    if let Err(err) = &outcome {
        error!(event = "draw_error", error = %err);
    }
    outcome?;
    restored?;
    Ok(())
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        DisableFocusChange,
        LeaveAlternateScreen
    )?;
    terminal.show_cursor()
}

/// Runs until quit or a failed draw. The client is torn down either way.
async fn run_dashboard<B, S>(
    app: &mut App,
    terminal: &mut Terminal<B>,
    transport_rx: &mut mpsc::Receiver<TransportEvent>,
    events: &mut S,
) -> io::Result<()>
where
    B: Backend,
    S: Stream<Item = io::Result<Event>> + Unpin,
{
    let outcome = loop {
        let reconnect_at = app.client.reconnect_deadline();
        let decay_at = app.tracker.next_deadline();
        let frame_at = app.coalescer.deadline();
        tokio::select! {
            Some(event) = transport_rx.recv() => {
                app.apply_transport_event(event, Instant::now());
            }
            _ = sleep_until_opt(reconnect_at) => {
                let command = app.client.poll_reconnect(Instant::now());
                app.run_command(command);
            }
            _ = sleep_until_opt(decay_at) => {
                let now = Instant::now();
                app.tracker.poll_expired(now, &mut app.coalescer);
            }
            _ = sleep_until_opt(frame_at) => {
                if app.coalescer.begin_frame(Instant::now()) {
                    let drawn = terminal.draw(|frame| render_ui(frame, &app.view()));
                    app.coalescer.end_frame();
                    if let Err(err) = drawn {
                        break Err(err);
                    }
                }
            }
            maybe_event = events.next() => {
                match maybe_event {
                    Some(Ok(event)) => {
                        if handle_input(event, app) {
                            break Ok(());
                        }
                    }
                    Some(Err(err)) => {
                        warn!(event = "input_error", error = %err);
                    }
                    None => break Ok(()),
                }
            }
        }
    };
    app.teardown();
    outcome
}

/// Returns true when the dashboard should exit.
fn handle_input(event: Event, app: &mut App) -> bool {
    match event {
        Event::Key(key) if key.kind == KeyEventKind::Press => handle_key(key, app),
        Event::FocusLost => {
            let command = app.client.set_visible(false);
            app.run_command(command);
            false
        }
        Event::FocusGained => {
            let command = app.client.set_visible(true);
            app.run_command(command);
            false
        }
        Event::Resize(_, _) => {
            app.coalescer.request_render(Instant::now());
            false
        }
        _ => false,
    }
}

fn handle_key(key: KeyEvent, app: &mut App) -> bool {
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => true,
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => true,
        KeyCode::Char('v') => {
            let command = app.client.toggle_visible();
            app.run_command(command);
            app.coalescer.request_render(Instant::now());
            false
        }
        _ => false,
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_enabled = matches!(
        std::env::var("TELEM_LOG_STDOUT").ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE") | Some("yes") | Some("YES")
    );
    if stdout_enabled {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
        return;
    }
    if let Some(file) = open_log_file() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init();
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::sink)
        .try_init();
}

fn open_log_file() -> Option<std::fs::File> {
    let dir = std::env::var("TELEM_LOG_DIR").ok()?;
    if dir.trim().is_empty() {
        return None;
    }
    let dir = PathBuf::from(dir);
    std::fs::create_dir_all(&dir).ok()?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("telem-dashboard.log"))
        .ok()
}
