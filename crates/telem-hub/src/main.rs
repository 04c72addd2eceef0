mod api;
mod broadcast;
mod engine;
mod liveness;
mod population;
mod registry;
mod simulation;

use crate::api::AppState;
use crate::broadcast::{BroadcastHub, SessionConfig};
use crate::registry::CORE_DEVICES;
use crate::simulation::SimulationConfig;
use anyhow::Context;
use clap::Parser;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "telem-hub")]
struct Args {
    #[arg(long, env = "TELEM_HUB_ADDR", default_value = "127.0.0.1:8080")]
    addr: String,
    #[arg(
        long,
        env = "TELEM_ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_value = "http://localhost:3000"
    )]
    allowed_origins: Vec<String>,
    #[arg(long, default_value_t = 500)]
    engine_tick_ms: u64,
    #[arg(long, default_value_t = 8000)]
    population_tick_ms: u64,
    #[arg(long, default_value_t = 2000)]
    liveness_tick_ms: u64,
    #[arg(long, default_value_t = 10_000)]
    offline_after_ms: u64,
    #[arg(long, default_value_t = 12)]
    max_devices: usize,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, env = "TELEM_LOG_DIR", default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = 30)]
    stale_seconds: u64,
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 256)]
    session_buffer: usize,
}

#[derive(Debug, Error)]
enum ConfigError {
    #[error("invalid listen address {addr}: {source}")]
    InvalidAddr {
        addr: String,
        source: std::net::AddrParseError,
    },
    #[error("at least one allowed origin is required")]
    NoOrigins,
    #[error("allowed origin must be http(s)://host[:port]: {0}")]
    InvalidOrigin(String),
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("max devices must be at least {min}, got {got}")]
    TooFewDevices { min: usize, got: usize },
}

#[derive(Clone, Debug)]
struct Config {
    addr: SocketAddr,
    allowed_origins: Vec<String>,
    simulation: SimulationConfig,
    sessions: SessionConfig,
}

impl Config {
    fn from_args(args: Args) -> Result<Self, ConfigError> {
        let addr = args
            .addr
            .trim()
            .parse()
            .map_err(|source| ConfigError::InvalidAddr {
                addr: args.addr.clone(),
                source,
            })?;

        let allowed_origins: Vec<String> = args
            .allowed_origins
            .iter()
            .map(|origin| origin.trim().trim_end_matches('/').to_string())
            .filter(|origin| !origin.is_empty())
            .collect();
        if allowed_origins.is_empty() {
            return Err(ConfigError::NoOrigins);
        }
        if let Some(bad) = allowed_origins.iter().find(|origin| !valid_origin(origin)) {
            return Err(ConfigError::InvalidOrigin(bad.clone()));
        }

        for (name, value) in [
            ("engine tick", args.engine_tick_ms),
            ("population tick", args.population_tick_ms),
            ("liveness tick", args.liveness_tick_ms),
            ("offline threshold", args.offline_after_ms),
            ("stale seconds", args.stale_seconds),
            ("ping interval", args.ping_interval),
            ("write timeout", args.write_timeout),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroValue(name));
            }
        }
        if args.session_buffer == 0 {
            return Err(ConfigError::ZeroValue("session buffer"));
        }
        if args.max_devices < CORE_DEVICES.len() {
            return Err(ConfigError::TooFewDevices {
                min: CORE_DEVICES.len(),
                got: args.max_devices,
            });
        }

        Ok(Self {
            addr,
            allowed_origins,
            simulation: SimulationConfig {
                engine_tick: Duration::from_millis(args.engine_tick_ms),
                population_tick: Duration::from_millis(args.population_tick_ms),
                liveness_tick: Duration::from_millis(args.liveness_tick_ms),
                offline_after: Duration::from_millis(args.offline_after_ms),
                max_devices: args.max_devices,
                seed: args.seed,
            },
            sessions: SessionConfig {
                session_buffer: args.session_buffer,
                write_timeout: Duration::from_secs(args.write_timeout),
                ping_interval: Duration::from_secs(args.ping_interval),
                stale_after: Duration::from_secs(args.stale_seconds),
            },
        })
    }
}

fn valid_origin(origin: &str) -> bool {
    let rest = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"));
    matches!(rest, Some(host) if !host.is_empty() && !host.contains('/'))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(args.debug || env_true("TELEM_HUB_DEBUG"), &args.log_dir);
    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(err) => {
            error!(event = "config_invalid", error = %err);
            return Err(err.into());
        }
    };

    let hub = Arc::new(BroadcastHub::new(config.sessions.clone()));
    hub.clone().start_stale_reaper();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (sim, sim_task) =
        simulation::spawn(config.simulation.clone(), hub.clone(), shutdown_rx);

    let app = api::router(AppState {
        hub,
        sim,
        allowed_origins: Arc::new(config.allowed_origins.clone()),
    });

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("binding {}", config.addr))?;

    info!(
        event = "hub_start",
        addr = %config.addr,
        origins = ?config.allowed_origins,
        max_devices = config.simulation.max_devices
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown");
    };

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await;
    if let Err(err) = &served {
        error!(event = "hub_error", error = %err);
    }

    let _ = shutdown_tx.send(true);
    if let Err(err) = sim_task.await {
        error!(event = "simulation_join_error", error = %err);
    }
    info!(event = "hub_stopped");
    served.context("serving")
}

fn init_logging(debug: bool, log_dir: &str) -> Option<LogGuard> {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("TELEM_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Tees log lines to stdout and, when configured, the hub log file.
struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("telem-hub.log"))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Result<Config, ConfigError> {
        let mut argv = vec!["telem-hub"];
        argv.extend_from_slice(extra);
        Config::from_args(Args::try_parse_from(argv).unwrap())
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = parse(&["--addr", "127.0.0.1:8080"]).unwrap();
        assert_eq!(config.addr.port(), 8080);
        assert_eq!(config.simulation.engine_tick, Duration::from_millis(500));
        assert_eq!(config.simulation.max_devices, 12);
        assert_eq!(config.sessions.session_buffer, 256);
    }

    #[test]
    fn origins_are_split_and_normalized() {
        let config = parse(&[
            "--allowed-origins",
            "http://localhost:3000/, https://ops.example.com",
        ])
        .unwrap();
        assert_eq!(
            config.allowed_origins,
            vec![
                "http://localhost:3000".to_string(),
                "https://ops.example.com".to_string()
            ]
        );
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            parse(&["--addr", "not-an-addr"]),
            Err(ConfigError::InvalidAddr { .. })
        ));
        assert!(matches!(
            parse(&["--allowed-origins", "ftp://files"]),
            Err(ConfigError::InvalidOrigin(_))
        ));
        assert!(matches!(
            parse(&["--engine-tick-ms", "0"]),
            Err(ConfigError::ZeroValue("engine tick"))
        ));
        assert!(matches!(
            parse(&["--max-devices", "3"]),
            Err(ConfigError::TooFewDevices { min: 5, got: 3 })
        ));
    }
}
