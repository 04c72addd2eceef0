use crate::broadcast::BroadcastHub;
use crate::engine::{EngineConfig, TransactionEngine};
use crate::liveness::LivenessMonitor;
use crate::population::{ChurnEvent, DevicePopulationManager, PopulationConfig};
use crate::registry::DeviceRegistry;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use telem_core::wire::{DeviceStatusPayload, TelemetryPayload, TelemetryUpdate, WireMsg};
use telem_core::{Device, Liveness, Metrics, Stage};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const COMMAND_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub engine_tick: Duration,
    pub population_tick: Duration,
    pub liveness_tick: Duration,
    pub offline_after: Duration,
    pub max_devices: usize,
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            engine_tick: Duration::from_millis(500),
            population_tick: Duration::from_secs(8),
            liveness_tick: Duration::from_secs(2),
            offline_after: Duration::from_secs(10),
            max_devices: 12,
            seed: None,
        }
    }
}

/// Last metrics broadcast for a device, whether simulated or reported.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub device_id: String,
    pub name: String,
    pub address: String,
    pub stage: Option<Stage>,
    pub metrics: Metrics,
    pub reported_status: Option<Liveness>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    #[error("device not found: {0}")]
    UnknownDevice(String),
    #[error("simulation unavailable")]
    Unavailable,
}

pub enum SimCommand {
    Devices {
        reply: oneshot::Sender<Vec<Device>>,
    },
    Metrics {
        reply: oneshot::Sender<Vec<MetricsSnapshot>>,
    },
    Ingest {
        update: TelemetryUpdate,
        reply: oneshot::Sender<Result<Device, SimError>>,
    },
}

/// Cloneable mailbox into the simulation task. Nothing outside that task
/// touches the registry or the transaction map.
#[derive(Clone, Debug)]
pub struct SimHandle {
    commands: mpsc::Sender<SimCommand>,
}

impl SimHandle {
    pub async fn devices(&self) -> Result<Vec<Device>, SimError> {
        let (reply, rx) = oneshot::channel();
        self.request(SimCommand::Devices { reply }).await?;
        rx.await.map_err(|_| SimError::Unavailable)
    }

    pub async fn metrics(&self) -> Result<Vec<MetricsSnapshot>, SimError> {
        let (reply, rx) = oneshot::channel();
        self.request(SimCommand::Metrics { reply }).await?;
        rx.await.map_err(|_| SimError::Unavailable)
    }

    pub async fn ingest(&self, update: TelemetryUpdate) -> Result<Device, SimError> {
        let (reply, rx) = oneshot::channel();
        self.request(SimCommand::Ingest { update, reply }).await?;
        rx.await.map_err(|_| SimError::Unavailable)?
    }

    async fn request(&self, command: SimCommand) -> Result<(), SimError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SimError::Unavailable)
    }
}

pub struct Simulation<R> {
    registry: DeviceRegistry,
    engine: TransactionEngine,
    population: DevicePopulationManager,
    liveness: LivenessMonitor,
    rng: R,
    last_metrics: BTreeMap<String, MetricsSnapshot>,
}

impl Simulation<StdRng> {
    pub fn from_config(config: &SimulationConfig, now: DateTime<Utc>) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let offline_after = chrono::Duration::from_std(config.offline_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(10));
        Self::new(
            DeviceRegistry::seeded(now),
            TransactionEngine::new(EngineConfig::default()),
            DevicePopulationManager::new(PopulationConfig {
                max_devices: config.max_devices,
                ..PopulationConfig::default()
            }),
            LivenessMonitor::new(offline_after),
            rng,
        )
    }
}

impl<R: Rng> Simulation<R> {
    pub fn new(
        registry: DeviceRegistry,
        engine: TransactionEngine,
        population: DevicePopulationManager,
        liveness: LivenessMonitor,
        rng: R,
    ) -> Self {
        Self {
            registry,
            engine,
            population,
            liveness,
            rng,
            last_metrics: BTreeMap::new(),
        }
    }

    pub fn engine_tick(&mut self, now: DateTime<Utc>) -> Vec<WireMsg> {
        let events = self.engine.tick(&mut self.registry, &mut self.rng, now);
        let mut messages = Vec::with_capacity(events.len());
        for event in &events {
            if let Some(device) = self.registry.get(&event.source_address) {
                self.last_metrics.insert(
                    event.source_address.clone(),
                    MetricsSnapshot {
                        device_id: device.id.clone(),
                        name: device.display_name.clone(),
                        address: device.address.clone(),
                        stage: Some(event.stage),
                        metrics: event.metrics,
                        reported_status: None,
                        updated_at: now,
                    },
                );
            }
            messages.push(WireMsg::Telemetry(TelemetryPayload::from(event)));
        }
        messages
    }

    pub fn population_tick(&mut self, now: DateTime<Utc>) -> Vec<WireMsg> {
        let churn = self
            .population
            .tick(&mut self.registry, &mut self.engine, &mut self.rng, now);
        match churn {
            Some(ChurnEvent::Joined(device)) => vec![WireMsg::DeviceJoin {
                device: device.descriptor(),
            }],
            Some(ChurnEvent::Exited(device)) => {
                self.last_metrics.remove(&device.address);
                vec![WireMsg::DeviceExit {
                    ip: device.address,
                    name: device.display_name,
                }]
            }
            None => Vec::new(),
        }
    }

    pub fn liveness_tick(&mut self, now: DateTime<Utc>) -> Vec<WireMsg> {
        self.liveness
            .sweep(&mut self.registry, now)
            .into_iter()
            .map(|change| {
                let metrics = self
                    .last_metrics
                    .get(&change.address)
                    .map(|snapshot| snapshot.metrics);
                WireMsg::DeviceStatus(DeviceStatusPayload {
                    ip: change.address,
                    name: change.name,
                    status: change.status,
                    metrics,
                })
            })
            .collect()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.registry.snapshot()
    }

    pub fn metrics(&self) -> Vec<MetricsSnapshot> {
        self.last_metrics.values().cloned().collect()
    }

    /// Merges externally reported telemetry. Reported status and metrics are
    /// layered onto the metrics snapshot; the registry only records the
    /// activity, liveness stays derived by the monitor.
    pub fn ingest(
        &mut self,
        update: TelemetryUpdate,
        now: DateTime<Utc>,
    ) -> Result<(Device, WireMsg), SimError> {
        let device = self
            .registry
            .find_by_id(&update.device_id)
            .or_else(|| self.registry.get(&update.device_id))
            .cloned()
            .ok_or_else(|| SimError::UnknownDevice(update.device_id.clone()))?;
        self.registry.touch(&device.address, now);

        let entry = self
            .last_metrics
            .entry(device.address.clone())
            .or_insert_with(|| MetricsSnapshot {
                device_id: device.id.clone(),
                name: device.display_name.clone(),
                address: device.address.clone(),
                stage: None,
                metrics: Metrics::default(),
                reported_status: None,
                updated_at: now,
            });
        if let Some(partial) = update.metrics {
            entry.metrics = partial.merge_into(entry.metrics);
        }
        if update.status.is_some() {
            entry.reported_status = update.status;
        }
        entry.updated_at = now;

        let message = WireMsg::DeviceStatus(DeviceStatusPayload {
            ip: device.address.clone(),
            name: device.display_name.clone(),
            status: update.status.unwrap_or(device.liveness),
            metrics: Some(entry.metrics),
        });
        Ok((device, message))
    }

    async fn handle_command(&mut self, command: SimCommand, hub: &BroadcastHub) {
        match command {
            SimCommand::Devices { reply } => {
                let _ = reply.send(self.devices());
            }
            SimCommand::Metrics { reply } => {
                let _ = reply.send(self.metrics());
            }
            SimCommand::Ingest { update, reply } => {
                let result = match self.ingest(update, Utc::now()) {
                    Ok((device, message)) => {
                        hub.broadcast(&message).await;
                        info!(event = "telemetry_merged", address = %device.address);
                        Ok(device)
                    }
                    Err(err) => {
                        warn!(event = "telemetry_rejected", error = %err);
                        Err(err)
                    }
                };
                let _ = reply.send(result);
            }
        }
    }
}

pub fn spawn(
    config: SimulationConfig,
    hub: Arc<BroadcastHub>,
    shutdown: watch::Receiver<bool>,
) -> (SimHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let simulation = Simulation::from_config(&config, Utc::now());
    let task = tokio::spawn(run(simulation, config, hub, rx, shutdown));
    (SimHandle { commands: tx }, task)
}

async fn publish(hub: &BroadcastHub, messages: Vec<WireMsg>) {
    for message in messages {
        let delivered = hub.broadcast(&message).await;
        debug!(event = "published", kind = message.kind(), delivered);
    }
}

async fn run<R: Rng + Send>(
    mut simulation: Simulation<R>,
    config: SimulationConfig,
    hub: Arc<BroadcastHub>,
    mut commands: mpsc::Receiver<SimCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    let start = Instant::now();
    let mut engine_ticker = interval_at(start + config.engine_tick, config.engine_tick);
    let mut population_ticker =
        interval_at(start + config.population_tick, config.population_tick);
    let mut liveness_ticker = interval_at(start + config.liveness_tick, config.liveness_tick);
    for ticker in [
        &mut engine_ticker,
        &mut population_ticker,
        &mut liveness_ticker,
    ] {
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    }
    info!(
        event = "simulation_start",
        devices = simulation.registry.len(),
        engine_tick_ms = config.engine_tick.as_millis() as u64
    );

    loop {
        tokio::select! {
            _ = engine_ticker.tick() => {
                let messages = simulation.engine_tick(Utc::now());
                publish(&hub, messages).await;
            }
            _ = population_ticker.tick() => {
                let messages = simulation.population_tick(Utc::now());
                publish(&hub, messages).await;
            }
            _ = liveness_ticker.tick() => {
                let messages = simulation.liveness_tick(Utc::now());
                publish(&hub, messages).await;
            }
            maybe_command = commands.recv() => {
                match maybe_command {
                    Some(command) => simulation.handle_command(command, &hub).await,
                    None => break,
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!(event = "simulation_stop");
}
