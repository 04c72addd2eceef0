use crate::registry::DeviceRegistry;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use telem_core::{Metrics, Stage, TelemetryEvent};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Share of the population the engine keeps busy.
    pub target_active_ratio: f64,
    /// Chance that a tick starts any new transactions at all.
    pub start_probability: f64,
    pub max_starts_per_tick: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            target_active_ratio: 0.8,
            start_probability: 0.7,
            max_starts_per_tick: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub device_address: String,
    pub current_stage: Stage,
    pub remaining_dwell_ticks: u32,
    pub started_at: DateTime<Utc>,
}

/// Dwell in engine ticks per stage. DECRYPT is the slowest step.
pub fn dwell_range(stage: Stage) -> RangeInclusive<u32> {
    match stage {
        Stage::Auth => 1..=2,
        Stage::Encrypt => 2..=3,
        Stage::Decrypt => 3..=5,
        Stage::Hash => 1..=2,
    }
}

/// Owns every in-flight transaction, at most one per device address.
#[derive(Debug, Default)]
pub struct TransactionEngine {
    config: EngineConfig,
    transactions: BTreeMap<String, Transaction>,
}

impl TransactionEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            transactions: BTreeMap::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.transactions.len()
    }

    #[cfg(test)]
    pub fn get(&self, address: &str) -> Option<&Transaction> {
        self.transactions.get(address)
    }

    #[cfg(test)]
    pub fn is_active(&self, address: &str) -> bool {
        self.transactions.contains_key(address)
    }

    /// Drops the transaction for a departed device.
    pub fn discard(&mut self, address: &str) -> Option<Transaction> {
        self.transactions.remove(address)
    }

    /// One engine period: start new transactions, then age every active one.
    pub fn tick<R: Rng>(
        &mut self,
        registry: &mut DeviceRegistry,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> Vec<TelemetryEvent> {
        self.start_transactions(registry, rng, now);
        self.advance(registry, rng, now)
    }

    fn start_transactions<R: Rng>(
        &mut self,
        registry: &DeviceRegistry,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> usize {
        let target = (registry.len() as f64 * self.config.target_active_ratio).ceil() as usize;
        let active = self.active_count();
        if active >= target {
            return 0;
        }
        let idle: Vec<&str> = registry
            .iter()
            .map(|device| device.address.as_str())
            .filter(|address| !self.transactions.contains_key(*address))
            .collect();
        if idle.is_empty() || !rng.gen_bool(self.config.start_probability) {
            return 0;
        }
        let wanted = rng
            .gen_range(1..=self.config.max_starts_per_tick.max(1))
            .min(target - active)
            .min(idle.len());
        let chosen: Vec<String> = idle
            .choose_multiple(rng, wanted)
            .map(|address| address.to_string())
            .collect();
        for address in &chosen {
            let dwell = rng.gen_range(dwell_range(Stage::Auth));
            debug!(event = "transaction_started", address = %address, dwell);
            self.transactions.insert(
                address.clone(),
                Transaction {
                    device_address: address.clone(),
                    current_stage: Stage::Auth,
                    remaining_dwell_ticks: dwell,
                    started_at: now,
                },
            );
        }
        chosen.len()
    }

    fn advance<R: Rng>(
        &mut self,
        registry: &mut DeviceRegistry,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> Vec<TelemetryEvent> {
        let mut events = Vec::new();
        let mut finished = Vec::new();
        for (address, transaction) in self.transactions.iter_mut() {
            transaction.remaining_dwell_ticks = transaction.remaining_dwell_ticks.saturating_sub(1);
            if transaction.remaining_dwell_ticks > 0 {
                continue;
            }
            let stage = transaction.current_stage;
            events.push(TelemetryEvent {
                source_address: address.clone(),
                stage,
                is_terminal: stage.is_terminal(),
                metrics: sample_metrics(stage, rng),
                emitted_at: now,
            });
            registry.touch(address, now);
            match stage.next() {
                Some(next) => {
                    transaction.current_stage = next;
                    transaction.remaining_dwell_ticks = rng.gen_range(dwell_range(next));
                }
                None => finished.push(address.clone()),
            }
        }
        for address in finished {
            if let Some(done) = self.transactions.remove(&address) {
                let elapsed_ms = (now - done.started_at).num_milliseconds();
                debug!(event = "transaction_completed", address = %address, elapsed_ms);
            }
        }
        events
    }
}

fn sample_metrics<R: Rng>(stage: Stage, rng: &mut R) -> Metrics {
    let (throughput, latency) = match stage {
        Stage::Auth => (50.0..150.0, 5.0..20.0),
        Stage::Encrypt => (30.0..90.0, 10.0..40.0),
        Stage::Decrypt => (20.0..70.0, 15.0..60.0),
        Stage::Hash => (80.0..200.0, 2.0..10.0),
    };
    Metrics {
        throughput: round_tenths(rng.gen_range(throughput)),
        latency: round_tenths(rng.gen_range(latency)),
        security_score: round_tenths(rng.gen_range(85.0..100.0)),
    }
}

fn round_tenths(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
