use crate::engine::TransactionEngine;
use crate::registry::DeviceRegistry;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use telem_core::Device;
use tracing::{info, warn};
use uuid::Uuid;

const SUBNET: &str = "192.168.1";
const FIRST_SYNTHETIC_HOST: u8 = 106;
const LAST_SYNTHETIC_HOST: u8 = 254;

#[derive(Debug, Clone)]
pub struct PopulationConfig {
    pub max_devices: usize,
    /// Chance that a population tick changes anything.
    pub churn_probability: f64,
    /// Given churn and both options open, chance of a join over an exit.
    pub join_bias: f64,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            max_devices: 12,
            churn_probability: 0.6,
            join_bias: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChurnEvent {
    Joined(Device),
    Exited(Device),
}

/// Simulates devices joining and leaving the fleet.
#[derive(Debug)]
pub struct DevicePopulationManager {
    config: PopulationConfig,
    next_serial: u32,
}

impl DevicePopulationManager {
    pub fn new(config: PopulationConfig) -> Self {
        Self {
            config,
            next_serial: 1,
        }
    }

    pub fn tick<R: Rng>(
        &mut self,
        registry: &mut DeviceRegistry,
        engine: &mut TransactionEngine,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> Option<ChurnEvent> {
        if !rng.gen_bool(self.config.churn_probability) {
            return None;
        }
        let removable: Vec<String> = registry
            .iter()
            .filter(|device| !DeviceRegistry::is_protected(&device.address))
            .map(|device| device.address.clone())
            .collect();
        let can_join = registry.len() < self.config.max_devices;
        let join = match (can_join, removable.is_empty()) {
            (false, true) => return None,
            (true, true) => true,
            (false, false) => false,
            (true, false) => rng.gen_bool(self.config.join_bias),
        };
        if join {
            self.join(registry, now).map(ChurnEvent::Joined)
        } else {
            let address = removable.choose(rng)?;
            self.exit(registry, engine, address).map(ChurnEvent::Exited)
        }
    }

    /// Adds a synthetic device on the lowest free address.
    pub fn join(&mut self, registry: &mut DeviceRegistry, now: DateTime<Utc>) -> Option<Device> {
        if registry.len() >= self.config.max_devices {
            return None;
        }
        let address = (FIRST_SYNTHETIC_HOST..=LAST_SYNTHETIC_HOST)
            .map(|host| format!("{SUBNET}.{host}"))
            .find(|candidate| !registry.contains(candidate))?;
        let serial = self.next_serial;
        self.next_serial += 1;
        let device = Device::new(
            format!("dev-{}", Uuid::new_v4().simple()),
            format!("IoT-Device-{serial}"),
            address,
            now,
        );
        if let Err(err) = registry.insert(device.clone()) {
            warn!(event = "device_join_rejected", error = %err);
            return None;
        }
        info!(
            event = "device_join",
            address = %device.address,
            name = %device.display_name,
            population = registry.len()
        );
        Some(device)
    }

    /// Removes a non-core device and discards its in-flight transaction.
    pub fn exit(
        &mut self,
        registry: &mut DeviceRegistry,
        engine: &mut TransactionEngine,
        address: &str,
    ) -> Option<Device> {
        if DeviceRegistry::is_protected(address) {
            warn!(event = "device_exit_refused", address = address);
            return None;
        }
        let device = registry.remove(address)?;
        let discarded = engine.discard(address);
        info!(
            event = "device_exit",
            address = %device.address,
            name = %device.display_name,
            discarded_stage = discarded.as_ref().map(|tx| tx.current_stage.as_str()),
            population = registry.len()
        );
        Some(device)
    }
}
