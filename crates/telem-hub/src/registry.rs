use chrono::{DateTime, Utc};
use telem_core::Device;
use thiserror::Error;

/// Seed population. These devices are never removed by churn.
pub const CORE_DEVICES: [(&str, &str, &str); 5] = [
    ("dev-101", "Sensor-Alpha", "192.168.1.101"),
    ("dev-102", "Sensor-Bravo", "192.168.1.102"),
    ("dev-103", "Sensor-Charlie", "192.168.1.103"),
    ("dev-104", "Sensor-Delta", "192.168.1.104"),
    ("dev-105", "Sensor-Echo", "192.168.1.105"),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("address already registered: {0}")]
    DuplicateAddress(String),
    #[error("name already registered: {0}")]
    DuplicateName(String),
}

/// Current device population, kept in join order. Addresses and names are
/// unique at every instant.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(now: DateTime<Utc>) -> Self {
        let mut registry = Self::new();
        for (id, name, address) in CORE_DEVICES {
            registry.devices.push(Device::new(id, name, address, now));
        }
        registry
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.iter_mut()
    }

    pub fn get(&self, address: &str) -> Option<&Device> {
        self.devices.iter().find(|device| device.address == address)
    }

    pub fn find_by_id(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|device| device.id == id)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.get(address).is_some()
    }

    pub fn insert(&mut self, device: Device) -> Result<(), RegistryError> {
        if self.contains(&device.address) {
            return Err(RegistryError::DuplicateAddress(device.address));
        }
        if self
            .devices
            .iter()
            .any(|existing| existing.display_name == device.display_name)
        {
            return Err(RegistryError::DuplicateName(device.display_name));
        }
        self.devices.push(device);
        Ok(())
    }

    pub fn remove(&mut self, address: &str) -> Option<Device> {
        let index = self
            .devices
            .iter()
            .position(|device| device.address == address)?;
        Some(self.devices.remove(index))
    }

    /// Records activity for a device. Returns false for unknown addresses.
    pub fn touch(&mut self, address: &str, now: DateTime<Utc>) -> bool {
        match self
            .devices
            .iter_mut()
            .find(|device| device.address == address)
        {
            Some(device) => {
                device.last_seen_at = now;
                true
            }
            None => false,
        }
    }

    pub fn is_protected(address: &str) -> bool {
        CORE_DEVICES
            .iter()
            .any(|(_, _, core_address)| *core_address == address)
    }

    #[cfg(test)]
    pub fn addresses(&self) -> Vec<String> {
        self.devices
            .iter()
            .map(|device| device.address.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Device> {
        self.devices.clone()
    }
}
