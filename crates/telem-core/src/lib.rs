use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod wire;

/// Pipeline stages a device transaction passes through, in order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Stage {
    Auth,
    Encrypt,
    Decrypt,
    Hash,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Auth, Stage::Encrypt, Stage::Decrypt, Stage::Hash];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Auth => "AUTH",
            Stage::Encrypt => "ENCRYPT",
            Stage::Decrypt => "DECRYPT",
            Stage::Hash => "HASH",
        }
    }

    /// The stage that follows this one, `None` once the pipeline is done.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Auth => Some(Stage::Encrypt),
            Stage::Encrypt => Some(Stage::Decrypt),
            Stage::Decrypt => Some(Stage::Hash),
            Stage::Hash => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Hash)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_uppercase().as_str() {
            "AUTH" => Ok(Stage::Auth),
            "ENCRYPT" => Ok(Stage::Encrypt),
            "DECRYPT" => Ok(Stage::Decrypt),
            "HASH" => Ok(Stage::Hash),
            other => Err(format!("Unknown stage: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    #[default]
    Online,
    Offline,
}

impl Liveness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Liveness::Online => "online",
            Liveness::Offline => "offline",
        }
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Liveness {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(Liveness::Online),
            "offline" => Ok(Liveness::Offline),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub throughput: f64,
    pub latency: f64,
    pub security_score: f64,
}

/// A member of the simulated fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub display_name: String,
    pub address: String,
    pub liveness: Liveness,
    pub last_seen_at: DateTime<Utc>,
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        address: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            address: address.into(),
            liveness: Liveness::Online,
            last_seen_at: now,
        }
    }

    /// Identity only, as carried by `device_join`.
    pub fn descriptor(&self) -> wire::DeviceDescriptor {
        wire::DeviceDescriptor {
            id: self.id.clone(),
            name: self.display_name.clone(),
            ip: self.address.clone(),
            status: None,
        }
    }

    /// Identity plus current liveness, for snapshots and REST replies.
    pub fn status_descriptor(&self) -> wire::DeviceDescriptor {
        wire::DeviceDescriptor {
            status: Some(self.liveness),
            ..self.descriptor()
        }
    }
}

/// One stage completion emitted by the transaction engine. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    pub source_address: String,
    pub stage: Stage,
    pub is_terminal: bool,
    pub metrics: Metrics,
    pub emitted_at: DateTime<Utc>,
}
