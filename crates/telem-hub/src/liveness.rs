use crate::registry::DeviceRegistry;
use chrono::{DateTime, Duration, Utc};
use telem_core::Liveness;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct LivenessChange {
    pub address: String,
    pub name: String,
    pub status: Liveness,
}

/// Derives online/offline purely from time since last activity.
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    offline_after: Duration,
}

impl LivenessMonitor {
    pub fn new(offline_after: Duration) -> Self {
        Self { offline_after }
    }

    /// Flips every device whose state disagrees with its last-seen age.
    /// Running it twice at the same instant changes nothing the second time.
    pub fn sweep(
        &self,
        registry: &mut DeviceRegistry,
        now: DateTime<Utc>,
    ) -> Vec<LivenessChange> {
        let mut changes = Vec::new();
        for device in registry.iter_mut() {
            let desired = if now - device.last_seen_at > self.offline_after {
                Liveness::Offline
            } else {
                Liveness::Online
            };
            if desired == device.liveness {
                continue;
            }
            device.liveness = desired;
            info!(
                event = "liveness_changed",
                address = %device.address,
                status = desired.as_str()
            );
            changes.push(LivenessChange {
                address: device.address.clone(),
                name: device.display_name.clone(),
                status: desired,
            });
        }
        changes
    }
}
