use crate::render::RenderCoalescer;
use chrono::{DateTime, TimeZone, Utc};
use telem_core::wire::{DeviceDescriptor, DeviceStatusPayload, TelemetryPayload};
use telem_core::{Liveness, Stage};
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

pub const ACTIVE_DECAY: Duration = Duration::from_millis(1100);
pub const TERMINAL_DECAY: Duration = Duration::from_millis(3000);

/// UI-facing state for one device. Keyed by address.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEntityState {
    pub id: String,
    pub name: String,
    pub address: String,
    pub position: usize,
    pub last_known_stage: Option<Stage>,
    pub is_active: bool,
    pub throughput: f64,
    pub liveness: Liveness,
    /// Single decay slot; arming always replaces what was here.
    decay_deadline: Option<Instant>,
}

impl ClientEntityState {
    fn from_descriptor(device: &DeviceDescriptor, position: usize) -> Self {
        Self {
            id: device.id.clone(),
            name: device.name.clone(),
            address: device.ip.clone(),
            position,
            last_known_stage: None,
            is_active: false,
            throughput: 0.0,
            liveness: device.status.unwrap_or_default(),
            decay_deadline: None,
        }
    }

    #[cfg(test)]
    pub fn decay_deadline(&self) -> Option<Instant> {
        self.decay_deadline
    }

    fn deactivate(&mut self) {
        self.is_active = false;
        self.throughput = 0.0;
        self.decay_deadline = None;
    }
}

#[derive(Debug, Default)]
pub struct ActivityTracker {
    entities: Vec<ClientEntityState>,
    last_update: Option<DateTime<Utc>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entities(&self) -> &[ClientEntityState] {
        &self.entities
    }

    #[cfg(test)]
    pub fn get(&self, address: &str) -> Option<&ClientEntityState> {
        self.entities.iter().find(|entity| entity.address == address)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn active_count(&self) -> usize {
        self.entities.iter().filter(|entity| entity.is_active).count()
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    /// Marks the source active and re-arms its decay. Telemetry for an
    /// address we do not know is dropped.
    pub fn on_telemetry(
        &mut self,
        payload: &TelemetryPayload,
        now: Instant,
        render: &mut RenderCoalescer,
    ) -> bool {
        let Some(entity) = self
            .entities
            .iter_mut()
            .find(|entity| entity.address == payload.source)
        else {
            debug!(event = "telemetry_unknown_source", source = %payload.source);
            return false;
        };
        entity.is_active = true;
        entity.last_known_stage = Some(payload.stage_id);
        entity.throughput = payload.metrics.throughput;
        let decay = if payload.is_last_stage {
            TERMINAL_DECAY
        } else {
            ACTIVE_DECAY
        };
        entity.decay_deadline = Some(now + decay);
        self.last_update = Some(
            Utc.timestamp_millis_opt(payload.ts)
                .single()
                .unwrap_or_else(Utc::now),
        );
        render.request_render(now);
        true
    }

    /// Retires every highlight whose decay is due. Returns how many fired.
    pub fn poll_expired(&mut self, now: Instant, render: &mut RenderCoalescer) -> usize {
        let mut fired = 0;
        for entity in &mut self.entities {
            if matches!(entity.decay_deadline, Some(deadline) if deadline <= now) {
                entity.deactivate();
                fired += 1;
            }
        }
        if fired > 0 {
            render.request_render(now);
        }
        fired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entities
            .iter()
            .filter_map(|entity| entity.decay_deadline)
            .min()
    }

    pub fn cancel_all(&mut self) {
        for entity in &mut self.entities {
            entity.decay_deadline = None;
        }
    }

    pub fn on_device_join(
        &mut self,
        device: &DeviceDescriptor,
        now: Instant,
        render: &mut RenderCoalescer,
    ) -> bool {
        let duplicate = self
            .entities
            .iter()
            .any(|entity| entity.address == device.ip || entity.name == device.name);
        if duplicate {
            debug!(event = "device_join_duplicate", address = %device.ip, name = %device.name);
            return false;
        }
        let position = self.entities.len();
        self.entities
            .push(ClientEntityState::from_descriptor(device, position));
        info!(event = "device_join", address = %device.ip, name = %device.name);
        render.request_render(now);
        true
    }

    pub fn on_device_exit(
        &mut self,
        address: &str,
        name: &str,
        now: Instant,
        render: &mut RenderCoalescer,
    ) -> bool {
        let index = self
            .entities
            .iter()
            .position(|entity| entity.address == address)
            .or_else(|| self.entities.iter().position(|entity| entity.name == name));
        let Some(index) = index else {
            return false;
        };
        let removed = self.entities.remove(index);
        self.reindex();
        info!(event = "device_exit", address = %removed.address, name = %removed.name);
        render.request_render(now);
        true
    }

    /// Replaces the entity list with the hub's view, keeping activity for
    /// devices that are still present.
    pub fn on_snapshot(
        &mut self,
        devices: &[DeviceDescriptor],
        now: Instant,
        render: &mut RenderCoalescer,
    ) {
        let mut previous = std::mem::take(&mut self.entities);
        for device in devices {
            if self.entities.iter().any(|entity| entity.address == device.ip) {
                continue;
            }
            let position = self.entities.len();
            let entity = match previous.iter().position(|entity| entity.address == device.ip) {
                Some(index) => {
                    let mut kept = previous.swap_remove(index);
                    kept.id = device.id.clone();
                    kept.name = device.name.clone();
                    kept.position = position;
                    if let Some(status) = device.status {
                        kept.liveness = status;
                    }
                    kept
                }
                None => ClientEntityState::from_descriptor(device, position),
            };
            self.entities.push(entity);
        }
        debug!(event = "device_snapshot", devices = self.entities.len());
        render.request_render(now);
    }

    pub fn on_device_status(
        &mut self,
        payload: &DeviceStatusPayload,
        now: Instant,
        render: &mut RenderCoalescer,
    ) -> bool {
        let Some(entity) = self
            .entities
            .iter_mut()
            .find(|entity| entity.address == payload.ip)
        else {
            return false;
        };
        let throughput = payload
            .metrics
            .map_or(entity.throughput, |metrics| metrics.throughput);
        if entity.liveness == payload.status && entity.throughput == throughput {
            return false;
        }
        entity.liveness = payload.status;
        entity.throughput = throughput;
        self.last_update = Some(Utc::now());
        render.request_render(now);
        true
    }

    fn reindex(&mut self) {
        for (position, entity) in self.entities.iter_mut().enumerate() {
            entity.position = position;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telem_core::Metrics;

    fn descriptor(id: &str, name: &str, ip: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            id: id.to_string(),
            name: name.to_string(),
            ip: ip.to_string(),
            status: Some(Liveness::Online),
        }
    }

    fn telemetry(source: &str, stage: Stage, last: bool) -> TelemetryPayload {
        TelemetryPayload {
            source: source.to_string(),
            stage_id: stage,
            is_last_stage: last,
            metrics: Metrics {
                throughput: 87.5,
                latency: 12.0,
                security_score: 97.0,
            },
            ts: 1_700_000_000_000,
        }
    }

    fn seeded(now: Instant, render: &mut RenderCoalescer) -> ActivityTracker {
        let mut tracker = ActivityTracker::new();
        tracker.on_snapshot(
            &[
                descriptor("dev-101", "Sensor-Alpha", "192.168.1.101"),
                descriptor("dev-102", "Sensor-Bravo", "192.168.1.102"),
            ],
            now,
            render,
        );
        tracker
    }

    #[test]
    fn encrypt_stage_highlight_decays_after_1100ms() {
        let start = Instant::now();
        let mut render = RenderCoalescer::new(Duration::from_millis(16));
        let mut tracker = seeded(start, &mut render);

        assert!(tracker.on_telemetry(
            &telemetry("192.168.1.101", Stage::Encrypt, false),
            start,
            &mut render
        ));
        let entity = tracker.get("192.168.1.101").unwrap();
        assert!(entity.is_active);
        assert_eq!(entity.last_known_stage, Some(Stage::Encrypt));
        assert_eq!(entity.throughput, 87.5);
        assert_eq!(tracker.next_deadline(), Some(start + ACTIVE_DECAY));

        assert_eq!(
            tracker.poll_expired(start + Duration::from_millis(1099), &mut render),
            0
        );
        assert!(tracker.get("192.168.1.101").unwrap().is_active);

        assert_eq!(tracker.poll_expired(start + ACTIVE_DECAY, &mut render), 1);
        let entity = tracker.get("192.168.1.101").unwrap();
        assert!(!entity.is_active);
        assert_eq!(entity.throughput, 0.0);
        assert_eq!(entity.decay_deadline(), None);
        assert_eq!(tracker.next_deadline(), None);
    }

    #[test]
    fn terminal_stage_holds_for_3000ms() {
        let start = Instant::now();
        let mut render = RenderCoalescer::new(Duration::from_millis(16));
        let mut tracker = seeded(start, &mut render);

        tracker.on_telemetry(
            &telemetry("192.168.1.101", Stage::Hash, true),
            start,
            &mut render,
        );
        assert_eq!(
            tracker.poll_expired(start + Duration::from_millis(2000), &mut render),
            0
        );
        assert_eq!(tracker.poll_expired(start + TERMINAL_DECAY, &mut render), 1);
        assert!(!tracker.get("192.168.1.101").unwrap().is_active);
    }

    #[test]
    fn rearming_replaces_the_pending_decay() {
        let start = Instant::now();
        let mut render = RenderCoalescer::new(Duration::from_millis(16));
        let mut tracker = seeded(start, &mut render);
        let source = "192.168.1.102";

        tracker.on_telemetry(&telemetry(source, Stage::Auth, false), start, &mut render);
        let second = start + Duration::from_millis(600);
        tracker.on_telemetry(&telemetry(source, Stage::Encrypt, false), second, &mut render);
        assert_eq!(tracker.next_deadline(), Some(second + ACTIVE_DECAY));

        assert_eq!(tracker.poll_expired(start + ACTIVE_DECAY, &mut render), 0);
        assert!(tracker.get(source).unwrap().is_active);

        let mut fired = 0;
        for step in 0..40 {
            fired += tracker.poll_expired(second + Duration::from_millis(100 * step), &mut render);
        }
        assert_eq!(fired, 1);
    }

    #[test]
    fn duplicate_join_leaves_list_unchanged() {
        let start = Instant::now();
        let mut render = RenderCoalescer::new(Duration::from_millis(16));
        let mut tracker = seeded(start, &mut render);

        assert!(!tracker.on_device_join(
            &descriptor("dev-x", "Other", "192.168.1.101"),
            start,
            &mut render
        ));
        assert!(!tracker.on_device_join(
            &descriptor("dev-y", "Sensor-Bravo", "192.168.1.150"),
            start,
            &mut render
        ));
        assert_eq!(tracker.len(), 2);

        assert!(tracker.on_device_join(
            &descriptor("dev-z", "IoT-Device-1", "192.168.1.106"),
            start,
            &mut render
        ));
        assert_eq!(tracker.len(), 3);
        assert_eq!(tracker.get("192.168.1.106").unwrap().position, 2);
    }

    #[test]
    fn unknown_source_is_ignored_without_render() {
        let start = Instant::now();
        let mut render = RenderCoalescer::new(Duration::from_millis(16));
        let mut tracker = seeded(start, &mut render);
        render.cancel();

        assert!(!tracker.on_telemetry(
            &telemetry("10.0.0.9", Stage::Auth, false),
            start,
            &mut render
        ));
        assert_eq!(tracker.active_count(), 0);
        assert!(!render.is_pending());
    }

    #[test]
    fn exit_removes_entity_and_reindexes() {
        let start = Instant::now();
        let mut render = RenderCoalescer::new(Duration::from_millis(16));
        let mut tracker = seeded(start, &mut render);
        tracker.on_telemetry(
            &telemetry("192.168.1.101", Stage::Decrypt, false),
            start,
            &mut render,
        );

        assert!(tracker.on_device_exit("192.168.1.101", "Sensor-Alpha", start, &mut render));
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.entities()[0].position, 0);
        assert_eq!(tracker.next_deadline(), None);
        assert!(!tracker.on_device_exit("192.168.1.101", "Sensor-Alpha", start, &mut render));
    }

    #[test]
    fn snapshot_keeps_activity_for_surviving_devices() {
        let start = Instant::now();
        let mut render = RenderCoalescer::new(Duration::from_millis(16));
        let mut tracker = seeded(start, &mut render);
        tracker.on_telemetry(
            &telemetry("192.168.1.102", Stage::Auth, false),
            start,
            &mut render,
        );

        tracker.on_snapshot(
            &[
                descriptor("dev-102", "Sensor-Bravo", "192.168.1.102"),
                descriptor("dev-103", "Sensor-Charlie", "192.168.1.103"),
            ],
            start,
            &mut render,
        );
        assert_eq!(tracker.len(), 2);
        assert!(tracker.get("192.168.1.101").is_none());
        let kept = tracker.get("192.168.1.102").unwrap();
        assert!(kept.is_active);
        assert_eq!(kept.position, 0);
    }

    #[test]
    fn teardown_cancels_every_decay() {
        let start = Instant::now();
        let mut render = RenderCoalescer::new(Duration::from_millis(16));
        let mut tracker = seeded(start, &mut render);
        for source in ["192.168.1.101", "192.168.1.102"] {
            tracker.on_telemetry(&telemetry(source, Stage::Auth, false), start, &mut render);
        }
        tracker.cancel_all();
        assert_eq!(tracker.next_deadline(), None);
        assert_eq!(
            tracker.poll_expired(start + TERMINAL_DECAY, &mut render),
            0
        );
    }

    #[test]
    fn status_flips_liveness() {
        let start = Instant::now();
        let mut render = RenderCoalescer::new(Duration::from_millis(16));
        let mut tracker = seeded(start, &mut render);
        let payload = DeviceStatusPayload {
            ip: "192.168.1.101".to_string(),
            name: "Sensor-Alpha".to_string(),
            status: Liveness::Offline,
            metrics: None,
        };
        assert!(tracker.on_device_status(&payload, start, &mut render));
        assert_eq!(
            tracker.get("192.168.1.101").unwrap().liveness,
            Liveness::Offline
        );
        assert!(!tracker.on_device_status(&payload, start, &mut render));
    }

    #[test]
    fn status_metrics_update_throughput_and_repeat_is_quiet() {
        let start = Instant::now();
        let mut render = RenderCoalescer::new(Duration::from_millis(16));
        let mut tracker = seeded(start, &mut render);
        render.cancel();
        let payload = DeviceStatusPayload {
            ip: "192.168.1.101".to_string(),
            name: "Sensor-Alpha".to_string(),
            status: Liveness::Online,
            metrics: Some(Metrics {
                throughput: 64.5,
                latency: 12.0,
                security_score: 90.0,
            }),
        };
        assert!(tracker.on_device_status(&payload, start, &mut render));
        assert_eq!(tracker.get("192.168.1.101").unwrap().throughput, 64.5);
        assert!(render.is_pending());

        render.cancel();
        assert!(!tracker.on_device_status(&payload, start, &mut render));
        assert!(!render.is_pending());
    }
}
