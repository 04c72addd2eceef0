use crate::{Liveness, Metrics, Stage, TelemetryEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const MAX_FRAME_BYTES: usize = 64 * 1024;

const OUTBOUND_TYPES: &[&str] = &[
    "info",
    "telemetry",
    "device_join",
    "device_exit",
    "device_snapshot",
    "device_status",
    "error",
];

const INBOUND_TELEMETRY_UPDATE: &str = "telemetry_update";

/// Envelopes pushed from the hub to every connected session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMsg {
    Info { message: String },
    Telemetry(TelemetryPayload),
    DeviceJoin { device: DeviceDescriptor },
    DeviceExit { ip: String, name: String },
    DeviceSnapshot { devices: Vec<DeviceDescriptor> },
    DeviceStatus(DeviceStatusPayload),
    Error { message: String },
}

impl WireMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMsg::Info { .. } => "info",
            WireMsg::Telemetry(_) => "telemetry",
            WireMsg::DeviceJoin { .. } => "device_join",
            WireMsg::DeviceExit { .. } => "device_exit",
            WireMsg::DeviceSnapshot { .. } => "device_snapshot",
            WireMsg::DeviceStatus(_) => "device_status",
            WireMsg::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryPayload {
    pub source: String,
    pub stage_id: Stage,
    pub is_last_stage: bool,
    pub metrics: Metrics,
    /// Emission time in unix milliseconds.
    pub ts: i64,
}

impl From<&TelemetryEvent> for TelemetryPayload {
    fn from(event: &TelemetryEvent) -> Self {
        Self {
            source: event.source_address.clone(),
            stage_id: event.stage,
            is_last_stage: event.is_terminal,
            metrics: event.metrics,
            ts: event.emitted_at.timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: String,
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Liveness>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceStatusPayload {
    pub ip: String,
    pub name: String,
    pub status: Liveness,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("body must be a JSON object")]
    NotAnObject,
    #[error("deviceId is required")]
    MissingDeviceId,
    #[error("deviceId must be a string")]
    InvalidDeviceId,
    #[error("invalid status: {0}")]
    InvalidStatus(String),
    #[error("invalid metrics: {0}")]
    InvalidMetrics(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("frame has no type tag")]
    MissingType,
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

pub fn encode_text(msg: &WireMsg) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(msg).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > MAX_FRAME_BYTES {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    Ok(encoded)
}

/// Parses an outbound envelope. Unknown tags are reported separately from
/// malformed JSON so consumers can log and drop them.
pub fn decode_text(raw: &[u8]) -> Result<WireMsg, FrameError> {
    let value = parse_object(raw)?;
    let kind = message_type(&value)?;
    if !OUTBOUND_TYPES.contains(&kind) {
        return Err(FrameError::UnknownType(kind.to_string()));
    }
    serde_json::from_value(value).map_err(|err| FrameError::Decode(err.to_string()))
}

/// Parses a frame sent by a session to the hub.
pub fn decode_inbound(raw: &[u8]) -> Result<TelemetryUpdate, FrameError> {
    let value = parse_object(raw)?;
    let kind = message_type(&value)?;
    if kind != INBOUND_TELEMETRY_UPDATE {
        return Err(FrameError::UnknownType(kind.to_string()));
    }
    Ok(TelemetryUpdate::from_value(&value)?)
}

fn parse_object(raw: &[u8]) -> Result<Value, FrameError> {
    if raw.len() > MAX_FRAME_BYTES {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

fn message_type(value: &Value) -> Result<&str, FrameError> {
    value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PartialMetrics {
    #[serde(default)]
    pub throughput: Option<f64>,
    #[serde(default)]
    pub latency: Option<f64>,
    #[serde(default)]
    pub security_score: Option<f64>,
}

impl PartialMetrics {
    pub fn merge_into(&self, base: Metrics) -> Metrics {
        Metrics {
            throughput: self.throughput.unwrap_or(base.throughput),
            latency: self.latency.unwrap_or(base.latency),
            security_score: self.security_score.unwrap_or(base.security_score),
        }
    }
}

/// Externally reported device telemetry, accepted over REST or the socket.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryUpdate {
    pub device_id: String,
    pub status: Option<Liveness>,
    pub metrics: Option<PartialMetrics>,
}

impl TelemetryUpdate {
    pub fn from_value(value: &Value) -> Result<Self, ValidationError> {
        let object = value.as_object().ok_or(ValidationError::NotAnObject)?;
        let device_id = match object.get("deviceId") {
            None | Some(Value::Null) => return Err(ValidationError::MissingDeviceId),
            Some(Value::String(id)) if id.trim().is_empty() => {
                return Err(ValidationError::MissingDeviceId)
            }
            Some(Value::String(id)) => id.clone(),
            Some(_) => return Err(ValidationError::InvalidDeviceId),
        };
        let status = match object.get("status") {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) => Some(
                raw.parse::<Liveness>()
                    .map_err(|_| ValidationError::InvalidStatus(raw.clone()))?,
            ),
            Some(other) => return Err(ValidationError::InvalidStatus(other.to_string())),
        };
        let metrics = match object.get("metrics") {
            None | Some(Value::Null) => None,
            Some(raw @ Value::Object(_)) => Some(
                serde_json::from_value::<PartialMetrics>(raw.clone())
                    .map_err(|err| ValidationError::InvalidMetrics(err.to_string()))?,
            ),
            Some(_) => {
                return Err(ValidationError::InvalidMetrics(
                    "expected an object".to_string(),
                ))
            }
        };
        Ok(Self {
            device_id,
            status,
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_telemetry_envelope() {
        let raw = br#"{"type":"telemetry","source":"192.168.1.101","stageId":"ENCRYPT","isLastStage":false,"metrics":{"throughput":42.0,"latency":12.5,"securityScore":96.0},"ts":1760000000000}"#;
        let msg = decode_text(raw).unwrap();
        let WireMsg::Telemetry(payload) = msg else {
            panic!("expected telemetry");
        };
        assert_eq!(payload.source, "192.168.1.101");
        assert_eq!(payload.stage_id, Stage::Encrypt);
        assert!(!payload.is_last_stage);
        assert_eq!(payload.metrics.security_score, 96.0);
    }

    #[test]
    fn device_events_match_wire_shape() {
        let join = WireMsg::DeviceJoin {
            device: DeviceDescriptor {
                id: "dev-7".to_string(),
                name: "IoT-Device-7".to_string(),
                ip: "192.168.1.107".to_string(),
                status: None,
            },
        };
        let value: Value = serde_json::from_str(&encode_text(&join).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type":"device_join","device":{"id":"dev-7","name":"IoT-Device-7","ip":"192.168.1.107"}})
        );

        let exit = decode_text(br#"{"type":"device_exit","ip":"192.168.1.107","name":"IoT-Device-7"}"#)
            .unwrap();
        assert_eq!(exit.kind(), "device_exit");
    }

    #[test]
    fn unknown_and_malformed_frames_are_distinguished() {
        assert_eq!(
            decode_text(br#"{"type":"firmware","blob":1}"#),
            Err(FrameError::UnknownType("firmware".to_string()))
        );
        assert_eq!(decode_text(br#"{"message":"x"}"#), Err(FrameError::MissingType));
        assert!(matches!(decode_text(b"{not json"), Err(FrameError::Decode(_))));
        assert!(matches!(
            decode_text(br#"{"type":"telemetry","source":"x"}"#),
            Err(FrameError::Decode(_))
        ));
    }

    #[test]
    fn oversized_frames_are_rejected_before_parsing() {
        let raw = vec![b' '; MAX_FRAME_BYTES + 1];
        assert!(matches!(
            decode_text(&raw),
            Err(FrameError::OversizedFrame { .. })
        ));
    }

    #[test]
    fn telemetry_update_requires_string_device_id() {
        assert_eq!(
            TelemetryUpdate::from_value(&json!({"status":"online"})),
            Err(ValidationError::MissingDeviceId)
        );
        assert_eq!(
            TelemetryUpdate::from_value(&json!({"deviceId": 101})),
            Err(ValidationError::InvalidDeviceId)
        );
        assert_eq!(
            TelemetryUpdate::from_value(&json!(["deviceId"])),
            Err(ValidationError::NotAnObject)
        );
        assert!(matches!(
            TelemetryUpdate::from_value(&json!({"deviceId":"dev-1","status":"sleeping"})),
            Err(ValidationError::InvalidStatus(_))
        ));
        assert!(matches!(
            TelemetryUpdate::from_value(&json!({"deviceId":"dev-1","metrics":{"latency":"slow"}})),
            Err(ValidationError::InvalidMetrics(_))
        ));
    }

    #[test]
    fn partial_metrics_merge_keeps_unreported_fields() {
        let update = TelemetryUpdate::from_value(
            &json!({"deviceId":"dev-1","status":"offline","metrics":{"latency":80.0}}),
        )
        .unwrap();
        assert_eq!(update.status, Some(Liveness::Offline));
        let merged = update.metrics.unwrap().merge_into(Metrics {
            throughput: 10.0,
            latency: 5.0,
            security_score: 90.0,
        });
        assert_eq!(merged.throughput, 10.0);
        assert_eq!(merged.latency, 80.0);
    }

    #[test]
    fn inbound_frames_only_accept_telemetry_updates() {
        let update = decode_inbound(br#"{"type":"telemetry_update","deviceId":"dev-2"}"#).unwrap();
        assert_eq!(update.device_id, "dev-2");
        assert_eq!(
            decode_inbound(br#"{"type":"telemetry","deviceId":"dev-2"}"#),
            Err(FrameError::UnknownType("telemetry".to_string()))
        );
        assert_eq!(
            decode_inbound(br#"{"type":"telemetry_update"}"#),
            Err(FrameError::Invalid(ValidationError::MissingDeviceId))
        );
    }
}
