use chrono::DateTime;
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

pub const CLI_PREFIX: &str = "CLI_";
pub const COORDINATOR_PREFIX: &str = "COORDINATOR_";
pub const ORCHESTRATOR_PREFIX: &str = "ORCHESTRATOR_";
pub const SURFACE_UPDATE_TYPE: &str = "A2UI_SURFACE_UPDATE";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("message is not a json object")]
    NotAnObject,
    #[error("message has no string type field")]
    MissingType,
    #[error("{kind} payload rejected: {reason}")]
    Schema { kind: String, reason: String },
}

/// A decoded message before its payload has been checked against any schema.
///
/// Both `{"type": .., "payload": {..}}` and flat `{"type": .., ..fields}`
/// shapes are accepted; for the flat shape every non-`type` field becomes
/// the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    pub kind: String,
    pub payload: Value,
}

pub fn decode_envelope(text: &str, max_frame_bytes: usize) -> Result<InboundEnvelope, DecodeError> {
    if text.len() > max_frame_bytes {
        return Err(DecodeError::OversizedFrame {
            size: text.len(),
            max: max_frame_bytes,
        });
    }
    let value: Value =
        serde_json::from_str(text).map_err(|err| DecodeError::InvalidJson(err.to_string()))?;
    let Value::Object(mut map) = value else {
        return Err(DecodeError::NotAnObject);
    };
    let kind = match map.remove("type") {
        Some(Value::String(kind)) if !kind.trim().is_empty() => kind,
        _ => return Err(DecodeError::MissingType),
    };
    let payload = match map.remove("payload") {
        Some(payload) => payload,
        None => Value::Object(map),
    };
    Ok(InboundEnvelope { kind, payload })
}

impl InboundEnvelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Decode into an adjacently tagged (`type` + `payload`) enum.
    pub fn decode_tagged<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        let mut tagged = Map::new();
        tagged.insert("type".to_string(), Value::String(self.kind.clone()));
        tagged.insert("payload".to_string(), self.payload.clone());
        serde_json::from_value(Value::Object(tagged)).map_err(|err| self.schema_error(err))
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        serde_json::from_value(self.payload.clone()).map_err(|err| self.schema_error(err))
    }

    fn schema_error(&self, err: impl fmt::Display) -> DecodeError {
        DecodeError::Schema {
            kind: self.kind.clone(),
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum CliMessage {
    #[serde(rename = "CLI_STARTED")]
    Started(CliStartedPayload),
    #[serde(rename = "CLI_OUTPUT")]
    Output(CliOutputPayload),
    #[serde(rename = "CLI_COMPLETED")]
    Completed(CliCompletedPayload),
}

impl CliMessage {
    pub fn execution_id(&self) -> &str {
        match self {
            CliMessage::Started(payload) => &payload.execution_id,
            CliMessage::Output(payload) => &payload.execution_id,
            CliMessage::Completed(payload) => &payload.execution_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CliStartedPayload {
    pub execution_id: String,
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default, deserialize_with = "deserialize_optional_timestamp_ms")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CliOutputPayload {
    pub execution_id: String,
    #[serde(default)]
    pub chunk_type: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub unit: Option<OutputUnit>,
}

/// Structured output unit; takes precedence over raw `data`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputUnit {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CliCompletedPayload {
    pub execution_id: String,
    pub success: bool,
    #[serde(default)]
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceUpdate {
    pub surface_id: String,
    pub components: Vec<Value>,
    #[serde(default)]
    pub initial_state: Option<Value>,
}

impl SurfaceUpdate {
    pub fn from_envelope(envelope: &InboundEnvelope) -> Result<Self, DecodeError> {
        let update: SurfaceUpdate = envelope.decode_payload()?;
        if update.surface_id.trim().is_empty() {
            return Err(DecodeError::Schema {
                kind: envelope.kind.clone(),
                reason: "surfaceId must not be empty".to_string(),
            });
        }
        Ok(update)
    }
}

/// Coordinator traffic is forwarded opaquely; only the execution id is inspected.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CoordinatorEvent {
    pub kind: String,
    pub execution_id: Option<String>,
    pub payload: Value,
}

impl CoordinatorEvent {
    pub fn from_envelope(envelope: &InboundEnvelope) -> Self {
        let execution_id = envelope
            .payload
            .get("executionId")
            .and_then(Value::as_str)
            .map(|id| id.to_string());
        Self {
            kind: envelope.kind.clone(),
            execution_id,
            payload: envelope.payload.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum OrchestratorMessage {
    #[serde(rename = "ORCHESTRATOR_STATE_UPDATE")]
    StateUpdate(PipelineStateUpdate),
    #[serde(rename = "ORCHESTRATOR_NODE_STARTED")]
    NodeStarted(NodeStartedPayload),
    #[serde(rename = "ORCHESTRATOR_NODE_COMPLETED")]
    NodeCompleted(NodeCompletedPayload),
    #[serde(rename = "ORCHESTRATOR_NODE_FAILED")]
    NodeFailed(NodeFailedPayload),
    #[serde(rename = "ORCHESTRATOR_LOG")]
    Log(PipelineLogPayload),
}

impl OrchestratorMessage {
    pub fn exec_id(&self) -> &str {
        match self {
            OrchestratorMessage::StateUpdate(payload) => &payload.exec_id,
            OrchestratorMessage::NodeStarted(payload) => &payload.exec_id,
            OrchestratorMessage::NodeCompleted(payload) => &payload.exec_id,
            OrchestratorMessage::NodeFailed(payload) => &payload.exec_id,
            OrchestratorMessage::Log(payload) => &payload.exec_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStateUpdate {
    pub exec_id: String,
    pub status: String,
    #[serde(default)]
    pub current_node_id: Option<String>,
    #[serde(deserialize_with = "deserialize_timestamp_ms")]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStartedPayload {
    pub exec_id: String,
    pub node_id: String,
    #[serde(deserialize_with = "deserialize_timestamp_ms")]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeCompletedPayload {
    pub exec_id: String,
    pub node_id: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(deserialize_with = "deserialize_timestamp_ms")]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeFailedPayload {
    pub exec_id: String,
    pub node_id: String,
    pub error: String,
    #[serde(deserialize_with = "deserialize_timestamp_ms")]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineLogPayload {
    pub exec_id: String,
    pub log: PipelineLogEntry,
    #[serde(deserialize_with = "deserialize_timestamp_ms")]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineLogEntry {
    #[serde(deserialize_with = "deserialize_timestamp_ms")]
    pub timestamp: i64,
    pub level: LogLevel,
    #[serde(default)]
    pub node_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
}

/// Accepts epoch milliseconds (integer or float) or an RFC 3339 string.
pub fn deserialize_timestamp_ms<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    timestamp_from_value(&value)
        .ok_or_else(|| de::Error::custom(format!("invalid timestamp: {value}")))
}

pub fn deserialize_optional_timestamp_ms<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => timestamp_from_value(&value)
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("invalid timestamp: {value}"))),
    }
}

fn timestamp_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|ms| ms.round() as i64)),
        Value::String(text) => {
            let text = text.trim();
            DateTime::parse_from_rfc3339(text)
                .map(|dt| dt.timestamp_millis())
                .ok()
                .or_else(|| text.parse::<i64>().ok())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_accepts_payload_and_flat_shapes() {
        let wrapped = decode_envelope(
            r#"{"type":"CLI_COMPLETED","payload":{"executionId":"e1","success":true}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode wrapped");
        let flat = decode_envelope(
            r#"{"type":"CLI_COMPLETED","executionId":"e1","success":true}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode flat");
        assert_eq!(wrapped, flat);

        let message: CliMessage = flat.decode_tagged().expect("decode cli message");
        assert_eq!(
            message,
            CliMessage::Completed(CliCompletedPayload {
                execution_id: "e1".to_string(),
                success: true,
                duration: None,
            })
        );
    }

    #[test]
    fn envelope_rejects_oversized_and_untyped_frames() {
        let huge = format!(r#"{{"type":"CLI_OUTPUT","data":"{}"}}"#, "x".repeat(256));
        assert!(matches!(
            decode_envelope(&huge, 64),
            Err(DecodeError::OversizedFrame { .. })
        ));
        assert_eq!(
            decode_envelope(r#"{"payload":{}}"#, DEFAULT_MAX_FRAME_BYTES),
            Err(DecodeError::MissingType)
        );
        assert_eq!(
            decode_envelope("[1,2,3]", DEFAULT_MAX_FRAME_BYTES),
            Err(DecodeError::NotAnObject)
        );
        assert!(matches!(
            decode_envelope("{not json", DEFAULT_MAX_FRAME_BYTES),
            Err(DecodeError::InvalidJson(_))
        ));
    }

    #[test]
    fn orchestrator_union_rejects_unknown_subtype() {
        let envelope = InboundEnvelope::new(
            "ORCHESTRATOR_TELEPORT",
            serde_json::json!({"execId": "pipe-1", "timestamp": 1}),
        );
        let result = envelope.decode_tagged::<OrchestratorMessage>();
        assert!(matches!(result, Err(DecodeError::Schema { .. })));
    }

    #[test]
    fn orchestrator_log_decodes_nested_entry() {
        let envelope = InboundEnvelope::new(
            "ORCHESTRATOR_LOG",
            serde_json::json!({
                "execId": "pipe-1",
                "timestamp": "2026-02-07T21:00:00Z",
                "log": {
                    "timestamp": 1_770_498_000_000i64,
                    "level": "warning",
                    "nodeId": "build",
                    "message": "cache miss"
                }
            }),
        );
        let message: OrchestratorMessage = envelope.decode_tagged().expect("decode log");
        let OrchestratorMessage::Log(payload) = message else {
            panic!("expected log message")
        };
        assert_eq!(payload.exec_id, "pipe-1");
        assert_eq!(payload.timestamp, 1_770_498_000_000);
        assert_eq!(payload.log.level, LogLevel::Warn);
        assert_eq!(payload.log.node_id.as_deref(), Some("build"));
    }

    #[test]
    fn started_payload_accepts_string_and_numeric_timestamps() {
        let from_string: CliStartedPayload = serde_json::from_value(serde_json::json!({
            "executionId": "e1",
            "tool": "gemini",
            "mode": "analysis",
            "timestamp": "2026-02-07T21:00:00.250Z"
        }))
        .expect("string timestamp");
        assert_eq!(from_string.timestamp, Some(1_770_498_000_250));

        let from_number: CliStartedPayload = serde_json::from_value(serde_json::json!({
            "executionId": "e1",
            "tool": "gemini",
            "timestamp": 1_770_498_000_250i64
        }))
        .expect("numeric timestamp");
        assert_eq!(from_number.timestamp, Some(1_770_498_000_250));
        assert_eq!(from_number.mode, "");

        let missing: CliStartedPayload =
            serde_json::from_value(serde_json::json!({"executionId": "e1"}))
                .expect("missing timestamp");
        assert_eq!(missing.timestamp, None);
    }

    #[test]
    fn surface_update_requires_surface_id() {
        let empty = InboundEnvelope::new(
            SURFACE_UPDATE_TYPE,
            serde_json::json!({"surfaceId": " ", "components": []}),
        );
        assert!(matches!(
            SurfaceUpdate::from_envelope(&empty),
            Err(DecodeError::Schema { .. })
        ));

        let missing_components = InboundEnvelope::new(
            SURFACE_UPDATE_TYPE,
            serde_json::json!({"surfaceId": "panel"}),
        );
        assert!(SurfaceUpdate::from_envelope(&missing_components).is_err());

        let valid = InboundEnvelope::new(
            SURFACE_UPDATE_TYPE,
            serde_json::json!({"surfaceId": "panel", "components": [{"id": "c1"}]}),
        );
        let update = SurfaceUpdate::from_envelope(&valid).expect("valid surface");
        assert_eq!(update.components.len(), 1);
    }

    #[test]
    fn coordinator_event_extracts_execution_id() {
        let event = CoordinatorEvent::from_envelope(&InboundEnvelope::new(
            "COORDINATOR_COMMAND_STARTED",
            serde_json::json!({"executionId": "coord-1", "commandId": "c"}),
        ));
        assert_eq!(event.execution_id.as_deref(), Some("coord-1"));

        let anonymous = CoordinatorEvent::from_envelope(&InboundEnvelope::new(
            "COORDINATOR_COMMAND_STARTED",
            serde_json::json!({"commandId": "c"}),
        ));
        assert_eq!(anonymous.execution_id, None);
    }
}
