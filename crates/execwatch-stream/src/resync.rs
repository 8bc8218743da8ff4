use execwatch_core::wire::deserialize_optional_timestamp_ms;
use execwatch_core::{ExecutionStatus, OutputKind, OutputLine};
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("fetch failed: {0}")]
    Request(String),
    #[error("fetch rejected: {0}")]
    Rejected(String),
    #[error("fetch returned no data")]
    MissingData,
    #[error("invalid fetch response: {0}")]
    Decode(String),
}

/// Source of authoritative execution state, consulted after a reconnect.
pub trait Resync: Send + Sync + 'static {
    fn active_executions(&self) -> BoxFuture<'static, Result<Vec<ExecutionSnapshot>, FetchError>>;
}

/// `{ "success": bool, "data"?: T, "error"?: string }`
#[derive(Debug, Clone, Deserialize)]
pub struct ResyncEnvelope<T> {
    pub success: bool,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
}

impl<T> ResyncEnvelope<T> {
    pub fn into_result(self) -> Result<T, FetchError> {
        if !self.success {
            return Err(FetchError::Rejected(
                self.error.unwrap_or_else(|| "unspecified error".to_string()),
            ));
        }
        self.data.ok_or(FetchError::MissingData)
    }
}

pub fn decode_envelope<T: DeserializeOwned>(text: &str) -> Result<T, FetchError> {
    serde_json::from_str::<ResyncEnvelope<T>>(text)
        .map_err(|err| FetchError::Decode(err.to_string()))?
        .into_result()
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSnapshot {
    #[serde(alias = "executionId")]
    pub id: String,
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub status: ExecutionStatus,
    #[serde(default, deserialize_with = "deserialize_optional_timestamp_ms")]
    pub start_time: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_optional_timestamp_ms")]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub output: Vec<SnapshotLine>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SnapshotLine {
    #[serde(rename = "type", default)]
    pub kind: OutputKind,
    pub content: String,
    #[serde(default, deserialize_with = "deserialize_optional_timestamp_ms")]
    pub timestamp: Option<i64>,
}

impl ExecutionSnapshot {
    pub fn output_lines(&self, fallback_timestamp: i64) -> Vec<OutputLine> {
        self.output
            .iter()
            .map(|line| {
                OutputLine::new(
                    self.id.clone(),
                    line.kind,
                    line.content.clone(),
                    line.timestamp.unwrap_or(fallback_timestamp),
                )
            })
            .collect()
    }
}
