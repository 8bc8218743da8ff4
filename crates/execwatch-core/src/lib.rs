pub mod wire;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Upper bound on buffered output lines per execution.
pub const DEFAULT_MAX_LINES: usize = 5_000;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Error,
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        Self::Running
    }
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Error)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "running" | "in_progress" | "in-progress" => Ok(ExecutionStatus::Running),
            "completed" | "complete" | "success" | "done" => Ok(ExecutionStatus::Completed),
            "error" | "failed" | "failure" => Ok(ExecutionStatus::Error),
            other => Err(format!("Unknown execution status: {other}")),
        }
    }
}

/// Semantic kind of a single line of tool output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Stdout,
    Stderr,
    Metadata,
    Thought,
    System,
    ToolCall,
}

impl Default for OutputKind {
    fn default() -> Self {
        Self::Stdout
    }
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::Stdout => "stdout",
            OutputKind::Stderr => "stderr",
            OutputKind::Metadata => "metadata",
            OutputKind::Thought => "thought",
            OutputKind::System => "system",
            OutputKind::ToolCall => "tool_call",
        }
    }

    /// Kinds that always start a block of their own.
    pub fn is_standalone(&self) -> bool {
        matches!(
            self,
            OutputKind::ToolCall | OutputKind::Thought | OutputKind::System
        )
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "stdout" => Ok(OutputKind::Stdout),
            "stderr" => Ok(OutputKind::Stderr),
            "metadata" => Ok(OutputKind::Metadata),
            "thought" | "thinking" => Ok(OutputKind::Thought),
            "system" => Ok(OutputKind::System),
            "tool_call" | "tool-call" | "toolcall" => Ok(OutputKind::ToolCall),
            other => Err(format!("Unknown output kind: {other}")),
        }
    }
}

/// One immutable line of output attributed to an execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutputLine {
    pub execution_id: String,
    #[serde(rename = "type")]
    pub kind: OutputKind,
    pub content: String,
    pub timestamp: i64,
}

impl OutputLine {
    pub fn new(
        execution_id: impl Into<String>,
        kind: OutputKind,
        content: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            kind,
            content: content.into(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
    Reconnecting,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
