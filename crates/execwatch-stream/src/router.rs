use execwatch_core::wire::{
    decode_envelope, CliMessage, CliOutputPayload, CoordinatorEvent, DecodeError, InboundEnvelope,
    OrchestratorMessage, SurfaceUpdate, CLI_PREFIX, COORDINATOR_PREFIX, DEFAULT_MAX_FRAME_BYTES,
    ORCHESTRATOR_PREFIX, SURFACE_UPDATE_TYPE,
};
use execwatch_core::{ExecutionStatus, OutputKind, OutputLine};
use serde_json::Value;
use tracing::{debug, warn};

const TOOL_NAME_KEYS: [&str; 2] = ["toolName", "tool_name"];
const TOOL_ARG_KEYS: [&str; 4] = ["parameters", "arguments", "input", "args"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Cli,
    Surface,
    Coordinator,
    Orchestrator,
    Unrouted,
}

/// First match wins: CLI prefix, surface marker, coordinator prefix,
/// orchestrator prefix.
pub fn classify(kind: &str) -> Channel {
    if kind.starts_with(CLI_PREFIX) {
        Channel::Cli
    } else if kind == SURFACE_UPDATE_TYPE {
        Channel::Surface
    } else if kind.starts_with(COORDINATOR_PREFIX) {
        Channel::Coordinator
    } else if kind.starts_with(ORCHESTRATOR_PREFIX) {
        Channel::Orchestrator
    } else {
        Channel::Unrouted
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliAction {
    Started {
        execution_id: String,
        tool: String,
        mode: String,
        start_time: Option<i64>,
    },
    Output {
        execution_id: String,
        lines: Vec<OutputLine>,
    },
    Completed {
        execution_id: String,
        status: ExecutionStatus,
        duration_ms: Option<u64>,
    },
}

impl CliAction {
    pub fn execution_id(&self) -> &str {
        match self {
            CliAction::Started { execution_id, .. }
            | CliAction::Output { execution_id, .. }
            | CliAction::Completed { execution_id, .. } => execution_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Unrouted,
    ForeignCoordinator,
    ForeignOrchestrator,
}

/// Outcome of routing one inbound message. Exactly one consumer path, or none.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Cli(CliAction),
    Surface(SurfaceUpdate),
    Coordinator(CoordinatorEvent),
    Orchestrator(OrchestratorMessage),
    Ignored(IgnoreReason),
    Dropped(DecodeError),
}

#[derive(Debug, Clone)]
pub struct Router {
    max_frame_bytes: usize,
    coordinator_execution: Option<String>,
    orchestrator_execution: Option<String>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Router {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            coordinator_execution: None,
            orchestrator_execution: None,
        }
    }

    pub fn track_coordinator(&mut self, execution_id: Option<String>) {
        self.coordinator_execution = execution_id;
    }

    pub fn track_orchestrator(&mut self, execution_id: Option<String>) {
        self.orchestrator_execution = execution_id;
    }

    pub fn coordinator_execution(&self) -> Option<&str> {
        self.coordinator_execution.as_deref()
    }

    pub fn orchestrator_execution(&self) -> Option<&str> {
        self.orchestrator_execution.as_deref()
    }

    pub fn route(&self, text: &str, now: i64) -> Dispatch {
        match decode_envelope(text, self.max_frame_bytes) {
            Ok(envelope) => self.route_envelope(&envelope, now),
            Err(err) => dropped(err),
        }
    }

    pub fn route_envelope(&self, envelope: &InboundEnvelope, now: i64) -> Dispatch {
        match classify(&envelope.kind) {
            Channel::Cli => match envelope.decode_tagged::<CliMessage>() {
                Ok(message) => Dispatch::Cli(cli_action(message, now)),
                Err(err) => dropped(err),
            },
            Channel::Surface => match SurfaceUpdate::from_envelope(envelope) {
                Ok(update) => Dispatch::Surface(update),
                Err(err) => dropped(err),
            },
            Channel::Coordinator => {
                let event = CoordinatorEvent::from_envelope(envelope);
                if event.execution_id.is_some()
                    && event.execution_id.as_deref() == self.coordinator_execution()
                {
                    Dispatch::Coordinator(event)
                } else {
                    debug!(
                        event = "coordinator_message_ignored",
                        kind = %envelope.kind,
                        execution_id = ?event.execution_id
                    );
                    Dispatch::Ignored(IgnoreReason::ForeignCoordinator)
                }
            }
            Channel::Orchestrator => {
                let message = match envelope.decode_tagged::<OrchestratorMessage>() {
                    Ok(message) => message,
                    Err(err) => return dropped(err),
                };
                if Some(message.exec_id()) == self.orchestrator_execution() {
                    Dispatch::Orchestrator(message)
                } else {
                    debug!(
                        event = "orchestrator_message_ignored",
                        kind = %envelope.kind,
                        exec_id = %message.exec_id()
                    );
                    Dispatch::Ignored(IgnoreReason::ForeignOrchestrator)
                }
            }
            Channel::Unrouted => {
                debug!(event = "message_unrouted", kind = %envelope.kind);
                Dispatch::Ignored(IgnoreReason::Unrouted)
            }
        }
    }
}

fn dropped(err: DecodeError) -> Dispatch {
    warn!(event = "message_dropped", error = %err);
    Dispatch::Dropped(err)
}

fn cli_action(message: CliMessage, now: i64) -> CliAction {
    match message {
        CliMessage::Started(payload) => CliAction::Started {
            execution_id: payload.execution_id,
            tool: payload.tool,
            mode: payload.mode,
            start_time: payload.timestamp,
        },
        CliMessage::Output(payload) => CliAction::Output {
            lines: output_lines(&payload, now),
            execution_id: payload.execution_id,
        },
        CliMessage::Completed(payload) => CliAction::Completed {
            execution_id: payload.execution_id,
            status: if payload.success {
                ExecutionStatus::Completed
            } else {
                ExecutionStatus::Error
            },
            duration_ms: payload.duration,
        },
    }
}

/// Splits one output chunk into lines. Blank lines are skipped, but a chunk
/// with no visible text still produces a single empty line. Tool-call shaped
/// content is typed as a tool call whatever chunk type it arrived under.
pub fn output_lines(payload: &CliOutputPayload, now: i64) -> Vec<OutputLine> {
    let kind = resolve_kind(payload);
    let content = resolve_content(payload);
    let (kind, text) = match content.and_then(|value| format_tool_call(value, kind)) {
        Some(call) => (OutputKind::ToolCall, call),
        None => (kind, content_text(content)),
    };

    let mut lines: Vec<OutputLine> = text
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.is_empty())
        .map(|line| OutputLine::new(payload.execution_id.clone(), kind, line, now))
        .collect();
    if lines.is_empty() {
        lines.push(OutputLine::new(payload.execution_id.clone(), kind, "", now));
    }
    lines
}

fn resolve_kind(payload: &CliOutputPayload) -> OutputKind {
    payload
        .unit
        .as_ref()
        .and_then(|unit| unit.kind.parse().ok())
        .or_else(|| {
            payload
                .chunk_type
                .as_deref()
                .and_then(|chunk| chunk.parse().ok())
        })
        .unwrap_or_default()
}

fn resolve_content(payload: &CliOutputPayload) -> Option<&Value> {
    payload
        .unit
        .as_ref()
        .map(|unit| &unit.content)
        .filter(|content| !content.is_null())
        .or(payload.data.as_ref())
}

fn content_text(content: Option<&Value>) -> String {
    match content {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(value) => value.to_string(),
    }
}

/// Renders tool-call shaped content as a single `[Tool] name(k=v, ...)` line.
///
/// An object counts as a tool call when it carries `toolName`, or when the
/// chunk is already typed as a tool call and it carries `name`.
pub fn format_tool_call(value: &Value, kind: OutputKind) -> Option<String> {
    let object = value.as_object()?;
    let name = TOOL_NAME_KEYS
        .iter()
        .find_map(|key| object.get(*key))
        .or_else(|| {
            (kind == OutputKind::ToolCall)
                .then(|| object.get("name"))
                .flatten()
        })
        .and_then(Value::as_str)?;
    let args = match TOOL_ARG_KEYS.iter().find_map(|key| object.get(*key)) {
        None | Some(Value::Null) => String::new(),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(key, value)| format!("{key}={}", inline_value(value)))
            .collect::<Vec<_>>()
            .join(", "),
        Some(other) => inline_value(other),
    };
    Some(format!("[Tool] {name}({args})"))
}

fn inline_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.replace(['\r', '\n'], " "),
        other => other.to_string(),
    }
}
