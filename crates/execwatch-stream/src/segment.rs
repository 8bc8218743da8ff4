use execwatch_core::{ExecutionStatus, OutputKind, OutputLine};
use regex::Regex;
use serde::Serialize;
use std::ops::Range;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    Tool,
    Thought,
    System,
    Stderr,
    Stdout,
    Metadata,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Tool => "tool",
            BlockKind::Thought => "thought",
            BlockKind::System => "system",
            BlockKind::Stderr => "stderr",
            BlockKind::Stdout => "stdout",
            BlockKind::Metadata => "metadata",
        }
    }
}

impl From<OutputKind> for BlockKind {
    fn from(kind: OutputKind) -> Self {
        match kind {
            OutputKind::ToolCall => BlockKind::Tool,
            OutputKind::Thought => BlockKind::Thought,
            OutputKind::System => BlockKind::System,
            OutputKind::Stderr => BlockKind::Stderr,
            OutputKind::Stdout => BlockKind::Stdout,
            OutputKind::Metadata => BlockKind::Metadata,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Running,
    Completed,
}

impl From<ExecutionStatus> for BlockStatus {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Running => BlockStatus::Running,
            ExecutionStatus::Completed | ExecutionStatus::Error => BlockStatus::Completed,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DisplayBlock {
    pub id: String,
    pub title: String,
    pub kind: BlockKind,
    pub status: BlockStatus,
    pub tool_name: Option<String>,
    pub line_count: usize,
    /// Milliseconds until the next block starts (or until the last line for
    /// the final block). `None` when timestamps run backwards.
    pub duration: Option<i64>,
    pub lines: Vec<OutputLine>,
    pub timestamp: i64,
}

/// Groups an ordered line sequence into display blocks.
///
/// Single left-to-right pass with one open block:
/// - tool calls, thoughts and system lines always open a new block;
/// - stderr opens a new block unless the open block is stderr;
/// - a tool call block absorbs the stdout that follows it;
/// - consecutive stdout lines merge, as do consecutive stderr lines;
/// - anything else opens a new block.
///
/// Block status mirrors the execution: `running` while it runs, `completed`
/// once it reached any terminal status.
pub fn segment(lines: &[OutputLine], status: ExecutionStatus) -> Vec<DisplayBlock> {
    let spans = block_spans(lines);
    let block_status = BlockStatus::from(status);

    spans
        .iter()
        .enumerate()
        .map(|(index, span)| {
            let first = &lines[span.start];
            let last = &lines[span.end - 1];
            let end_ts = spans
                .get(index + 1)
                .map(|next| lines[next.start].timestamp)
                .unwrap_or(last.timestamp);
            let elapsed = end_ts - first.timestamp;
            let (title, tool_name) = describe(first);
            DisplayBlock {
                id: format!("{}-block-{index}", first.execution_id),
                title,
                kind: BlockKind::from(first.kind),
                status: block_status,
                tool_name,
                line_count: span.len(),
                duration: (elapsed >= 0).then_some(elapsed),
                lines: lines[span.clone()].to_vec(),
                timestamp: first.timestamp,
            }
        })
        .collect()
}

fn block_spans(lines: &[OutputLine]) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut open: Option<(OutputKind, usize)> = None;

    for (index, line) in lines.iter().enumerate() {
        match open {
            Some((open_kind, _)) if continues_block(open_kind, line.kind) => {}
            Some((_, start)) => {
                spans.push(start..index);
                open = Some((line.kind, index));
            }
            None => open = Some((line.kind, index)),
        }
    }
    if let Some((_, start)) = open {
        spans.push(start..lines.len());
    }
    spans
}

fn continues_block(open: OutputKind, next: OutputKind) -> bool {
    if next.is_standalone() {
        return false;
    }
    // stderr after a tool call still starts its own block
    if next == OutputKind::Stderr && open != OutputKind::Stderr {
        return false;
    }
    matches!(
        (open, next),
        (OutputKind::ToolCall, OutputKind::Stdout)
            | (OutputKind::Stderr, OutputKind::Stderr)
            | (OutputKind::Stdout, OutputKind::Stdout)
    )
}

fn describe(line: &OutputLine) -> (String, Option<String>) {
    let title = match line.kind {
        OutputKind::ToolCall => {
            return match parse_tool_call(&line.content) {
                Some((name, args)) if args.is_empty() => (name.clone(), Some(name)),
                Some((name, args)) => (format!("{name}({args})"), Some(name)),
                None => ("Tool Call".to_string(), None),
            };
        }
        OutputKind::Thought => "Thought",
        OutputKind::System => "System",
        OutputKind::Stderr => "Error Output",
        OutputKind::Stdout => "Output",
        OutputKind::Metadata => "Metadata",
    };
    (title.to_string(), None)
}

/// Parses `[Tool] name(args)` (args optional) into `(name, args)`.
pub fn parse_tool_call(content: &str) -> Option<(String, String)> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"^\s*\[Tool\]\s+([^\s(]+)(?:\((.*)\))?\s*$").expect("valid regex")
    });
    let captures = pattern.captures(content)?;
    let name = captures.get(1)?.as_str().to_string();
    let args = captures
        .get(2)
        .map(|args| args.as_str().trim().to_string())
        .unwrap_or_default();
    Some((name, args))
}
