use execwatch_core::{ExecutionStatus, OutputLine, DEFAULT_MAX_LINES};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

const DEFAULT_TOOL: &str = "unknown";
const DEFAULT_MODE: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub tool: String,
    pub mode: String,
    pub status: ExecutionStatus,
    pub lines: VecDeque<OutputLine>,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub recovered: bool,
    pub reported_duration_ms: Option<u64>,
}

impl ExecutionRecord {
    fn new(execution_id: &str, start_time: i64) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            tool: DEFAULT_TOOL.to_string(),
            mode: DEFAULT_MODE.to_string(),
            status: ExecutionStatus::Running,
            lines: VecDeque::new(),
            start_time,
            end_time: None,
            recovered: false,
            reported_duration_ms: None,
        }
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            execution_id: self.execution_id.clone(),
            tool: self.tool.clone(),
            mode: self.mode.clone(),
            status: self.status,
            line_count: self.lines.len(),
            start_time: self.start_time,
            end_time: self.end_time,
            recovered: self.recovered,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub tool: String,
    pub mode: String,
    pub status: ExecutionStatus,
    pub line_count: usize,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub recovered: bool,
}

/// Partial metadata update. `None` leaves a field untouched; `end_time`
/// uses `Some(None)` to clear a previously recorded end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPatch {
    pub tool: Option<String>,
    pub mode: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub start_time: Option<i64>,
    pub end_time: Option<Option<i64>>,
    pub recovered: Option<bool>,
    pub reported_duration_ms: Option<u64>,
}

impl ExecutionPatch {
    fn apply(self, record: &mut ExecutionRecord) {
        if let Some(tool) = self.tool.filter(|tool| !tool.trim().is_empty()) {
            record.tool = tool;
        }
        if let Some(mode) = self.mode.filter(|mode| !mode.trim().is_empty()) {
            record.mode = mode;
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(start_time) = self.start_time {
            record.start_time = start_time;
        }
        if let Some(end_time) = self.end_time {
            record.end_time = end_time;
        }
        if let Some(recovered) = self.recovered {
            record.recovered = recovered;
        }
        if let Some(duration) = self.reported_duration_ms {
            record.reported_duration_ms = Some(duration);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub created: bool,
    pub evicted: usize,
}

/// Per-execution, append-only, bounded line store.
#[derive(Debug)]
pub struct IngestionBuffer {
    max_lines: usize,
    records: HashMap<String, ExecutionRecord>,
}

impl Default for IngestionBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}

impl IngestionBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            records: HashMap::new(),
        }
    }

    pub fn get(&self, execution_id: &str) -> Option<&ExecutionRecord> {
        self.records.get(execution_id)
    }

    pub fn contains(&self, execution_id: &str) -> bool {
        self.records.contains_key(execution_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &ExecutionRecord> {
        self.records.values()
    }

    /// Appends one line, creating the record with default metadata if needed.
    /// Once the record holds more than `max_lines`, the oldest lines are dropped.
    pub fn append(&mut self, execution_id: &str, line: OutputLine) -> AppendOutcome {
        let mut created = false;
        let record = self
            .records
            .entry(execution_id.to_string())
            .or_insert_with(|| {
                created = true;
                ExecutionRecord::new(execution_id, line.timestamp)
            });
        record.lines.push_back(line);
        let mut evicted = 0;
        while record.lines.len() > self.max_lines {
            record.lines.pop_front();
            evicted += 1;
        }
        AppendOutcome { created, evicted }
    }

    /// Merges metadata without touching `lines`. Returns true if the record was created.
    pub fn upsert(&mut self, execution_id: &str, patch: ExecutionPatch, now: i64) -> bool {
        let mut created = false;
        let record = self
            .records
            .entry(execution_id.to_string())
            .or_insert_with(|| {
                created = true;
                ExecutionRecord::new(execution_id, now)
            });
        patch.apply(record);
        created
    }

    /// Replaces the lines of a record wholesale, keeping only the newest `max_lines`.
    pub fn replace_lines(&mut self, execution_id: &str, mut lines: Vec<OutputLine>) -> bool {
        let Some(record) = self.records.get_mut(execution_id) else {
            return false;
        };
        let excess = lines.len().saturating_sub(self.max_lines);
        if excess > 0 {
            lines.drain(..excess);
        }
        record.lines = VecDeque::from(lines);
        true
    }

    pub fn remove(&mut self, execution_id: &str) -> Option<ExecutionRecord> {
        self.records.remove(execution_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use execwatch_core::OutputKind;

    fn line(index: usize) -> OutputLine {
        OutputLine::new("exec-1", OutputKind::Stdout, format!("line {index}"), index as i64)
    }

    #[test]
    fn append_creates_record_with_defaults() {
        let mut buffer = IngestionBuffer::default();
        let outcome = buffer.append("exec-1", line(7));
        assert!(outcome.created);
        assert_eq!(outcome.evicted, 0);

        let record = buffer.get("exec-1").expect("record created");
        assert_eq!(record.tool, DEFAULT_TOOL);
        assert_eq!(record.mode, DEFAULT_MODE);
        assert_eq!(record.status, ExecutionStatus::Running);
        assert_eq!(record.start_time, 7);
        assert_eq!(record.lines.len(), 1);

        let second = buffer.append("exec-1", line(8));
        assert!(!second.created);
    }

    #[test]
    fn overflow_keeps_most_recent_lines_in_order() {
        let mut buffer = IngestionBuffer::default();
        let total = DEFAULT_MAX_LINES + 1_234;
        for index in 0..total {
            buffer.append("exec-1", line(index));
            let len = buffer.get("exec-1").map(|r| r.lines.len()).unwrap_or(0);
            assert!(len <= DEFAULT_MAX_LINES);
        }

        let record = buffer.get("exec-1").expect("record");
        assert_eq!(record.lines.len(), DEFAULT_MAX_LINES);
        let expected: Vec<String> = (total - DEFAULT_MAX_LINES..total)
            .map(|index| format!("line {index}"))
            .collect();
        let actual: Vec<String> = record.lines.iter().map(|l| l.content.clone()).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn small_capacity_reports_evictions() {
        let mut buffer = IngestionBuffer::new(3);
        for index in 0..3 {
            assert_eq!(buffer.append("exec-1", line(index)).evicted, 0);
        }
        assert_eq!(buffer.append("exec-1", line(3)).evicted, 1);
        let stamps: Vec<_> = buffer
            .get("exec-1")
            .expect("record")
            .lines
            .iter()
            .map(|l| l.timestamp)
            .collect();
        assert_eq!(stamps, vec![1, 2, 3]);
    }

    #[test]
    fn upsert_merges_metadata_without_touching_lines() {
        let mut buffer = IngestionBuffer::default();
        buffer.append("exec-1", line(1));
        buffer.append("exec-1", line(2));

        let created = buffer.upsert(
            "exec-1",
            ExecutionPatch {
                tool: Some("codex".to_string()),
                mode: Some(String::new()),
                status: Some(ExecutionStatus::Completed),
                end_time: Some(Some(99)),
                ..ExecutionPatch::default()
            },
            100,
        );
        assert!(!created);

        let record = buffer.get("exec-1").expect("record");
        assert_eq!(record.tool, "codex");
        assert_eq!(record.mode, DEFAULT_MODE);
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.end_time, Some(99));
        assert_eq!(record.lines.len(), 2);

        buffer.upsert(
            "exec-1",
            ExecutionPatch {
                end_time: Some(None),
                ..ExecutionPatch::default()
            },
            100,
        );
        assert_eq!(buffer.get("exec-1").expect("record").end_time, None);
    }

    #[test]
    fn replace_lines_respects_capacity() {
        let mut buffer = IngestionBuffer::new(2);
        assert!(!buffer.replace_lines("missing", vec![line(0)]));

        buffer.upsert("exec-1", ExecutionPatch::default(), 0);
        assert!(buffer.replace_lines("exec-1", vec![line(0), line(1), line(2)]));
        let stamps: Vec<_> = buffer
            .get("exec-1")
            .expect("record")
            .lines
            .iter()
            .map(|l| l.timestamp)
            .collect();
        assert_eq!(stamps, vec![1, 2]);
    }
}
