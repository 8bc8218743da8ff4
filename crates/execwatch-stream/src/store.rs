use crate::buffer::{
    AppendOutcome, ExecutionPatch, ExecutionRecord, ExecutionSummary, IngestionBuffer,
};
use crate::cache::{BlockCache, BlockSet};
use execwatch_core::{now_ms, OutputLine};

/// Execution records plus their block cache. Every mutation of a record's
/// lines or metadata drops its cache entry in the same call.
#[derive(Debug)]
pub struct ExecutionStore {
    buffer: IngestionBuffer,
    cache: BlockCache,
}

impl Default for ExecutionStore {
    fn default() -> Self {
        Self::new(execwatch_core::DEFAULT_MAX_LINES)
    }
}

impl ExecutionStore {
    pub fn new(max_lines: usize) -> Self {
        Self {
            buffer: IngestionBuffer::new(max_lines),
            cache: BlockCache::new(),
        }
    }

    pub fn get(&self, execution_id: &str) -> Option<&ExecutionRecord> {
        self.buffer.get(execution_id)
    }

    pub fn contains(&self, execution_id: &str) -> bool {
        self.buffer.contains(execution_id)
    }

    pub fn is_cached(&self, execution_id: &str) -> bool {
        self.cache.contains(execution_id)
    }

    pub fn append(&mut self, execution_id: &str, line: OutputLine) -> AppendOutcome {
        let outcome = self.buffer.append(execution_id, line);
        self.cache.invalidate(execution_id);
        outcome
    }

    pub fn upsert(&mut self, execution_id: &str, patch: ExecutionPatch) -> bool {
        let created = self.buffer.upsert(execution_id, patch, now_ms());
        self.cache.invalidate(execution_id);
        created
    }

    /// Seeds lines for a record that has none yet. Returns false when the
    /// record is missing or already holds output.
    pub fn seed_lines(&mut self, execution_id: &str, lines: Vec<OutputLine>) -> bool {
        let has_lines = self
            .buffer
            .get(execution_id)
            .map(|record| !record.lines.is_empty())
            .unwrap_or(true);
        if has_lines || lines.is_empty() {
            return false;
        }
        self.cache.invalidate(execution_id);
        self.buffer.replace_lines(execution_id, lines)
    }

    pub fn remove(&mut self, execution_id: &str) -> Option<ExecutionRecord> {
        self.cache.invalidate(execution_id);
        self.buffer.remove(execution_id)
    }

    /// Removes every execution in a terminal state. Returns the removed ids, sorted.
    pub fn remove_finished(&mut self) -> Vec<String> {
        let mut finished: Vec<String> = self
            .buffer
            .records()
            .filter(|record| record.status.is_terminal())
            .map(|record| record.execution_id.clone())
            .collect();
        finished.sort();
        for execution_id in &finished {
            self.remove(execution_id);
        }
        finished
    }

    pub fn blocks(&mut self, execution_id: &str) -> BlockSet {
        self.cache.get_blocks(&self.buffer, execution_id, now_ms())
    }

    pub fn invalidate(&mut self, execution_id: &str) -> bool {
        self.cache.invalidate(execution_id)
    }

    /// Execution summaries ordered by start time, then id.
    pub fn summaries(&self) -> Vec<ExecutionSummary> {
        let mut summaries: Vec<ExecutionSummary> =
            self.buffer.records().map(ExecutionRecord::summary).collect();
        summaries.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.execution_id.cmp(&b.execution_id))
        });
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use execwatch_core::{ExecutionStatus, OutputKind};
    use std::sync::Arc;

    fn stdout(execution_id: &str, content: &str, timestamp: i64) -> OutputLine {
        OutputLine::new(execution_id, OutputKind::Stdout, content, timestamp)
    }

    fn complete(store: &mut ExecutionStore, execution_id: &str) {
        store.upsert(
            execution_id,
            ExecutionPatch {
                status: Some(ExecutionStatus::Completed),
                end_time: Some(Some(now_ms())),
                ..ExecutionPatch::default()
            },
        );
    }

    #[test]
    fn append_after_completion_forces_recompute() {
        let mut store = ExecutionStore::default();
        store.append("exec-1", stdout("exec-1", "one", 1));
        complete(&mut store, "exec-1");

        let first = store.blocks("exec-1");
        let second = store.blocks("exec-1");
        assert!(Arc::ptr_eq(&first, &second));

        store.append("exec-1", stdout("exec-1", "late", 2));
        let third = store.blocks("exec-1");
        assert!(!Arc::ptr_eq(&second, &third));
        assert_eq!(third[0].line_count, 2);
    }

    #[test]
    fn remove_drops_record_and_cache_entry_together() {
        let mut store = ExecutionStore::default();
        store.append("exec-1", stdout("exec-1", "one", 1));
        complete(&mut store, "exec-1");
        store.blocks("exec-1");
        assert!(store.is_cached("exec-1"));

        let removed = store.remove("exec-1").expect("record removed");
        assert_eq!(removed.lines.len(), 1);
        assert!(!store.contains("exec-1"));
        assert!(!store.is_cached("exec-1"));
        assert!(store.blocks("exec-1").is_empty());
    }

    #[test]
    fn remove_finished_keeps_running_executions() {
        let mut store = ExecutionStore::default();
        store.append("done", stdout("done", "x", 1));
        store.append("live", stdout("live", "y", 2));
        store.append("failed", stdout("failed", "z", 3));
        complete(&mut store, "done");
        store.upsert(
            "failed",
            ExecutionPatch {
                status: Some(ExecutionStatus::Error),
                end_time: Some(Some(now_ms())),
                ..ExecutionPatch::default()
            },
        );

        assert_eq!(store.remove_finished(), vec!["done", "failed"]);
        assert!(store.contains("live"));
        assert_eq!(store.summaries().len(), 1);
    }

    #[test]
    fn seed_lines_only_fills_empty_records() {
        let mut store = ExecutionStore::default();
        assert!(!store.seed_lines("missing", vec![stdout("missing", "x", 1)]));

        store.upsert("exec-1", ExecutionPatch::default());
        assert!(store.seed_lines("exec-1", vec![stdout("exec-1", "restored", 1)]));
        assert!(!store.seed_lines("exec-1", vec![stdout("exec-1", "again", 2)]));
        assert_eq!(store.get("exec-1").expect("record").lines.len(), 1);
    }

    #[test]
    fn summaries_are_ordered_by_start_time() {
        let mut store = ExecutionStore::default();
        store.append("b", stdout("b", "x", 20));
        store.append("a", stdout("a", "x", 30));
        store.append("c", stdout("c", "x", 10));
        let order: Vec<_> = store
            .summaries()
            .into_iter()
            .map(|summary| summary.execution_id)
            .collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }
}
