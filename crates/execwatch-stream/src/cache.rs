use crate::buffer::{ExecutionRecord, IngestionBuffer};
use crate::segment::{segment, DisplayBlock};
use execwatch_core::OutputLine;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

pub type BlockSet = Arc<Vec<DisplayBlock>>;

#[derive(Debug, Clone)]
struct CacheEntry {
    blocks: BlockSet,
    computed_at: i64,
}

/// Read-through memoization of segmented blocks.
///
/// An entry is only trusted once its execution has ended and the entry was
/// computed at or after that end; running executions are recomputed on every
/// read.
#[derive(Debug, Default)]
pub struct BlockCache {
    entries: HashMap<String, CacheEntry>,
}

impl BlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_blocks(
        &mut self,
        buffer: &IngestionBuffer,
        execution_id: &str,
        now: i64,
    ) -> BlockSet {
        let Some(record) = buffer.get(execution_id) else {
            return Arc::new(Vec::new());
        };
        if let Some(entry) = self.entries.get(execution_id) {
            if is_fresh(entry, record) {
                return Arc::clone(&entry.blocks);
            }
        }

        let lines: Cow<'_, [OutputLine]> = match record.lines.as_slices() {
            (front, []) => Cow::Borrowed(front),
            _ => Cow::Owned(record.lines.iter().cloned().collect()),
        };
        let blocks: BlockSet = Arc::new(segment(&lines, record.status));
        self.entries.insert(
            execution_id.to_string(),
            CacheEntry {
                blocks: Arc::clone(&blocks),
                computed_at: now,
            },
        );
        blocks
    }

    pub fn invalidate(&mut self, execution_id: &str) -> bool {
        self.entries.remove(execution_id).is_some()
    }

    pub fn contains(&self, execution_id: &str) -> bool {
        self.entries.contains_key(execution_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_fresh(entry: &CacheEntry, record: &ExecutionRecord) -> bool {
    match record.end_time {
        Some(end_time) => entry.computed_at >= end_time,
        None => false,
    }
}
