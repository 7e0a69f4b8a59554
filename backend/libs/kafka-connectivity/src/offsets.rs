//! Per-partition offset tracking for at-least-once consumption.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::message::TopicPartition;

#[derive(Debug)]
struct PartitionState {
    outstanding: BTreeSet<i64>,
    highest_completed: Option<i64>,
    /// Next offset the broker would hand out after a restart
    committed: i64,
}

impl PartitionState {
    fn commit_candidate(&self) -> Option<i64> {
        self.outstanding
            .first()
            .copied()
            .or_else(|| self.highest_completed.map(|offset| offset + 1))
    }
}

/// Tracks which consumed offsets are still being processed.
///
/// The commit position of a partition is the lowest outstanding offset, or one past the
/// highest completed offset when nothing is outstanding. It only ever moves forward, and an
/// offset whose processing never completes pins it until the stream restarts.
#[derive(Debug, Default)]
pub struct PartitionOffsetTracker {
    partitions: HashMap<TopicPartition, PartitionState>,
}

impl PartitionOffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an offset as handed to the pipeline
    pub fn register(&mut self, topic_partition: &TopicPartition, offset: i64) {
        let state = self
            .partitions
            .entry(topic_partition.clone())
            .or_insert_with(|| PartitionState {
                outstanding: BTreeSet::new(),
                highest_completed: None,
                committed: offset,
            });
        state.outstanding.insert(offset);
    }

    /// Mark an offset as done.
    ///
    /// Returns the new commit position when it advanced.
    pub fn complete(&mut self, topic_partition: &TopicPartition, offset: i64) -> Option<i64> {
        let Some(state) = self.partitions.get_mut(topic_partition) else {
            debug!(%topic_partition, offset, "Completion for untracked partition");
            return None;
        };

        if !state.outstanding.remove(&offset) {
            debug!(%topic_partition, offset, "Completion for untracked offset");
            return None;
        }

        state.highest_completed = Some(state.highest_completed.map_or(offset, |h| h.max(offset)));

        match state.commit_candidate() {
            Some(candidate) if candidate > state.committed => {
                state.committed = candidate;
                Some(candidate)
            }
            _ => None,
        }
    }

    pub fn committed(&self, topic_partition: &TopicPartition) -> Option<i64> {
        self.partitions
            .get(topic_partition)
            .map(|state| state.committed)
    }

    pub fn outstanding(&self, topic_partition: &TopicPartition) -> usize {
        self.partitions
            .get(topic_partition)
            .map_or(0, |state| state.outstanding.len())
    }

    pub fn total_outstanding(&self) -> usize {
        self.partitions
            .values()
            .map(|state| state.outstanding.len())
            .sum()
    }
}
