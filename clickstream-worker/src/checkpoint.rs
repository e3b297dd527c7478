use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use clickstream_common::batch::Batch;
use clickstream_common::event::LogRecord;
use clickstream_common::stream::Checkpoint;
use tracing::warn;

/// Tracks which read records have reached a terminal state.
///
/// Records are tracked as soon as they are read, so a record still sitting
/// in an open batch holds back the checkpoint of its partition even when a
/// later record of another buffering key is already delivered.
#[derive(Default)]
pub struct CheckpointTracker {
    partitions: Mutex<HashMap<i32, BTreeMap<i64, bool>>>,
}

impl CheckpointTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, record: &LogRecord) {
        match self.partitions.lock() {
            Ok(mut partitions) => {
                partitions
                    .entry(record.partition)
                    .or_default()
                    .insert(record.sequence, false);
            }
            Err(_) => warn!("poisoned CheckpointTracker mutex, record will not be checkpointed"),
        }
    }

    /// Mark every record of a delivered or dead-lettered batch as done.
    ///
    /// Returns one checkpoint per partition whose contiguous done prefix moved.
    pub fn complete(&self, batch: &Batch) -> Vec<Checkpoint> {
        let Ok(mut partitions) = self.partitions.lock() else {
            warn!("poisoned CheckpointTracker mutex, skipping checkpoint");
            return Vec::new();
        };

        let mut touched: Vec<i32> = Vec::new();
        for record in batch.records() {
            if let Some(sequences) = partitions.get_mut(&record.partition) {
                if let Some(done) = sequences.get_mut(&record.sequence) {
                    *done = true;
                }
            }
            if !touched.contains(&record.partition) {
                touched.push(record.partition);
            }
        }

        let mut checkpoints = Vec::new();
        for partition in touched {
            let Some(sequences) = partitions.get_mut(&partition) else {
                continue;
            };

            let mut next_sequence = None;
            while let Some(entry) = sequences.first_entry() {
                if !*entry.get() {
                    break;
                }
                next_sequence = Some(*entry.key() + 1);
                entry.remove();
            }

            if let Some(next_sequence) = next_sequence {
                checkpoints.push(Checkpoint {
                    partition,
                    next_sequence,
                });
            }
        }

        checkpoints
    }

    /// Number of tracked records not covered by a checkpoint yet.
    pub fn pending(&self) -> usize {
        self.partitions
            .lock()
            .map(|partitions| partitions.values().map(|sequences| sequences.len()).sum())
            .unwrap_or(0)
    }
}
