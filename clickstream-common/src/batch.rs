use std::fmt;

use time::OffsetDateTime;
use tokio::time::Instant;
use uuid::Uuid;

use crate::event::LogRecord;

/// Why a batch was released downstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Accumulated bytes reached the size threshold.
    Size,
    /// Accumulated records reached the count threshold.
    Count,
    /// The buffering interval elapsed since the first record.
    Interval,
    /// The buffer was drained on shutdown.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CloseReason::Size => write!(f, "size"),
            CloseReason::Count => write!(f, "count"),
            CloseReason::Interval => write!(f, "interval"),
            CloseReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// A batch that is still accepting records.
#[derive(Debug)]
pub struct OpenBatch {
    partition_key: String,
    records: Vec<LogRecord>,
    size_bytes: usize,
    opened_at: Instant,
    created_at: OffsetDateTime,
}

impl OpenBatch {
    pub fn new(partition_key: &str, opened_at: Instant) -> Self {
        Self {
            partition_key: partition_key.to_owned(),
            records: Vec::new(),
            size_bytes: 0,
            opened_at,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn push(&mut self, record: LogRecord) {
        self.size_bytes += record.size_bytes();
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Seal the batch. After this the records can no longer change.
    pub fn close(self, reason: CloseReason) -> Batch {
        Batch {
            id: Uuid::now_v7(),
            partition_key: self.partition_key,
            records: self.records,
            size_bytes: self.size_bytes,
            created_at: self.created_at,
            close_reason: reason,
        }
    }
}

/// An ordered, bounded group of records released by the buffering layer.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    id: Uuid,
    partition_key: String,
    records: Vec<LogRecord>,
    size_bytes: usize,
    created_at: OffsetDateTime,
    close_reason: CloseReason,
}

impl Batch {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Wall clock time of the first record, used to derive storage keys.
    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn close_reason(&self) -> CloseReason {
        self.close_reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn record(sequence: i64, data: &'static [u8]) -> LogRecord {
        LogRecord {
            partition: 0,
            sequence,
            partition_key: "k".to_owned(),
            data: Bytes::from_static(data),
            arrived_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn close_keeps_order_and_size() {
        let mut open = OpenBatch::new("k", Instant::now());
        open.push(record(1, b"one"));
        open.push(record(2, b"three"));

        assert_eq!(open.len(), 2);
        assert_eq!(open.size_bytes(), 8);

        let batch = open.close(CloseReason::Count);

        let sequences: Vec<i64> = batch.records().iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert_eq!(batch.size_bytes(), 8);
        assert_eq!(batch.partition_key(), "k");
        assert_eq!(batch.close_reason(), CloseReason::Count);
    }
}
