//! Interfaces to the ordered, partitioned stream sitting between the producer
//! and the buffering layer, plus an in-memory implementation.
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Notify;

use crate::event::{LogRecord, StreamRecord};

/// Errors reaching the ingestion endpoint. The producer treats all of them as transient.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestionError {
    #[error("ingestion endpoint unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("failed to read from stream: {0}")]
    Read(String),
    #[error("failed to store checkpoint: {0}")]
    Checkpoint(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PutRecordResult {
    Accepted { partition: i32, sequence: i64 },
    Rejected { error: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutRecordsOutput {
    pub failed_count: usize,
    pub results: Vec<PutRecordResult>,
}

impl PutRecordsOutput {
    pub fn from_results(results: Vec<PutRecordResult>) -> Self {
        let failed_count = results
            .iter()
            .filter(|result| matches!(result, PutRecordResult::Rejected { .. }))
            .count();

        Self {
            failed_count,
            results,
        }
    }
}

#[async_trait]
pub trait IngestionEndpoint: Send + Sync {
    async fn put_records(
        &self,
        records: Vec<StreamRecord>,
    ) -> Result<PutRecordsOutput, IngestionError>;
}

/// Sequential consumption of the stream. `Ok(None)` means the stream ended.
#[async_trait]
pub trait StreamReader: Send {
    async fn next_record(&mut self) -> Result<Option<LogRecord>, StreamError>;
}

/// Position to resume a partition from: every sequence below `next_sequence` is done.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Checkpoint {
    pub partition: i32,
    pub next_sequence: i64,
}

pub trait Checkpointer: Send + Sync {
    fn commit(&self, checkpoint: Checkpoint) -> Result<(), StreamError>;
}

struct Inner {
    log: Vec<LogRecord>,
    next_sequence: Vec<i64>,
    checkpoints: HashMap<i32, i64>,
    closed: bool,
}

/// An in-memory partitioned log. Clones share the same log.
#[derive(Clone)]
pub struct MemoryStream {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    partitions: i32,
}

impl MemoryStream {
    pub fn new(partitions: i32) -> Self {
        let partitions = partitions.max(1);

        Self {
            inner: Arc::new(Mutex::new(Inner {
                log: Vec::new(),
                next_sequence: vec![0; partitions as usize],
                checkpoints: HashMap::new(),
                closed: false,
            })),
            notify: Arc::new(Notify::new()),
            partitions,
        }
    }

    pub fn partition_for(&self, partition_key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        partition_key.hash(&mut hasher);
        (hasher.finish() % self.partitions as u64) as i32
    }

    /// Stop accepting records. Readers return `None` once they reach the end of the log.
    pub fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.closed = true;
        }
        self.notify.notify_waiters();
    }

    /// A reader starting at the committed checkpoints, or at the beginning of each partition.
    pub fn reader(&self) -> MemoryStreamReader {
        let start = self
            .inner
            .lock()
            .map(|inner| inner.checkpoints.clone())
            .unwrap_or_default();

        MemoryStreamReader {
            stream: self.clone(),
            position: 0,
            start,
        }
    }

    pub fn checkpoint(&self, partition: i32) -> Option<i64> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.checkpoints.get(&partition).copied())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.log.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IngestionEndpoint for MemoryStream {
    async fn put_records(
        &self,
        records: Vec<StreamRecord>,
    ) -> Result<PutRecordsOutput, IngestionError> {
        let mut results = Vec::with_capacity(records.len());
        {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| IngestionError::Unavailable("poisoned stream mutex".to_owned()))?;

            if inner.closed {
                return Err(IngestionError::Unavailable("stream is closed".to_owned()));
            }

            let arrived_at = OffsetDateTime::now_utc();
            for record in records {
                let partition = self.partition_for(&record.partition_key);
                let sequence = inner.next_sequence[partition as usize];
                inner.next_sequence[partition as usize] += 1;

                inner.log.push(LogRecord {
                    partition,
                    sequence,
                    partition_key: record.partition_key,
                    data: record.data,
                    arrived_at,
                });
                results.push(PutRecordResult::Accepted {
                    partition,
                    sequence,
                });
            }
        }
        self.notify.notify_waiters();

        Ok(PutRecordsOutput::from_results(results))
    }
}

impl Checkpointer for MemoryStream {
    fn commit(&self, checkpoint: Checkpoint) -> Result<(), StreamError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| StreamError::Checkpoint("poisoned stream mutex".to_owned()))?;

        let current = inner.checkpoints.entry(checkpoint.partition).or_insert(0);
        *current = (*current).max(checkpoint.next_sequence);

        Ok(())
    }
}

pub struct MemoryStreamReader {
    stream: MemoryStream,
    position: usize,
    start: HashMap<i32, i64>,
}

impl MemoryStreamReader {
    /// Next record past the reader's position, and whether the stream is closed.
    fn poll_next(&mut self) -> Result<(Option<LogRecord>, bool), StreamError> {
        let inner = self
            .stream
            .inner
            .lock()
            .map_err(|_| StreamError::Read("poisoned stream mutex".to_owned()))?;

        while let Some(record) = inner.log.get(self.position) {
            self.position += 1;
            let start = self.start.get(&record.partition).copied().unwrap_or(0);
            if record.sequence >= start {
                return Ok((Some(record.clone()), inner.closed));
            }
        }

        Ok((None, inner.closed))
    }
}

#[async_trait]
impl StreamReader for MemoryStreamReader {
    async fn next_record(&mut self) -> Result<Option<LogRecord>, StreamError> {
        let notify = self.stream.notify.clone();
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.poll_next()? {
                (Some(record), _) => return Ok(Some(record)),
                (None, true) => return Ok(None),
                (None, false) => notified.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn record(key: &str, data: &'static str) -> StreamRecord {
        StreamRecord {
            data: Bytes::from_static(data.as_bytes()),
            partition_key: key.to_owned(),
        }
    }

    #[tokio::test]
    async fn test_reader_sees_records_in_order() {
        let stream = MemoryStream::new(4);
        let output = stream
            .put_records(vec![record("a", "1"), record("b", "2"), record("a", "3")])
            .await
            .unwrap();
        assert_eq!(output.failed_count, 0);
        stream.close();

        let mut reader = stream.reader();
        let mut seen = Vec::new();
        while let Some(record) = reader.next_record().await.unwrap() {
            seen.push(record.data);
        }

        assert_eq!(seen, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_sequences_are_per_partition() {
        let stream = MemoryStream::new(1);
        let output = stream
            .put_records(vec![record("a", "1"), record("b", "2")])
            .await
            .unwrap();

        assert_eq!(
            output.results,
            vec![
                PutRecordResult::Accepted {
                    partition: 0,
                    sequence: 0
                },
                PutRecordResult::Accepted {
                    partition: 0,
                    sequence: 1
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_reader_replays_from_checkpoint() {
        let stream = MemoryStream::new(1);
        stream
            .put_records(vec![record("a", "1"), record("a", "2"), record("a", "3")])
            .await
            .unwrap();
        stream
            .commit(Checkpoint {
                partition: 0,
                next_sequence: 2,
            })
            .unwrap();
        stream.close();

        let mut reader = stream.reader();
        let first = reader.next_record().await.unwrap().unwrap();
        assert_eq!(first.sequence, 2);
        assert_eq!(reader.next_record().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_checkpoints_never_move_backwards() {
        let stream = MemoryStream::new(1);
        stream
            .commit(Checkpoint {
                partition: 0,
                next_sequence: 5,
            })
            .unwrap();
        stream
            .commit(Checkpoint {
                partition: 0,
                next_sequence: 3,
            })
            .unwrap();

        assert_eq!(stream.checkpoint(0), Some(5));
    }

    #[tokio::test]
    async fn test_reader_wakes_up_on_new_records() {
        let stream = MemoryStream::new(1);
        let mut reader = stream.reader();

        let handle = tokio::spawn(async move { reader.next_record().await });
        tokio::task::yield_now().await;
        stream.put_records(vec![record("a", "late")]).await.unwrap();

        let record = handle.await.unwrap().unwrap().unwrap();
        assert_eq!(record.data, "late");
    }

    #[tokio::test]
    async fn test_closed_stream_rejects_puts() {
        let stream = MemoryStream::new(1);
        stream.close();

        assert!(stream.put_records(vec![record("a", "1")]).await.is_err());
    }
}
