//! Buffering of stream records into batches.
//!
//! Records are grouped by partition key. A batch is released as soon as it
//! reaches the byte or record threshold, or once its first record has waited
//! for the buffering interval, whichever comes first. Every trigger goes
//! through the same close path, which removes the batch from the open set,
//! so a batch is released exactly once.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use clickstream_common::batch::{Batch, CloseReason, OpenBatch};
use clickstream_common::event::LogRecord;
use clickstream_common::stream::StreamReader;

use crate::checkpoint::CheckpointTracker;
use crate::error::WorkerError;

#[derive(Clone, Copy, Debug)]
pub struct BufferConfig {
    pub max_batch_bytes: usize,
    pub max_batch_records: usize,
    pub max_batch_interval: Duration,
}

pub struct BatchBuffer {
    config: BufferConfig,
    open: HashMap<String, OpenBatch>,
}

impl BatchBuffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            open: HashMap::new(),
        }
    }

    /// Append a record to the open batch of its partition key.
    ///
    /// Returns the batches this closed: an expired batch for the same key is
    /// released before the record starts a new one.
    pub fn ingest(&mut self, record: LogRecord, now: Instant) -> Vec<Batch> {
        let mut closed = Vec::new();
        let key = record.partition_key.clone();

        if let Some(open) = self.open.get(&key) {
            if now >= open.opened_at() + self.config.max_batch_interval {
                closed.extend(self.close(&key, CloseReason::Interval));
            }
        }

        let open = self
            .open
            .entry(key.clone())
            .or_insert_with(|| OpenBatch::new(&key, now));
        open.push(record);

        let reason = if open.size_bytes() >= self.config.max_batch_bytes {
            Some(CloseReason::Size)
        } else if open.len() >= self.config.max_batch_records {
            Some(CloseReason::Count)
        } else {
            None
        };

        if let Some(reason) = reason {
            closed.extend(self.close(&key, reason));
        }

        closed
    }

    /// Close every batch whose first record is at least the buffering interval old.
    pub fn poll_expired(&mut self, now: Instant) -> Vec<Batch> {
        let mut expired: Vec<(Instant, String)> = self
            .open
            .iter()
            .filter(|(_, open)| now >= open.opened_at() + self.config.max_batch_interval)
            .map(|(key, open)| (open.opened_at(), key.clone()))
            .collect();
        expired.sort();

        expired
            .into_iter()
            .filter_map(|(_, key)| self.close(&key, CloseReason::Interval))
            .collect()
    }

    /// The earliest instant at which an open batch expires.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.open
            .values()
            .map(|open| open.opened_at() + self.config.max_batch_interval)
            .min()
    }

    /// Close every open batch, oldest first.
    pub fn drain(&mut self) -> Vec<Batch> {
        let mut open: Vec<OpenBatch> = self.open.drain().map(|(_, open)| open).collect();
        open.sort_by_key(|open| open.opened_at());

        open.into_iter()
            .map(|open| open.close(CloseReason::Shutdown))
            .collect()
    }

    pub fn open_batches(&self) -> usize {
        self.open.len()
    }

    fn close(&mut self, key: &str, reason: CloseReason) -> Option<Batch> {
        let batch = self.open.remove(key)?.close(reason);

        metrics::counter!("clickstream_batches_closed_total", "reason" => reason.to_string())
            .increment(1);
        metrics::histogram!("clickstream_batch_records").record(batch.len() as f64);
        debug!(
            batch_id = %batch.id(),
            partition_key = batch.partition_key(),
            records = batch.len(),
            bytes = batch.size_bytes(),
            "closed batch on {}",
            reason
        );

        Some(batch)
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn emit(outbound: &UnboundedSender<Arc<Batch>>, batches: Vec<Batch>) -> Result<(), WorkerError> {
    for batch in batches {
        outbound
            .send(Arc::new(batch))
            .map_err(|_| WorkerError::OutboundClosed)?;
    }

    Ok(())
}

/// Read the stream into the buffer until it ends or `cancel` fires, releasing
/// closed batches on `outbound`. Open batches are drained on the way out.
pub async fn run_buffer<R: StreamReader>(
    mut reader: R,
    config: BufferConfig,
    outbound: UnboundedSender<Arc<Batch>>,
    tracker: Arc<CheckpointTracker>,
    cancel: CancellationToken,
) -> Result<(), WorkerError> {
    let mut buffer = BatchBuffer::new(config);

    let result = loop {
        let deadline = buffer.next_deadline();

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("buffer cancelled, draining {} open batches", buffer.open_batches());
                break Ok(());
            }
            _ = sleep_until_deadline(deadline) => {
                let expired = buffer.poll_expired(Instant::now());
                if let Err(e) = emit(&outbound, expired) {
                    break Err(e);
                }
            }
            record = reader.next_record() => match record {
                Ok(Some(record)) => {
                    tracker.track(&record);
                    let closed = buffer.ingest(record, Instant::now());
                    if let Err(e) = emit(&outbound, closed) {
                        break Err(e);
                    }
                }
                Ok(None) => {
                    info!("stream ended, draining {} open batches", buffer.open_batches());
                    break Ok(());
                }
                Err(e) => {
                    error!("failed to read from stream: {}", e);
                    break Err(WorkerError::from(e));
                }
            }
        }
    };

    emit(&outbound, buffer.drain())?;
    result
}
