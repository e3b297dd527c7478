//! Durable delivery of batches to object storage.
//!
//! Layout, with `<hour>` the `YYYY/MM/DD/HH` of the batch creation time:
//!
//! * raw backup: `<backup prefix><hour>/<batch id>.ndjson<ext>`, written once
//! * output: `<output prefix><hour>/<batch id>-<attempt>.ndjson<ext>`
//! * failed records: `<backup prefix>processing-failed/<hour>/<batch id>-<attempt>.ndjson<ext>`
//! * dead letters: `<backup prefix>dead-letter/<hour>/<batch id>.json`
//!
//! Output keys carry the attempt number, so a retried delivery never
//! overwrites what an earlier attempt wrote.
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, warn};
use uuid::Uuid;

use clickstream_common::batch::Batch;
use clickstream_common::compression::Codec;
use clickstream_common::record::{RecordResult, TransformedRecord};
use clickstream_common::storage::ObjectStore;

use crate::error::DeliveryError;

const PROCESSING_FAILED: &str = "processing-failed/";
const DEAD_LETTER: &str = "dead-letter/";

/// A bucket, a key prefix and the codec applied to objects written there.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    pub bucket: String,
    pub prefix: String,
    pub codec: Codec,
}

impl Destination {
    pub fn new(bucket: &str, prefix: &str, codec: Codec) -> Self {
        Self {
            bucket: bucket.to_owned(),
            prefix: prefix.to_owned(),
            codec,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    Failed(String),
}

/// What a single delivery attempt of a batch achieved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub batch_id: Uuid,
    pub attempt: u32,
    pub delivered: usize,
    pub dropped: usize,
    pub failed: usize,
    pub status: DeliveryStatus,
}

impl DeliveryOutcome {
    /// An attempt that failed before any record result was known.
    pub fn failed(batch_id: Uuid, attempt: u32, reason: &str) -> Self {
        Self {
            batch_id,
            attempt,
            delivered: 0,
            dropped: 0,
            failed: 0,
            status: DeliveryStatus::Failed(reason.to_owned()),
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.status == DeliveryStatus::Delivered
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BackupLine<'a> {
    record_id: String,
    partition_key: &'a str,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FailedLine<'a> {
    record_id: &'a str,
    error_message: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeadLetterManifest<'a> {
    batch_id: Uuid,
    partition_key: &'a str,
    attempts: u32,
    reason: &'a str,
    backup_bucket: &'a str,
    backup_key: String,
    record_ids: Vec<String>,
    dead_lettered_at: String,
}

fn time_path(at: OffsetDateTime) -> String {
    at.to_offset(UtcOffset::UTC)
        .format(format_description!("[year]/[month]/[day]/[hour]"))
        .unwrap_or_default()
}

fn ndjson<T: Serialize>(lines: impl Iterator<Item = T>) -> Result<Vec<u8>, serde_json::Error> {
    let mut body = Vec::new();
    for line in lines {
        serde_json::to_writer(&mut body, &line)?;
        body.push(b'\n');
    }

    Ok(body)
}

pub struct DeliverySink {
    store: Arc<dyn ObjectStore>,
    output: Destination,
    backup: Destination,
}

impl DeliverySink {
    pub fn new(store: Arc<dyn ObjectStore>, output: Destination, backup: Destination) -> Self {
        Self {
            store,
            output,
            backup,
        }
    }

    /// Key of the raw backup. It only depends on the batch, never on the attempt.
    pub fn backup_key(&self, batch: &Batch) -> String {
        format!(
            "{}{}/{}.ndjson{}",
            self.backup.prefix,
            time_path(batch.created_at()),
            batch.id(),
            self.backup.codec.extension()
        )
    }

    pub fn output_key(&self, batch: &Batch, attempt: u32) -> String {
        format!(
            "{}{}/{}-{}.ndjson{}",
            self.output.prefix,
            time_path(batch.created_at()),
            batch.id(),
            attempt,
            self.output.codec.extension()
        )
    }

    pub fn failed_key(&self, batch: &Batch, attempt: u32) -> String {
        format!(
            "{}{}{}/{}-{}.ndjson{}",
            self.backup.prefix,
            PROCESSING_FAILED,
            time_path(batch.created_at()),
            batch.id(),
            attempt,
            self.backup.codec.extension()
        )
    }

    pub fn dead_letter_key(&self, batch: &Batch) -> String {
        format!(
            "{}{}{}/{}.json",
            self.backup.prefix,
            DEAD_LETTER,
            time_path(batch.created_at()),
            batch.id()
        )
    }

    async fn put(
        &self,
        destination: &Destination,
        codec: Codec,
        key: &str,
        batch_id: Uuid,
        body: Vec<u8>,
    ) -> Result<(), DeliveryError> {
        let body = codec.compress(&body).map_err(|e| DeliveryError::Encode {
            batch_id,
            error: e.to_string(),
        })?;
        let bytes = body.len();

        self.store
            .put_object(&destination.bucket, key, body, codec.content_encoding())
            .await?;

        let labels = [("bucket", destination.bucket.clone())];
        metrics::counter!("clickstream_sink_bytes_written_total", &labels).increment(bytes as u64);
        debug!(batch_id = %batch_id, bucket = %destination.bucket, key, bytes, "wrote object");

        Ok(())
    }

    /// Write the untransformed batch to the backup destination.
    pub async fn backup(&self, batch: &Batch) -> Result<String, DeliveryError> {
        let body = ndjson(batch.records().iter().map(|record| BackupLine {
            record_id: record.record_id(),
            partition_key: &record.partition_key,
            data: STANDARD.encode(&record.data),
        }))
        .map_err(|e| DeliveryError::Encode {
            batch_id: batch.id(),
            error: e.to_string(),
        })?;

        let key = self.backup_key(batch);
        self.put(&self.backup, self.backup.codec, &key, batch.id(), body)
            .await?;

        Ok(key)
    }

    /// Persist the results of one transform attempt.
    ///
    /// `Ok` payloads go to the output destination, `Failed` records are kept
    /// as error records next to the backup, `Dropped` records are only counted.
    pub async fn deliver(
        &self,
        batch: &Batch,
        attempt: u32,
        results: &[TransformedRecord],
    ) -> DeliveryOutcome {
        let mut payloads = Vec::new();
        let mut failures = Vec::new();
        let mut dropped = 0;
        for record in results {
            match &record.result {
                RecordResult::Ok(payload) => {
                    payloads.extend_from_slice(payload);
                    payloads.push(b'\n');
                }
                RecordResult::Dropped(_) => dropped += 1,
                RecordResult::Failed(reason) => failures.push(FailedLine {
                    record_id: &record.record_id,
                    error_message: reason,
                }),
            }
        }

        let delivered = results.len() - dropped - failures.len();
        let failed = failures.len();
        let mut outcome = DeliveryOutcome {
            batch_id: batch.id(),
            attempt,
            delivered,
            dropped,
            failed,
            status: DeliveryStatus::Delivered,
        };

        if delivered > 0 {
            let key = self.output_key(batch, attempt);
            if let Err(e) = self
                .put(&self.output, self.output.codec, &key, batch.id(), payloads)
                .await
            {
                warn!(batch_id = %batch.id(), attempt, "failed to deliver batch: {}", e);
                outcome.status = DeliveryStatus::Failed(e.to_string());
                return outcome;
            }
        }

        if !failures.is_empty() {
            let written = match ndjson(failures.into_iter()) {
                Ok(body) => {
                    let key = self.failed_key(batch, attempt);
                    self.put(&self.backup, self.backup.codec, &key, batch.id(), body)
                        .await
                }
                Err(e) => Err(DeliveryError::Encode {
                    batch_id: batch.id(),
                    error: e.to_string(),
                }),
            };

            if let Err(e) = written {
                warn!(batch_id = %batch.id(), attempt, "failed to write failed records: {}", e);
                outcome.status = DeliveryStatus::Failed(e.to_string());
                return outcome;
            }
        }

        metrics::counter!("clickstream_records_delivered_total").increment(delivered as u64);
        metrics::counter!("clickstream_records_dropped_total").increment(dropped as u64);
        metrics::counter!("clickstream_records_failed_total").increment(failed as u64);

        outcome
    }

    /// Write a manifest for a batch that exhausted its retries.
    pub async fn dead_letter(
        &self,
        batch: &Batch,
        attempts: u32,
        reason: &str,
    ) -> Result<String, DeliveryError> {
        let manifest = DeadLetterManifest {
            batch_id: batch.id(),
            partition_key: batch.partition_key(),
            attempts,
            reason,
            backup_bucket: &self.backup.bucket,
            backup_key: self.backup_key(batch),
            record_ids: batch.records().iter().map(|r| r.record_id()).collect(),
            dead_lettered_at: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
        };
        let body = serde_json::to_vec(&manifest).map_err(|e| DeliveryError::Encode {
            batch_id: batch.id(),
            error: e.to_string(),
        })?;

        let key = self.dead_letter_key(batch);
        self.put(&self.backup, Codec::None, &key, batch.id(), body)
            .await?;

        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use clickstream_common::batch::{CloseReason, OpenBatch};
    use clickstream_common::event::LogRecord;
    use clickstream_common::storage::MemoryObjectStore;
    use serde_json::Value;
    use tokio::time::Instant;

    fn batch(payloads: &[&'static [u8]]) -> Batch {
        let mut open = OpenBatch::new("partition-a", Instant::now());
        for (sequence, data) in payloads.iter().enumerate() {
            open.push(LogRecord {
                partition: 0,
                sequence: sequence as i64,
                partition_key: "partition-a".to_owned(),
                data: Bytes::from_static(data),
                arrived_at: OffsetDateTime::UNIX_EPOCH,
            });
        }
        open.close(CloseReason::Count)
    }

    fn sink(store: &MemoryObjectStore) -> DeliverySink {
        DeliverySink::new(
            Arc::new(store.clone()),
            Destination::new("events", "out/", Codec::Zstd),
            Destination::new("events", "backup/", Codec::Gzip),
        )
    }

    fn lines(store: &MemoryObjectStore, bucket: &str, key: &str, codec: Codec) -> Vec<Value> {
        let object = store.get(bucket, key).expect("object was not written");
        let body = codec.decompress(&object.body).unwrap();
        String::from_utf8(body)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn keys_follow_time_layout() {
        let store = MemoryObjectStore::new();
        let sink = sink(&store);
        let batch = batch(&[b"{}"]);
        let path = time_path(batch.created_at());
        let id = batch.id();

        assert_eq!(path.len(), "2024/01/01/00".len());
        assert_eq!(sink.backup_key(&batch), format!("backup/{path}/{id}.ndjson.gz"));
        assert_eq!(sink.output_key(&batch, 2), format!("out/{path}/{id}-2.ndjson.zst"));
        assert_eq!(
            sink.failed_key(&batch, 1),
            format!("backup/processing-failed/{path}/{id}-1.ndjson.gz")
        );
        assert_eq!(
            sink.dead_letter_key(&batch),
            format!("backup/dead-letter/{path}/{id}.json")
        );
    }

    #[tokio::test]
    async fn backup_holds_raw_records() {
        let store = MemoryObjectStore::new();
        let sink = sink(&store);
        let batch = batch(&[b"{\"a\":1}", b"not json"]);

        let key = sink.backup(&batch).await.unwrap();

        let object = store.get("events", &key).unwrap();
        assert_eq!(object.content_encoding.as_deref(), Some("gzip"));
        let lines = lines(&store, "events", &key, Codec::Gzip);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["recordId"], "0-1");
        assert_eq!(lines[1]["partitionKey"], "partition-a");
        assert_eq!(lines[1]["data"], STANDARD.encode(b"not json"));
    }

    #[tokio::test]
    async fn deliver_splits_results() {
        let store = MemoryObjectStore::new();
        let sink = sink(&store);
        let batch = batch(&[b"{}", b"[]", b"{"]);
        let results = vec![
            TransformedRecord::new(
                "0-0",
                RecordResult::Ok(Bytes::from_static(b"{\"random\":0.5}")),
            ),
            TransformedRecord::new("0-1", RecordResult::Dropped("not an object".to_owned())),
            TransformedRecord::new("0-2", RecordResult::Failed("invalid JSON".to_owned())),
        ];

        let outcome = sink.deliver(&batch, 1, &results).await;

        assert!(outcome.is_delivered());
        assert_eq!((outcome.delivered, outcome.dropped, outcome.failed), (1, 1, 1));

        let output = lines(&store, "events", &sink.output_key(&batch, 1), Codec::Zstd);
        assert_eq!(output, vec![serde_json::json!({"random": 0.5})]);

        let failed = lines(&store, "events", &sink.failed_key(&batch, 1), Codec::Gzip);
        assert_eq!(
            failed,
            vec![serde_json::json!({"recordId": "0-2", "errorMessage": "invalid JSON"})]
        );
    }

    #[tokio::test]
    async fn nothing_to_deliver_writes_nothing() {
        let store = MemoryObjectStore::new();
        let sink = sink(&store);
        let batch = batch(&[b"[]"]);
        let results = vec![TransformedRecord::new(
            "0-0",
            RecordResult::Dropped("not an object".to_owned()),
        )];

        let outcome = sink.deliver(&batch, 1, &results).await;

        assert!(outcome.is_delivered());
        assert!(store.keys("events", "").is_empty());
    }

    #[tokio::test]
    async fn redelivery_keeps_earlier_attempts() {
        let store = MemoryObjectStore::new();
        let sink = sink(&store);
        let batch = batch(&[b"{}"]);
        let results = vec![TransformedRecord::new(
            "0-0",
            RecordResult::Ok(Bytes::from_static(b"{}")),
        )];

        sink.deliver(&batch, 1, &results).await;
        assert_eq!(store.keys("events", "out/").len(), 1);

        sink.deliver(&batch, 2, &results).await;
        let keys = store.keys("events", "out/");
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&sink.output_key(&batch, 1)));
        assert!(keys.contains(&sink.output_key(&batch, 2)));
    }

    #[tokio::test]
    async fn dead_letter_points_at_backup() {
        let store = MemoryObjectStore::new();
        let sink = sink(&store);
        let batch = batch(&[b"{}", b"{}"]);

        let key = sink.dead_letter(&batch, 6, "transform timed out").await.unwrap();

        let object = store.get("events", &key).unwrap();
        assert_eq!(object.content_encoding, None);
        let manifest: Value = serde_json::from_slice(&object.body).unwrap();
        assert_eq!(manifest["attempts"], 6);
        assert_eq!(manifest["backupKey"], sink.backup_key(&batch));
        assert_eq!(manifest["recordIds"], serde_json::json!(["0-0", "0-1"]));
    }
}
