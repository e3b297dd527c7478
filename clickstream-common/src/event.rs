use bytes::Bytes;
use serde_json::Value;
use time::OffsetDateTime;

/// A single measurement produced on the client.
///
/// Events are immutable once created: the producer moves them into the
/// ingestion endpoint and keeps no reference behind.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    payload: Value,
    partition_key: String,
    timestamp: OffsetDateTime,
}

impl Event {
    pub fn new(payload: Value, partition_key: &str, timestamp: OffsetDateTime) -> Self {
        Self {
            payload,
            partition_key: partition_key.to_owned(),
            timestamp,
        }
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    /// Serialize this event into the record shape accepted by an ingestion endpoint.
    pub fn into_record(self) -> Result<StreamRecord, serde_json::Error> {
        let data = serde_json::to_vec(&self.payload)?;

        Ok(StreamRecord {
            data: Bytes::from(data),
            partition_key: self.partition_key,
        })
    }
}

/// A record as sent to the stream by `put_records`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRecord {
    pub data: Bytes,
    pub partition_key: String,
}

/// A record read back from the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub partition: i32,
    pub sequence: i64,
    pub partition_key: String,
    pub data: Bytes,
    pub arrived_at: OffsetDateTime,
}

impl LogRecord {
    /// An identifier unique within the stream, stable across re-reads of the same record.
    pub fn record_id(&self) -> String {
        format!("{}-{}", self.partition, self.sequence)
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}
