//! Per-record enrichment.
//!
//! A transform maps one payload to one [`RecordResult`]. Failures of a single
//! record, including panics inside the transform, never leak into the other
//! records of the same invocation.
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use bytes::Bytes;
use serde_json::Value;

use crate::batch::Batch;
use crate::record::{InvocationResult, RecordResult, TransformRequest, TransformedRecord};

pub trait RecordTransform: Send + Sync {
    fn transform_record(&self, data: &[u8]) -> RecordResult;
}

/// Adds a uniformly distributed random number to every JSON object payload.
#[derive(Clone, Debug)]
pub struct RandomEnricher {
    field: String,
}

impl RandomEnricher {
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_owned(),
        }
    }
}

impl Default for RandomEnricher {
    fn default() -> Self {
        Self::new("random")
    }
}

impl RecordTransform for RandomEnricher {
    fn transform_record(&self, data: &[u8]) -> RecordResult {
        let mut value: Value = match serde_json::from_slice(data) {
            Ok(value) => value,
            Err(e) => return RecordResult::Failed(format!("invalid JSON payload: {e}")),
        };

        let Some(object) = value.as_object_mut() else {
            return RecordResult::Dropped("payload is not a JSON object".to_owned());
        };
        object.insert(self.field.clone(), Value::from(rand::random::<f64>()));

        match serde_json::to_vec(&value) {
            Ok(payload) => RecordResult::Ok(Bytes::from(payload)),
            Err(e) => RecordResult::Failed(format!("failed to serialize payload: {e}")),
        }
    }
}

/// Run the transform for one record, turning a panic into a `Failed` result.
pub fn transform_isolated(
    transform: &dyn RecordTransform,
    record_id: &str,
    data: &[u8],
) -> TransformedRecord {
    let result = panic::catch_unwind(AssertUnwindSafe(|| transform.transform_record(data)))
        .unwrap_or_else(|panic| RecordResult::Failed(panic_reason(panic)));

    let label = match &result {
        RecordResult::Ok(_) => "ok",
        RecordResult::Dropped(_) => "dropped",
        RecordResult::Failed(_) => "failed",
    };
    metrics::counter!("clickstream_transform_records_total", "result" => label).increment(1);

    TransformedRecord::new(record_id, result)
}

/// Transform every record of a batch, one result per record, in order.
pub fn transform_batch(transform: &dyn RecordTransform, batch: &Batch) -> Vec<TransformedRecord> {
    batch
        .records()
        .iter()
        .map(|record| transform_isolated(transform, &record.record_id(), &record.data))
        .collect()
}

/// Serve a transform invocation. Records whose data is not valid base64 fail on their own.
pub fn transform_invocation(
    transform: &dyn RecordTransform,
    request: &TransformRequest,
) -> Vec<InvocationResult> {
    request
        .records
        .iter()
        .map(|record| match record.decode_data() {
            Ok(data) => transform_isolated(transform, &record.record_id, &data),
            Err(e) => TransformedRecord::new(
                &record.record_id,
                RecordResult::Failed(format!("invalid base64 data: {e}")),
            ),
        })
        .map(InvocationResult::from)
        .collect()
}

fn panic_reason(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("transform panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("transform panicked: {message}")
    } else {
        "transform panicked".to_owned()
    }
}
