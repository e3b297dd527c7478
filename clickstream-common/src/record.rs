use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::batch::Batch;

/// The outcome of transforming one record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordResult {
    /// The transformed payload, ready for the primary destination.
    Ok(Bytes),
    /// The record was intentionally discarded.
    Dropped(String),
    /// The record could not be transformed.
    Failed(String),
}

impl RecordResult {
    pub fn kind(&self) -> ResultKind {
        match self {
            RecordResult::Ok(_) => ResultKind::Ok,
            RecordResult::Dropped(_) => ResultKind::Dropped,
            RecordResult::Failed(_) => ResultKind::Failed,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, RecordResult::Ok(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransformedRecord {
    pub record_id: String,
    pub result: RecordResult,
}

impl TransformedRecord {
    pub fn new(record_id: &str, result: RecordResult) -> Self {
        Self {
            record_id: record_id.to_owned(),
            result,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultKind {
    Ok,
    Dropped,
    Failed,
}

/// Body of a transform invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformRequest {
    pub records: Vec<InvocationRecord>,
}

impl TransformRequest {
    pub fn from_batch(batch: &Batch) -> Self {
        let records = batch
            .records()
            .iter()
            .map(|record| InvocationRecord {
                record_id: record.record_id(),
                data: STANDARD.encode(&record.data),
            })
            .collect();

        Self { records }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRecord {
    pub record_id: String,
    /// Base64 encoded payload.
    pub data: String,
}

impl InvocationRecord {
    pub fn decode_data(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.data)
    }
}

/// One element of a transform invocation response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResult {
    pub record_id: String,
    pub result: ResultKind,
    /// Base64 encoded transformed payload, only present when `result` is `Ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<TransformedRecord> for InvocationResult {
    fn from(record: TransformedRecord) -> Self {
        let kind = record.result.kind();
        let (data, error_message) = match record.result {
            RecordResult::Ok(payload) => (Some(STANDARD.encode(&payload)), None),
            RecordResult::Dropped(reason) | RecordResult::Failed(reason) => (None, Some(reason)),
        };

        Self {
            record_id: record.record_id,
            result: kind,
            data,
            error_message,
        }
    }
}

impl From<InvocationResult> for TransformedRecord {
    fn from(result: InvocationResult) -> Self {
        let reason = result.error_message.unwrap_or_default();
        let record_result = match result.result {
            ResultKind::Ok => match result.data.as_deref().map(|data| STANDARD.decode(data)) {
                Some(Ok(payload)) => RecordResult::Ok(Bytes::from(payload)),
                Some(Err(e)) => RecordResult::Failed(format!("invalid base64 in response: {e}")),
                None => RecordResult::Failed("Ok result without data".to_owned()),
            },
            ResultKind::Dropped => RecordResult::Dropped(reason),
            ResultKind::Failed => RecordResult::Failed(reason),
        };

        Self {
            record_id: result.record_id,
            result: record_result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ok_result_serializes_without_error_message() {
        let result = InvocationResult::from(TransformedRecord::new(
            "1",
            RecordResult::Ok(Bytes::from_static(b"{}")),
        ));

        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"recordId": "1", "result": "Ok", "data": "e30="})
        );
    }

    #[test]
    fn failed_result_has_no_data() {
        let result = InvocationResult::from(TransformedRecord::new(
            "7",
            RecordResult::Failed("bad json".to_owned()),
        ));

        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"recordId": "7", "result": "Failed", "errorMessage": "bad json"})
        );
    }

    #[test]
    fn ok_response_without_data_is_failed() {
        let result: InvocationResult =
            serde_json::from_value(json!({"recordId": "2", "result": "Ok"})).unwrap();

        let record = TransformedRecord::from(result);

        assert_eq!(record.record_id, "2");
        assert!(matches!(record.result, RecordResult::Failed(_)));
    }

    #[test]
    fn request_parses_camel_case() {
        let request: TransformRequest =
            serde_json::from_value(json!({"records": [{"recordId": "1", "data": "e30="}]}))
                .unwrap();

        assert_eq!(request.records[0].record_id, "1");
        assert_eq!(request.records[0].decode_data().unwrap(), b"{}");
    }
}
