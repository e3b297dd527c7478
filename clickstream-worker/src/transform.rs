use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use url::Url;

use clickstream_common::batch::Batch;
use clickstream_common::record::{
    InvocationResult, RecordResult, TransformRequest, TransformedRecord,
};
use clickstream_common::transform::{transform_batch, RecordTransform};

use crate::error::TransformError;

/// Runs the per-record transform over a whole batch.
///
/// Implementations return exactly one result per record, in batch order.
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(&self, batch: Arc<Batch>) -> Result<Vec<TransformedRecord>, TransformError>;
}

/// Runs the transform in process, on the blocking thread pool.
pub struct LocalTransformer {
    transform: Arc<dyn RecordTransform>,
}

impl LocalTransformer {
    pub fn new(transform: Arc<dyn RecordTransform>) -> Self {
        Self { transform }
    }
}

#[async_trait]
impl Transformer for LocalTransformer {
    async fn transform(&self, batch: Arc<Batch>) -> Result<Vec<TransformedRecord>, TransformError> {
        let transform = self.transform.clone();

        tokio::task::spawn_blocking(move || transform_batch(transform.as_ref(), &batch))
            .await
            .map_err(|e| TransformError::Invocation(e.to_string()))
    }
}

/// Invokes a remote transform over HTTP.
pub struct HttpTransformer {
    client: reqwest::Client,
    url: Url,
}

impl HttpTransformer {
    pub fn new(url: Url, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("clickstream-worker")
            .timeout(request_timeout)
            .build()?;

        Ok(Self { client, url })
    }
}

/// Pair a response with the batch records. A record missing from the response fails on its own.
fn match_results(batch: &Batch, results: Vec<InvocationResult>) -> Vec<TransformedRecord> {
    let mut by_id: HashMap<String, InvocationResult> = results
        .into_iter()
        .map(|result| (result.record_id.clone(), result))
        .collect();

    batch
        .records()
        .iter()
        .map(|record| {
            let record_id = record.record_id();
            match by_id.remove(&record_id) {
                Some(result) => TransformedRecord::from(result),
                None => TransformedRecord::new(
                    &record_id,
                    RecordResult::Failed("record missing from transform response".to_owned()),
                ),
            }
        })
        .collect()
}

#[async_trait]
impl Transformer for HttpTransformer {
    async fn transform(&self, batch: Arc<Batch>) -> Result<Vec<TransformedRecord>, TransformError> {
        let request = TransformRequest::from_batch(&batch);

        let response = self
            .client
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| TransformError::Invocation(e.to_string()))?;

        let results: Vec<InvocationResult> = response
            .json()
            .await
            .map_err(|e| TransformError::Invocation(e.to_string()))?;

        Ok(match_results(&batch, results))
    }
}

/// A transformer bounded by a deadline. Missing the deadline fails the whole attempt.
pub struct TransformStage {
    transformer: Arc<dyn Transformer>,
    timeout: Duration,
}

impl TransformStage {
    pub fn new(transformer: Arc<dyn Transformer>, timeout: Duration) -> Self {
        Self {
            transformer,
            timeout,
        }
    }

    pub async fn run(&self, batch: Arc<Batch>) -> Result<Vec<TransformedRecord>, TransformError> {
        let expected = batch.len();
        let start = tokio::time::Instant::now();

        let results = tokio::time::timeout(self.timeout, self.transformer.transform(batch))
            .await
            .map_err(|_| TransformError::Timeout(self.timeout))??;

        metrics::histogram!("clickstream_transform_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        if results.len() != expected {
            return Err(TransformError::ResultCount {
                expected,
                returned: results.len(),
            });
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use axum::{routing::post, Json, Router};
    use bytes::Bytes;
    use clickstream_common::batch::{CloseReason, OpenBatch};
    use clickstream_common::event::LogRecord;
    use clickstream_common::record::ResultKind;
    use clickstream_common::transform::RandomEnricher;
    use serde_json::Value;
    use time::OffsetDateTime;
    use tokio::time::Instant;

    fn batch(payloads: &[&'static [u8]]) -> Arc<Batch> {
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
        Arc::new(open.close(CloseReason::Count))
    }

    struct Stalled;

    #[async_trait]
    impl Transformer for Stalled {
        async fn transform(
            &self,
            _batch: Arc<Batch>,
        ) -> Result<Vec<TransformedRecord>, TransformError> {
            std::future::pending().await
        }
    }

    struct Truncating;

    #[async_trait]
    impl Transformer for Truncating {
        async fn transform(
            &self,
            _batch: Arc<Batch>,
        ) -> Result<Vec<TransformedRecord>, TransformError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn local_transform_isolates_malformed_records() {
        let stage = TransformStage::new(
            Arc::new(LocalTransformer::new(Arc::new(RandomEnricher::default()))),
            Duration::from_secs(5),
        );
        let batch = batch(&[b"{\"a\":1}", b"{\"b\":2}", b"{oops", b"{\"c\":3}"]);

        let results = stage.run(batch.clone()).await.unwrap();

        assert_eq!(results.len(), 4);
        for (index, (result, record)) in results.iter().zip(batch.records()).enumerate() {
            assert_eq!(result.record_id, record.record_id());
            assert_eq!(matches!(result.result, RecordResult::Failed(_)), index == 2);
        }
        let RecordResult::Ok(payload) = &results[0].result else {
            panic!("expected an Ok result");
        };
        let value: Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(value["a"], 1);
        assert!(value["random"].as_f64().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fails_the_attempt() {
        let stage = TransformStage::new(Arc::new(Stalled), Duration::from_secs(30));

        assert_eq!(
            stage.run(batch(&[b"{}"])).await,
            Err(TransformError::Timeout(Duration::from_secs(30)))
        );
    }

    #[tokio::test]
    async fn missing_results_fail_the_attempt() {
        let stage = TransformStage::new(Arc::new(Truncating), Duration::from_secs(30));

        assert_eq!(
            stage.run(batch(&[b"{}", b"{}"])).await,
            Err(TransformError::ResultCount {
                expected: 2,
                returned: 0
            })
        );
    }

    #[test]
    fn unmatched_response_records_fail() {
        let batch = batch(&[b"{}", b"{}"]);
        let results = vec![InvocationResult {
            record_id: "0-1".to_owned(),
            result: ResultKind::Dropped,
            data: None,
            error_message: Some("not an object".to_owned()),
        }];

        let matched = match_results(&batch, results);

        assert!(matches!(matched[0].result, RecordResult::Failed(_)));
        assert_eq!(
            matched[1].result,
            RecordResult::Dropped("not an object".to_owned())
        );
    }

    async fn serve_echo() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/transform",
            post(|Json(request): Json<TransformRequest>| async move {
                Json(clickstream_common::transform::transform_invocation(
                    &RandomEnricher::default(),
                    &request,
                ))
            }),
        );
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        addr
    }

    #[tokio::test]
    async fn http_transformer_round_trips_record_ids() {
        let addr = serve_echo().await;
        let url = Url::parse(&format!("http://{}/transform", addr)).unwrap();
        let transformer = HttpTransformer::new(url, Duration::from_secs(5)).unwrap();
        let batch = batch(&[b"{}", b"42"]);

        let results = transformer.transform(batch.clone()).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].record_id, "0-0");
        assert!(results[0].result.is_ok());
        assert_eq!(results[1].record_id, "0-1");
        assert!(matches!(results[1].result, RecordResult::Dropped(_)));
    }
}
