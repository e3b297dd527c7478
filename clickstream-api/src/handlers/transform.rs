use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, http::StatusCode, Json};
use tracing::{debug, error};

use clickstream_common::record::{InvocationResult, TransformRequest};
use clickstream_common::transform::{transform_invocation, RecordTransform};

/// Transform every record of an invocation, one result per record, in request order.
pub async fn post(
    State(record_transform): State<Arc<dyn RecordTransform>>,
    Json(request): Json<TransformRequest>,
) -> Result<Json<Vec<InvocationResult>>, (StatusCode, String)> {
    let records = request.records.len();
    let start = Instant::now();

    let results = tokio::task::spawn_blocking(move || {
        transform_invocation(record_transform.as_ref(), &request)
    })
    .await
    .map_err(|e| {
        error!("transform invocation task failed: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "transform invocation failed".to_owned(),
        )
    })?;

    metrics::counter!("clickstream_api_invocations_total").increment(1);
    metrics::histogram!("clickstream_api_invocation_duration_seconds")
        .record(start.elapsed().as_secs_f64());
    debug!(records, "served transform invocation");

    Ok(Json(results))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{self, Request, StatusCode},
        Router,
    };
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use clickstream_common::record::{InvocationResult, ResultKind};
    use clickstream_common::transform::RandomEnricher;
    use http_body_util::BodyExt; // for `collect`
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    use crate::handlers::app::add_routes;

    fn app() -> Router {
        add_routes(
            Router::new(),
            Arc::new(RandomEnricher::default()),
            1024 * 1024,
            4,
        )
    }

    async fn invoke(body: String) -> (StatusCode, Vec<InvocationResult>) {
        let response = app()
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/transform")
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let results = match status {
            StatusCode::OK => serde_json::from_slice(&body).unwrap(),
            _ => Vec::new(),
        };

        (status, results)
    }

    #[tokio::test]
    async fn empty_object_gets_a_random_field() {
        let body = serde_json::json!({
            "records": [{"recordId": "1", "data": STANDARD.encode("{}")}]
        });

        let (status, results) = invoke(body.to_string()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record_id, "1");
        assert_eq!(results[0].result, ResultKind::Ok);

        let data = STANDARD.decode(results[0].data.as_ref().unwrap()).unwrap();
        let value: Value = serde_json::from_slice(&data).unwrap();
        let random = value["random"].as_f64().unwrap();
        assert!((0.0..1.0).contains(&random));
        assert_eq!(value.as_object().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn results_follow_request_order() {
        let body = serde_json::json!({
            "records": [
                {"recordId": "a", "data": STANDARD.encode(r#"{"blog":"x"}"#)},
                {"recordId": "b", "data": STANDARD.encode("{not json")},
                {"recordId": "c", "data": STANDARD.encode("[1, 2]")},
                {"recordId": "d", "data": "%%%"},
            ]
        });

        let (status, results) = invoke(body.to_string()).await;

        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> = results.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
        let kinds: Vec<ResultKind> = results.iter().map(|r| r.result).collect();
        assert_eq!(
            kinds,
            vec![
                ResultKind::Ok,
                ResultKind::Failed,
                ResultKind::Dropped,
                ResultKind::Failed
            ]
        );
        assert!(results[1].data.is_none());
        assert!(results[1].error_message.is_some());
    }

    #[tokio::test]
    async fn malformed_invocation_is_rejected() {
        let (status, _) = invoke(r#"{"rows": []}"#.to_owned()).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
