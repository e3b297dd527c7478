use std::convert::Infallible;
use std::sync::Arc;

use axum::{extract::DefaultBodyLimit, routing, Router};
use tower::limit::ConcurrencyLimitLayer;

use clickstream_common::transform::RecordTransform;

use super::transform;

pub fn add_routes(
    router: Router,
    record_transform: Arc<dyn RecordTransform>,
    max_body_size: usize,
    concurrency_limit: usize,
) -> Router {
    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index)) // No async loop for now, just check axum health
        .route(
            "/transform",
            routing::post(transform::post)
                .with_state(record_transform)
                .layer::<_, Infallible>(ConcurrencyLimitLayer::new(concurrency_limit))
                .layer(DefaultBodyLimit::max(max_body_size)),
        )
}

pub async fn index() -> &'static str {
    "clickstream api"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use clickstream_common::transform::RandomEnricher;
    use http_body_util::BodyExt; // for `collect`
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    fn app() -> Router {
        add_routes(Router::new(), Arc::new(RandomEnricher::default()), 1024, 4)
    }

    #[tokio::test]
    async fn index() {
        let response = app()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"clickstream api");
    }

    #[tokio::test]
    async fn liveness() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/_liveness")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let records: Vec<String> = (0..100)
            .map(|i| format!(r#"{{"recordId":"{i}","data":"e30="}}"#))
            .collect();
        let body = format!(r#"{{"records":[{}]}}"#, records.join(","));

        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/transform")
                    .header("Content-Type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
