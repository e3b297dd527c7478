use std::future::ready;
use std::sync::Arc;

use axum::{routing::get, Router};
use config::Config;
use envconfig::Envconfig;
use eyre::Result;
use tracing_subscriber::EnvFilter;

use clickstream_common::metrics::{setup_metrics_recorder, track_metrics};
use clickstream_common::transform::RandomEnricher;

mod config;
mod handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let recorder_handle = setup_metrics_recorder().expect("failed to setup metrics recorder");
    let app = handlers::add_routes(
        Router::new(),
        Arc::new(RandomEnricher::default()),
        config.max_body_size,
        config.concurrency_limit,
    )
    .route("/metrics", get(move || ready(recorder_handle.render())))
    .layer(axum::middleware::from_fn(track_metrics));

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start clickstream-api http server, {}", e),
    }
}
