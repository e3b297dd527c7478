//! Simulate a reader scrolling through a page and produce scroll events to Kafka.
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use clickstream_common::health::HealthRegistry;
use clickstream_common::kafka::KafkaIngestion;
use clickstream_common::metrics::{serve, setup_metrics_router};
use clickstream_producer::config::Config;
use clickstream_producer::producer::Producer;
use clickstream_producer::scroll::{ScrollMeasure, ScrollSignal};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");
    let identity_id = config
        .identity_id
        .as_ref()
        .map(|id| id.as_str().to_owned())
        .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());

    let ingestion = KafkaIngestion::new(
        &config.kafka,
        liveness.register("rdkafka", Duration::from_secs(30)),
    )
    .expect("failed to start Kafka producer");

    let producer = Arc::new(Producer::new(
        ScrollMeasure::new(config.page_url.as_str(), config.client_height, &identity_id),
        Arc::new(ingestion),
        config.flush_interval_ms.0,
        config.debounce_ms.0,
    ));

    let router = setup_metrics_router(liveness.clone()).expect("failed to setup metrics recorder");
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let cancel = CancellationToken::new();
    let flush_loop = {
        let producer = producer.clone();
        let cancel = cancel.clone();
        let handle = liveness.register("flush_loop", config.flush_interval_ms.0 * 5);
        tokio::spawn(async move { producer.run(handle, cancel).await })
    };

    info!(identity_id = %identity_id, "simulating scroll events");
    let mut tick = tokio::time::interval(config.scroll_tick_ms.0);
    let max_top = config.page_height.saturating_sub(config.client_height);
    let mut scroll_top: u32 = 0;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutting down producer");
                cancel.cancel();
                break;
            }
            _ = tick.tick() => {
                let step: i64 = rand::thread_rng().gen_range(-120..=240);
                scroll_top = (scroll_top as i64 + step).clamp(0, max_top as i64) as u32;
                producer.observe(ScrollSignal {
                    scroll_top,
                    scroll_height: config.page_height,
                });
            }
        }
    }

    if let Err(e) = flush_loop.await {
        error!("flush loop did not shut down cleanly: {}", e);
    }
}
