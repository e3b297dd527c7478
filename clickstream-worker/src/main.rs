//! Consume clickstream records from Kafka, batch them, transform them and deliver them to S3.
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use clickstream_common::health::HealthRegistry;
use clickstream_common::kafka::KafkaStreamReader;
use clickstream_common::metrics::{serve, setup_metrics_router};
use clickstream_common::storage::S3ObjectStore;
use clickstream_common::transform::RandomEnricher;
use clickstream_worker::buffer::run_buffer;
use clickstream_worker::checkpoint::CheckpointTracker;
use clickstream_worker::config::Config;
use clickstream_worker::controller::RetryController;
use clickstream_worker::error::WorkerError;
use clickstream_worker::sink::DeliverySink;
use clickstream_worker::transform::{
    HttpTransformer, LocalTransformer, TransformStage, Transformer,
};
use clickstream_worker::worker::DeliveryWorker;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");
    config.validate()?;

    let liveness = HealthRegistry::new("liveness");

    let store = S3ObjectStore::from_env(config.sink.s3_endpoint.clone()).await;
    store.check_bucket(&config.sink.output_bucket).await?;
    store.check_bucket(&config.sink.backup_bucket).await?;

    let reader = KafkaStreamReader::new(
        &config.kafka,
        liveness.register("rdkafka", Duration::from_secs(30)),
    )
    .expect("failed to start Kafka consumer");
    let checkpointer = Arc::new(reader.checkpointer());

    let transformer: Arc<dyn Transformer> = match config.transform_url() {
        Some(url) => {
            info!("invoking transform at {}", url);
            Arc::new(
                HttpTransformer::new(url, config.transform_timeout_ms.0)
                    .expect("failed to construct reqwest client for transform"),
            )
        }
        None => Arc::new(LocalTransformer::new(Arc::new(RandomEnricher::default()))),
    };

    let tracker = Arc::new(CheckpointTracker::new());
    let worker = Arc::new(DeliveryWorker::new(
        TransformStage::new(transformer, config.transform_timeout_ms.0),
        DeliverySink::new(Arc::new(store), config.sink.output(), config.sink.backup()),
        RetryController::new(config.retry_policy.provide()),
        tracker.clone(),
        checkpointer,
        config.max_concurrent_batches,
        liveness.register("worker", Duration::from_secs(60)),
    ));

    let router = setup_metrics_router(liveness.clone()).expect("failed to setup metrics recorder");
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("shutting down, draining open batches");
            cancel.cancel();
        });
    }

    let (outbound, inbound) = mpsc::unbounded_channel();
    let buffer = tokio::spawn(run_buffer(
        reader,
        config.buffer(),
        outbound,
        tracker,
        cancel,
    ));

    worker.run(inbound).await;

    match buffer.await {
        Ok(result) => result,
        Err(e) => {
            error!("buffer task failed: {}", e);
            Ok(())
        }
    }
}
