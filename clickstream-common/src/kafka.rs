//! Kafka bindings for the ingestion endpoint and the stream reader.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use envconfig::Envconfig;
use metrics::gauge;
use rdkafka::consumer::{Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, Message};
use time::OffsetDateTime;
use tracing::{debug, error, info};

use crate::event::{LogRecord, StreamRecord};
use crate::health::HealthHandle;
use crate::stream::{
    Checkpoint, Checkpointer, IngestionEndpoint, IngestionError, PutRecordResult,
    PutRecordsOutput, StreamError, StreamReader,
};

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "clickstream_events")]
    pub kafka_topic: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message

    #[envconfig(default = "clickstream-worker")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest
}

impl KafkaConfig {
    fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set("statistics.interval.ms", "10000");

        if self.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        client_config
    }
}

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // The rdkafka loop is running and calling us
        self.liveness.report_healthy();

        gauge!("clickstream_kafka_queue_depth").set(stats.msg_cnt as f64);
        gauge!("clickstream_kafka_queue_bytes").set(stats.msg_size as f64);
    }
}

impl ConsumerContext for KafkaContext {}

/// Ingestion endpoint producing records to a Kafka topic, keyed by partition key.
pub struct KafkaIngestion {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaIngestion {
    pub fn new(config: &KafkaConfig, liveness: HealthHandle) -> Result<Self, KafkaError> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);
        let mut client_config = config.client_config();
        client_config
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            );

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext { liveness })?;

        // Ping the cluster to make sure we can reach brokers
        if let Err(e) = producer
            .client()
            .fetch_metadata(None, Duration::from_secs(15))
        {
            error!("failed to fetch metadata from Kafka brokers: {:?}", e);
            return Err(e);
        }
        info!("connected to Kafka brokers");

        Ok(Self {
            producer,
            topic: config.kafka_topic.clone(),
        })
    }
}

#[async_trait]
impl IngestionEndpoint for KafkaIngestion {
    async fn put_records(
        &self,
        records: Vec<StreamRecord>,
    ) -> Result<PutRecordsOutput, IngestionError> {
        let mut deliveries = Vec::with_capacity(records.len());

        for record in &records {
            let delivery = self
                .producer
                .send_result(FutureRecord {
                    topic: self.topic.as_str(),
                    payload: Some(&record.data[..]),
                    partition: None,
                    key: Some(record.partition_key.as_str()),
                    timestamp: None,
                    headers: None,
                })
                .map_err(|(e, _)| e);
            deliveries.push(delivery);
        }

        let mut results = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            let result = match delivery {
                Ok(future) => match future.await {
                    Ok(Ok((partition, offset))) => PutRecordResult::Accepted {
                        partition,
                        sequence: offset,
                    },
                    Ok(Err((e, _))) => PutRecordResult::Rejected {
                        error: e.to_string(),
                    },
                    Err(_) => PutRecordResult::Rejected {
                        error: "delivery canceled".to_owned(),
                    },
                },
                Err(e) => PutRecordResult::Rejected {
                    error: e.to_string(),
                },
            };
            results.push(result);
        }

        Ok(PutRecordsOutput::from_results(results))
    }
}

/// Stream reader consuming the topic with manually stored offsets.
pub struct KafkaStreamReader {
    consumer: Arc<StreamConsumer<KafkaContext>>,
    topic: String,
}

impl KafkaStreamReader {
    pub fn new(config: &KafkaConfig, liveness: HealthHandle) -> Result<Self, KafkaError> {
        let mut client_config = config.client_config();
        client_config
            .set("group.id", &config.kafka_consumer_group)
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false");

        let consumer: StreamConsumer<KafkaContext> =
            client_config.create_with_context(KafkaContext { liveness })?;
        consumer.subscribe(&[config.kafka_topic.as_str()])?;

        Ok(Self {
            consumer: Arc::new(consumer),
            topic: config.kafka_topic.clone(),
        })
    }

    pub fn checkpointer(&self) -> KafkaCheckpointer {
        KafkaCheckpointer {
            consumer: self.consumer.clone(),
            topic: self.topic.clone(),
        }
    }
}

#[async_trait]
impl StreamReader for KafkaStreamReader {
    async fn next_record(&mut self) -> Result<Option<LogRecord>, StreamError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| StreamError::Read(e.to_string()))?;

        let partition_key = message
            .key()
            .map(|key| String::from_utf8_lossy(key).into_owned())
            .unwrap_or_default();
        let arrived_at = message
            .timestamp()
            .to_millis()
            .and_then(|millis| {
                OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
            })
            .unwrap_or_else(OffsetDateTime::now_utc);

        Ok(Some(LogRecord {
            partition: message.partition(),
            sequence: message.offset(),
            partition_key,
            data: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
            arrived_at,
        }))
    }
}

pub struct KafkaCheckpointer {
    consumer: Arc<StreamConsumer<KafkaContext>>,
    topic: String,
}

impl Checkpointer for KafkaCheckpointer {
    fn commit(&self, checkpoint: Checkpoint) -> Result<(), StreamError> {
        if checkpoint.next_sequence <= 0 {
            return Ok(());
        }

        // librdkafka stores offset + 1, so we hand it the last finished offset.
        self.consumer
            .store_offset(
                &self.topic,
                checkpoint.partition,
                checkpoint.next_sequence - 1,
            )
            .map_err(|e| StreamError::Checkpoint(e.to_string()))
    }
}
