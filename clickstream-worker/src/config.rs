use envconfig::Envconfig;
use url::Url;

use clickstream_common::compression::Codec;
use clickstream_common::config::{EnvMsDuration, NonEmptyString};
use clickstream_common::kafka::KafkaConfig;
use clickstream_common::retry::RetryPolicy;

use crate::buffer::BufferConfig;
use crate::error::ConfigError;
use crate::sink::Destination;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    #[envconfig(default = "209715")]
    pub buffer_max_bytes: usize,

    #[envconfig(default = "500")]
    pub buffer_max_records: usize,

    #[envconfig(default = "60000")]
    pub buffer_interval_ms: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub transform_timeout_ms: EnvMsDuration,

    /// Invoke the transform over HTTP when set, in process otherwise.
    pub transform_url: Option<NonEmptyString>,

    #[envconfig(default = "64")]
    pub max_concurrent_batches: usize,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    #[envconfig(nested = true)]
    pub sink: SinkConfig,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_max_bytes == 0 {
            return Err(ConfigError::Zero("BUFFER_MAX_BYTES"));
        }
        if self.buffer_max_records == 0 {
            return Err(ConfigError::Zero("BUFFER_MAX_RECORDS"));
        }
        if self.max_concurrent_batches == 0 {
            return Err(ConfigError::Zero("MAX_CONCURRENT_BATCHES"));
        }
        if self.retry_policy.backoff_coefficient == 0 {
            return Err(ConfigError::Zero("BACKOFF_COEFFICIENT"));
        }
        if let Some(url) = &self.transform_url {
            Url::parse(url.as_str())
                .map_err(|e| ConfigError::InvalidTransformUrl(format!("{}: {}", url.as_str(), e)))?;
        }

        self.sink.validate()
    }

    pub fn transform_url(&self) -> Option<Url> {
        self.transform_url
            .as_ref()
            .and_then(|url| Url::parse(url.as_str()).ok())
    }

    pub fn buffer(&self) -> BufferConfig {
        BufferConfig {
            max_batch_bytes: self.buffer_max_bytes,
            max_batch_records: self.buffer_max_records,
            max_batch_interval: self.buffer_interval_ms.0,
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "5")]
    pub max_retries: u32,

    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "60000")]
    pub maximum_interval: EnvMsDuration,
}

impl RetryPolicyConfig {
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy::build(self.backoff_coefficient, self.initial_interval.0)
            .max_retries(self.max_retries)
            .maximum_interval(self.maximum_interval.0)
            .provide()
    }
}

#[derive(Envconfig, Clone)]
pub struct SinkConfig {
    #[envconfig(default = "clickstream-events")]
    pub output_bucket: String,

    #[envconfig(default = "")]
    pub output_prefix: String,

    #[envconfig(default = "zstd")]
    pub output_compression: Codec,

    #[envconfig(default = "clickstream-events")]
    pub backup_bucket: String,

    #[envconfig(default = "backup/")]
    pub backup_prefix: String,

    #[envconfig(default = "gzip")]
    pub backup_compression: Codec,

    /// Custom S3 compatible endpoint, implies path style addressing.
    pub s3_endpoint: Option<String>,
}

impl SinkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_bucket.trim().is_empty() {
            return Err(ConfigError::EmptyBucket("OUTPUT_BUCKET"));
        }
        if self.backup_bucket.trim().is_empty() {
            return Err(ConfigError::EmptyBucket("BACKUP_BUCKET"));
        }
        if self.output_bucket == self.backup_bucket && self.output_prefix == self.backup_prefix {
            return Err(ConfigError::SameDestination {
                bucket: self.output_bucket.clone(),
                prefix: self.output_prefix.clone(),
            });
        }

        Ok(())
    }

    pub fn output(&self) -> Destination {
        Destination::new(&self.output_bucket, &self.output_prefix, self.output_compression)
    }

    pub fn backup(&self) -> Destination {
        Destination::new(&self.backup_bucket, &self.backup_prefix, self.backup_compression)
    }
}
