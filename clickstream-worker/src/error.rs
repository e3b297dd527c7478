use std::time;

use clickstream_common::storage::StorageError;
use clickstream_common::stream::StreamError;
use thiserror::Error;
use uuid::Uuid;

/// Configuration the worker refuses to start with.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} bucket must not be empty")]
    EmptyBucket(&'static str),
    #[error("output and backup destinations are both {bucket}/{prefix}")]
    SameDestination { bucket: String, prefix: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("invalid transform url: {0}")]
    InvalidTransformUrl(String),
}

/// Errors failing a whole transform attempt. Per-record failures are results, not errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("transform did not finish within {0:?}")]
    Timeout(time::Duration),
    #[error("transform invocation failed: {0}")]
    Invocation(String),
    #[error("transform returned {returned} results for {expected} records")]
    ResultCount { expected: usize, returned: usize },
}

/// Errors writing a batch to durable storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("failed to encode batch {batch_id}: {error}")]
    Encode { batch_id: Uuid, error: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors related to the retry state of a batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    #[error("batch {0} is not registered")]
    UnknownBatch(Uuid),
    #[error("batch {0} already has an attempt in flight")]
    AlreadyInFlight(Uuid),
    #[error("batch {0} is already delivered or dead-lettered")]
    Terminal(Uuid),
    #[error("batch {batch_id} has no attempt {attempt} in flight")]
    NotInFlight { batch_id: Uuid, attempt: u32 },
}

/// Errors stopping the worker pipeline.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("outbound batch channel closed")]
    OutboundClosed,
}
