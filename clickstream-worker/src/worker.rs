use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info};

use clickstream_common::batch::Batch;
use clickstream_common::health::HealthHandle;
use clickstream_common::stream::Checkpointer;

use crate::checkpoint::CheckpointTracker;
use crate::controller::{Decision, RetryController};
use crate::error::ControllerError;
use crate::sink::{DeliveryOutcome, DeliverySink};
use crate::transform::TransformStage;

/// Receives closed batches and drives each of them to a terminal state.
///
/// Every attempt goes through backup (first time only), transform and
/// delivery. Failed attempts are retried with backoff until the retry
/// policy gives up, then the batch is dead-lettered. Delivered and
/// dead-lettered batches move the stream checkpoint.
pub struct DeliveryWorker {
    stage: TransformStage,
    sink: DeliverySink,
    controller: RetryController,
    tracker: Arc<CheckpointTracker>,
    checkpointer: Arc<dyn Checkpointer>,
    /// Maximum number of batch attempts running at the same time.
    max_concurrent_batches: usize,
    /// The liveness check handle, to call on a schedule to report healthy
    liveness: HealthHandle,
}

impl DeliveryWorker {
    pub fn new(
        stage: TransformStage,
        sink: DeliverySink,
        controller: RetryController,
        tracker: Arc<CheckpointTracker>,
        checkpointer: Arc<dyn Checkpointer>,
        max_concurrent_batches: usize,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            stage,
            sink,
            controller,
            tracker,
            checkpointer,
            max_concurrent_batches,
            liveness,
        }
    }

    pub fn controller(&self) -> &RetryController {
        &self.controller
    }

    /// Process batches from `inbound` until it is closed and every batch is terminal.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Arc<Batch>>) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_batches));
        let report_semaphore_utilization = || {
            metrics::gauge!("clickstream_worker_saturation_percent").set(
                1f64 - semaphore.available_permits() as f64 / self.max_concurrent_batches as f64,
            );
        };

        let mut tasks: JoinSet<Option<Arc<Batch>>> = JoinSet::new();
        let mut liveness_tick = tokio::time::interval(Duration::from_secs(10));
        let mut inbound_closed = false;

        loop {
            if inbound_closed && tasks.is_empty() {
                break;
            }

            tokio::select! {
                batch = inbound.recv(), if !inbound_closed => match batch {
                    Some(batch) => {
                        self.controller.register(batch.id());
                        metrics::counter!("clickstream_batches_received_total").increment(1);
                        tasks.spawn(self.clone().process(batch, semaphore.clone()));
                    }
                    None => {
                        info!("batch channel closed, waiting for {} batches", tasks.len());
                        inbound_closed = true;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => match joined {
                    Ok(Some(retry)) => {
                        tasks.spawn(self.clone().process(retry, semaphore.clone()));
                    }
                    Ok(None) => {}
                    Err(e) => error!("batch task failed: {}", e),
                },
                _ = liveness_tick.tick() => {
                    self.liveness.report_healthy();
                    report_semaphore_utilization();
                    metrics::gauge!("clickstream_worker_batches_tracked")
                        .set(self.controller.tracked() as f64);
                }
            }
        }

        info!("all batches reached a terminal state");
    }

    /// Run one attempt of a batch. Returns the batch when it must be attempted again.
    async fn process(
        self: Arc<Self>,
        batch: Arc<Batch>,
        semaphore: Arc<Semaphore>,
    ) -> Option<Arc<Batch>> {
        let Ok(permit) = semaphore.acquire_owned().await else {
            error!(batch_id = %batch.id(), "worker semaphore closed");
            return None;
        };

        let attempt = match self.controller.begin(batch.id()) {
            Ok(attempt) => attempt,
            Err(ControllerError::UnknownBatch(batch_id)) => {
                error!(batch_id = %batch_id, "batch was not registered, registering it again");
                self.controller.register(batch_id);
                return Some(batch);
            }
            Err(e) => {
                // The attempt in flight, or the one that made the batch terminal, settles it.
                error!(batch_id = %batch.id(), "not starting attempt: {}", e);
                return None;
            }
        };

        // The attempt runs on its own task: an abort or a panic fails the attempt, not the worker.
        let handle = tokio::spawn(self.clone().attempt(
            batch.clone(),
            attempt.number,
            attempt.needs_backup,
        ));
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => DeliveryOutcome::failed(
                batch.id(),
                attempt.number,
                &format!("attempt terminated: {e}"),
            ),
        };
        drop(permit);

        let decision = match self.controller.complete(&outcome) {
            Ok(decision) => decision,
            Err(e) => {
                error!(batch_id = %batch.id(), "failed to complete attempt: {}", e);
                self.recover(&batch, &outcome);
                return None;
            }
        };

        match decision {
            Decision::Delivered => {
                info!(
                    batch_id = %batch.id(),
                    attempt = attempt.number,
                    delivered = outcome.delivered,
                    dropped = outcome.dropped,
                    failed = outcome.failed,
                    "delivered batch"
                );
                self.settle(&batch);
                None
            }
            Decision::Retry { delay } => {
                tokio::time::sleep(delay).await;
                Some(batch)
            }
            Decision::DeadLetter {
                attempts,
                reason,
                backed_up,
            } => {
                error!(
                    batch_id = %batch.id(),
                    partition_key = batch.partition_key(),
                    attempts,
                    "batch exhausted its retries: {}",
                    reason
                );
                if self.dead_letter(&batch, attempts, &reason, backed_up).await {
                    self.settle(&batch);
                } else {
                    self.hold_back(&batch);
                }
                None
            }
        }
    }

    async fn attempt(
        self: Arc<Self>,
        batch: Arc<Batch>,
        attempt: u32,
        needs_backup: bool,
    ) -> DeliveryOutcome {
        if needs_backup {
            if let Err(e) = self.sink.backup(&batch).await {
                return DeliveryOutcome::failed(batch.id(), attempt, &e.to_string());
            }
            self.controller.record_backup(batch.id());
        }

        let results = match self.stage.run(batch.clone()).await {
            Ok(results) => results,
            Err(e) => return DeliveryOutcome::failed(batch.id(), attempt, &e.to_string()),
        };

        self.sink.deliver(&batch, attempt, &results).await
    }

    /// Make a dead-lettered batch recoverable: the raw backup must exist and
    /// the manifest must point at it. Returns false when either write failed.
    async fn dead_letter(
        &self,
        batch: &Batch,
        attempts: u32,
        reason: &str,
        backed_up: bool,
    ) -> bool {
        if !backed_up {
            match self.sink.backup(batch).await {
                Ok(_) => self.controller.record_backup(batch.id()),
                Err(e) => {
                    error!(batch_id = %batch.id(), "failed to back up dead-lettered batch: {}", e);
                    return false;
                }
            }
        }

        match self.sink.dead_letter(batch, attempts, reason).await {
            Ok(_) => true,
            Err(e) => {
                error!(batch_id = %batch.id(), "failed to write dead letter manifest: {}", e);
                false
            }
        }
    }

    /// Settle a batch whose outcome the controller could not record.
    fn recover(&self, batch: &Batch, outcome: &DeliveryOutcome) {
        if outcome.is_delivered() {
            self.controller.discard(batch.id());
            self.commit(batch);
        } else {
            self.hold_back(batch);
        }
    }

    /// Stop processing a batch that is stored nowhere. Its records are not
    /// checkpointed, so the stream replays them after a restart.
    fn hold_back(&self, batch: &Batch) {
        self.controller.discard(batch.id());
        metrics::counter!("clickstream_batches_held_back_total").increment(1);
        error!(
            batch_id = %batch.id(),
            partition_key = batch.partition_key(),
            records = batch.len(),
            "batch is not persisted, holding back the checkpoint of its partitions"
        );
    }

    fn settle(&self, batch: &Batch) {
        self.controller.forget(batch.id());
        self.commit(batch);
    }

    /// Commit the checkpoints a terminal batch unblocked.
    fn commit(&self, batch: &Batch) {
        for checkpoint in self.tracker.complete(batch) {
            if let Err(e) = self.checkpointer.commit(checkpoint) {
                error!(
                    partition = checkpoint.partition,
                    "failed to commit checkpoint: {}", e
                );
            }
        }
    }
}
