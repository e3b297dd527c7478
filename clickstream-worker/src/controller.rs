use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use clickstream_common::retry::RetryPolicy;

use crate::error::ControllerError;
use crate::sink::{DeliveryOutcome, DeliveryStatus};

/// Where a batch is in its delivery lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchState {
    Pending,
    InFlight { attempt: u32 },
    Retrying { delay: Duration },
    Delivered,
    DeadLettered,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchState::Delivered | BatchState::DeadLettered)
    }
}

/// What the worker must do with a batch once an attempt completed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Delivered,
    Retry { delay: Duration },
    /// `backed_up` is false when no attempt managed to write the raw backup.
    DeadLetter {
        attempts: u32,
        reason: String,
        backed_up: bool,
    },
}

/// An attempt handed out by [`RetryController::begin`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attempt {
    pub number: u32,
    /// The raw backup has not been written yet.
    pub needs_backup: bool,
}

#[derive(Debug)]
struct Entry {
    state: BatchState,
    attempts: u32,
    failures: u32,
    backed_up: bool,
}

/// Retry state of every batch handed to the worker.
///
/// All transitions happen under one lock, so two attempts of the same batch
/// can never be in flight at the same time.
pub struct RetryController {
    policy: RetryPolicy,
    batches: Mutex<HashMap<Uuid, Entry>>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            batches: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Entry>> {
        // Entries are updated in place without panicking, so a poisoned map is still consistent.
        self.batches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start tracking a batch. Registering a known batch keeps its current state.
    pub fn register(&self, batch_id: Uuid) {
        self.lock().entry(batch_id).or_insert(Entry {
            state: BatchState::Pending,
            attempts: 0,
            failures: 0,
            backed_up: false,
        });
    }

    /// Move a pending or retrying batch in flight.
    pub fn begin(&self, batch_id: Uuid) -> Result<Attempt, ControllerError> {
        let mut batches = self.lock();
        let entry = batches
            .get_mut(&batch_id)
            .ok_or(ControllerError::UnknownBatch(batch_id))?;

        match entry.state {
            BatchState::Pending | BatchState::Retrying { .. } => {
                entry.attempts += 1;
                entry.state = BatchState::InFlight {
                    attempt: entry.attempts,
                };

                Ok(Attempt {
                    number: entry.attempts,
                    needs_backup: !entry.backed_up,
                })
            }
            BatchState::InFlight { .. } => Err(ControllerError::AlreadyInFlight(batch_id)),
            BatchState::Delivered | BatchState::DeadLettered => {
                Err(ControllerError::Terminal(batch_id))
            }
        }
    }

    pub fn record_backup(&self, batch_id: Uuid) {
        if let Some(entry) = self.lock().get_mut(&batch_id) {
            entry.backed_up = true;
        }
    }

    /// Settle the in-flight attempt described by `outcome`.
    pub fn complete(&self, outcome: &DeliveryOutcome) -> Result<Decision, ControllerError> {
        let mut batches = self.lock();
        let entry = batches
            .get_mut(&outcome.batch_id)
            .ok_or(ControllerError::UnknownBatch(outcome.batch_id))?;

        if entry.state
            != (BatchState::InFlight {
                attempt: outcome.attempt,
            })
        {
            return Err(ControllerError::NotInFlight {
                batch_id: outcome.batch_id,
                attempt: outcome.attempt,
            });
        }

        let decision = match &outcome.status {
            DeliveryStatus::Delivered => {
                entry.state = BatchState::Delivered;
                metrics::counter!("clickstream_batches_delivered_total").increment(1);
                Decision::Delivered
            }
            DeliveryStatus::Failed(reason) => {
                entry.failures += 1;

                if self.policy.should_retry(entry.failures) {
                    let delay = self.policy.retry_interval(entry.failures);
                    entry.state = BatchState::Retrying { delay };
                    metrics::counter!("clickstream_batches_retried_total").increment(1);
                    warn!(
                        batch_id = %outcome.batch_id,
                        attempt = outcome.attempt,
                        "batch attempt failed, retrying in {:?}: {}",
                        delay,
                        reason
                    );
                    Decision::Retry { delay }
                } else {
                    entry.state = BatchState::DeadLettered;
                    metrics::counter!("clickstream_batches_dead_lettered_total").increment(1);
                    Decision::DeadLetter {
                        attempts: entry.attempts,
                        reason: reason.clone(),
                        backed_up: entry.backed_up,
                    }
                }
            }
        };

        Ok(decision)
    }

    pub fn state(&self, batch_id: Uuid) -> Option<BatchState> {
        self.lock().get(&batch_id).map(|entry| entry.state.clone())
    }

    /// Stop tracking a batch that reached a terminal state.
    pub fn forget(&self, batch_id: Uuid) {
        let mut batches = self.lock();
        if batches
            .get(&batch_id)
            .is_some_and(|entry| entry.state.is_terminal())
        {
            batches.remove(&batch_id);
        }
    }

    /// Stop tracking a batch whatever its state.
    pub fn discard(&self, batch_id: Uuid) {
        self.lock().remove(&batch_id);
    }

    pub fn tracked(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(max_retries: u32) -> RetryController {
        RetryController::new(
            RetryPolicy::build(2, Duration::from_secs(1))
                .max_retries(max_retries)
                .maximum_interval(Duration::from_secs(3))
                .provide(),
        )
    }

    fn failed(batch_id: Uuid, attempt: u32) -> DeliveryOutcome {
        DeliveryOutcome::failed(batch_id, attempt, "destination unavailable")
    }

    #[test]
    fn delivered_batch_is_terminal() {
        let controller = controller(5);
        let id = Uuid::now_v7();
        controller.register(id);

        let attempt = controller.begin(id).unwrap();
        assert_eq!(
            attempt,
            Attempt {
                number: 1,
                needs_backup: true
            }
        );

        let outcome = DeliveryOutcome {
            status: DeliveryStatus::Delivered,
            ..failed(id, 1)
        };
        assert_eq!(controller.complete(&outcome), Ok(Decision::Delivered));
        assert_eq!(controller.state(id), Some(BatchState::Delivered));
        assert_eq!(controller.begin(id), Err(ControllerError::Terminal(id)));
    }

    #[test]
    fn concurrent_attempts_are_rejected() {
        let controller = controller(5);
        let id = Uuid::now_v7();
        controller.register(id);

        controller.begin(id).unwrap();
        assert_eq!(controller.begin(id), Err(ControllerError::AlreadyInFlight(id)));
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let controller = controller(5);
        let id = Uuid::now_v7();
        controller.register(id);

        let mut delays = Vec::new();
        for attempt in 1..=4 {
            assert_eq!(controller.begin(id).unwrap().number, attempt);
            match controller.complete(&failed(id, attempt)).unwrap() {
                Decision::Retry { delay } => delays.push(delay.as_secs()),
                other => panic!("unexpected decision {:?}", other),
            }
        }

        assert_eq!(delays, vec![1, 2, 3, 3]);
    }

    #[test]
    fn exhausted_batch_is_dead_lettered_once() {
        let max_retries = 2;
        let controller = controller(max_retries);
        let id = Uuid::now_v7();
        controller.register(id);

        for attempt in 1..=max_retries {
            controller.begin(id).unwrap();
            assert!(matches!(
                controller.complete(&failed(id, attempt)),
                Ok(Decision::Retry { .. })
            ));
        }

        controller.begin(id).unwrap();
        assert_eq!(
            controller.complete(&failed(id, max_retries + 1)),
            Ok(Decision::DeadLetter {
                attempts: max_retries + 1,
                reason: "destination unavailable".to_owned(),
                backed_up: false,
            })
        );
        assert_eq!(controller.state(id), Some(BatchState::DeadLettered));
        assert_eq!(controller.begin(id), Err(ControllerError::Terminal(id)));

        controller.forget(id);
        assert_eq!(controller.tracked(), 0);
    }

    #[test]
    fn backup_is_requested_until_recorded() {
        let controller = controller(5);
        let id = Uuid::now_v7();
        controller.register(id);

        assert!(controller.begin(id).unwrap().needs_backup);
        controller.complete(&failed(id, 1)).unwrap();

        assert!(controller.begin(id).unwrap().needs_backup);
        controller.record_backup(id);
        controller.complete(&failed(id, 2)).unwrap();

        assert!(!controller.begin(id).unwrap().needs_backup);
    }

    #[test]
    fn dead_letter_reports_backup() {
        let controller = controller(0);
        let id = Uuid::now_v7();
        controller.register(id);

        controller.begin(id).unwrap();
        controller.record_backup(id);

        assert!(matches!(
            controller.complete(&failed(id, 1)),
            Ok(Decision::DeadLetter {
                backed_up: true,
                ..
            })
        ));
    }

    #[test]
    fn discard_drops_in_flight_batch() {
        let controller = controller(5);
        let id = Uuid::now_v7();
        controller.register(id);
        controller.begin(id).unwrap();

        controller.forget(id);
        assert_eq!(controller.tracked(), 1);

        controller.discard(id);
        assert_eq!(controller.tracked(), 0);
        assert_eq!(controller.state(id), None);
    }

    #[test]
    fn stale_outcome_is_rejected() {
        let controller = controller(5);
        let id = Uuid::now_v7();
        controller.register(id);

        controller.begin(id).unwrap();
        assert_eq!(
            controller.complete(&failed(id, 2)),
            Err(ControllerError::NotInFlight {
                batch_id: id,
                attempt: 2
            })
        );
    }
}
