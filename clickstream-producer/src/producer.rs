use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use clickstream_common::event::{Event, StreamRecord};
use clickstream_common::health::HealthHandle;
use clickstream_common::stream::{IngestionEndpoint, IngestionError, PutRecordsOutput};

use crate::buffer::EventBuffer;
use crate::debounce::Debouncer;

/// Turns a settled signal into the event that describes it.
pub trait Measure<S>: Send + Sync + 'static {
    fn measure(&self, signal: S, observed_at: OffsetDateTime) -> Event;
}

/// Why a flush failed, if it did. Any rejected record fails the whole flush.
fn flush_failure(result: &Result<PutRecordsOutput, IngestionError>) -> Option<String> {
    match result {
        Ok(output) if output.failed_count == 0 => None,
        Ok(output) => Some(format!(
            "ingestion endpoint rejected {} of {} records",
            output.failed_count,
            output.results.len()
        )),
        Err(error) => Some(error.to_string()),
    }
}

/// Client side batcher: debounces raw signals into events and flushes them
/// to an ingestion endpoint on a fixed period.
///
/// Delivery is at most once. A failed flush is logged and counted, and its
/// events are not retried.
pub struct Producer<S> {
    buffer: EventBuffer,
    debouncer: Debouncer<S>,
    endpoint: Arc<dyn IngestionEndpoint>,
    flush_interval: Duration,
}

impl<S: Send + 'static> Producer<S> {
    pub fn new<M: Measure<S>>(
        measure: M,
        endpoint: Arc<dyn IngestionEndpoint>,
        flush_interval: Duration,
        debounce: Duration,
    ) -> Self {
        let buffer = EventBuffer::new();
        let measure = Arc::new(measure);

        let settled = buffer.clone();
        let debouncer = Debouncer::new(debounce, move |signal| {
            let event = measure.measure(signal, OffsetDateTime::now_utc());
            settled.push(event);
        });

        Self {
            buffer,
            debouncer,
            endpoint,
            flush_interval,
        }
    }

    /// Record a raw signal. Only the last signal of a burst becomes an event.
    pub fn observe(&self, signal: S) {
        self.debouncer.observe(signal);
    }

    /// Number of events waiting for the next flush.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Send every buffered event to the ingestion endpoint, returning the events taken.
    ///
    /// Nothing is sent when the buffer is empty.
    pub async fn flush(&self) -> Vec<Event> {
        let events = self.buffer.take();
        if events.is_empty() {
            return events;
        }

        let mut records: Vec<StreamRecord> = Vec::with_capacity(events.len());
        for event in events.iter().cloned() {
            match event.into_record() {
                Ok(record) => records.push(record),
                Err(error) => {
                    warn!("failed to serialize event, dropping it: {}", error);
                    metrics::counter!("clickstream_producer_events_dropped_total").increment(1);
                }
            }
        }
        if records.is_empty() {
            return events;
        }

        let sent = records.len() as u64;
        let result = self.endpoint.put_records(records).await;
        match flush_failure(&result) {
            None => {
                debug!("flushed {} events", sent);
                metrics::counter!("clickstream_producer_events_sent_total").increment(sent);
            }
            Some(reason) => {
                warn!("flush of {} events failed, dropping them: {}", sent, reason);
                metrics::counter!("clickstream_producer_flush_failures_total").increment(1);
                metrics::counter!("clickstream_producer_events_dropped_total").increment(sent);
            }
        }

        events
    }

    /// Flush on a fixed period until cancelled, then flush one last time.
    ///
    /// A signal still inside its debounce window at shutdown is dropped.
    pub async fn run(&self, liveness: HealthHandle, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.flush_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    liveness.report_healthy();
                    self.flush().await;
                }
            }
        }

        self.debouncer.cancel();
        let events = self.flush().await;
        info!("producer stopped after a final flush of {} events", events.len());
    }
}
