use std::sync::{Arc, Mutex};

use clickstream_common::event::Event;
use tracing::warn;

/// Events waiting for the next flush.
///
/// Only the debounce task pushes and only the flush loop takes: a flush
/// swaps the whole list for an empty one, so events settled while the
/// flush is in flight land in the next list.
#[derive(Clone, Default)]
pub struct EventBuffer {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: Event) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(_) => warn!("poisoned EventBuffer mutex, dropping event"),
        }
    }

    /// Take every buffered event, leaving an empty buffer behind.
    pub fn take(&self) -> Vec<Event> {
        match self.events.lock() {
            Ok(mut events) => std::mem::take(&mut *events),
            Err(_) => {
                warn!("poisoned EventBuffer mutex, nothing to flush");
                Vec::new()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
