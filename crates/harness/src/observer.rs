use std::time::Duration;

use draftsync_core::SaveStatus;
use draftsync_engine::{AutosaveObserver, SaveError};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedEvent {
    Status(SaveStatus),
    Saved(u64),
    RetryScheduled { attempt: u32, delay: Duration },
    Failed(SaveError),
    Conflict(SaveError),
}

/// Observer that keeps every callback in arrival order.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().clone()
    }

    pub fn statuses(&self) -> Vec<SaveStatus> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ObservedEvent::Status(status) => Some(*status),
                _ => None,
            })
            .collect()
    }

    /// `(attempt, delay)` for every scheduled retry.
    pub fn retries(&self) -> Vec<(u32, Duration)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ObservedEvent::RetryScheduled { attempt, delay } => Some((*attempt, *delay)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, matches: impl Fn(&ObservedEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| matches(e)).count()
    }

    fn push(&self, event: ObservedEvent) {
        self.events.lock().push(event);
    }
}

impl AutosaveObserver for RecordingObserver {
    fn on_status_change(&self, status: SaveStatus) {
        self.push(ObservedEvent::Status(status));
    }

    fn on_save_success(&self, version: u64) {
        self.push(ObservedEvent::Saved(version));
    }

    fn on_retry_scheduled(&self, attempt: u32, delay: Duration) {
        self.push(ObservedEvent::RetryScheduled { attempt, delay });
    }

    fn on_save_error(&self, error: &SaveError) {
        self.push(ObservedEvent::Failed(error.clone()));
    }

    fn on_conflict(&self, error: &SaveError) {
        self.push(ObservedEvent::Conflict(error.clone()));
    }
}
