//! Positions of events handed to the worker pool whose outcome is unknown

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::log::LogPosition;

/// Envelope id → originating log position
///
/// Owned by the consumer; the lock is only held for a single map operation.
#[derive(Debug, Default)]
pub(crate) struct PendingSet {
    entries: Mutex<HashMap<String, LogPosition>>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an event; returns the position it replaced if the id was already pending
    pub fn insert(&self, event_id: &str, position: LogPosition) -> Option<LogPosition> {
        self.entries.lock().insert(event_id.to_string(), position)
    }

    pub fn get(&self, event_id: &str) -> Option<LogPosition> {
        self.entries.lock().get(event_id).cloned()
    }

    pub fn remove(&self, event_id: &str) -> Option<LogPosition> {
        self.entries.lock().remove(event_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
