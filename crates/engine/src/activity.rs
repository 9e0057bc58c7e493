//! Activity log sink for committed state changes.
//!
//! Services emit one event after each committed mutation. Recording is
//! synchronous and infallible from the caller's point of view: a sink that
//! cannot keep an event drops it, never the transaction that produced it.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

/// One committed state change.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEvent {
    /// Entity kind, e.g. `order`, `payment`, `inventory`.
    pub entity_type: &'static str,
    /// Id of the entity that changed.
    pub entity_id: String,
    /// What happened, e.g. `status_changed`, `reserved`.
    pub action: &'static str,
    /// Action-specific details.
    pub payload: serde_json::Value,
    /// When the change committed.
    pub at: DateTime<Utc>,
}

impl ActivityEvent {
    /// Build an event stamped with the current time.
    #[must_use]
    pub fn new(
        entity_type: &'static str,
        entity_id: impl ToString,
        action: &'static str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.to_string(),
            action,
            payload,
            at: Utc::now(),
        }
    }
}

/// A sink for [`ActivityEvent`]s.
///
/// Implementations must not block: they run inline after the mutation,
/// before the call returns to the caller.
pub trait ActivityLog: Send + Sync {
    /// Record one event.
    fn record(&self, event: ActivityEvent);
}

/// Emits activity as structured `tracing` events under the
/// `stockroom::activity` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingActivityLog;

impl TracingActivityLog {
    /// Create the sink.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl ActivityLog for TracingActivityLog {
    fn record(&self, event: ActivityEvent) {
        info!(
            target: "stockroom::activity",
            entity_type = event.entity_type,
            entity_id = %event.entity_id,
            action = event.action,
            payload = %event.payload,
            "activity"
        );
    }
}

/// Keeps the most recent events in memory, for embedding and tests.
#[derive(Debug)]
pub struct MemoryActivityLog {
    events: Mutex<VecDeque<ActivityEvent>>,
    capacity: usize,
}

impl MemoryActivityLog {
    /// Default number of retained events.
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Create a sink retaining up to [`Self::DEFAULT_CAPACITY`] events.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Create a sink retaining up to `capacity` events; older events are
    /// dropped first.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// A copy of the retained events, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ActivityEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for MemoryActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityLog for MemoryActivityLog {
    fn record(&self, event: ActivityEvent) {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }
}
