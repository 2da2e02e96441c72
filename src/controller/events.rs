//! Bounded event buffer mirroring Kubernetes-style object events
//!
//! Events describe why a cluster is in its current phase. They land in the
//! structured log and in a bounded in-memory ring that diagnostics can read
//! back; old entries fall off the front.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub id: Uuid,
    pub time: DateTime<Utc>,
    pub event_type: EventType,
    /// Object the event is about, e.g. "virtualcluster/tenant-a"
    pub object: String,
    /// Machine-readable reason, e.g. "NodeJoinFailed"
    pub reason: String,
    pub message: String,
}

pub struct EventRecorder {
    buffer: Mutex<VecDeque<Event>>,
    capacity: usize,
}

impl Default for EventRecorder {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn normal(&self, object: &str, reason: &str, message: impl Into<String>) {
        self.record(EventType::Normal, object, reason, message.into());
    }

    pub fn warning(&self, object: &str, reason: &str, message: impl Into<String>) {
        self.record(EventType::Warning, object, reason, message.into());
    }

    fn record(&self, event_type: EventType, object: &str, reason: &str, message: String) {
        match event_type {
            EventType::Normal => tracing::info!("event {} {}: {}", object, reason, message),
            EventType::Warning => tracing::warn!("event {} {}: {}", object, reason, message),
        }

        let mut buffer = self.buffer.lock().expect("event buffer lock");
        if buffer.len() == self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(Event {
            id: Uuid::new_v4(),
            time: Utc::now(),
            event_type,
            object: object.to_string(),
            reason: reason.to_string(),
            message,
        });
    }

    /// Snapshot of the buffered events, oldest first
    pub fn recent(&self) -> Vec<Event> {
        self.buffer
            .lock()
            .expect("event buffer lock")
            .iter()
            .cloned()
            .collect()
    }
}
