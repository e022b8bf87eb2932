//! MemoryEventSink - keeps every event, for tests and embedding.

use std::sync::{Mutex, PoisonError};

use crate::domain::{LifecyclePhase, SchemaError, Task, WorkerEvent};
use crate::ports::EventSink;

#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<WorkerEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<WorkerEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn resolved_tasks(&self) -> Vec<Task> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                WorkerEvent::TaskResolved { task, .. } => Some(task),
                _ => None,
            })
            .collect()
    }

    pub fn rejections(&self) -> Vec<(u64, SchemaError)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                WorkerEvent::MessageRejected {
                    delivery_tag,
                    error,
                } => Some((delivery_tag, error)),
                _ => None,
            })
            .collect()
    }

    pub fn phases(&self) -> Vec<LifecyclePhase> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                WorkerEvent::PhaseChanged(phase) => Some(phase),
                _ => None,
            })
            .collect()
    }

    /// Reconnect attempts announced, in order.
    pub fn reconnect_attempts(&self) -> Vec<u32> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                WorkerEvent::ConnectionLost { attempt } => Some(attempt),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: &WorkerEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
