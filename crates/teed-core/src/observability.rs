use serde::{Deserialize, Serialize};

use crate::domain::TaskState;

/// Counters for one worker run, returned when the loop stops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Deliveries taken off the queue.
    pub received: u64,
    pub done: u64,
    pub done_with_error: u64,
    pub failed: u64,
    /// Deliveries that never became a task.
    pub rejected: u64,
    pub redelivered: u64,
    pub reconnects: u32,
}

impl WorkerStats {
    pub fn record(&mut self, state: TaskState) {
        match state {
            TaskState::Done => self.done += 1,
            TaskState::DoneWithError => self.done_with_error += 1,
            TaskState::Failed => self.failed += 1,
            TaskState::Todo => {}
        }
    }

    /// Tasks that reached a terminal state.
    pub fn resolved(&self) -> u64 {
        self.done + self.done_with_error + self.failed
    }
}
