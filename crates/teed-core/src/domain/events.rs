//! Events - what the worker reports while it runs.
//!
//! Tasks are not persisted by the worker; an `EventSink` is where their
//! final state goes.

use super::errors::SchemaError;
use super::outcome::Outcome;
use super::task::Task;

/// Lifecycle phase of a worker.
///
/// starting -> consuming -> draining -> stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    Starting,
    Consuming,
    Draining,
    Stopped,
}

impl LifecyclePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecyclePhase::Starting => "starting",
            LifecyclePhase::Consuming => "consuming",
            LifecyclePhase::Draining => "draining",
            LifecyclePhase::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    PhaseChanged(LifecyclePhase),

    /// A task reached a terminal state.
    TaskResolved {
        task: Task,
        outcome: Option<Outcome>,
        /// Failure detail for `failed` tasks.
        error: Option<String>,
    },

    /// A delivery never became a task.
    MessageRejected {
        delivery_tag: u64,
        error: SchemaError,
    },

    /// The broker link dropped; `attempt` is the reconnect attempt about to run.
    ConnectionLost { attempt: u32 },
}
