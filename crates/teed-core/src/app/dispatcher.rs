//! Dispatcher - runs a task's operation and resolves the task.
//!
//! Every task handed to `dispatch` comes back terminal. Handler errors,
//! panics, a missing registration and the optional time limit all end in
//! `failed`; nothing escapes to the consumption loop.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use crate::app::registry::OperationRegistry;
use crate::domain::{
    Operation, OperationError, Outcome, Task, TaskArgs, TaskId, TaskState,
};
use crate::ports::{Clock, OperationHandler};

/// Why an operation ended in `failed`.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no handler registered for operation '{0}'")]
    NotRegistered(Operation),

    #[error("operation failed: {0}")]
    Operation(#[from] OperationError),

    #[error("operation panicked: {0}")]
    Panicked(String),

    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),
}

/// The task was already terminal when it reached the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task {task_id} is already {state}; refusing to dispatch it again")]
pub struct AlreadyResolved {
    pub task_id: TaskId,
    pub state: TaskState,
}

#[derive(Debug)]
pub enum Resolution {
    /// `Success` or `PartialFailure`; the task is `done` / `done_with_error`.
    Completed(Outcome),
    Failed(DispatchError),
}

#[derive(Debug)]
pub struct DispatchReport {
    /// The resolved task (terminal state, processed fields set).
    pub task: Task,
    pub resolution: Resolution,
}

impl DispatchReport {
    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        match &self.resolution {
            Resolution::Completed(outcome) => Some(outcome),
            Resolution::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&DispatchError> {
        match &self.resolution {
            Resolution::Completed(_) => None,
            Resolution::Failed(err) => Some(err),
        }
    }
}

pub struct Dispatcher {
    registry: Arc<OperationRegistry>,
    clock: Arc<dyn Clock>,
    worker_name: String,
    task_timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<OperationRegistry>,
        clock: Arc<dyn Clock>,
        worker_name: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            clock,
            worker_name: worker_name.into(),
            task_timeout: None,
        }
    }

    pub fn with_timeout(mut self, task_timeout: Option<Duration>) -> Self {
        self.task_timeout = task_timeout;
        self
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// Run the task's operation and move the task to its terminal state.
    pub async fn dispatch(&self, mut task: Task) -> Result<DispatchReport, AlreadyResolved> {
        let task_id = task.id();
        if task.state().is_terminal() {
            return Err(AlreadyResolved {
                task_id,
                state: task.state(),
            });
        }

        let operation = task.operation();
        let result = match self.registry.get(operation) {
            Some(handler) => self.invoke(handler, task.args().clone()).await,
            None => Err(DispatchError::NotRegistered(operation)),
        };

        let (state, resolution) = match result {
            Ok(outcome) => {
                if !outcome.warnings.is_empty() {
                    warn!(
                        task_id = %task_id,
                        operation = %operation,
                        warnings = ?outcome.warnings,
                        "Task {} finished with errors",
                        task_id
                    );
                }
                (outcome.kind.task_state(), Resolution::Completed(outcome))
            }
            Err(err) => {
                error!(
                    task_id = %task_id,
                    operation = %operation,
                    error = %err,
                    "Task {} failed: {}",
                    task_id,
                    err
                );
                (TaskState::Failed, Resolution::Failed(err))
            }
        };

        task.resolve(state, self.worker_name.as_str(), self.clock.now())
            .map_err(|e| AlreadyResolved {
                task_id,
                state: e.from,
            })?;

        Ok(DispatchReport { task, resolution })
    }

    /// Run the handler on its own tokio task so a panic or the time limit
    /// cannot unwind into the caller.
    async fn invoke(
        &self,
        handler: Arc<dyn OperationHandler>,
        args: TaskArgs,
    ) -> Result<Outcome, DispatchError> {
        let mut join = tokio::spawn(async move { handler.run(&args).await });

        let joined = match self.task_timeout {
            None => (&mut join).await,
            Some(limit) => match tokio::time::timeout(limit, &mut join).await {
                Ok(joined) => joined,
                Err(_) => {
                    join.abort();
                    return Err(DispatchError::TimedOut(limit));
                }
            },
        };

        match joined {
            Ok(result) => result.map_err(DispatchError::from),
            Err(err) if err.is_panic() => Err(DispatchError::Panicked(panic_message(
                err.into_panic(),
            ))),
            Err(err) => Err(DispatchError::Panicked(err.to_string())),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
