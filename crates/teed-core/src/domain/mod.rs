//! Domain model (ids, operations, task state machine, outcomes, events).

pub mod envelope;
pub mod errors;
pub mod events;
pub mod ids;
pub mod operation;
pub mod outcome;
pub mod state;
pub mod task;

pub use envelope::{Envelope, JSON_CONTENT_TYPE};
pub use errors::{FieldError, FieldProblem, SchemaError, TransitionError};
pub use events::{LifecyclePhase, WorkerEvent};
pub use ids::TaskId;
pub use operation::{Operation, UnknownOperation};
pub use outcome::{Artifact, OperationError, Outcome, OutcomeKind};
pub use state::{TaskState, UnknownState};
pub use task::{Task, TaskArgs};
