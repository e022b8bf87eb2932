//! Message decoder - decides whether a broker message is a task.
//!
//! Pure function of the envelope: no I/O, no logging, same bytes in gives an
//! equal `Task` out.

use crate::domain::{Envelope, FieldError, SchemaError, Task, TaskState};

/// Admit an envelope as a `todo` task.
///
/// - wrong or missing content type: `UnsupportedContentType` (not a task)
/// - body is not JSON: `Malformed`
/// - JSON but not a valid task, or not `todo`: `NotAnObject` / `InvalidFields`
pub fn decode(envelope: &Envelope) -> Result<Task, SchemaError> {
    if !envelope.is_json() {
        return Err(SchemaError::UnsupportedContentType(
            envelope.content_type.clone(),
        ));
    }

    let value: serde_json::Value = serde_json::from_slice(&envelope.body)
        .map_err(|e| SchemaError::Malformed(e.to_string()))?;

    let task = Task::from_value(&value)?;
    if task.state() != TaskState::Todo {
        return Err(SchemaError::InvalidFields(vec![FieldError::invalid(
            "state",
            format!("expected todo on intake, got {}", task.state()),
        )]));
    }
    Ok(task)
}
