//! Errors - per-message and per-task error types.
//!
//! These never take the worker down. The loop classifies them, logs them,
//! and moves on to the next delivery.

use std::fmt;

use super::state::TaskState;

/// What is wrong with a single field of an incoming task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldProblem {
    Missing,
    WrongType { expected: &'static str },
    Invalid(String),
}

impl fmt::Display for FieldProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldProblem::Missing => f.write_str("missing"),
            FieldProblem::WrongType { expected } => write!(f, "expected {expected}"),
            FieldProblem::Invalid(reason) => f.write_str(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub problem: FieldProblem,
}

impl FieldError {
    pub fn missing(field: &'static str) -> Self {
        Self {
            field,
            problem: FieldProblem::Missing,
        }
    }

    pub fn wrong_type(field: &'static str, expected: &'static str) -> Self {
        Self {
            field,
            problem: FieldProblem::WrongType { expected },
        }
    }

    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            problem: FieldProblem::Invalid(reason.into()),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.problem)
    }
}

/// A message could not be admitted as a task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// Content type is not JSON; the message is not a task at all.
    #[error("unsupported content type: {}", .0.as_deref().unwrap_or("<none>"))]
    UnsupportedContentType(Option<String>),

    #[error("payload is not valid JSON: {0}")]
    Malformed(String),

    #[error("payload is not a JSON object")]
    NotAnObject,

    /// Every failing field, not just the first one.
    #[error("invalid task: {}", join_fields(.0))]
    InvalidFields(Vec<FieldError>),
}

impl SchemaError {
    /// The failing field names, in the order they were checked.
    pub fn fields(&self) -> Vec<&'static str> {
        match self {
            SchemaError::InvalidFields(errors) => errors.iter().map(|e| e.field).collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_content_type(&self) -> bool {
        matches!(self, SchemaError::UnsupportedContentType(_))
    }
}

fn join_fields(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// An illegal state change was attempted on a task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal task transition {from} -> {to}")]
pub struct TransitionError {
    pub from: TaskState,
    pub to: TaskState,
}
