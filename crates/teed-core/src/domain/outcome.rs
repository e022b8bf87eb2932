//! Outcome model: what an operation reports when it returns normally.
//!
//! Hard failures are not an outcome; they come back as `Err(OperationError)`.
//! Together that gives the three-way result at the operation boundary:
//! `Ok(Success)`, `Ok(PartialFailure)`, `Err(_)`.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::state::TaskState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Success,
    PartialFailure,
}

impl OutcomeKind {
    /// The terminal task state this outcome resolves to.
    pub fn task_state(self) -> TaskState {
        match self {
            OutcomeKind::Success => TaskState::Done,
            OutcomeKind::PartialFailure => TaskState::DoneWithError,
        }
    }
}

/// Something produced or observed while running an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum Artifact {
    /// Path (or object-store URI) of a file the operation wrote.
    FilePath(String),

    Url(String),

    /// Arbitrary structured output.
    Json(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub kind: OutcomeKind,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,

    /// Soft problems; non-empty for a partial failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            kind: OutcomeKind::Success,
            artifacts: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn partial(warning: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::PartialFailure,
            artifacts: Vec::new(),
            warnings: vec![warning.into()],
        }
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// A hard failure raised by an operation.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct OperationError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl OperationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for OperationError {
    fn from(err: std::io::Error) -> Self {
        Self::with_source(format!("io: {err}"), err)
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeKind::Success => f.write_str("SUCCESS"),
            OutcomeKind::PartialFailure => f.write_str("PARTIAL_FAILURE"),
        }
    }
}
