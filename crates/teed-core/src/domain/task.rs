//! Task: the unit of work flowing through the worker.
//!
//! A task is built in one of two ways:
//! - by a producer, with [`Task::new`] (always `todo`);
//! - from an inbound payload, with [`Task::from_value`], which validates every
//!   field and reports all of the failing ones at once.
//!
//! After that the only mutation is [`Task::resolve`], the single `todo ->
//! terminal` transition that also stamps `processed_at` / `processed_by`.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use super::errors::{FieldError, SchemaError, TransitionError};
use super::ids::TaskId;
use super::operation::Operation;
use super::state::TaskState;

/// Operation parameters. Opaque to the core, ordered for stable output.
pub type TaskArgs = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    id: TaskId,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<TaskId>,
    created_at: DateTime<Utc>,
    created_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    processed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    processed_by: Option<String>,
    operation: Operation,
    state: TaskState,
    args: TaskArgs,
}

impl Task {
    pub fn new(
        id: TaskId,
        created_at: DateTime<Utc>,
        created_by: impl Into<String>,
        operation: Operation,
        args: TaskArgs,
    ) -> Self {
        Self {
            id,
            parent_id: None,
            created_at,
            created_by: created_by.into(),
            processed_at: None,
            processed_by: None,
            operation,
            state: TaskState::Todo,
            args,
        }
    }

    pub fn with_parent(mut self, parent_id: TaskId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn parent_id(&self) -> Option<TaskId> {
        self.parent_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn created_by(&self) -> &str {
        &self.created_by
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.processed_at
    }

    pub fn processed_by(&self) -> Option<&str> {
        self.processed_by.as_deref()
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn args(&self) -> &TaskArgs {
        &self.args
    }

    /// Move the task into a terminal state.
    ///
    /// Only `todo -> {done, done_with_error, failed}` is legal. The processed
    /// fields are written here and nowhere else.
    pub fn resolve(
        &mut self,
        state: TaskState,
        processed_by: impl Into<String>,
        processed_at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(state) {
            return Err(TransitionError {
                from: self.state,
                to: state,
            });
        }
        self.state = state;
        self.processed_by = Some(processed_by.into());
        self.processed_at = Some(processed_at);
        Ok(())
    }

    /// Validate a structured payload and build the task it describes.
    ///
    /// Legacy field names (`uuid`, `parent_task_uuid`, `created_on`,
    /// `processed_on`, `type`) are accepted; the canonical name wins when both
    /// are present. Unknown fields are ignored.
    pub fn from_value(value: &Value) -> Result<Task, SchemaError> {
        let obj = value.as_object().ok_or(SchemaError::NotAnObject)?;
        let mut errors = Vec::new();

        let id = required(obj, &mut errors, "id", &["uuid"], parse_id);
        let parent_id = optional(obj, &mut errors, "parent_id", &["parent_task_uuid"], parse_id);
        let created_at = required(obj, &mut errors, "created_at", &["created_on"], parse_timestamp);
        let created_by = required(obj, &mut errors, "created_by", &[], parse_string);
        let processed_at =
            optional(obj, &mut errors, "processed_at", &["processed_on"], parse_timestamp);
        let processed_by = optional(obj, &mut errors, "processed_by", &[], parse_string);
        let operation = required(obj, &mut errors, "operation", &["type"], parse_operation);
        let state = required(obj, &mut errors, "state", &[], parse_state);
        let args = required(obj, &mut errors, "args", &[], parse_args);

        if let Some(state) = state {
            let terminal = state.is_terminal();
            if terminal != processed_at.is_some() {
                errors.push(FieldError::invalid(
                    "processed_at",
                    format!("must be set if and only if the task is terminal (state={state})"),
                ));
            }
            if terminal != processed_by.is_some() {
                errors.push(FieldError::invalid(
                    "processed_by",
                    format!("must be set if and only if the task is terminal (state={state})"),
                ));
            }
        }

        match (id, created_at, created_by, operation, state, args) {
            (Some(id), Some(created_at), Some(created_by), Some(operation), Some(state), Some(args))
                if errors.is_empty() =>
            {
                Ok(Task {
                    id,
                    parent_id,
                    created_at,
                    created_by,
                    processed_at,
                    processed_by,
                    operation,
                    state,
                    args,
                })
            }
            _ => Err(SchemaError::InvalidFields(errors)),
        }
    }
}

// ========================================
// Field extraction
// ========================================

type Parser<T> = fn(&'static str, &Value) -> Result<T, FieldError>;

fn lookup<'a>(obj: &'a Map<String, Value>, name: &str, aliases: &[&str]) -> Option<&'a Value> {
    std::iter::once(name)
        .chain(aliases.iter().copied())
        .find_map(|key| obj.get(key))
}

fn required<T>(
    obj: &Map<String, Value>,
    errors: &mut Vec<FieldError>,
    name: &'static str,
    aliases: &[&str],
    parse: Parser<T>,
) -> Option<T> {
    match lookup(obj, name, aliases) {
        None | Some(Value::Null) => {
            errors.push(FieldError::missing(name));
            None
        }
        Some(v) => parse(name, v).map_err(|e| errors.push(e)).ok(),
    }
}

fn optional<T>(
    obj: &Map<String, Value>,
    errors: &mut Vec<FieldError>,
    name: &'static str,
    aliases: &[&str],
    parse: Parser<T>,
) -> Option<T> {
    match lookup(obj, name, aliases) {
        None | Some(Value::Null) => None,
        Some(v) => parse(name, v).map_err(|e| errors.push(e)).ok(),
    }
}

fn as_str<'a>(field: &'static str, v: &'a Value) -> Result<&'a str, FieldError> {
    v.as_str().ok_or_else(|| FieldError::wrong_type(field, "string"))
}

fn parse_string(field: &'static str, v: &Value) -> Result<String, FieldError> {
    as_str(field, v).map(str::to_string)
}

fn parse_id(field: &'static str, v: &Value) -> Result<TaskId, FieldError> {
    as_str(field, v)?
        .parse()
        .map_err(|e| FieldError::invalid(field, format!("not a UUID: {e}")))
}

fn parse_operation(field: &'static str, v: &Value) -> Result<Operation, FieldError> {
    as_str(field, v)?
        .parse()
        .map_err(|e| FieldError::invalid(field, format!("{e}")))
}

fn parse_state(field: &'static str, v: &Value) -> Result<TaskState, FieldError> {
    as_str(field, v)?
        .parse()
        .map_err(|e| FieldError::invalid(field, format!("{e}")))
}

fn parse_args(field: &'static str, v: &Value) -> Result<TaskArgs, FieldError> {
    let obj = v
        .as_object()
        .ok_or_else(|| FieldError::wrong_type(field, "object"))?;
    let mut args = TaskArgs::new();
    for (k, v) in obj {
        let Some(s) = v.as_str() else {
            return Err(FieldError::invalid(
                field,
                format!("value of '{k}' must be a string"),
            ));
        };
        args.insert(k.clone(), s.to_string());
    }
    Ok(args)
}

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// RFC 3339 with any offset, or a naive timestamp taken as UTC.
pub(crate) fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn parse_timestamp(field: &'static str, v: &Value) -> Result<DateTime<Utc>, FieldError> {
    let s = as_str(field, v)?;
    parse_datetime(s)
        .ok_or_else(|| FieldError::invalid(field, format!("not an ISO-8601 timestamp: '{s}'")))
}
