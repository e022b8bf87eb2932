//! CommandOperation - runs an operation as an external program.
//!
//! Task args become `--key value` flags after the configured argv. The exit
//! status is the three-way result:
//!
//! - `0`: success
//! - the partial exit code (3 by default): partial failure, stderr lines are
//!   the warnings
//! - anything else, or death by signal: failure

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::DEFAULT_PARTIAL_EXIT_CODE;
use crate::domain::{OperationError, Outcome, OutcomeKind, TaskArgs};
use crate::ports::OperationHandler;

/// Stderr lines kept in a failure message.
const STDERR_TAIL_LINES: usize = 5;

#[derive(Debug, Clone)]
pub struct CommandOperation {
    program: String,
    base_args: Vec<String>,
    partial_exit_code: i32,
}

impl CommandOperation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            partial_exit_code: DEFAULT_PARTIAL_EXIT_CODE,
        }
    }

    /// `argv[0]` is the program, the rest are leading arguments.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, rest) = argv.split_first()?;
        Some(Self::new(program.as_str()).args(rest.iter().cloned()))
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn partial_exit_code(mut self, code: i32) -> Self {
        self.partial_exit_code = code;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments passed to the program for one task, in order.
    pub fn command_args(&self, args: &TaskArgs) -> Vec<String> {
        let mut out = self.base_args.clone();
        for (key, value) in args {
            out.push(format!("--{key}"));
            out.push(value.clone());
        }
        out
    }
}

fn stderr_lines(stderr: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl OperationHandler for CommandOperation {
    async fn run(&self, args: &TaskArgs) -> Result<Outcome, OperationError> {
        let argv = self.command_args(args);
        debug!(program = %self.program, args = ?argv, "Running operation command");

        let output = Command::new(&self.program)
            .args(&argv)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| OperationError::with_source(format!("cannot run '{}'", self.program), e))?;

        let lines = stderr_lines(&output.stderr);
        match output.status.code() {
            Some(0) => Ok(Outcome::success()),
            Some(code) if code == self.partial_exit_code => {
                let warnings = if lines.is_empty() {
                    vec![format!("'{}' reported a partial failure", self.program)]
                } else {
                    lines
                };
                Ok(Outcome {
                    kind: OutcomeKind::PartialFailure,
                    artifacts: Vec::new(),
                    warnings,
                })
            }
            Some(code) => {
                let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join(" | ");
                Err(OperationError::new(format!(
                    "'{}' exited with code {}: {}",
                    self.program, code, tail
                )))
            }
            None => Err(OperationError::new(format!(
                "'{}' was terminated by a signal",
                self.program
            ))),
        }
    }
}
