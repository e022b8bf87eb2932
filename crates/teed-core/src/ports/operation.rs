//! Operation port - the black-box processing behind each `Operation`.

use async_trait::async_trait;

use crate::domain::{OperationError, Outcome, TaskArgs};

/// Runs one kind of operation.
///
/// - `Ok(Outcome::success())` resolves the task to `done`
/// - `Ok(Outcome::partial(..))` resolves it to `done_with_error`
/// - `Err(_)` resolves it to `failed`
///
/// Args are passed through untouched; validating them is the handler's job.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn run(&self, args: &TaskArgs) -> Result<Outcome, OperationError>;
}

/// Adapts a plain synchronous function into an `OperationHandler`.
///
/// ```ignore
/// registry.register(
///     Operation::BulkcmProbe,
///     Arc::new(FnOperation::new(|args: &TaskArgs| Ok(Outcome::success()))),
/// )?;
/// ```
pub struct FnOperation<F> {
    f: F,
}

impl<F> FnOperation<F>
where
    F: Fn(&TaskArgs) -> Result<Outcome, OperationError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> OperationHandler for FnOperation<F>
where
    F: Fn(&TaskArgs) -> Result<Outcome, OperationError> + Send + Sync,
{
    async fn run(&self, args: &TaskArgs) -> Result<Outcome, OperationError> {
        (self.f)(args)
    }
}
