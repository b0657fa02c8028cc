pub mod context;
pub mod handler;
pub mod tasker;

pub use context::TaskContext;
pub use handler::{HandlerFuture, TaskHandler};
pub use tasker::Tasker;

use crate::models::{CoreError, CoreErrorKind, CoreResult, ExecId, TaskId};

pub type OrchestrationResult<T> = CoreResult<T>;

/// Runs a synchronous storage call on the blocking pool.
pub(crate) async fn run_blocking<T, F>(operation: F) -> OrchestrationResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> CoreResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .map_err(|join_error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("storage call join failure: {join_error}"),
            )
        })?
}

/// Fills in task and execution ids the error does not already carry.
pub(crate) fn attribute_error(
    error: CoreError,
    task: Option<&TaskId>,
    execution: Option<&ExecId>,
) -> CoreError {
    CoreError {
        task: error.task.or_else(|| task.cloned()),
        execution: error.execution.or_else(|| execution.cloned()),
        kind: error.kind,
        message: error.message,
    }
}
