use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::models::task_event::{LEVEL_DEBUG, LEVEL_ERROR, LEVEL_INFO, LEVEL_WARNING};
use crate::models::{CoreError, CoreErrorKind, CoreResult, ExecId, Task, TaskEvent, TaskExec};
use crate::orchestration::{attribute_error, run_blocking};
use crate::persistence::TaskerStorage;

/// Handle given to a handler for exactly one execution.
///
/// Clones refer to the same execution, so a handler may move a clone into
/// its own spawned work. Completion is first-call-wins across all clones.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    task: Task,
    exec_id: ExecId,
    exec: Mutex<TaskExec>,
    storage: Arc<dyn TaskerStorage>,
}

impl TaskContext {
    pub(crate) fn new(task: Task, exec: TaskExec, storage: Arc<dyn TaskerStorage>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                task,
                exec_id: exec.id.clone(),
                exec: Mutex::new(exec),
                storage,
            }),
        }
    }

    pub fn task(&self) -> &Task {
        &self.inner.task
    }

    pub fn exec_id(&self) -> &ExecId {
        &self.inner.exec_id
    }

    /// Deserializes the task's parameter blob.
    pub fn bind_param<T: DeserializeOwned>(&self) -> CoreResult<T> {
        serde_json::from_str(&self.inner.task.param).map_err(|error| {
            CoreError::new(
                CoreErrorKind::DeserializationFailure,
                format!("task param is not valid for the requested type: {error}"),
            )
            .with_task(&self.inner.task.id)
            .with_execution(&self.inner.exec_id)
        })
    }

    /// Appends a progress event. Storage failures are logged and dropped.
    pub async fn event(&self, level: impl Into<String>, message: impl Into<String>) {
        let event = TaskEvent::now(self.inner.exec_id.clone(), level, message);
        let storage = self.inner.storage.clone();

        if let Err(error) = run_blocking(move || storage.add_task_event(&event)).await {
            tracing::warn!(
                task_id = %self.inner.task.id,
                exec_id = %self.inner.exec_id,
                kind = ?error.kind,
                message = %error.message,
                "failed to record task event"
            );
        }
    }

    pub async fn debug(&self, message: impl Into<String>) {
        self.event(LEVEL_DEBUG, message).await;
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.event(LEVEL_INFO, message).await;
    }

    pub async fn warning(&self, message: impl Into<String>) {
        self.event(LEVEL_WARNING, message).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.event(LEVEL_ERROR, message).await;
    }

    /// Completes the execution successfully. Pass `()` for no result.
    ///
    /// Fails with `AlreadyCompleted` if the execution was already completed.
    pub async fn success<R: Serialize>(&self, result: R) -> CoreResult<()> {
        let result = self.encode_result(result)?;
        self.complete(true, result).await
    }

    /// Completes the execution as failed. Pass `()` for no result.
    ///
    /// Fails with `AlreadyCompleted` if the execution was already completed.
    pub async fn fail<R: Serialize>(&self, result: R) -> CoreResult<()> {
        let result = self.encode_result(result)?;
        self.complete(false, result).await
    }

    pub async fn is_completed(&self) -> bool {
        self.inner.exec.lock().await.is_completed()
    }

    pub async fn snapshot(&self) -> TaskExec {
        self.inner.exec.lock().await.clone()
    }

    /// Completion applied once the handler's unit of work has finished.
    /// A no-op when the handler already completed explicitly.
    pub(crate) async fn complete_if_pending(&self, outcome: CoreResult<()>) {
        let (success, result) = match &outcome {
            Ok(()) => (true, None),
            Err(error) => (
                false,
                Some(
                    serde_json::json!({
                        "error": error.message,
                        "kind": format!("{:?}", error.kind),
                    })
                    .to_string(),
                ),
            ),
        };

        match self.complete(success, result).await {
            Ok(()) => {
                if let Err(error) = &outcome {
                    tracing::warn!(
                        task_id = %self.inner.task.id,
                        exec_id = %self.inner.exec_id,
                        kind = ?error.kind,
                        message = %error.message,
                        "task handler failed"
                    );
                }
            }
            Err(error) if error.kind == CoreErrorKind::AlreadyCompleted => {}
            Err(error) => {
                tracing::error!(
                    task_id = %self.inner.task.id,
                    exec_id = %self.inner.exec_id,
                    kind = ?error.kind,
                    message = %error.message,
                    "failed to persist automatic completion"
                );
            }
        }
    }

    async fn complete(&self, success: bool, result: Option<String>) -> CoreResult<()> {
        let mut exec = self.inner.exec.lock().await;
        if exec.is_completed() {
            return Err(CoreError::new(
                CoreErrorKind::AlreadyCompleted,
                "execution was already completed",
            )
            .with_task(&self.inner.task.id)
            .with_execution(&self.inner.exec_id));
        }

        let pending = exec.clone();
        exec.success = success;
        exec.end_time = Some(SystemTime::now());
        exec.result = result;
        // Committed before the write: if the handler is aborted while the
        // write is in flight, automatic completion must still see it as done.
        let record = exec.clone();

        let storage = self.inner.storage.clone();
        if let Err(error) = run_blocking(move || storage.update_task_exec(&record)).await {
            *exec = pending;
            return Err(attribute_error(
                error,
                Some(&self.inner.task.id),
                Some(&self.inner.exec_id),
            ));
        }

        tracing::debug!(
            task_id = %self.inner.task.id,
            exec_id = %self.inner.exec_id,
            success,
            "execution completed"
        );
        Ok(())
    }

    fn encode_result<R: Serialize>(&self, result: R) -> CoreResult<Option<String>> {
        let value = serde_json::to_value(result).map_err(|error| {
            attribute_error(
                CoreError::from(error),
                Some(&self.inner.task.id),
                Some(&self.inner.exec_id),
            )
        })?;
        if value.is_null() {
            Ok(None)
        } else {
            Ok(Some(value.to_string()))
        }
    }
}
