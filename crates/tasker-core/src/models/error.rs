use thiserror::Error;

use crate::models::{ExecId, TaskId};

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CoreErrorKind {
    NotFound,
    AlreadyExists,
    HandlerNotRegistered,
    InvalidInput,
    DeserializationFailure,
    StorageFailure,
    TriggerRegistration,
    AlreadyCompleted,
    HandlerFailure,
    Timeout,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub task: Option<TaskId>,
    pub execution: Option<ExecId>,
    pub kind: CoreErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            task: None,
            execution: None,
            kind,
            message: message.into(),
        }
    }

    /// Error type for handler bodies that fail for domain reasons.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::HandlerFailure, message)
    }

    pub fn with_task(mut self, task: &TaskId) -> Self {
        self.task = Some(task.clone());
        self
    }

    pub fn with_execution(mut self, execution: &ExecId) -> Self {
        self.execution = Some(execution.clone());
        self
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(CoreErrorKind::DeserializationFailure, error.to_string())
    }
}
