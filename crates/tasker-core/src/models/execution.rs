use std::fmt::{Display, Formatter};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::TaskId;

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecId(pub String);

impl ExecId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Display for ExecId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExecId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One run of a task. `end_time` stays `None` until the run completes, and
/// `success`/`result` are only meaningful once it is set.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskExec {
    pub id: ExecId,
    pub task_id: TaskId,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub success: bool,
    pub result: Option<String>,
}

impl TaskExec {
    pub fn start(task_id: TaskId) -> Self {
        Self {
            id: ExecId::generate(),
            task_id,
            start_time: SystemTime::now(),
            end_time: None,
            success: false,
            result: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.end_time.is_some()
    }
}
