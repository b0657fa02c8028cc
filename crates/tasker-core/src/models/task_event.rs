use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::models::ExecId;

pub const LEVEL_DEBUG: &str = "debug";
pub const LEVEL_INFO: &str = "info";
pub const LEVEL_WARNING: &str = "warning";
pub const LEVEL_ERROR: &str = "error";

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub exec_id: ExecId,
    pub time: SystemTime,
    pub level: String,
    pub message: String,
}

impl TaskEvent {
    pub fn now(exec_id: ExecId, level: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exec_id,
            time: SystemTime::now(),
            level: level.into(),
            message: message.into(),
        }
    }
}
