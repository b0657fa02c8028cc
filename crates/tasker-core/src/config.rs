use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_MAX_EXECUTIONS: usize = 100;
pub const DEFAULT_MAX_EVENTS_PER_EXECUTION: usize = 100;

/// Caps enforced by every storage backend on insert.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub max_executions: usize,
    pub max_events_per_execution: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_executions: DEFAULT_MAX_EXECUTIONS,
            max_events_per_execution: DEFAULT_MAX_EVENTS_PER_EXECUTION,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct TaskerConfig {
    pub retention: RetentionPolicy,
    /// Handlers still running after this long are aborted and their
    /// execution is failed. `None` lets handlers run indefinitely.
    pub handler_timeout_ms: Option<u64>,
    /// Upper bound on concurrently running handlers. Executions over the
    /// bound are still created immediately and wait for a slot.
    pub max_concurrent_executions: Option<usize>,
}

impl TaskerConfig {
    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }
}
