pub mod in_memory;

pub use in_memory::InMemoryStorage;

use crate::models::{CoreError, ExecId, SchemeId, Task, TaskEvent, TaskExec, TaskId, TaskScheme};

pub type PersistenceResult<T> = Result<T, CoreError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

pub trait TaskStore: Send + Sync {
    fn add_task(&self, task: &Task) -> PersistenceResult<()>;

    /// Removes the task together with its schemes, executions and their
    /// events as one logical operation.
    fn remove_task(&self, task_id: &TaskId) -> PersistenceResult<()>;

    fn list_tasks(&self) -> PersistenceResult<Vec<Task>>;
}

pub trait SchemeStore: Send + Sync {
    fn add_task_scheme(&self, scheme: &TaskScheme) -> PersistenceResult<()>;

    fn remove_task_scheme(&self, scheme_id: &SchemeId) -> PersistenceResult<()>;

    fn list_task_schemes(&self) -> PersistenceResult<Vec<TaskScheme>>;
}

pub trait ExecutionStore: Send + Sync {
    /// Inserts a new execution and evicts the oldest ones past the
    /// retention cap, together with their events.
    fn add_task_exec(&self, exec: &TaskExec) -> PersistenceResult<()>;

    fn update_task_exec(&self, exec: &TaskExec) -> PersistenceResult<()>;

    fn get_task_exec(&self, exec_id: &ExecId) -> PersistenceResult<Option<TaskExec>>;

    /// All retained executions, oldest start time first.
    fn list_task_execs(&self) -> PersistenceResult<Vec<TaskExec>>;
}

pub trait EventStore: Send + Sync {
    /// Appends an event and drops the oldest events of the same execution
    /// past the retention cap.
    fn add_task_event(&self, event: &TaskEvent) -> PersistenceResult<()>;

    /// Events of one execution in insertion order; empty when unknown.
    fn list_task_events(&self, exec_id: &ExecId) -> PersistenceResult<Vec<TaskEvent>>;
}

pub trait TaskerStorage: TaskStore + SchemeStore + ExecutionStore + EventStore {}

impl<T> TaskerStorage for T where T: TaskStore + SchemeStore + ExecutionStore + EventStore + ?Sized {}
