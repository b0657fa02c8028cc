pub mod error;
pub mod execution;
pub mod task;
pub mod task_event;

pub use error::{CoreError, CoreErrorKind, CoreResult};
pub use execution::{ExecId, TaskExec};
pub use task::{SchemeId, Task, TaskId, TaskScheme};
pub use task_event::TaskEvent;
