use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::config::RetentionPolicy;
use crate::models::{
    CoreError, CoreErrorKind, ExecId, SchemeId, Task, TaskEvent, TaskExec, TaskId, TaskScheme,
};
use crate::persistence::{EventStore, ExecutionStore, PersistenceResult, SchemeStore, TaskStore};

/// Volatile backend. Every operation, retention trimming included, runs
/// under the single state mutex.
#[derive(Default)]
pub struct InMemoryStorage {
    retention: RetentionPolicy,
    state: Mutex<StorageState>,
}

#[derive(Default)]
struct StorageState {
    tasks: BTreeMap<TaskId, Task>,
    schemes: BTreeMap<SchemeId, TaskScheme>,
    execs: HashMap<ExecId, StoredExec>,
    events: HashMap<ExecId, Vec<TaskEvent>>,
    next_sequence: u64,
}

struct StoredExec {
    // Insertion order breaks ties between equal start times.
    sequence: u64,
    exec: TaskExec,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: RetentionPolicy) -> Self {
        Self {
            retention,
            state: Mutex::new(StorageState::default()),
        }
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    fn lock_state(&self) -> PersistenceResult<MutexGuard<'_, StorageState>> {
        self.state.lock().map_err(|_| {
            CoreError::new(CoreErrorKind::Internal, "in-memory storage mutex poisoned")
        })
    }
}

impl StorageState {
    fn evict_oldest_execs(&mut self, max_executions: usize) {
        while self.execs.len() > max_executions {
            let Some(oldest) = self
                .execs
                .values()
                .min_by_key(|stored| (stored.exec.start_time, stored.sequence))
                .map(|stored| stored.exec.id.clone())
            else {
                break;
            };
            self.execs.remove(&oldest);
            self.events.remove(&oldest);
        }
    }
}

impl TaskStore for InMemoryStorage {
    fn add_task(&self, task: &Task) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        if state.tasks.contains_key(&task.id) {
            return Err(
                storage_error(format!("task '{}' already stored", task.id)).with_task(&task.id)
            );
        }
        state.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn remove_task(&self, task_id: &TaskId) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        state.schemes.retain(|_, scheme| &scheme.task_id != task_id);

        let removed_execs: Vec<ExecId> = state
            .execs
            .values()
            .filter(|stored| &stored.exec.task_id == task_id)
            .map(|stored| stored.exec.id.clone())
            .collect();
        for exec_id in removed_execs {
            state.execs.remove(&exec_id);
            state.events.remove(&exec_id);
        }

        state.tasks.remove(task_id);
        Ok(())
    }

    fn list_tasks(&self) -> PersistenceResult<Vec<Task>> {
        let state = self.lock_state()?;
        Ok(state.tasks.values().cloned().collect())
    }
}

impl SchemeStore for InMemoryStorage {
    fn add_task_scheme(&self, scheme: &TaskScheme) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        if !state.tasks.contains_key(&scheme.task_id) {
            return Err(
                storage_error(format!("scheme '{}' references a missing task", scheme.id))
                    .with_task(&scheme.task_id),
            );
        }
        if state.schemes.contains_key(&scheme.id) {
            return Err(storage_error(format!("scheme '{}' already stored", scheme.id)));
        }
        state.schemes.insert(scheme.id.clone(), scheme.clone());
        Ok(())
    }

    fn remove_task_scheme(&self, scheme_id: &SchemeId) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        state.schemes.remove(scheme_id);
        Ok(())
    }

    fn list_task_schemes(&self) -> PersistenceResult<Vec<TaskScheme>> {
        let state = self.lock_state()?;
        Ok(state.schemes.values().cloned().collect())
    }
}

impl ExecutionStore for InMemoryStorage {
    fn add_task_exec(&self, exec: &TaskExec) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        if !state.tasks.contains_key(&exec.task_id) {
            return Err(storage_error("execution references a missing task")
                .with_task(&exec.task_id)
                .with_execution(&exec.id));
        }
        if state.execs.contains_key(&exec.id) {
            return Err(storage_error("execution already stored").with_execution(&exec.id));
        }

        let sequence = state.next_sequence;
        state.next_sequence = state.next_sequence.saturating_add(1);
        state.execs.insert(
            exec.id.clone(),
            StoredExec {
                sequence,
                exec: exec.clone(),
            },
        );
        state.evict_oldest_execs(self.retention.max_executions);
        Ok(())
    }

    fn update_task_exec(&self, exec: &TaskExec) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        // Evicted or cascaded executions are not brought back.
        let Some(stored) = state.execs.get_mut(&exec.id) else {
            return Err(storage_error("execution was not found for update")
                .with_task(&exec.task_id)
                .with_execution(&exec.id));
        };
        stored.exec = exec.clone();
        Ok(())
    }

    fn get_task_exec(&self, exec_id: &ExecId) -> PersistenceResult<Option<TaskExec>> {
        let state = self.lock_state()?;
        Ok(state.execs.get(exec_id).map(|stored| stored.exec.clone()))
    }

    fn list_task_execs(&self) -> PersistenceResult<Vec<TaskExec>> {
        let state = self.lock_state()?;
        let mut stored: Vec<&StoredExec> = state.execs.values().collect();
        stored.sort_by_key(|stored| (stored.exec.start_time, stored.sequence));
        Ok(stored.into_iter().map(|stored| stored.exec.clone()).collect())
    }
}

impl EventStore for InMemoryStorage {
    fn add_task_event(&self, event: &TaskEvent) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        if !state.execs.contains_key(&event.exec_id) {
            return Err(storage_error("event references a missing execution")
                .with_execution(&event.exec_id));
        }

        let max_events = self.retention.max_events_per_execution;
        let events = state.events.entry(event.exec_id.clone()).or_default();
        events.push(event.clone());
        if events.len() > max_events {
            let overflow = events.len() - max_events;
            events.drain(..overflow);
        }
        Ok(())
    }

    fn list_task_events(&self, exec_id: &ExecId) -> PersistenceResult<Vec<TaskEvent>> {
        let state = self.lock_state()?;
        Ok(state.events.get(exec_id).cloned().unwrap_or_default())
    }
}

fn storage_error(message: impl Into<String>) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("in-memory store: {}", message.into()),
    )
}
