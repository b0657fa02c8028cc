use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, OnceCell, Semaphore};

use crate::config::TaskerConfig;
use crate::models::{
    CoreError, CoreErrorKind, ExecId, SchemeId, Task, TaskEvent, TaskExec, TaskId, TaskScheme,
};
use crate::orchestration::{
    OrchestrationResult, TaskContext, TaskHandler, attribute_error, run_blocking,
};
use crate::persistence::{InMemoryStorage, TaskerStorage};
use crate::trigger::{
    CronTriggerScheduler, TriggerCallback, TriggerFuture, TriggerHandle, TriggerScheduler,
};

/// Registry of handlers, tasks and schedules, and the bridge from trigger
/// fires and manual runs to tracked executions.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct Tasker {
    inner: Arc<TaskerInner>,
}

struct TaskerInner {
    storage: Arc<dyn TaskerStorage>,
    triggers: Arc<dyn TriggerScheduler>,
    config: TaskerConfig,
    admission: Option<Arc<Semaphore>>,
    // Held across check, persist and insert so registry mutations are
    // linearizable with respect to each other and to run_task.
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    started: bool,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    tasks: HashMap<TaskId, Task>,
    schemes: HashMap<SchemeId, RegisteredScheme>,
}

struct RegisteredScheme {
    scheme: TaskScheme,
    trigger: Option<TriggerHandle>,
}

impl Tasker {
    pub fn new(storage: Arc<dyn TaskerStorage>, triggers: Arc<dyn TriggerScheduler>) -> Self {
        Self::with_config(storage, triggers, TaskerConfig::default())
    }

    pub fn with_config(
        storage: Arc<dyn TaskerStorage>,
        triggers: Arc<dyn TriggerScheduler>,
        config: TaskerConfig,
    ) -> Self {
        let admission = config
            .max_concurrent_executions
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));

        Self {
            inner: Arc::new(TaskerInner {
                storage,
                triggers,
                config,
                admission,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Volatile storage and tokio-driven cron triggers.
    pub fn in_memory() -> Self {
        Self::in_memory_with_config(TaskerConfig::default())
    }

    pub fn in_memory_with_config(config: TaskerConfig) -> Self {
        let storage = Arc::new(InMemoryStorage::with_retention(config.retention));
        Self::with_config(storage, Arc::new(CronTriggerScheduler::new()), config)
    }

    pub fn storage(&self) -> Arc<dyn TaskerStorage> {
        self.inner.storage.clone()
    }

    pub fn config(&self) -> &TaskerConfig {
        &self.inner.config
    }

    /// Associates `handler` with `name`, replacing any previous handler.
    /// Executions already running keep the handler they started with.
    pub async fn register(&self, name: impl Into<String>, handler: impl TaskHandler + 'static) {
        let name = name.into();
        let mut registry = self.inner.registry.lock().await;
        if registry
            .handlers
            .insert(name.clone(), Arc::new(handler))
            .is_some()
        {
            tracing::debug!(handler = %name, "replaced task handler registration");
        }
    }

    pub async fn add_task(
        &self,
        task_id: &str,
        handler: &str,
        desc: &str,
        param: &str,
    ) -> OrchestrationResult<()> {
        let task_id = TaskId::from(task_id);
        let mut registry = self.inner.registry.lock().await;

        if !registry.handlers.contains_key(handler) {
            return Err(handler_not_registered(handler).with_task(&task_id));
        }
        if registry.tasks.contains_key(&task_id) {
            return Err(CoreError::new(
                CoreErrorKind::AlreadyExists,
                format!("task '{task_id}' already exists"),
            )
            .with_task(&task_id));
        }

        let task = Task {
            id: task_id.clone(),
            handler: handler.to_string(),
            desc: desc.to_string(),
            param: param.to_string(),
        };
        let storage = self.inner.storage.clone();
        let record = task.clone();
        run_blocking(move || storage.add_task(&record))
            .await
            .map_err(|error| attribute_error(error, Some(&task_id), None))?;

        registry.tasks.insert(task_id.clone(), task);
        tracing::info!(task_id = %task_id, handler, "added task");
        Ok(())
    }

    /// Removes the task, its schedules, executions and events, and cancels
    /// the triggers of the removed schedules.
    pub async fn remove_task(&self, task_id: &str) -> OrchestrationResult<()> {
        let task_id = TaskId::from(task_id);
        let mut registry = self.inner.registry.lock().await;

        if !registry.tasks.contains_key(&task_id) {
            return Err(task_not_found(&task_id));
        }

        let storage = self.inner.storage.clone();
        let removed = task_id.clone();
        run_blocking(move || storage.remove_task(&removed))
            .await
            .map_err(|error| attribute_error(error, Some(&task_id), None))?;

        registry.tasks.remove(&task_id);
        let scheme_ids: Vec<SchemeId> = registry
            .schemes
            .values()
            .filter(|entry| entry.scheme.task_id == task_id)
            .map(|entry| entry.scheme.id.clone())
            .collect();
        for scheme_id in &scheme_ids {
            if let Some(entry) = registry.schemes.remove(scheme_id)
                && let Some(trigger) = entry.trigger
            {
                trigger.cancel();
            }
        }

        tracing::info!(
            task_id = %task_id,
            removed_schemes = scheme_ids.len(),
            "removed task"
        );
        Ok(())
    }

    pub async fn add_task_scheme(
        &self,
        scheme_id: &str,
        task_id: &str,
        cron_expr: &str,
    ) -> OrchestrationResult<()> {
        let scheme_id = SchemeId::from(scheme_id);
        let task_id = TaskId::from(task_id);
        let mut registry = self.inner.registry.lock().await;

        if !registry.tasks.contains_key(&task_id) {
            return Err(task_not_found(&task_id));
        }
        if registry.schemes.contains_key(&scheme_id) {
            return Err(CoreError::new(
                CoreErrorKind::AlreadyExists,
                format!("scheme '{scheme_id}' already exists"),
            )
            .with_task(&task_id));
        }

        let trigger = self
            .arm_trigger(&scheme_id, &task_id, cron_expr)
            .map_err(|error| attribute_error(error, Some(&task_id), None))?;

        let scheme = TaskScheme {
            id: scheme_id.clone(),
            task_id: task_id.clone(),
            cron: cron_expr.to_string(),
        };
        let storage = self.inner.storage.clone();
        let record = scheme.clone();
        if let Err(error) = run_blocking(move || storage.add_task_scheme(&record)).await {
            trigger.cancel();
            return Err(attribute_error(error, Some(&task_id), None));
        }

        registry.schemes.insert(
            scheme_id.clone(),
            RegisteredScheme {
                scheme,
                trigger: Some(trigger),
            },
        );
        tracing::info!(
            scheme_id = %scheme_id,
            task_id = %task_id,
            cron = cron_expr,
            "added task scheme"
        );
        Ok(())
    }

    /// Stops future fires of the schedule. Executions it already launched
    /// keep running.
    pub async fn remove_task_scheme(&self, scheme_id: &str) -> OrchestrationResult<()> {
        let scheme_id = SchemeId::from(scheme_id);
        let mut registry = self.inner.registry.lock().await;

        let task_id = registry
            .schemes
            .get(&scheme_id)
            .map(|entry| entry.scheme.task_id.clone())
            .ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::NotFound,
                    format!("scheme '{scheme_id}' was not found"),
                )
            })?;

        let storage = self.inner.storage.clone();
        let removed = scheme_id.clone();
        run_blocking(move || storage.remove_task_scheme(&removed))
            .await
            .map_err(|error| attribute_error(error, Some(&task_id), None))?;

        if let Some(entry) = registry.schemes.remove(&scheme_id)
            && let Some(trigger) = entry.trigger
        {
            trigger.cancel();
        }

        tracing::info!(scheme_id = %scheme_id, task_id = %task_id, "removed task scheme");
        Ok(())
    }

    /// Loads persisted tasks and schedules and registers triggers for them.
    ///
    /// Schedules whose task is missing, or whose expression no longer
    /// registers, are kept without a trigger and logged.
    pub async fn run(&self) -> OrchestrationResult<()> {
        let mut registry = self.inner.registry.lock().await;
        if registry.started {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "tasker has already been started",
            ));
        }

        let storage = self.inner.storage.clone();
        let tasks = run_blocking(move || storage.list_tasks()).await?;
        let storage = self.inner.storage.clone();
        let schemes = run_blocking(move || storage.list_task_schemes()).await?;

        for task in tasks {
            registry.tasks.entry(task.id.clone()).or_insert(task);
        }

        let mut armed = 0usize;
        for scheme in schemes {
            if registry.schemes.contains_key(&scheme.id) {
                continue;
            }

            let trigger = if registry.tasks.contains_key(&scheme.task_id) {
                match self.arm_trigger(&scheme.id, &scheme.task_id, &scheme.cron) {
                    Ok(trigger) => {
                        armed += 1;
                        Some(trigger)
                    }
                    Err(error) => {
                        tracing::warn!(
                            scheme_id = %scheme.id,
                            task_id = %scheme.task_id,
                            cron = %scheme.cron,
                            kind = ?error.kind,
                            message = %error.message,
                            "failed to register trigger for persisted scheme"
                        );
                        None
                    }
                }
            } else {
                tracing::warn!(
                    scheme_id = %scheme.id,
                    task_id = %scheme.task_id,
                    "persisted scheme references a missing task; trigger not registered"
                );
                None
            };

            registry
                .schemes
                .insert(scheme.id.clone(), RegisteredScheme { scheme, trigger });
        }

        registry.started = true;
        tracing::info!(
            tasks = registry.tasks.len(),
            schemes = registry.schemes.len(),
            armed_triggers = armed,
            "tasker started"
        );
        Ok(())
    }

    /// Creates an execution and launches the task's handler without waiting
    /// for it. The outcome is observable through `execution` and `events`.
    pub async fn run_task(&self, task_id: &str) -> OrchestrationResult<ExecId> {
        let task_id = TaskId::from(task_id);
        let registry = self.inner.registry.lock().await;
        self.start_execution(registry, &task_id).await
    }

    /// Fire path of a schedule trigger. Yields `None` when the schedule was
    /// removed or its trigger cancelled while the fire waited for the lock.
    async fn run_scheduled(
        &self,
        scheme_id: &SchemeId,
        task_id: &TaskId,
        trigger: &TriggerHandle,
    ) -> OrchestrationResult<Option<ExecId>> {
        let registry = self.inner.registry.lock().await;
        // Every path that retires a trigger cancels it under this lock.
        if trigger.is_cancelled() || !registry.schemes.contains_key(scheme_id) {
            tracing::debug!(
                scheme_id = %scheme_id,
                task_id = %task_id,
                "dropped fire of a retired trigger"
            );
            return Ok(None);
        }
        self.start_execution(registry, task_id).await.map(Some)
    }

    async fn start_execution(
        &self,
        registry: MutexGuard<'_, Registry>,
        task_id: &TaskId,
    ) -> OrchestrationResult<ExecId> {
        let task = registry
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| task_not_found(task_id))?;
        let handler = registry
            .handlers
            .get(&task.handler)
            .cloned()
            .ok_or_else(|| handler_not_registered(&task.handler).with_task(task_id))?;

        let exec = TaskExec::start(task_id.clone());
        let storage = self.inner.storage.clone();
        let record = exec.clone();
        run_blocking(move || storage.add_task_exec(&record))
            .await
            .map_err(|error| attribute_error(error, Some(task_id), Some(&exec.id)))?;
        drop(registry);

        let exec_id = exec.id.clone();
        self.launch(handler, TaskContext::new(task, exec, self.inner.storage.clone()));
        tracing::info!(task_id = %task_id, exec_id = %exec_id, "launched task execution");
        Ok(exec_id)
    }

    pub async fn events(&self, exec_id: &ExecId) -> OrchestrationResult<Vec<TaskEvent>> {
        let storage = self.inner.storage.clone();
        let exec_id = exec_id.clone();
        run_blocking(move || storage.list_task_events(&exec_id)).await
    }

    pub async fn execution(&self, exec_id: &ExecId) -> OrchestrationResult<Option<TaskExec>> {
        let storage = self.inner.storage.clone();
        let exec_id = exec_id.clone();
        run_blocking(move || storage.get_task_exec(&exec_id)).await
    }

    pub async fn executions(&self) -> OrchestrationResult<Vec<TaskExec>> {
        let storage = self.inner.storage.clone();
        run_blocking(move || storage.list_task_execs()).await
    }

    pub async fn tasks(&self) -> Vec<Task> {
        let registry = self.inner.registry.lock().await;
        let mut tasks: Vec<Task> = registry.tasks.values().cloned().collect();
        tasks.sort_by(|left, right| left.id.cmp(&right.id));
        tasks
    }

    pub async fn task_schemes(&self) -> Vec<TaskScheme> {
        let registry = self.inner.registry.lock().await;
        let mut schemes: Vec<TaskScheme> = registry
            .schemes
            .values()
            .map(|entry| entry.scheme.clone())
            .collect();
        schemes.sort_by(|left, right| left.id.cmp(&right.id));
        schemes
    }

    /// Cancels every registered trigger. Schedules stay registered and
    /// persisted; running executions are not interrupted.
    pub async fn shutdown(&self) {
        let mut registry = self.inner.registry.lock().await;
        let mut cancelled = 0usize;
        for entry in registry.schemes.values_mut() {
            if let Some(trigger) = entry.trigger.take() {
                trigger.cancel();
                cancelled += 1;
            }
        }
        tracing::info!(cancelled_triggers = cancelled, "tasker shut down");
    }

    /// Registers a trigger whose fires run `task_id` for as long as the
    /// schedule stays registered under the returned handle.
    fn arm_trigger(
        &self,
        scheme_id: &SchemeId,
        task_id: &TaskId,
        cron_expr: &str,
    ) -> OrchestrationResult<TriggerHandle> {
        // Weak so a registered trigger does not keep the tasker alive.
        let weak: Weak<TaskerInner> = Arc::downgrade(&self.inner);
        let armed: Arc<OnceCell<TriggerHandle>> = Arc::new(OnceCell::new());
        let scheme_id = scheme_id.clone();
        let task_id = task_id.clone();

        let callback: TriggerCallback = {
            let armed = armed.clone();
            Arc::new(move || {
                let weak = weak.clone();
                let armed = armed.clone();
                let scheme_id = scheme_id.clone();
                let task_id = task_id.clone();
                Box::pin(async move {
                    let (Some(inner), Some(trigger)) = (weak.upgrade(), armed.get()) else {
                        return;
                    };
                    let tasker = Tasker { inner };
                    if let Err(error) = tasker.run_scheduled(&scheme_id, &task_id, trigger).await {
                        tracing::warn!(
                            scheme_id = %scheme_id,
                            task_id = %task_id,
                            kind = ?error.kind,
                            message = %error.message,
                            "scheduled task run failed"
                        );
                    }
                }) as TriggerFuture
            })
        };

        let trigger = self.inner.triggers.schedule(cron_expr, callback)?;
        // Fresh cell; the first set cannot fail.
        let _ = armed.set(trigger.clone());
        Ok(trigger)
    }

    fn launch(&self, handler: Arc<dyn TaskHandler>, context: TaskContext) {
        let admission = self.inner.admission.clone();
        let timeout = self.inner.config.handler_timeout();

        tokio::spawn(async move {
            let _permit = match admission {
                Some(semaphore) => semaphore.acquire_owned().await.ok(),
                None => None,
            };
            let outcome = invoke_handler(handler, context.clone(), timeout).await;
            context.complete_if_pending(outcome).await;
        });
    }
}

impl Drop for TaskerInner {
    fn drop(&mut self) {
        for entry in self.registry.get_mut().schemes.values() {
            if let Some(trigger) = &entry.trigger {
                trigger.cancel();
            }
        }
    }
}

/// Runs the handler on its own tokio task so a panic or timeout becomes a
/// failed outcome instead of escaping.
async fn invoke_handler(
    handler: Arc<dyn TaskHandler>,
    context: TaskContext,
    timeout: Option<Duration>,
) -> OrchestrationResult<()> {
    let task_id = context.task().id.clone();
    let exec_id = context.exec_id().clone();
    // `call` itself runs inside the spawned task so a panic while building
    // the future is caught like one raised while polling it.
    let mut join_handle = tokio::spawn(async move { handler.call(context).await });

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut join_handle).await {
            Ok(joined) => joined,
            Err(_) => {
                join_handle.abort();
                return Err(CoreError::new(
                    CoreErrorKind::Timeout,
                    format!("handler did not finish within {}ms", limit.as_millis()),
                )
                .with_task(&task_id)
                .with_execution(&exec_id));
            }
        },
        None => join_handle.await,
    };

    joined.unwrap_or_else(|join_error| {
        Err(CoreError::new(
            CoreErrorKind::HandlerFailure,
            format!("handler task failed: {join_error}"),
        )
        .with_task(&task_id)
        .with_execution(&exec_id))
    })
}

fn task_not_found(task_id: &TaskId) -> CoreError {
    CoreError::new(
        CoreErrorKind::NotFound,
        format!("task '{task_id}' was not found"),
    )
    .with_task(task_id)
}

fn handler_not_registered(handler: &str) -> CoreError {
    CoreError::new(
        CoreErrorKind::HandlerNotRegistered,
        format!("no handler is registered under '{handler}'"),
    )
}
