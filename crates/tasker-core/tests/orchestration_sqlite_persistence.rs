use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tasker_core::models::{CoreError, CoreErrorKind, CoreResult, ExecId, TaskExec};
use tasker_core::orchestration::{TaskContext, Tasker};
use tasker_core::persistence::{ExecutionStore, SchemeStore, TaskStore};
use tasker_core::sqlite::SqliteStore;
use tasker_core::trigger::CronTriggerScheduler;

fn test_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("tasker-{test_name}-{nanos}.sqlite3"))
}

fn sqlite_tasker(path: &Path) -> (Tasker, Arc<SqliteStore>) {
    let store = Arc::new(SqliteStore::new(path));
    store.migrate_to_latest().expect("migrations should apply");
    let tasker = Tasker::new(store.clone(), Arc::new(CronTriggerScheduler::new()));
    (tasker, store)
}

async fn wait_for_persisted_completion(store: &SqliteStore, exec_id: &ExecId) -> TaskExec {
    for _ in 0..150 {
        if let Some(exec) = store
            .get_task_exec(exec_id)
            .expect("get_task_exec should succeed")
            && exec.is_completed()
        {
            return exec;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("execution {exec_id} was not completed in sqlite");
}

async fn echo(context: TaskContext) -> CoreResult<()> {
    context.info("start").await;
    context.success(()).await
}

#[tokio::test]
async fn echo_execution_is_persisted() {
    let path = test_db_path("echo");
    let (tasker, store) = sqlite_tasker(&path);
    tasker.register("Echo", echo).await;
    tasker.add_task("t1", "Echo", "d", "{}").await.unwrap();

    let exec_id = tasker.run_task("t1").await.unwrap();
    let exec = wait_for_persisted_completion(&store, &exec_id).await;

    assert!(exec.success);
    assert!(exec.end_time.unwrap() >= exec.start_time);
    let events = tasker.events(&exec_id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].level, "info");
    assert_eq!(events[0].message, "start");
}

#[tokio::test]
async fn failing_handler_persists_error_result() {
    let path = test_db_path("failure");
    let (tasker, store) = sqlite_tasker(&path);
    tasker
        .register("fails", |context: TaskContext| async move {
            context.warning("about to fail").await;
            Err::<(), CoreError>(CoreError::handler("disk full"))
        })
        .await;
    tasker.add_task("t1", "fails", "", "{}").await.unwrap();

    let exec_id = tasker.run_task("t1").await.unwrap();
    let exec = wait_for_persisted_completion(&store, &exec_id).await;

    assert!(!exec.success);
    assert!(exec.result.as_deref().unwrap().contains("disk full"));
    assert_eq!(tasker.events(&exec_id).await.unwrap()[0].level, "warning");
}

#[tokio::test]
async fn restarted_tasker_recovers_registry_from_sqlite() {
    let path = test_db_path("recovery");
    {
        let (tasker, store) = sqlite_tasker(&path);
        tasker.register("Echo", echo).await;
        tasker.add_task("t1", "Echo", "kept", "{}").await.unwrap();
        tasker
            .add_task_scheme("s1", "t1", "0 0 0 1 1 *")
            .await
            .unwrap();
        let exec_id = tasker.run_task("t1").await.unwrap();
        wait_for_persisted_completion(&store, &exec_id).await;
        tasker.shutdown().await;
    }

    let (tasker, store) = sqlite_tasker(&path);
    tasker.register("Echo", echo).await;
    tasker.run().await.unwrap();

    let tasks = tasker.tasks().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].desc, "kept");
    assert_eq!(tasker.task_schemes().await.len(), 1);
    assert_eq!(tasker.executions().await.unwrap().len(), 1);

    let error = tasker
        .add_task("t1", "Echo", "again", "{}")
        .await
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::AlreadyExists);

    let exec_id = tasker.run_task("t1").await.unwrap();
    assert!(wait_for_persisted_completion(&store, &exec_id).await.success);

    tasker.remove_task("t1").await.unwrap();
    assert!(store.list_tasks().unwrap().is_empty());
    assert!(store.list_task_schemes().unwrap().is_empty());
    assert!(store.list_task_execs().unwrap().is_empty());
}
