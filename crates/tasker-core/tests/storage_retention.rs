use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tasker_core::config::RetentionPolicy;
use tasker_core::models::{
    CoreErrorKind, ExecId, SchemeId, Task, TaskEvent, TaskExec, TaskId, TaskScheme,
};
use tasker_core::persistence::{
    EventStore, ExecutionStore, InMemoryStorage, SchemeStore, TaskStore, TaskerStorage,
};
use tasker_core::sqlite::SqliteStore;

const BASE_UNIX_SECS: u64 = 1_700_000_000;

fn test_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("tasker-{test_name}-{nanos}.sqlite3"))
}

fn migrated_sqlite(test_name: &str) -> SqliteStore {
    let store = SqliteStore::new(test_db_path(test_name));
    store.migrate_to_latest().expect("migrations should apply");
    store
}

fn task(id: &str) -> Task {
    Task {
        id: TaskId::from(id),
        handler: "noop".to_string(),
        desc: String::new(),
        param: "{}".to_string(),
    }
}

fn exec_at(id: &str, task_id: &str, offset_secs: u64) -> TaskExec {
    TaskExec {
        id: ExecId::from(id),
        task_id: TaskId::from(task_id),
        start_time: UNIX_EPOCH + Duration::from_secs(BASE_UNIX_SECS + offset_secs),
        end_time: None,
        success: false,
        result: None,
    }
}

fn event(exec_id: &str, message: String) -> TaskEvent {
    TaskEvent::now(ExecId::from(exec_id), "info", message)
}

fn keeps_most_recent_executions(store: &dyn TaskerStorage) {
    store.add_task(&task("t1")).unwrap();

    // Inserted out of start-time order; 7 is coprime with 150.
    for step in 0..150u64 {
        let offset = (step * 7) % 150;
        store
            .add_task_exec(&exec_at(&format!("exec-{offset}"), "t1", offset))
            .unwrap();
    }

    let execs = store.list_task_execs().unwrap();
    assert_eq!(execs.len(), 100);
    let expected: Vec<ExecId> = (50..150)
        .map(|offset| ExecId(format!("exec-{offset}")))
        .collect();
    let actual: Vec<ExecId> = execs.into_iter().map(|exec| exec.id).collect();
    assert_eq!(actual, expected);
}

fn keeps_most_recent_events_in_order(store: &dyn TaskerStorage) {
    store.add_task(&task("t1")).unwrap();
    store.add_task_exec(&exec_at("e1", "t1", 0)).unwrap();
    store.add_task_exec(&exec_at("e2", "t1", 1)).unwrap();

    for index in 0..150 {
        store
            .add_task_event(&event("e1", format!("event-{index}")))
            .unwrap();
    }
    store
        .add_task_event(&event("e2", "other".to_string()))
        .unwrap();

    let messages: Vec<String> = store
        .list_task_events(&ExecId::from("e1"))
        .unwrap()
        .into_iter()
        .map(|event| event.message)
        .collect();
    let expected: Vec<String> = (50..150).map(|index| format!("event-{index}")).collect();
    assert_eq!(messages, expected);
    assert_eq!(store.list_task_events(&ExecId::from("e2")).unwrap().len(), 1);
}

fn evicted_execution_takes_its_events(store: &dyn TaskerStorage) {
    store.add_task(&task("t1")).unwrap();
    store.add_task_exec(&exec_at("old", "t1", 0)).unwrap();
    store
        .add_task_event(&event("old", "from old".to_string()))
        .unwrap();
    store.add_task_exec(&exec_at("mid", "t1", 1)).unwrap();
    store.add_task_exec(&exec_at("new", "t1", 2)).unwrap();

    assert!(store.get_task_exec(&ExecId::from("old")).unwrap().is_none());
    assert!(store.list_task_events(&ExecId::from("old")).unwrap().is_empty());
    assert_eq!(store.list_task_execs().unwrap().len(), 2);
}

fn remove_task_cascades(store: &dyn TaskerStorage) {
    store.add_task(&task("t1")).unwrap();
    store.add_task(&task("t2")).unwrap();
    store
        .add_task_scheme(&TaskScheme {
            id: SchemeId::from("s1"),
            task_id: TaskId::from("t1"),
            cron: "* * * * * *".to_string(),
        })
        .unwrap();
    store.add_task_exec(&exec_at("e1", "t1", 0)).unwrap();
    store.add_task_exec(&exec_at("e2", "t2", 1)).unwrap();
    store
        .add_task_event(&event("e1", "gone".to_string()))
        .unwrap();

    store.remove_task(&TaskId::from("t1")).unwrap();

    let tasks = store.list_tasks().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, TaskId::from("t2"));
    assert!(store.list_task_schemes().unwrap().is_empty());
    assert!(store.get_task_exec(&ExecId::from("e1")).unwrap().is_none());
    assert!(store.list_task_events(&ExecId::from("e1")).unwrap().is_empty());
    assert!(store.get_task_exec(&ExecId::from("e2")).unwrap().is_some());
}

fn dangling_references_are_rejected(store: &dyn TaskerStorage) {
    let error = store
        .add_task_exec(&exec_at("e1", "missing", 0))
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);

    let error = store
        .add_task_scheme(&TaskScheme {
            id: SchemeId::from("s1"),
            task_id: TaskId::from("missing"),
            cron: "* * * * * *".to_string(),
        })
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);

    let error = store
        .add_task_event(&event("missing", "orphan".to_string()))
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);

    let mut ghost = exec_at("ghost", "missing", 0);
    ghost.end_time = Some(SystemTime::now());
    let error = store.update_task_exec(&ghost).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);
    assert!(store.list_task_execs().unwrap().is_empty());
}

fn completion_round_trips(store: &dyn TaskerStorage) {
    store.add_task(&task("t1")).unwrap();
    let mut exec = exec_at("e1", "t1", 0);
    store.add_task_exec(&exec).unwrap();

    exec.end_time = Some(UNIX_EPOCH + Duration::from_secs(BASE_UNIX_SECS + 5));
    exec.success = true;
    exec.result = Some(r#"{"ok":true}"#.to_string());
    store.update_task_exec(&exec).unwrap();

    assert_eq!(store.get_task_exec(&exec.id).unwrap(), Some(exec));
}

#[test]
fn in_memory_keeps_most_recent_executions() {
    keeps_most_recent_executions(&InMemoryStorage::new());
}

#[test]
fn sqlite_keeps_most_recent_executions() {
    keeps_most_recent_executions(&migrated_sqlite("retention-execs"));
}

#[test]
fn in_memory_keeps_most_recent_events_in_order() {
    keeps_most_recent_events_in_order(&InMemoryStorage::new());
}

#[test]
fn sqlite_keeps_most_recent_events_in_order() {
    keeps_most_recent_events_in_order(&migrated_sqlite("retention-events"));
}

#[test]
fn in_memory_eviction_drops_events() {
    let store = InMemoryStorage::with_retention(RetentionPolicy {
        max_executions: 2,
        max_events_per_execution: 10,
    });
    evicted_execution_takes_its_events(&store);
}

#[test]
fn sqlite_eviction_drops_events() {
    let store = SqliteStore::with_retention(
        test_db_path("retention-evict"),
        RetentionPolicy {
            max_executions: 2,
            max_events_per_execution: 10,
        },
    );
    store.migrate_to_latest().unwrap();
    evicted_execution_takes_its_events(&store);
}

#[test]
fn in_memory_remove_task_cascades() {
    remove_task_cascades(&InMemoryStorage::new());
}

#[test]
fn sqlite_remove_task_cascades() {
    remove_task_cascades(&migrated_sqlite("cascade"));
}

#[test]
fn in_memory_rejects_dangling_references() {
    dangling_references_are_rejected(&InMemoryStorage::new());
}

#[test]
fn sqlite_rejects_dangling_references() {
    dangling_references_are_rejected(&migrated_sqlite("dangling"));
}

#[test]
fn in_memory_completion_round_trips() {
    completion_round_trips(&InMemoryStorage::new());
}

#[test]
fn sqlite_completion_round_trips() {
    completion_round_trips(&migrated_sqlite("completion"));
}
