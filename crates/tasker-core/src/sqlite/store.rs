use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::config::RetentionPolicy;
use crate::models::{
    CoreError, CoreErrorKind, ExecId, SchemeId, Task, TaskEvent, TaskExec, TaskId, TaskScheme,
};
use crate::persistence::{
    EventStore, ExecutionStore, MigrationStore, PersistenceResult, SchemeStore, TaskStore,
};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "tasker_schema_migrations";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Relational backend. Each operation opens its own connection; writes that
/// read before they write take an immediate transaction so concurrent
/// executions serialize on the database lock instead of failing.
pub struct SqliteStore {
    database_path: PathBuf,
    retention: RetentionPolicy,
}

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self::with_retention(database_path, RetentionPolicy::default())
    }

    pub fn with_retention(database_path: impl Into<PathBuf>, retention: RetentionPolicy) -> Self {
        Self {
            database_path: database_path.into(),
            retention,
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }
}

impl MigrationStore for SqliteStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        if target_version > 0 && migration(target_version).is_none() {
            return Err(storage_error_text(
                "apply_migration",
                format!("migration version '{target_version}' is not defined"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version == current_version {
                // All DDL is IF NOT EXISTS, so replaying repairs tables that
                // went missing after their version was recorded.
                for version in 1..=target_version {
                    connection.execute_batch(defined_migration(version)?.up_sql)?;
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    step_migration(connection, defined_migration(version)?, Step::Up)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    step_migration(connection, defined_migration(version)?, Step::Down)?;
                }
            }

            Ok(())
        })
    }
}

impl TaskStore for SqliteStore {
    fn add_task(&self, task: &Task) -> PersistenceResult<()> {
        self.with_connection("add_task", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO tasks (task_id, handler, description, param)
VALUES (?1, ?2, ?3, ?4)
",
                params![
                    task.id.0.as_str(),
                    task.handler.as_str(),
                    task.desc.as_str(),
                    task.param.as_str(),
                ],
            )?;
            Ok(())
        })
    }

    fn remove_task(&self, task_id: &TaskId) -> PersistenceResult<()> {
        self.with_connection("remove_task", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            transaction.execute(
                "DELETE FROM task_schemes WHERE task_id = ?1",
                [task_id.0.as_str()],
            )?;
            transaction.execute(
                "
DELETE FROM task_events
WHERE exec_id IN (SELECT exec_id FROM task_execs WHERE task_id = ?1)
",
                [task_id.0.as_str()],
            )?;
            transaction.execute(
                "DELETE FROM task_execs WHERE task_id = ?1",
                [task_id.0.as_str()],
            )?;
            transaction.execute("DELETE FROM tasks WHERE task_id = ?1", [task_id.0.as_str()])?;
            transaction.commit()?;
            Ok(())
        })
    }

    fn list_tasks(&self) -> PersistenceResult<Vec<Task>> {
        self.with_connection("list_tasks", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT task_id, handler, description, param
FROM tasks
ORDER BY task_id
",
            )?;
            let rows = statement.query_map([], |row| {
                Ok(Task {
                    id: TaskId(row.get(0)?),
                    handler: row.get(1)?,
                    desc: row.get(2)?,
                    param: row.get(3)?,
                })
            })?;

            rows.collect()
        })
    }
}

impl SchemeStore for SqliteStore {
    fn add_task_scheme(&self, scheme: &TaskScheme) -> PersistenceResult<()> {
        self.with_connection("add_task_scheme", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if !task_exists(&transaction, &scheme.task_id)? {
                return Err(rejection(&format!(
                    "scheme '{}' references missing task '{}'",
                    scheme.id, scheme.task_id
                )));
            }
            transaction.execute(
                "
INSERT INTO task_schemes (scheme_id, task_id, cron)
VALUES (?1, ?2, ?3)
",
                params![
                    scheme.id.0.as_str(),
                    scheme.task_id.0.as_str(),
                    scheme.cron.as_str(),
                ],
            )?;
            transaction.commit()?;
            Ok(())
        })
    }

    fn remove_task_scheme(&self, scheme_id: &SchemeId) -> PersistenceResult<()> {
        self.with_connection("remove_task_scheme", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "DELETE FROM task_schemes WHERE scheme_id = ?1",
                [scheme_id.0.as_str()],
            )?;
            Ok(())
        })
    }

    fn list_task_schemes(&self) -> PersistenceResult<Vec<TaskScheme>> {
        self.with_connection("list_task_schemes", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT scheme_id, task_id, cron
FROM task_schemes
ORDER BY scheme_id
",
            )?;
            let rows = statement.query_map([], |row| {
                Ok(TaskScheme {
                    id: SchemeId(row.get(0)?),
                    task_id: TaskId(row.get(1)?),
                    cron: row.get(2)?,
                })
            })?;

            rows.collect()
        })
    }
}

impl ExecutionStore for SqliteStore {
    fn add_task_exec(&self, exec: &TaskExec) -> PersistenceResult<()> {
        let max_executions = to_i64(self.retention.max_executions)
            .map_err(|error| storage_error("add_task_exec", error))?;

        self.with_connection("add_task_exec", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if !task_exists(&transaction, &exec.task_id)? {
                return Err(rejection(&format!(
                    "execution '{}' references missing task '{}'",
                    exec.id, exec.task_id
                )));
            }
            transaction.execute(
                "
INSERT INTO task_execs (
    exec_id, task_id, start_time_unix_us, end_time_unix_us, success, result
) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
",
                params![
                    exec.id.0.as_str(),
                    exec.task_id.0.as_str(),
                    to_unix_micros(exec.start_time)?,
                    exec.end_time.map(to_unix_micros).transpose()?,
                    exec.success,
                    exec.result.as_deref(),
                ],
            )?;

            transaction.execute(
                "
DELETE FROM task_events
WHERE exec_id IN (
    SELECT exec_id FROM task_execs
    ORDER BY start_time_unix_us DESC, seq DESC
    LIMIT -1 OFFSET ?1
)
",
                [max_executions],
            )?;
            transaction.execute(
                "
DELETE FROM task_execs
WHERE exec_id IN (
    SELECT exec_id FROM task_execs
    ORDER BY start_time_unix_us DESC, seq DESC
    LIMIT -1 OFFSET ?1
)
",
                [max_executions],
            )?;

            transaction.commit()?;
            Ok(())
        })
    }

    fn update_task_exec(&self, exec: &TaskExec) -> PersistenceResult<()> {
        self.with_connection("update_task_exec", |connection| {
            ensure_schema_ready(connection)?;
            let updated = connection.execute(
                "
UPDATE task_execs
SET end_time_unix_us = ?2, success = ?3, result = ?4
WHERE exec_id = ?1
",
                params![
                    exec.id.0.as_str(),
                    exec.end_time.map(to_unix_micros).transpose()?,
                    exec.success,
                    exec.result.as_deref(),
                ],
            )?;

            if updated == 0 {
                return Err(rejection(
                    "execution id was not found for update",
                ));
            }
            Ok(())
        })
    }

    fn get_task_exec(&self, exec_id: &ExecId) -> PersistenceResult<Option<TaskExec>> {
        self.with_connection("get_task_exec", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(
                    "
SELECT exec_id, task_id, start_time_unix_us, end_time_unix_us, success, result
FROM task_execs
WHERE exec_id = ?1
",
                    [exec_id.0.as_str()],
                    read_exec_row,
                )
                .optional()
        })
    }

    fn list_task_execs(&self) -> PersistenceResult<Vec<TaskExec>> {
        self.with_connection("list_task_execs", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT exec_id, task_id, start_time_unix_us, end_time_unix_us, success, result
FROM task_execs
ORDER BY start_time_unix_us ASC, seq ASC
",
            )?;
            let rows = statement.query_map([], read_exec_row)?;

            rows.collect()
        })
    }
}

impl EventStore for SqliteStore {
    fn add_task_event(&self, event: &TaskEvent) -> PersistenceResult<()> {
        let max_events = to_i64(self.retention.max_events_per_execution)
            .map_err(|error| storage_error("add_task_event", error))?;

        self.with_connection("add_task_event", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let inserted = transaction.execute(
                "
INSERT INTO task_events (exec_id, time_unix_us, level, message)
SELECT ?1, ?2, ?3, ?4
WHERE EXISTS (SELECT 1 FROM task_execs WHERE exec_id = ?1)
",
                params![
                    event.exec_id.0.as_str(),
                    to_unix_micros(event.time)?,
                    event.level.as_str(),
                    event.message.as_str(),
                ],
            )?;
            if inserted == 0 {
                return Err(rejection(&format!(
                    "event references missing execution '{}'",
                    event.exec_id
                )));
            }

            transaction.execute(
                "
DELETE FROM task_events
WHERE exec_id = ?1
  AND event_id NOT IN (
    SELECT event_id FROM task_events
    WHERE exec_id = ?1
    ORDER BY event_id DESC
    LIMIT ?2
  )
",
                params![event.exec_id.0.as_str(), max_events],
            )?;

            transaction.commit()?;
            Ok(())
        })
    }

    fn list_task_events(&self, exec_id: &ExecId) -> PersistenceResult<Vec<TaskEvent>> {
        self.with_connection("list_task_events", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT exec_id, time_unix_us, level, message
FROM task_events
WHERE exec_id = ?1
ORDER BY event_id ASC
",
            )?;
            let rows = statement.query_map([exec_id.0.as_str()], |row| {
                let time_unix_us: i64 = row.get(1)?;
                Ok(TaskEvent {
                    exec_id: ExecId(row.get(0)?),
                    time: from_unix_micros(time_unix_us)?,
                    level: row.get(2)?,
                    message: row.get(3)?,
                })
            })?;

            rows.collect()
        })
    }
}

fn read_exec_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskExec> {
    let start_time_unix_us: i64 = row.get(2)?;
    let end_time_unix_us: Option<i64> = row.get(3)?;

    Ok(TaskExec {
        id: ExecId(row.get(0)?),
        task_id: TaskId(row.get(1)?),
        start_time: from_unix_micros(start_time_unix_us)?,
        end_time: end_time_unix_us.map(from_unix_micros).transpose()?,
        success: row.get(4)?,
        result: row.get(5)?,
    })
}

fn task_exists(connection: &Connection, task_id: &TaskId) -> rusqlite::Result<bool> {
    connection.query_row(
        "SELECT EXISTS(SELECT 1 FROM tasks WHERE task_id = ?1)",
        [task_id.0.as_str()],
        |row| row.get(0),
    )
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    Ok(connection)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(
        "
CREATE TABLE IF NOT EXISTS tasker_schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
",
    )?;
    Ok(())
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version <= 0 {
        return Err(rejection(
            "database schema is not initialized; apply migrations before task operations",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn defined_migration(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version)
        .ok_or_else(|| rejection(&format!("migration version '{version}' is not defined")))
}

#[derive(Clone, Copy)]
enum Step {
    Up,
    Down,
}

/// Runs one migration's DDL and its ledger row change in a single transaction.
fn step_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
    step: Step,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    match step {
        Step::Up => {
            transaction.execute_batch(migration.up_sql)?;
            transaction.execute(
                &format!(
                    "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix) \
                     VALUES (?1, ?2, unixepoch())"
                ),
                params![migration.version, migration.name],
            )?;
        }
        Step::Down => {
            transaction.execute_batch(migration.down_sql)?;
            transaction.execute(
                &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
                [migration.version],
            )?;
        }
    }
    transaction.commit()
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    storage_error_text(operation, error.to_string())
}

fn rejection(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn to_unix_micros(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        rejection(&format!("time before unix epoch is not supported: {error}"))
    })?;
    i64::try_from(duration.as_micros())
        .map_err(|_| rejection("unix timestamp microseconds exceed i64 range"))
}

fn from_unix_micros(value: i64) -> rusqlite::Result<SystemTime> {
    let micros = u64::try_from(value)
        .map_err(|_| rejection("negative unix timestamps are not supported"))?;
    Ok(UNIX_EPOCH + Duration::from_micros(micros))
}

fn to_i64(value: usize) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| rejection("value exceeds i64 range"))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
}
