#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_tasker_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    handler TEXT NOT NULL,
    description TEXT NOT NULL,
    param TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_schemes (
    scheme_id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    cron TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_schemes_task
    ON task_schemes (task_id);

CREATE TABLE IF NOT EXISTS task_execs (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    exec_id TEXT NOT NULL UNIQUE,
    task_id TEXT NOT NULL,
    start_time_unix_us INTEGER NOT NULL,
    end_time_unix_us INTEGER,
    success INTEGER NOT NULL DEFAULT 0,
    result TEXT
);

CREATE INDEX IF NOT EXISTS idx_task_execs_start
    ON task_execs (start_time_unix_us DESC, seq DESC);

CREATE INDEX IF NOT EXISTS idx_task_execs_task
    ON task_execs (task_id);

CREATE TABLE IF NOT EXISTS task_events (
    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
    exec_id TEXT NOT NULL,
    time_unix_us INTEGER NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_events_exec
    ON task_events (exec_id, event_id);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_task_events_exec;
DROP TABLE IF EXISTS task_events;
DROP INDEX IF EXISTS idx_task_execs_task;
DROP INDEX IF EXISTS idx_task_execs_start;
DROP TABLE IF EXISTS task_execs;
DROP INDEX IF EXISTS idx_task_schemes_task;
DROP TABLE IF EXISTS task_schemes;
DROP TABLE IF EXISTS tasks;
"#,
};

const MIGRATIONS: [SqliteMigration; 1] = [MIGRATION_0001];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}
