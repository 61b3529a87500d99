#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_engine_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS task_records (
    task_id INTEGER PRIMARY KEY,
    manager_id TEXT NOT NULL,
    action TEXT NOT NULL,
    package_name TEXT,
    package_version TEXT,
    query TEXT,
    label TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at_unix_ms INTEGER NOT NULL,
    started_at_unix_ms INTEGER,
    finished_at_unix_ms INTEGER,
    has_output INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_task_records_status
    ON task_records (status);

CREATE TABLE IF NOT EXISTS pin_records (
    manager_id TEXT NOT NULL,
    package_name TEXT NOT NULL,
    pinned_version TEXT,
    created_at_unix_ms INTEGER NOT NULL,
    PRIMARY KEY (manager_id, package_name)
);

CREATE TABLE IF NOT EXISTS outdated_packages (
    manager_id TEXT NOT NULL,
    package_name TEXT NOT NULL,
    installed_version TEXT,
    candidate_version TEXT NOT NULL,
    pinned INTEGER NOT NULL DEFAULT 0,
    updated_at_unix_ms INTEGER NOT NULL,
    PRIMARY KEY (manager_id, package_name)
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS outdated_packages;
DROP TABLE IF EXISTS pin_records;
DROP INDEX IF EXISTS idx_task_records_status;
DROP TABLE IF EXISTS task_records;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_task_error_attribution",
    up_sql: r#"
ALTER TABLE task_records ADD COLUMN error_code TEXT;
ALTER TABLE task_records ADD COLUMN error_message TEXT;
"#,
    down_sql: r#"
ALTER TABLE task_records DROP COLUMN error_message;
ALTER TABLE task_records DROP COLUMN error_code;
"#,
};

const MIGRATION_0003: SqliteMigration = SqliteMigration {
    version: 3,
    name: "add_inventory_and_preferences",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS installed_packages (
    manager_id TEXT NOT NULL,
    package_name TEXT NOT NULL,
    installed_version TEXT,
    pinned INTEGER NOT NULL DEFAULT 0,
    updated_at_unix_ms INTEGER NOT NULL,
    PRIMARY KEY (manager_id, package_name)
);

CREATE TABLE IF NOT EXISTS manager_preferences (
    manager_id TEXT PRIMARY KEY,
    enabled INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS engine_settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS engine_settings;
DROP TABLE IF EXISTS manager_preferences;
DROP TABLE IF EXISTS installed_packages;
"#,
};

const MIGRATIONS: &[SqliteMigration] = &[MIGRATION_0001, MIGRATION_0002, MIGRATION_0003];

pub fn migrations() -> &'static [SqliteMigration] {
    MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}
