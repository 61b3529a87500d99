use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::models::{
    ActionParams, CoreError, CoreErrorKind, InstalledPackage, ManagerAction, ManagerId,
    OutdatedPackage, PackageRef, PinRecord, TaskId, TaskPatch, TaskRecord, TaskStatus,
};
use crate::persistence::{
    MigrationStore, PackageStore, PersistenceResult, PinStore, PreferenceStore, TaskStore,
};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "keel_schema_migrations";
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);
const SAFE_MODE_KEY: &str = "safe_mode";

const TASK_COLUMNS: &str = "task_id, manager_id, action, package_name, package_version, query, \
     label, status, created_at_unix_ms, started_at_unix_ms, finished_at_unix_ms, has_output, \
     error_code, error_message";

pub struct SqliteStore {
    database_path: PathBuf,
}

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    /// Opens the database and brings the schema up to date.
    pub fn open(database_path: impl Into<PathBuf>) -> PersistenceResult<Self> {
        let store = Self::new(database_path);
        store.migrate_to_latest()?;
        Ok(store)
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

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version == current_version {
                // Replays are harmless: DDL is IF NOT EXISTS and duplicate
                // columns are tolerated.
                for version in 1..=target_version {
                    execute_batch_tolerant(connection, defined_migration(version)?.up_sql)?;
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined_migration(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined_migration(version)?)?;
                }
            }

            Ok(())
        })
    }
}

impl TaskStore for SqliteStore {
    fn create_task(&self, task: &TaskRecord) -> PersistenceResult<()> {
        self.with_connection("create_task", |connection| {
            ensure_schema_ready(connection)?;
            let (error_code, error_message) = error_columns(task.error.as_ref());
            connection.execute(
                &format!(
                    "INSERT INTO task_records ({TASK_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                     ON CONFLICT(task_id) DO NOTHING"
                ),
                params![
                    task_id_to_i64(task.id)?,
                    task.manager.as_str(),
                    task.action.as_str(),
                    task.params.package.as_deref(),
                    task.params.version.as_deref(),
                    task.params.query.as_deref(),
                    task.label.as_str(),
                    task.status.as_str(),
                    to_unix_ms(task.created_at)?,
                    task.started_at.map(to_unix_ms).transpose()?,
                    task.finished_at.map(to_unix_ms).transpose()?,
                    bool_to_sqlite(task.has_output),
                    error_code,
                    error_message,
                ],
            )?;
            Ok(())
        })
    }

    fn update_task(&self, task_id: TaskId, patch: &TaskPatch) -> PersistenceResult<()> {
        self.with_connection("update_task", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;
            let mut task = transaction
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM task_records WHERE task_id = ?1"),
                    [task_id_to_i64(task_id)?],
                    read_task,
                )
                .optional()?
                .ok_or_else(|| storage_error_sqlite("task id was not found for update"))?;

            if !task.apply(patch) {
                return Ok(());
            }

            let (error_code, error_message) = error_columns(task.error.as_ref());
            transaction.execute(
                "
UPDATE task_records
SET status = ?2, started_at_unix_ms = ?3, finished_at_unix_ms = ?4, has_output = ?5,
    error_code = ?6, error_message = ?7
WHERE task_id = ?1
",
                params![
                    task_id_to_i64(task.id)?,
                    task.status.as_str(),
                    task.started_at.map(to_unix_ms).transpose()?,
                    task.finished_at.map(to_unix_ms).transpose()?,
                    bool_to_sqlite(task.has_output),
                    error_code,
                    error_message,
                ],
            )?;
            transaction.commit()?;
            Ok(())
        })
    }

    fn get_task(&self, task_id: TaskId) -> PersistenceResult<Option<TaskRecord>> {
        self.with_connection("get_task", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM task_records WHERE task_id = ?1"),
                    [task_id_to_i64(task_id)?],
                    read_task,
                )
                .optional()
        })
    }

    fn load_unfinished_tasks(&self) -> PersistenceResult<Vec<TaskRecord>> {
        self.with_connection("load_unfinished_tasks", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM task_records
                 WHERE status IN ('queued', 'running')
                 ORDER BY task_id ASC"
            ))?;
            let rows = statement.query_map([], read_task)?;
            rows.collect()
        })
    }

    fn list_recent_tasks(&self, limit: usize) -> PersistenceResult<Vec<TaskRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        self.with_connection("list_recent_tasks", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM task_records ORDER BY task_id DESC LIMIT ?1"
            ))?;
            let rows = statement.query_map(params![to_i64(limit)?], read_task)?;
            rows.collect()
        })
    }

    fn next_task_id(&self) -> PersistenceResult<u64> {
        self.with_connection("next_task_id", |connection| {
            ensure_schema_ready(connection)?;
            let max_id: Option<i64> =
                connection.query_row("SELECT MAX(task_id) FROM task_records", [], |row| {
                    row.get(0)
                })?;
            match max_id {
                Some(id) => Ok(i64_to_u64(id)?.saturating_add(1)),
                None => Ok(0),
            }
        })
    }

    fn prune_terminal_tasks(&self, finished_before: SystemTime) -> PersistenceResult<usize> {
        self.with_connection("prune_terminal_tasks", |connection| {
            ensure_schema_ready(connection)?;
            let deleted = connection.execute(
                "
DELETE FROM task_records
WHERE status IN ('completed', 'failed', 'cancelled')
  AND COALESCE(finished_at_unix_ms, created_at_unix_ms) < ?1
",
                params![to_unix_ms(finished_before)?],
            )?;
            Ok(deleted)
        })
    }
}

impl PinStore for SqliteStore {
    fn upsert_pin(&self, pin: &PinRecord) -> PersistenceResult<()> {
        self.with_connection("upsert_pin", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO pin_records (manager_id, package_name, pinned_version, created_at_unix_ms)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(manager_id, package_name) DO UPDATE SET
    pinned_version = excluded.pinned_version
",
                params![
                    pin.package.manager.as_str(),
                    pin.package.name.as_str(),
                    pin.pinned_version.as_deref(),
                    to_unix_ms(pin.created_at)?,
                ],
            )?;
            Ok(())
        })
    }

    fn remove_pin(&self, package: &PackageRef) -> PersistenceResult<bool> {
        self.with_connection("remove_pin", |connection| {
            ensure_schema_ready(connection)?;
            let removed = connection.execute(
                "DELETE FROM pin_records WHERE manager_id = ?1 AND package_name = ?2",
                params![package.manager.as_str(), package.name.as_str()],
            )?;
            Ok(removed > 0)
        })
    }

    fn list_pins(&self) -> PersistenceResult<Vec<PinRecord>> {
        self.with_connection("list_pins", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT manager_id, package_name, pinned_version, created_at_unix_ms
FROM pin_records
ORDER BY manager_id, package_name
",
            )?;
            let rows = statement.query_map([], |row| {
                let manager_raw: String = row.get(0)?;
                let package_name: String = row.get(1)?;
                Ok(PinRecord {
                    package: PackageRef::new(ManagerId::from(manager_raw), package_name),
                    pinned_version: row.get(2)?,
                    created_at: from_unix_ms(row.get(3)?)?,
                })
            })?;
            rows.collect()
        })
    }
}

impl PackageStore for SqliteStore {
    fn replace_outdated(
        &self,
        manager: &ManagerId,
        packages: &[OutdatedPackage],
    ) -> PersistenceResult<()> {
        self.with_connection("replace_outdated", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;
            transaction.execute(
                "DELETE FROM outdated_packages WHERE manager_id = ?1",
                [manager.as_str()],
            )?;
            {
                let mut statement = transaction.prepare(
                    "
INSERT INTO outdated_packages (
    manager_id, package_name, installed_version, candidate_version, pinned, updated_at_unix_ms
) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT(manager_id, package_name) DO UPDATE SET
    installed_version = excluded.installed_version,
    candidate_version = excluded.candidate_version,
    pinned = excluded.pinned,
    updated_at_unix_ms = excluded.updated_at_unix_ms
",
                )?;
                let now = to_unix_ms(SystemTime::now())?;
                for package in packages {
                    statement.execute(params![
                        manager.as_str(),
                        package.package.name.as_str(),
                        package.installed_version.as_deref(),
                        package.candidate_version.as_str(),
                        bool_to_sqlite(package.pinned),
                        now,
                    ])?;
                }
            }
            transaction.commit()?;
            Ok(())
        })
    }

    fn list_outdated(&self) -> PersistenceResult<Vec<OutdatedPackage>> {
        self.with_connection("list_outdated", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT manager_id, package_name, installed_version, candidate_version, pinned
FROM outdated_packages
ORDER BY manager_id, package_name
",
            )?;
            let rows = statement.query_map([], |row| {
                let manager_raw: String = row.get(0)?;
                let package_name: String = row.get(1)?;
                Ok(OutdatedPackage {
                    package: PackageRef::new(ManagerId::from(manager_raw), package_name),
                    installed_version: row.get(2)?,
                    candidate_version: row.get(3)?,
                    pinned: sqlite_to_bool(row.get(4)?),
                })
            })?;
            rows.collect()
        })
    }

    fn replace_installed(
        &self,
        manager: &ManagerId,
        packages: &[InstalledPackage],
    ) -> PersistenceResult<()> {
        self.with_connection("replace_installed", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;
            transaction.execute(
                "DELETE FROM installed_packages WHERE manager_id = ?1",
                [manager.as_str()],
            )?;
            {
                let mut statement = transaction.prepare(
                    "
INSERT INTO installed_packages (
    manager_id, package_name, installed_version, pinned, updated_at_unix_ms
) VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(manager_id, package_name) DO UPDATE SET
    installed_version = excluded.installed_version,
    pinned = excluded.pinned,
    updated_at_unix_ms = excluded.updated_at_unix_ms
",
                )?;
                let now = to_unix_ms(SystemTime::now())?;
                for package in packages {
                    statement.execute(params![
                        manager.as_str(),
                        package.package.name.as_str(),
                        package.installed_version.as_deref(),
                        bool_to_sqlite(package.pinned),
                        now,
                    ])?;
                }
            }
            transaction.commit()?;
            Ok(())
        })
    }

    fn list_installed(&self) -> PersistenceResult<Vec<InstalledPackage>> {
        self.with_connection("list_installed", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT manager_id, package_name, installed_version, pinned
FROM installed_packages
ORDER BY manager_id, package_name
",
            )?;
            let rows = statement.query_map([], |row| {
                let manager_raw: String = row.get(0)?;
                let package_name: String = row.get(1)?;
                Ok(InstalledPackage {
                    package: PackageRef::new(ManagerId::from(manager_raw), package_name),
                    installed_version: row.get(2)?,
                    pinned: sqlite_to_bool(row.get(3)?),
                })
            })?;
            rows.collect()
        })
    }
}

impl PreferenceStore for SqliteStore {
    fn set_manager_enabled(&self, manager: &ManagerId, enabled: bool) -> PersistenceResult<()> {
        self.with_connection("set_manager_enabled", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO manager_preferences (manager_id, enabled) VALUES (?1, ?2)
ON CONFLICT(manager_id) DO UPDATE SET enabled = excluded.enabled
",
                params![manager.as_str(), bool_to_sqlite(enabled)],
            )?;
            Ok(())
        })
    }

    fn list_disabled_managers(&self) -> PersistenceResult<Vec<ManagerId>> {
        self.with_connection("list_disabled_managers", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "SELECT manager_id FROM manager_preferences WHERE enabled = 0 ORDER BY manager_id",
            )?;
            let rows = statement.query_map([], |row| Ok(ManagerId::from(row.get::<_, String>(0)?)))?;
            rows.collect()
        })
    }

    fn set_safe_mode(&self, enabled: bool) -> PersistenceResult<()> {
        self.with_connection("set_safe_mode", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO engine_settings (key, value) VALUES (?1, ?2)
ON CONFLICT(key) DO UPDATE SET value = excluded.value
",
                params![SAFE_MODE_KEY, bool_to_sqlite(enabled).to_string()],
            )?;
            Ok(())
        })
    }

    fn safe_mode(&self) -> PersistenceResult<bool> {
        self.with_connection("safe_mode", |connection| {
            ensure_schema_ready(connection)?;
            let value: Option<String> = connection
                .query_row(
                    "SELECT value FROM engine_settings WHERE key = ?1",
                    [SAFE_MODE_KEY],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value.is_some_and(|value| value == "1"))
        })
    }
}

fn read_task(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let id = TaskId(i64_to_u64(row.get(0)?)?);
    let manager = ManagerId::from(row.get::<_, String>(1)?);
    let action = parse_action(&row.get::<_, String>(2)?)?;
    let error_code: Option<String> = row.get(12)?;
    let error_message: Option<String> = row.get(13)?;
    let error = error_code.map(|code| CoreError {
        manager: Some(manager.clone()),
        task_id: Some(id),
        action: Some(action),
        kind: CoreErrorKind::from_code(&code).unwrap_or(CoreErrorKind::Internal),
        message: error_message.unwrap_or_default(),
    });

    Ok(TaskRecord {
        id,
        manager,
        action,
        params: ActionParams {
            package: row.get(3)?,
            version: row.get(4)?,
            query: row.get(5)?,
        },
        label: row.get(6)?,
        status: parse_status(&row.get::<_, String>(7)?)?,
        created_at: from_unix_ms(row.get(8)?)?,
        started_at: row.get::<_, Option<i64>>(9)?.map(from_unix_ms).transpose()?,
        finished_at: row.get::<_, Option<i64>>(10)?.map(from_unix_ms).transpose()?,
        has_output: sqlite_to_bool(row.get(11)?),
        error,
    })
}

fn error_columns(error: Option<&CoreError>) -> (Option<&'static str>, Option<&str>) {
    match error {
        Some(error) => (Some(error.code()), Some(error.message.as_str())),
        None => (None, None),
    }
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
    connection.execute_batch(&format!(
        "
CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
"
    ))
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version <= 0 {
        return Err(storage_error_sqlite(
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
        .ok_or_else(|| storage_error_sqlite(&format!("migration version '{version}' is not defined")))
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    execute_batch_tolerant(&transaction, migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT OR IGNORE INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()
}

/// `ALTER TABLE ADD COLUMN` is not idempotent in SQLite, so a replay that
/// hits an existing column statement by statement skips it.
fn execute_batch_tolerant(connection: &Connection, sql: &str) -> rusqlite::Result<()> {
    for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        match connection.execute_batch(statement) {
            Ok(()) => {}
            Err(error) if error.to_string().contains("duplicate column name") => {}
            Err(error) => return Err(error),
        }
    }
    Ok(())
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    let kind = match &error {
        rusqlite::Error::SqliteFailure(inner, _)
            if matches!(
                inner.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) =>
        {
            CoreErrorKind::PersistenceTransient
        }
        _ => CoreErrorKind::StorageFailure,
    };
    CoreError {
        kind,
        ..storage_error_text(operation, error.to_string())
    }
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn parse_action(raw: &str) -> rusqlite::Result<ManagerAction> {
    raw.parse::<ManagerAction>()
        .map_err(|message| storage_error_sqlite(&message))
}

fn parse_status(raw: &str) -> rusqlite::Result<TaskStatus> {
    raw.parse::<TaskStatus>()
        .map_err(|message| storage_error_sqlite(&message))
}

fn bool_to_sqlite(value: bool) -> i64 {
    i64::from(value)
}

fn sqlite_to_bool(value: i64) -> bool {
    value != 0
}

fn to_unix_ms(value: SystemTime) -> rusqlite::Result<i64> {
    let millis = value
        .duration_since(UNIX_EPOCH)
        .map_err(|error| {
            storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
        })?
        .as_millis();
    i64::try_from(millis).map_err(|_| storage_error_sqlite("unix timestamp exceeds i64 range"))
}

fn from_unix_ms(value: i64) -> rusqlite::Result<SystemTime> {
    let millis = u64::try_from(value)
        .map_err(|_| storage_error_sqlite("negative unix timestamp in sqlite record"))?;
    Ok(UNIX_EPOCH + Duration::from_millis(millis))
}

fn task_id_to_i64(value: TaskId) -> rusqlite::Result<i64> {
    i64::try_from(value.0).map_err(|_| storage_error_sqlite("task id exceeds i64 range"))
}

fn i64_to_u64(value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| storage_error_sqlite("negative task id in sqlite record"))
}

fn to_i64(value: usize) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("value exceeds i64 range"))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError {
        manager: None,
        task_id: None,
        action: None,
        kind: CoreErrorKind::StorageFailure,
        message: format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    }
}
