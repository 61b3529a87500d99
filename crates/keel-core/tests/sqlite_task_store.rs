use std::time::{Duration, SystemTime};

use keel_core::models::{
    ActionParams, CoreError, CoreErrorKind, InstalledPackage, ManagerAction, ManagerId,
    OutdatedPackage, PackageRef, PinRecord, TaskId, TaskPatch, TaskRecord, TaskStatus,
};
use keel_core::persistence::{MigrationStore, PackageStore, PinStore, PreferenceStore, TaskStore};
use keel_core::sqlite::{SqliteStore, current_schema_version};

fn open() -> (tempfile::TempDir, SqliteStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("nested").join("keel.db")).unwrap();
    (dir, store)
}

fn task(id: u64, package: &str) -> TaskRecord {
    TaskRecord::queued(
        TaskId(id),
        ManagerId::new("npm"),
        ManagerAction::Upgrade,
        ActionParams::package(package).with_version("9.1.0"),
        format!("upgrade {package} (npm)"),
    )
}

#[test]
fn open_creates_parent_directories_and_migrates() {
    let (_dir, store) = open();
    assert!(store.database_path().exists());
    assert_eq!(store.current_version().unwrap(), current_schema_version());
    assert!(store.planned_migrations(current_schema_version()).is_empty());
    assert_eq!(store.planned_migrations(0).len() as i64, current_schema_version());
}

#[test]
fn replaying_the_current_migration_is_harmless() {
    let (_dir, store) = open();
    store.create_task(&task(0, "eslint")).unwrap();

    store.migrate_to_latest().unwrap();
    store.apply_migration(current_schema_version()).unwrap();

    assert_eq!(store.current_version().unwrap(), current_schema_version());
    assert!(store.get_task(TaskId(0)).unwrap().is_some());
}

#[test]
fn migrations_roll_back_and_forward() {
    let (_dir, store) = open();
    store.apply_migration(0).unwrap();
    assert_eq!(store.current_version().unwrap(), 0);
    store.migrate_to_latest().unwrap();
    assert_eq!(store.current_version().unwrap(), current_schema_version());

    let error = store.apply_migration(current_schema_version() + 1).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);
}

#[test]
fn task_records_round_trip_with_params() {
    let (_dir, store) = open();
    let record = task(3, "eslint");
    store.create_task(&record).unwrap();

    let loaded = store.get_task(TaskId(3)).unwrap().unwrap();
    assert_eq!(loaded.manager, ManagerId::new("npm"));
    assert_eq!(loaded.action, ManagerAction::Upgrade);
    assert_eq!(loaded.params.package.as_deref(), Some("eslint"));
    assert_eq!(loaded.params.version.as_deref(), Some("9.1.0"));
    assert_eq!(loaded.status, TaskStatus::Queued);
    assert_eq!(loaded.label, "upgrade eslint (npm)");
    assert!(store.get_task(TaskId(4)).unwrap().is_none());
}

#[test]
fn creating_an_existing_task_is_a_no_op() {
    let (_dir, store) = open();
    store.create_task(&task(1, "eslint")).unwrap();
    store.create_task(&task(1, "prettier")).unwrap();

    let loaded = store.get_task(TaskId(1)).unwrap().unwrap();
    assert_eq!(loaded.params.package.as_deref(), Some("eslint"));
}

#[test]
fn terminal_state_is_written_once() {
    let (_dir, store) = open();
    store.create_task(&task(1, "eslint")).unwrap();
    store
        .update_task(TaskId(1), &TaskPatch::running(SystemTime::now()))
        .unwrap();

    let failure = CoreError {
        manager: Some(ManagerId::new("npm")),
        task_id: Some(TaskId(1)),
        action: Some(ManagerAction::Upgrade),
        ..CoreError::new(CoreErrorKind::ProcessFailure, "npm upgrade ended with exit code 1")
    };
    let failed = TaskPatch::terminal(TaskStatus::Failed, SystemTime::now(), Some(failure), true);
    store.update_task(TaskId(1), &failed).unwrap();
    store.update_task(TaskId(1), &failed).unwrap();
    store
        .update_task(
            TaskId(1),
            &TaskPatch::terminal(TaskStatus::Completed, SystemTime::now(), None, false),
        )
        .unwrap();

    let loaded = store.get_task(TaskId(1)).unwrap().unwrap();
    assert_eq!(loaded.status, TaskStatus::Failed);
    assert!(loaded.has_output);
    assert!(loaded.started_at.is_some());
    assert!(loaded.finished_at.is_some());
    let error = loaded.error.unwrap();
    assert_eq!(error.kind, CoreErrorKind::ProcessFailure);
    assert_eq!(error.manager, Some(ManagerId::new("npm")));
    assert_eq!(error.task_id, Some(TaskId(1)));
    assert_eq!(error.action, Some(ManagerAction::Upgrade));
}

#[test]
fn unfinished_recent_and_next_id_queries() {
    let (_dir, store) = open();
    assert_eq!(store.next_task_id().unwrap(), 0);

    for id in 0..4 {
        store.create_task(&task(id, &format!("pkg-{id}"))).unwrap();
    }
    store
        .update_task(
            TaskId(0),
            &TaskPatch::terminal(TaskStatus::Completed, SystemTime::now(), None, false),
        )
        .unwrap();
    store
        .update_task(TaskId(2), &TaskPatch::running(SystemTime::now()))
        .unwrap();

    let unfinished: Vec<TaskId> = store
        .load_unfinished_tasks()
        .unwrap()
        .into_iter()
        .map(|task| task.id)
        .collect();
    assert_eq!(unfinished, vec![TaskId(1), TaskId(2), TaskId(3)]);

    let recent: Vec<TaskId> = store
        .list_recent_tasks(2)
        .unwrap()
        .into_iter()
        .map(|task| task.id)
        .collect();
    assert_eq!(recent, vec![TaskId(3), TaskId(2)]);
    assert_eq!(store.next_task_id().unwrap(), 4);
}

#[test]
fn pruning_only_removes_old_terminal_tasks() {
    let (_dir, store) = open();
    store.create_task(&task(0, "old")).unwrap();
    store.create_task(&task(1, "active")).unwrap();
    let long_ago = SystemTime::now() - Duration::from_secs(90 * 24 * 60 * 60);
    store
        .update_task(
            TaskId(0),
            &TaskPatch::terminal(TaskStatus::Completed, long_ago, None, false),
        )
        .unwrap();

    let cutoff = SystemTime::now() - Duration::from_secs(24 * 60 * 60);
    assert_eq!(store.prune_terminal_tasks(cutoff).unwrap(), 1);
    assert!(store.get_task(TaskId(0)).unwrap().is_none());
    assert!(store.get_task(TaskId(1)).unwrap().is_some());
}

#[test]
fn pins_upsert_and_remove() {
    let (_dir, store) = open();
    let package = PackageRef::new(ManagerId::new("brew"), "postgresql@15");

    store.upsert_pin(&PinRecord::new(package.clone(), None)).unwrap();
    store
        .upsert_pin(&PinRecord::new(package.clone(), Some("15.6".to_string())))
        .unwrap();

    let pins = store.list_pins().unwrap();
    assert_eq!(pins.len(), 1);
    assert_eq!(pins[0].package, package);
    assert_eq!(pins[0].pinned_version.as_deref(), Some("15.6"));

    assert!(store.remove_pin(&package).unwrap());
    assert!(!store.remove_pin(&package).unwrap());
}

#[test]
fn outdated_snapshot_is_replaced_per_manager() {
    let (_dir, store) = open();
    let entry = |manager: &str, name: &str| OutdatedPackage {
        package: PackageRef::new(ManagerId::new(manager), name),
        installed_version: Some("1.0".to_string()),
        candidate_version: "2.0".to_string(),
        pinned: false,
    };

    store
        .replace_outdated(&ManagerId::new("npm"), &[entry("npm", "eslint"), entry("npm", "prettier")])
        .unwrap();
    store
        .replace_outdated(&ManagerId::new("brew"), &[entry("brew", "wget")])
        .unwrap();
    store
        .replace_outdated(&ManagerId::new("npm"), &[entry("npm", "typescript")])
        .unwrap();

    let names: Vec<String> = store
        .list_outdated()
        .unwrap()
        .into_iter()
        .map(|package| package.package.to_string())
        .collect();
    assert_eq!(names, vec!["brew:wget", "npm:typescript"]);
}

#[test]
fn installed_inventory_is_replaced_per_manager() {
    let (_dir, store) = open();
    let entry = |manager: &str, name: &str, version: Option<&str>| InstalledPackage {
        package: PackageRef::new(ManagerId::new(manager), name),
        installed_version: version.map(str::to_string),
        pinned: false,
    };

    store
        .replace_installed(
            &ManagerId::new("cargo"),
            &[entry("cargo", "ripgrep", Some("14.1.0")), entry("cargo", "bat", None)],
        )
        .unwrap();
    store
        .replace_installed(&ManagerId::new("npm"), &[entry("npm", "eslint", Some("8.57.0"))])
        .unwrap();
    store
        .replace_installed(&ManagerId::new("npm"), &[entry("npm", "typescript", Some("5.4.5"))])
        .unwrap();

    assert_eq!(
        store.list_installed().unwrap(),
        vec![
            entry("cargo", "bat", None),
            entry("cargo", "ripgrep", Some("14.1.0")),
            entry("npm", "typescript", Some("5.4.5")),
        ]
    );
}

#[test]
fn preferences_persist_across_reopening() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keel.db");
    {
        let store = SqliteStore::open(&path).unwrap();
        assert!(!store.safe_mode().unwrap());
        assert!(store.list_disabled_managers().unwrap().is_empty());

        store.set_manager_enabled(&ManagerId::new("pipx"), false).unwrap();
        store.set_manager_enabled(&ManagerId::new("npm"), false).unwrap();
        store.set_manager_enabled(&ManagerId::new("npm"), true).unwrap();
        store.set_safe_mode(true).unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(
        store.list_disabled_managers().unwrap(),
        vec![ManagerId::new("pipx")]
    );
    assert!(store.safe_mode().unwrap());
    store.set_safe_mode(false).unwrap();
    assert!(!store.safe_mode().unwrap());
}

#[test]
fn data_survives_reopening() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keel.db");
    {
        let store = SqliteStore::open(&path).unwrap();
        store.create_task(&task(5, "eslint")).unwrap();
    }
    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(store.next_task_id().unwrap(), 6);
}
