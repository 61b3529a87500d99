pub mod memory;
pub mod retry;

use std::time::SystemTime;

use crate::models::{
    CoreError, InstalledPackage, ManagerId, OutdatedPackage, PackageRef, PinRecord, TaskId,
    TaskPatch, TaskRecord,
};

pub use memory::InMemoryStore;
pub use retry::{RetryPolicy, with_retry};

pub type PersistenceResult<T> = Result<T, CoreError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

/// Durable task records. Writes are idempotent: creating an existing id is a
/// no-op, and no patch can move a task out of a terminal state.
pub trait TaskStore: Send + Sync {
    fn create_task(&self, task: &TaskRecord) -> PersistenceResult<()>;

    fn update_task(&self, task_id: TaskId, patch: &TaskPatch) -> PersistenceResult<()>;

    fn get_task(&self, task_id: TaskId) -> PersistenceResult<Option<TaskRecord>>;

    /// Tasks still `Queued` or `Running`, oldest first.
    fn load_unfinished_tasks(&self) -> PersistenceResult<Vec<TaskRecord>>;

    /// Newest first.
    fn list_recent_tasks(&self, limit: usize) -> PersistenceResult<Vec<TaskRecord>>;

    fn next_task_id(&self) -> PersistenceResult<u64>;

    /// Deletes terminal tasks that finished before `finished_before`.
    fn prune_terminal_tasks(&self, finished_before: SystemTime) -> PersistenceResult<usize>;
}

pub trait PinStore: Send + Sync {
    fn upsert_pin(&self, pin: &PinRecord) -> PersistenceResult<()>;

    fn remove_pin(&self, package: &PackageRef) -> PersistenceResult<bool>;

    fn list_pins(&self) -> PersistenceResult<Vec<PinRecord>>;
}

pub trait PackageStore: Send + Sync {
    /// Replaces everything known to be outdated for `manager`.
    fn replace_outdated(
        &self,
        manager: &ManagerId,
        packages: &[OutdatedPackage],
    ) -> PersistenceResult<()>;

    fn list_outdated(&self) -> PersistenceResult<Vec<OutdatedPackage>>;

    /// Replaces the installed inventory recorded for `manager`.
    fn replace_installed(
        &self,
        manager: &ManagerId,
        packages: &[InstalledPackage],
    ) -> PersistenceResult<()>;

    fn list_installed(&self) -> PersistenceResult<Vec<InstalledPackage>>;
}

/// Operator preferences that survive restarts. Managers are enabled unless
/// recorded otherwise; safe mode is off by default.
pub trait PreferenceStore: Send + Sync {
    fn set_manager_enabled(&self, manager: &ManagerId, enabled: bool) -> PersistenceResult<()>;

    fn list_disabled_managers(&self) -> PersistenceResult<Vec<ManagerId>>;

    fn set_safe_mode(&self, enabled: bool) -> PersistenceResult<()>;

    fn safe_mode(&self) -> PersistenceResult<bool>;
}
