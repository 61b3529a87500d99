use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use crate::models::{
    CoreError, CoreErrorKind, InstalledPackage, ManagerId, OutdatedPackage, PackageRef, PinRecord,
    TaskId, TaskPatch, TaskRecord,
};
use crate::persistence::{PackageStore, PersistenceResult, PinStore, PreferenceStore, TaskStore};

#[derive(Default)]
struct MemoryState {
    tasks: BTreeMap<TaskId, TaskRecord>,
    pins: BTreeMap<PackageRef, PinRecord>,
    outdated: BTreeMap<ManagerId, Vec<OutdatedPackage>>,
    installed: BTreeMap<ManagerId, Vec<InstalledPackage>>,
    disabled: BTreeSet<ManagerId>,
    safe_mode: bool,
    pending_write_failures: u32,
}

/// Store that lives only as long as the process. Used for ephemeral runs and
/// tests; same write semantics as the SQLite store.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` writes fail with `PersistenceTransient`.
    pub fn fail_next_writes(&self, count: u32) {
        self.state().pending_write_failures = count;
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn writable(&self, operation: &str) -> PersistenceResult<MutexGuard<'_, MemoryState>> {
        let mut state = self.state();
        if state.pending_write_failures > 0 {
            state.pending_write_failures -= 1;
            return Err(CoreError::new(
                CoreErrorKind::PersistenceTransient,
                format!("in-memory store '{operation}' is temporarily unavailable"),
            ));
        }
        Ok(state)
    }
}

impl TaskStore for InMemoryStore {
    fn create_task(&self, task: &TaskRecord) -> PersistenceResult<()> {
        self.writable("create_task")?
            .tasks
            .entry(task.id)
            .or_insert_with(|| task.clone());
        Ok(())
    }

    fn update_task(&self, task_id: TaskId, patch: &TaskPatch) -> PersistenceResult<()> {
        let mut state = self.writable("update_task")?;
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Err(CoreError {
                task_id: Some(task_id),
                ..CoreError::new(
                    CoreErrorKind::StorageFailure,
                    "task id was not found for update",
                )
            });
        };
        task.apply(patch);
        Ok(())
    }

    fn get_task(&self, task_id: TaskId) -> PersistenceResult<Option<TaskRecord>> {
        Ok(self.state().tasks.get(&task_id).cloned())
    }

    fn load_unfinished_tasks(&self) -> PersistenceResult<Vec<TaskRecord>> {
        Ok(self
            .state()
            .tasks
            .values()
            .filter(|task| !task.status.is_terminal())
            .cloned()
            .collect())
    }

    fn list_recent_tasks(&self, limit: usize) -> PersistenceResult<Vec<TaskRecord>> {
        Ok(self
            .state()
            .tasks
            .values()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    fn next_task_id(&self) -> PersistenceResult<u64> {
        Ok(self
            .state()
            .tasks
            .keys()
            .next_back()
            .map(|id| id.0.saturating_add(1))
            .unwrap_or(0))
    }

    fn prune_terminal_tasks(&self, finished_before: SystemTime) -> PersistenceResult<usize> {
        let mut state = self.writable("prune_terminal_tasks")?;
        let before = state.tasks.len();
        state.tasks.retain(|_, task| {
            !(task.status.is_terminal()
                && task.finished_at.unwrap_or(task.created_at) < finished_before)
        });
        Ok(before - state.tasks.len())
    }
}

impl PinStore for InMemoryStore {
    fn upsert_pin(&self, pin: &PinRecord) -> PersistenceResult<()> {
        self.writable("upsert_pin")?
            .pins
            .insert(pin.package.clone(), pin.clone());
        Ok(())
    }

    fn remove_pin(&self, package: &PackageRef) -> PersistenceResult<bool> {
        Ok(self.writable("remove_pin")?.pins.remove(package).is_some())
    }

    fn list_pins(&self) -> PersistenceResult<Vec<PinRecord>> {
        Ok(self.state().pins.values().cloned().collect())
    }
}

impl PackageStore for InMemoryStore {
    fn replace_outdated(
        &self,
        manager: &ManagerId,
        packages: &[OutdatedPackage],
    ) -> PersistenceResult<()> {
        self.writable("replace_outdated")?
            .outdated
            .insert(manager.clone(), packages.to_vec());
        Ok(())
    }

    fn list_outdated(&self) -> PersistenceResult<Vec<OutdatedPackage>> {
        Ok(self.state().outdated.values().flatten().cloned().collect())
    }

    fn replace_installed(
        &self,
        manager: &ManagerId,
        packages: &[InstalledPackage],
    ) -> PersistenceResult<()> {
        let mut packages = packages.to_vec();
        packages.sort_by(|left, right| left.package.name.cmp(&right.package.name));
        packages.dedup_by(|left, right| left.package == right.package);
        self.writable("replace_installed")?
            .installed
            .insert(manager.clone(), packages);
        Ok(())
    }

    fn list_installed(&self) -> PersistenceResult<Vec<InstalledPackage>> {
        Ok(self.state().installed.values().flatten().cloned().collect())
    }
}

impl PreferenceStore for InMemoryStore {
    fn set_manager_enabled(&self, manager: &ManagerId, enabled: bool) -> PersistenceResult<()> {
        let mut state = self.writable("set_manager_enabled")?;
        if enabled {
            state.disabled.remove(manager);
        } else {
            state.disabled.insert(manager.clone());
        }
        Ok(())
    }

    fn list_disabled_managers(&self) -> PersistenceResult<Vec<ManagerId>> {
        Ok(self.state().disabled.iter().cloned().collect())
    }

    fn set_safe_mode(&self, enabled: bool) -> PersistenceResult<()> {
        self.writable("set_safe_mode")?.safe_mode = enabled;
        Ok(())
    }

    fn safe_mode(&self) -> PersistenceResult<bool> {
        Ok(self.state().safe_mode)
    }
}
