use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::execution::{ProcessExecutor, TaskOutputRecord, TaskOutputStore, TokioProcessExecutor};
use crate::models::{
    ActionParams, CoreError, CoreErrorKind, InstalledPackage, ManagerAction, ManagerDescriptor,
    ManagerId, OutdatedPackage, PackageRef, PinRecord, TaskId, TaskSnapshot,
};
use crate::orchestration::{
    AuthorityPhaseRunner, EnginePolicy, OrchestrationResult, OrderedRun, PlanExecution,
    PlanScope, RecoveryReport, ResourceLockManager, SchedulerParts, SchedulerSettings,
    TaskRequest, TaskScheduler, TaskWindow, UpgradePlan, UpgradePlanner,
};
use crate::persistence::{
    InMemoryStore, PackageStore, PinStore, PreferenceStore, RetryPolicy, TaskStore, with_retry,
};
use crate::registry::AdapterRegistry;
use crate::sqlite::SqliteStore;

/// Everything the engine is assembled from. Tests build this by hand with
/// fake executors and in-memory stores.
pub struct EngineParts {
    pub registry: AdapterRegistry,
    pub executor: Arc<dyn ProcessExecutor>,
    pub tasks: Arc<dyn TaskStore>,
    pub pins: Arc<dyn PinStore>,
    pub packages: Arc<dyn PackageStore>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub outputs: Arc<TaskOutputStore>,
    pub settings: SchedulerSettings,
}

impl EngineParts {
    /// Parts sharing one in-memory store.
    pub fn in_memory(registry: AdapterRegistry, executor: Arc<dyn ProcessExecutor>) -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self {
            registry,
            executor,
            tasks: store.clone(),
            pins: store.clone(),
            packages: store.clone(),
            preferences: store,
            outputs: Arc::new(TaskOutputStore::default()),
            settings: SchedulerSettings::default(),
        }
    }
}

/// The caller-facing surface. Owns every stateful component; there are no
/// process-wide singletons.
pub struct Engine {
    scheduler: TaskScheduler,
    runner: AuthorityPhaseRunner,
    planner: UpgradePlanner,
    pins: Arc<dyn PinStore>,
    packages: Arc<dyn PackageStore>,
    preferences: Arc<dyn PreferenceStore>,
    retry: RetryPolicy,
    recovery: RecoveryReport,
}

impl Engine {
    /// Construction order: store and migrations, registry, output store,
    /// executor, scheduler (plus restart recovery), phase runner, planner.
    pub async fn open(config: &EngineConfig) -> OrchestrationResult<Self> {
        let registry = if config.managers.is_empty() {
            AdapterRegistry::builtin()?
        } else {
            AdapterRegistry::from_templates(config.managers.iter().cloned())?
        };

        let outputs = Arc::new(TaskOutputStore::new(config.execution.output_records));
        let executor: Arc<dyn ProcessExecutor> = Arc::new(
            TokioProcessExecutor::new(config.executor_settings()).with_output_store(outputs.clone()),
        );

        let parts = if config.ephemeral {
            EngineParts {
                outputs,
                settings: config.scheduler_settings(),
                ..EngineParts::in_memory(registry, executor)
            }
        } else {
            let path = config.database_path();
            let store = tokio::task::spawn_blocking(move || SqliteStore::open(path))
                .await
                .map_err(|error| {
                    CoreError::new(
                        CoreErrorKind::Internal,
                        format!("store initialization worker failed: {error}"),
                    )
                })??;
            let store = Arc::new(store);
            tracing::info!(path = %store.database_path().display(), "task store opened");
            EngineParts {
                registry,
                executor,
                tasks: store.clone(),
                pins: store.clone(),
                packages: store.clone(),
                preferences: store,
                outputs,
                settings: config.scheduler_settings(),
            }
        };

        Self::start(parts).await
    }

    pub async fn start(parts: EngineParts) -> OrchestrationResult<Self> {
        let retry = parts.settings.retry;
        let policy = load_policy(&parts.preferences, retry).await?;
        let scheduler = TaskScheduler::new(SchedulerParts {
            registry: parts.registry,
            executor: parts.executor,
            store: parts.tasks,
            packages: Some(parts.packages.clone()),
            outputs: parts.outputs,
            locks: ResourceLockManager::new(),
            policy,
            settings: parts.settings,
        });
        let recovery = scheduler.recover().await?;
        if !recovery.failed.is_empty() || !recovery.cancelled.is_empty() {
            tracing::warn!(
                failed = recovery.failed.len(),
                cancelled = recovery.cancelled.len(),
                "reconciled tasks left unfinished by a previous run"
            );
        }

        let runner = AuthorityPhaseRunner::new(scheduler.clone());
        let planner = UpgradePlanner::new(runner.clone(), parts.packages.clone(), parts.pins.clone());

        tracing::info!(
            managers = scheduler.registry().len(),
            disabled = scheduler.policy().disabled_managers().len(),
            safe_mode = scheduler.policy().safe_mode(),
            next_task_id = recovery.next_task_id,
            "engine started"
        );
        Ok(Self {
            scheduler,
            runner,
            planner,
            pins: parts.pins,
            packages: parts.packages,
            preferences: parts.preferences,
            retry,
            recovery,
        })
    }

    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn managers(&self) -> Vec<ManagerDescriptor> {
        self.scheduler.registry().descriptors()
    }

    pub async fn submit_task(
        &self,
        manager: ManagerId,
        action: ManagerAction,
        params: ActionParams,
    ) -> OrchestrationResult<TaskId> {
        self.submit(TaskRequest::new(manager, action, params)).await
    }

    pub async fn submit(&self, request: TaskRequest) -> OrchestrationResult<TaskId> {
        self.scheduler.submit(request).await
    }

    pub async fn cancel_task(&self, task_id: TaskId) -> OrchestrationResult<bool> {
        self.scheduler.cancel(task_id).await
    }

    pub async fn task_status(&self, task_id: TaskId) -> OrchestrationResult<TaskSnapshot> {
        self.scheduler.status(task_id).await
    }

    pub async fn wait_for_task(
        &self,
        task_id: TaskId,
        timeout: Option<Duration>,
    ) -> OrchestrationResult<TaskSnapshot> {
        self.scheduler.wait_for_terminal(task_id, timeout).await
    }

    pub async fn list_tasks(&self, window: TaskWindow) -> OrchestrationResult<Vec<TaskSnapshot>> {
        self.scheduler.list_tasks(window).await
    }

    pub fn get_task_output(&self, task_id: TaskId) -> Option<TaskOutputRecord> {
        self.scheduler.task_output(task_id)
    }

    pub async fn preview_plan(
        &self,
        include_pinned: bool,
        allow_guarded: bool,
    ) -> OrchestrationResult<UpgradePlan> {
        self.planner.preview(include_pinned, allow_guarded).await
    }

    pub async fn run_plan(
        &self,
        plan: &UpgradePlan,
        scope: Option<&PlanScope>,
    ) -> OrchestrationResult<PlanExecution> {
        self.planner.run(plan, scope).await
    }

    pub async fn retry_failed(&self, plan: &UpgradePlan) -> OrchestrationResult<PlanExecution> {
        self.planner.retry_failed(plan).await
    }

    pub async fn project_plan(&self, plan: &UpgradePlan) -> OrchestrationResult<UpgradePlan> {
        self.planner.project(plan).await
    }

    /// Runs `list_installed` and `list_outdated` on every enabled manager
    /// that supports them, in authority order. Each completed task replaces
    /// that manager's installed inventory or outdated snapshot.
    pub fn refresh_all(&self) -> OrchestrationResult<OrderedRun> {
        let policy = self.scheduler.policy();
        let mut requests = Vec::new();
        for descriptor in self.scheduler.registry().descriptors() {
            if !policy.is_manager_enabled(&descriptor.id) {
                tracing::debug!(manager = %descriptor.id, "skipping disabled manager during refresh");
                continue;
            }
            for action in [ManagerAction::ListInstalled, ManagerAction::ListOutdated] {
                if descriptor.capabilities.supports(action) {
                    requests.push(TaskRequest::new(
                        descriptor.id.clone(),
                        action,
                        ActionParams::default(),
                    ));
                }
            }
        }
        self.runner.run_ordered(requests)
    }

    /// Disabled managers refuse new tasks and drop out of refreshes and
    /// plans. Tasks already queued or running are left alone.
    pub async fn set_manager_enabled(
        &self,
        manager: ManagerId,
        enabled: bool,
    ) -> OrchestrationResult<()> {
        self.scheduler.registry().adapter(&manager)?;
        let store = self.preferences.clone();
        let target = manager.clone();
        with_retry(self.retry, "set_manager_enabled", move || {
            store.set_manager_enabled(&target, enabled)
        })
        .await?;
        self.scheduler.policy().set_manager_enabled(&manager, enabled);
        tracing::info!(manager = %manager, enabled, "manager preference changed");
        Ok(())
    }

    pub fn is_manager_enabled(&self, manager: &ManagerId) -> bool {
        self.scheduler.policy().is_manager_enabled(manager)
    }

    pub fn disabled_managers(&self) -> Vec<ManagerId> {
        self.scheduler.policy().disabled_managers()
    }

    /// While on, Guarded upgrades are never planned or run, whatever the
    /// plan allows.
    pub async fn set_safe_mode(&self, enabled: bool) -> OrchestrationResult<()> {
        let store = self.preferences.clone();
        with_retry(self.retry, "set_safe_mode", move || store.set_safe_mode(enabled)).await?;
        self.scheduler.policy().set_safe_mode(enabled);
        tracing::info!(enabled, "safe mode changed");
        Ok(())
    }

    pub fn safe_mode(&self) -> bool {
        self.scheduler.policy().safe_mode()
    }

    pub async fn list_installed(&self) -> OrchestrationResult<Vec<InstalledPackage>> {
        let store = self.packages.clone();
        with_retry(self.retry, "list_installed", move || store.list_installed()).await
    }

    pub async fn pin_package(
        &self,
        package: PackageRef,
        version: Option<String>,
    ) -> OrchestrationResult<PinRecord> {
        self.scheduler.registry().adapter(&package.manager)?;
        let pin = PinRecord::new(package, version);
        let pins = self.pins.clone();
        let record = pin.clone();
        with_retry(self.retry, "upsert_pin", move || pins.upsert_pin(&record)).await?;
        tracing::info!(package = %pin.package, "package pinned");
        Ok(pin)
    }

    pub async fn unpin_package(&self, package: PackageRef) -> OrchestrationResult<bool> {
        let pins = self.pins.clone();
        let target = package.clone();
        let removed = with_retry(self.retry, "remove_pin", move || pins.remove_pin(&target)).await?;
        if removed {
            tracing::info!(package = %package, "package unpinned");
        }
        Ok(removed)
    }

    pub async fn list_pins(&self) -> OrchestrationResult<Vec<PinRecord>> {
        let pins = self.pins.clone();
        with_retry(self.retry, "list_pins", move || pins.list_pins()).await
    }

    /// Supplies outdated data gathered outside the engine.
    pub async fn record_outdated(
        &self,
        manager: ManagerId,
        packages: Vec<OutdatedPackage>,
    ) -> OrchestrationResult<()> {
        self.scheduler.registry().adapter(&manager)?;
        if let Some(stray) = packages.iter().find(|package| package.package.manager != manager) {
            return Err(CoreError {
                manager: Some(manager.clone()),
                ..CoreError::new(
                    CoreErrorKind::InvalidInput,
                    format!("package '{}' does not belong to manager '{manager}'", stray.package),
                )
            });
        }
        let store = self.packages.clone();
        with_retry(self.retry, "replace_outdated", move || {
            store.replace_outdated(&manager, &packages)
        })
        .await
    }

    pub async fn list_outdated(&self) -> OrchestrationResult<Vec<OutdatedPackage>> {
        let store = self.packages.clone();
        with_retry(self.retry, "list_outdated", move || store.list_outdated()).await
    }

    pub async fn prune_tasks(&self, retention: Duration) -> OrchestrationResult<usize> {
        self.scheduler.prune(retention).await
    }
}

async fn load_policy(
    preferences: &Arc<dyn PreferenceStore>,
    retry: RetryPolicy,
) -> OrchestrationResult<EnginePolicy> {
    let store = preferences.clone();
    let disabled = with_retry(retry, "list_disabled_managers", move || {
        store.list_disabled_managers()
    })
    .await?;
    let store = preferences.clone();
    let safe_mode = with_retry(retry, "safe_mode", move || store.safe_mode()).await?;
    Ok(EnginePolicy::new(disabled, safe_mode))
}
