use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::adapters::{AdapterCommand, AdapterOutcome, ManagerAdapter};
use crate::execution::{
    ProcessExecutor, ProcessOutput, ProcessSpawnRequest, ProcessTerminationMode, RunningProcess,
    TaskOutputRecord, TaskOutputStore, spawn_validated,
};
use crate::models::{
    ActionParams, ActionSafety, CoreError, CoreErrorKind, ManagerAction, ManagerId, TaskId,
    TaskPatch, TaskRecord, TaskSnapshot, TaskStatus,
};
use crate::orchestration::OrchestrationResult;
use crate::orchestration::lock_manager::{LockTicket, ResourceLockManager};
use crate::orchestration::policy::EnginePolicy;
use crate::persistence::{PackageStore, RetryPolicy, TaskStore, with_retry};
use crate::registry::AdapterRegistry;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MUTATION_TIMEOUT: Duration = Duration::from_secs(1800);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_HISTORY_LIMIT: usize = 256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SchedulerSettings {
    pub read_timeout: Duration,
    pub mutation_timeout: Duration,
    pub grace_period: Duration,
    /// `None` waits for the manager lock indefinitely.
    pub lock_wait_timeout: Option<Duration>,
    pub retry: RetryPolicy,
    /// Terminal tasks kept in memory; older ones are served from the store.
    pub history_limit: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            mutation_timeout: DEFAULT_MUTATION_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            lock_wait_timeout: None,
            retry: RetryPolicy::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl SchedulerSettings {
    fn timeout_for(&self, action: ManagerAction) -> Duration {
        match action.safety() {
            ActionSafety::ReadOnly => self.read_timeout,
            ActionSafety::Mutating => self.mutation_timeout,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub manager: ManagerId,
    pub action: ManagerAction,
    #[serde(default)]
    pub params: ActionParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl TaskRequest {
    pub fn new(manager: ManagerId, action: ManagerAction, params: ActionParams) -> Self {
        Self {
            manager,
            action,
            params,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn display_label(&self) -> String {
        if let Some(label) = &self.label {
            return label.clone();
        }
        let target = self
            .params
            .package
            .as_deref()
            .or(self.params.query.as_deref());
        match target {
            Some(target) => format!("{} {target} ({})", self.action, self.manager),
            None => format!("{} ({})", self.action, self.manager),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskWindow {
    pub limit: usize,
    /// Only `Queued` and `Running` tasks.
    #[serde(default)]
    pub active_only: bool,
}

impl Default for TaskWindow {
    fn default() -> Self {
        Self {
            limit: 50,
            active_only: false,
        }
    }
}

/// Tasks reconciled after a restart.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub failed: Vec<TaskId>,
    pub cancelled: Vec<TaskId>,
    pub next_task_id: u64,
}

pub struct SchedulerParts {
    pub registry: AdapterRegistry,
    pub executor: Arc<dyn ProcessExecutor>,
    pub store: Arc<dyn TaskStore>,
    pub packages: Option<Arc<dyn PackageStore>>,
    pub outputs: Arc<TaskOutputStore>,
    pub locks: ResourceLockManager,
    pub policy: EnginePolicy,
    pub settings: SchedulerSettings,
}

type DedupeKey = (ManagerId, ManagerAction, ActionParams);

struct LiveTask {
    key: DedupeKey,
    cancel_requested: bool,
    process: Option<Arc<dyn RunningProcess>>,
    completion: watch::Sender<TaskStatus>,
}

#[derive(Default)]
struct SchedulerState {
    next_task_id: u64,
    tasks: BTreeMap<TaskId, TaskRecord>,
    live: HashMap<TaskId, LiveTask>,
    inflight: HashMap<DedupeKey, TaskId>,
}

struct SchedulerInner {
    registry: AdapterRegistry,
    executor: Arc<dyn ProcessExecutor>,
    store: Arc<dyn TaskStore>,
    packages: Option<Arc<dyn PackageStore>>,
    outputs: Arc<TaskOutputStore>,
    locks: ResourceLockManager,
    policy: EnginePolicy,
    settings: SchedulerSettings,
    state: Mutex<SchedulerState>,
}

/// Owns task ids and lifecycle state. The only writer of task records.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    /// Call [`TaskScheduler::recover`] before the first submission so the id
    /// counter continues after the persisted history.
    pub fn new(parts: SchedulerParts) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                registry: parts.registry,
                executor: parts.executor,
                store: parts.store,
                packages: parts.packages,
                outputs: parts.outputs,
                locks: parts.locks,
                policy: parts.policy,
                settings: parts.settings,
                state: Mutex::new(SchedulerState::default()),
            }),
        }
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.inner.registry
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    pub fn locks(&self) -> &ResourceLockManager {
        &self.inner.locks
    }

    pub fn policy(&self) -> &EnginePolicy {
        &self.inner.policy
    }

    /// Reconciles tasks left unfinished by a previous process. Nothing from
    /// that lifetime can still be running, so `Running` becomes `Failed` and
    /// `Queued` becomes `Cancelled`.
    pub async fn recover(&self) -> OrchestrationResult<RecoveryReport> {
        let store = self.inner.store.clone();
        let unfinished = with_retry(self.inner.settings.retry, "load_unfinished_tasks", move || {
            store.load_unfinished_tasks()
        })
        .await?;

        let mut report = RecoveryReport::default();
        for task in unfinished {
            if self.inner.state().live.contains_key(&task.id) {
                continue;
            }

            let (status, error) = match task.status {
                TaskStatus::Running => (
                    TaskStatus::Failed,
                    CoreError::new(
                        CoreErrorKind::Internal,
                        "engine restarted while the task was running",
                    ),
                ),
                _ => (
                    TaskStatus::Cancelled,
                    CoreError::new(
                        CoreErrorKind::Cancelled,
                        "engine restarted before the task was admitted",
                    ),
                ),
            };
            let error = error.attribute(&task.manager, Some(task.id), task.action);
            let patch = TaskPatch::terminal(status, SystemTime::now(), Some(error), task.has_output);
            self.inner.persist_patch(task.id, patch).await?;

            tracing::warn!(
                task_id = %task.id,
                manager = %task.manager,
                action = %task.action,
                previous = %task.status,
                reconciled = %status,
                "reconciled task from a previous engine run"
            );
            if status == TaskStatus::Failed {
                report.failed.push(task.id);
            } else {
                report.cancelled.push(task.id);
            }
        }

        let store = self.inner.store.clone();
        let persisted_next = with_retry(self.inner.settings.retry, "next_task_id", move || {
            store.next_task_id()
        })
        .await?;

        let mut state = self.inner.state();
        state.next_task_id = state.next_task_id.max(persisted_next);
        report.next_task_id = state.next_task_id;
        Ok(report)
    }

    /// Records a `Queued` task and schedules it behind its manager lock. An
    /// identical request that is still queued or running yields the existing
    /// task id. Disabled managers are refused before anything is recorded.
    pub async fn submit(&self, request: TaskRequest) -> OrchestrationResult<TaskId> {
        let adapter = self
            .inner
            .registry
            .ensure_supported(&request.manager, request.action)?;
        self.inner
            .policy
            .ensure_enabled(&request.manager, request.action)?;
        let command = adapter
            .build_command(request.action, &request.params)
            .map_err(|error| error.attribute(&request.manager, None, request.action))?;

        let label = request.display_label();
        let key: DedupeKey = (
            request.manager.clone(),
            request.action,
            request.params.clone(),
        );

        let (record, ticket) = {
            let mut state = self.inner.state();
            if let Some(existing) = state.inflight.get(&key).copied() {
                tracing::debug!(
                    task_id = %existing,
                    manager = %request.manager,
                    action = %request.action,
                    "duplicate submission joined in-flight task"
                );
                return Ok(existing);
            }

            let task_id = TaskId(state.next_task_id);
            let ticket = self.inner.locks.enqueue(&request.manager, task_id)?;
            state.next_task_id = state.next_task_id.saturating_add(1);

            let record = TaskRecord::queued(
                task_id,
                request.manager.clone(),
                request.action,
                request.params.clone(),
                label,
            );
            let (completion, _) = watch::channel(TaskStatus::Queued);
            state.tasks.insert(task_id, record.clone());
            state.live.insert(
                task_id,
                LiveTask {
                    key: key.clone(),
                    cancel_requested: false,
                    process: None,
                    completion,
                },
            );
            state.inflight.insert(key, task_id);
            (record, ticket)
        };

        let store = self.inner.store.clone();
        let persisted = record.clone();
        if let Err(error) = with_retry(self.inner.settings.retry, "create_task", move || {
            store.create_task(&persisted)
        })
        .await
        {
            let error = error.attribute(&record.manager, Some(record.id), record.action);
            drop(ticket);
            self.inner.settle(
                record.id,
                TaskPatch::terminal(
                    TaskStatus::Failed,
                    SystemTime::now(),
                    Some(error.clone()),
                    false,
                ),
            );
            return Err(error);
        }

        tracing::info!(
            task_id = %record.id,
            manager = %record.manager,
            action = %record.action,
            label = %record.label,
            "task queued"
        );

        let task_id = record.id;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run_task(record, adapter, command, ticket).await;
        });

        Ok(task_id)
    }

    pub async fn status(&self, task_id: TaskId) -> OrchestrationResult<TaskSnapshot> {
        if let Some(task) = self.inner.state().tasks.get(&task_id).cloned() {
            return Ok(task);
        }

        let store = self.inner.store.clone();
        with_retry(self.inner.settings.retry, "get_task", move || {
            store.get_task(task_id)
        })
        .await?
        .ok_or_else(|| unknown_task(task_id))
    }

    pub async fn cancel(&self, task_id: TaskId) -> OrchestrationResult<bool> {
        self.cancel_with_mode(
            task_id,
            ProcessTerminationMode::Graceful {
                grace_period: self.inner.settings.grace_period,
            },
        )
        .await
    }

    /// A queued task is withdrawn from its lock queue and never spawns. A
    /// running task's process group is signalled; it settles as `Cancelled`
    /// once the process exits. Returns false for tasks already terminal.
    pub async fn cancel_with_mode(
        &self,
        task_id: TaskId,
        mode: ProcessTerminationMode,
    ) -> OrchestrationResult<bool> {
        enum Pending {
            Untracked,
            Settled,
            Queued(ManagerId, TaskPatch),
            Running(Option<Arc<dyn RunningProcess>>),
        }

        let pending = {
            let mut state = self.inner.state();
            match state.tasks.get(&task_id).map(|task| (task.status, task.manager.clone(), task.action)) {
                None => Pending::Untracked,
                Some((TaskStatus::Queued, manager, action)) => {
                    let error = CoreError::new(
                        CoreErrorKind::Cancelled,
                        "cancelled before the task was admitted",
                    )
                    .attribute(&manager, Some(task_id), action);
                    let patch = TaskPatch::terminal(
                        TaskStatus::Cancelled,
                        SystemTime::now(),
                        Some(error),
                        false,
                    );
                    if let Some(task) = state.tasks.get_mut(&task_id) {
                        task.apply(&patch);
                    }
                    clear_inflight(&mut state, task_id);
                    if let Some(live) = state.live.get_mut(&task_id) {
                        live.cancel_requested = true;
                        live.completion.send_replace(TaskStatus::Cancelled);
                    }
                    Pending::Queued(manager, patch)
                }
                Some((TaskStatus::Running, _, _)) => match state.live.get_mut(&task_id) {
                    Some(live) => {
                        live.cancel_requested = true;
                        Pending::Running(live.process.clone())
                    }
                    None => Pending::Settled,
                },
                Some(_) => Pending::Settled,
            }
        };

        match pending {
            // Not owned by this process: terminal, or reconciled on restart.
            Pending::Untracked => {
                self.status(task_id).await?;
                return Ok(false);
            }
            Pending::Settled => return Ok(false),
            Pending::Queued(manager, patch) => {
                self.inner.locks.withdraw(&manager, task_id);
                tracing::info!(task_id = %task_id, manager = %manager, "queued task cancelled");
                if let Err(error) = self.inner.persist_patch(task_id, patch).await {
                    // The worker rewrites the terminal state once it observes
                    // the cancellation.
                    tracing::debug!(task_id = %task_id, error = %error, "deferred cancel write");
                }
            }
            Pending::Running(process) => {
                tracing::info!(task_id = %task_id, "requesting termination of running task");
                if let Some(process) = process
                    && let Err(error) = process.terminate(mode)
                {
                    tracing::warn!(task_id = %task_id, error = %error, "termination request failed");
                }
            }
        }

        Ok(true)
    }

    /// Resolves once the task is terminal. Tasks not owned by this process
    /// are answered from the store immediately.
    pub async fn wait_for_terminal(
        &self,
        task_id: TaskId,
        timeout: Option<Duration>,
    ) -> OrchestrationResult<TaskSnapshot> {
        let completion = self
            .inner
            .state()
            .live
            .get(&task_id)
            .map(|live| live.completion.subscribe());

        if let Some(mut completion) = completion {
            let settled = async move {
                // A closed channel means the task settled and was cleaned up.
                let _ = completion.wait_for(|status| status.is_terminal()).await;
            };
            match timeout {
                Some(limit) => tokio::time::timeout(limit, settled).await.map_err(|_| {
                    CoreError {
                        task_id: Some(task_id),
                        ..CoreError::new(
                            CoreErrorKind::Timeout,
                            format!("timed out waiting for task '{task_id}' to finish"),
                        )
                    }
                })?,
                None => settled.await,
            }
        }

        self.status(task_id).await
    }

    /// Newest first. In-memory state wins over the stored copy.
    pub async fn list_tasks(&self, window: TaskWindow) -> OrchestrationResult<Vec<TaskSnapshot>> {
        let store = self.inner.store.clone();
        let limit = window.limit;
        let stored = with_retry(self.inner.settings.retry, "list_recent_tasks", move || {
            store.list_recent_tasks(limit)
        })
        .await?;

        let mut merged: BTreeMap<TaskId, TaskSnapshot> =
            stored.into_iter().map(|task| (task.id, task)).collect();
        for (task_id, task) in &self.inner.state().tasks {
            merged.insert(*task_id, task.clone());
        }

        Ok(merged
            .into_values()
            .rev()
            .filter(|task| !window.active_only || !task.status.is_terminal())
            .take(window.limit)
            .collect())
    }

    pub fn task_output(&self, task_id: TaskId) -> Option<TaskOutputRecord> {
        self.inner.outputs.get(task_id)
    }

    /// Deletes terminal tasks that finished longer than `retention` ago.
    /// Queued and running tasks are never pruned.
    pub async fn prune(&self, retention: Duration) -> OrchestrationResult<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let store = self.inner.store.clone();
        let pruned = with_retry(self.inner.settings.retry, "prune_terminal_tasks", move || {
            store.prune_terminal_tasks(cutoff)
        })
        .await?;

        let evicted: Vec<TaskId> = {
            let mut state = self.inner.state();
            let evicted: Vec<TaskId> = state
                .tasks
                .values()
                .filter(|task| {
                    task.status.is_terminal()
                        && task.finished_at.unwrap_or(task.created_at) < cutoff
                })
                .map(|task| task.id)
                .collect();
            for task_id in &evicted {
                state.tasks.remove(task_id);
            }
            evicted
        };
        for task_id in evicted {
            self.inner.outputs.remove(task_id);
        }

        tracing::info!(pruned, "pruned terminal tasks");
        Ok(pruned)
    }
}

impl SchedulerInner {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_task(
        self: Arc<Self>,
        record: TaskRecord,
        adapter: Arc<dyn ManagerAdapter>,
        command: AdapterCommand,
        ticket: LockTicket,
    ) {
        let task_id = record.id;
        let manager = record.manager.clone();
        let action = record.action;

        let guard = match ticket.wait(self.settings.lock_wait_timeout).await {
            Ok(guard) => guard,
            Err(error) => {
                let status = if error.kind == CoreErrorKind::Cancelled {
                    TaskStatus::Cancelled
                } else {
                    TaskStatus::Failed
                };
                let error = error.attribute(&manager, Some(task_id), action);
                self.finish(task_id, status, Some(error), false).await;
                return;
            }
        };

        let started_at = SystemTime::now();
        if !self.mark_running(task_id, started_at) {
            // Cancelled between admission and start.
            self.finish(task_id, TaskStatus::Cancelled, None, false).await;
            guard.release();
            return;
        }
        tracing::debug!(task_id = %task_id, manager = %manager, action = %action, "task running");

        if let Err(error) = self.persist_patch(task_id, TaskPatch::running(started_at)).await {
            let error = error.attribute(&manager, Some(task_id), action);
            self.finish(task_id, TaskStatus::Failed, Some(error), false)
                .await;
            guard.release();
            return;
        }

        let (status, error) = self
            .execute(&record, adapter.as_ref(), command)
            .await;
        let has_output = self.outputs.contains(task_id);
        self.finish(task_id, status, error, has_output).await;
        guard.release();
    }

    async fn execute(
        &self,
        record: &TaskRecord,
        adapter: &dyn ManagerAdapter,
        command: AdapterCommand,
    ) -> (TaskStatus, Option<CoreError>) {
        let task_id = record.id;
        let manager = &record.manager;
        let action = record.action;
        let attribute = |error: CoreError| error.attribute(manager, Some(task_id), action);

        let display = command.command.display();
        let timeout = command
            .timeout
            .unwrap_or_else(|| self.settings.timeout_for(action));
        let request = ProcessSpawnRequest::new(manager.clone(), action, command.command)
            .task_id(task_id)
            .requires_elevation(command.requires_elevation)
            .timeout(timeout);

        let process: Arc<dyn RunningProcess> =
            match spawn_validated(self.executor.as_ref(), request) {
                Ok(process) => Arc::from(process),
                Err(error) => {
                    tracing::warn!(task_id = %task_id, manager = %manager, error = %error, "spawn failed");
                    return (TaskStatus::Failed, Some(attribute(error)));
                }
            };

        let cancel_before_register = {
            let mut state = self.state();
            match state.live.get_mut(&task_id) {
                Some(live) => {
                    live.process = Some(process.clone());
                    live.cancel_requested
                }
                None => false,
            }
        };
        if cancel_before_register
            && let Err(error) = process.terminate_gracefully(self.settings.grace_period)
        {
            tracing::warn!(task_id = %task_id, error = %error, "termination request failed");
        }

        let waited = process.wait().await;
        if self.cancel_requested(task_id) {
            let error = CoreError::new(CoreErrorKind::Cancelled, "cancelled while running");
            if let Ok(output) = &waited {
                self.record_output(task_id, &display, output);
            }
            return (TaskStatus::Cancelled, Some(attribute(error)));
        }

        let output = match waited {
            Ok(output) => output,
            Err(error) => {
                tracing::warn!(task_id = %task_id, manager = %manager, error = %error, "process did not complete");
                return (TaskStatus::Failed, Some(attribute(error)));
            }
        };
        self.record_output(task_id, &display, &output);

        match adapter.interpret(action, &record.params, &output) {
            Ok(AdapterOutcome::Completed) => (TaskStatus::Completed, None),
            Ok(AdapterOutcome::Outdated(packages)) => {
                let Some(store) = self.packages.clone() else {
                    return (TaskStatus::Completed, None);
                };
                let count = packages.len();
                let owner = manager.clone();
                match with_retry(self.settings.retry, "replace_outdated", move || {
                    store.replace_outdated(&owner, &packages)
                })
                .await
                {
                    Ok(()) => {
                        tracing::info!(manager = %manager, outdated = count, "outdated snapshot refreshed");
                        (TaskStatus::Completed, None)
                    }
                    Err(error) => (TaskStatus::Failed, Some(attribute(error))),
                }
            }
            Ok(AdapterOutcome::Installed(packages)) => {
                let Some(store) = self.packages.clone() else {
                    return (TaskStatus::Completed, None);
                };
                let count = packages.len();
                let owner = manager.clone();
                match with_retry(self.settings.retry, "replace_installed", move || {
                    store.replace_installed(&owner, &packages)
                })
                .await
                {
                    Ok(()) => {
                        tracing::info!(manager = %manager, installed = count, "installed inventory refreshed");
                        (TaskStatus::Completed, None)
                    }
                    Err(error) => (TaskStatus::Failed, Some(attribute(error))),
                }
            }
            Err(error) => {
                tracing::warn!(task_id = %task_id, manager = %manager, error = %error, "task failed");
                (TaskStatus::Failed, Some(attribute(error)))
            }
        }
    }

    fn record_output(&self, task_id: TaskId, display: &str, output: &ProcessOutput) {
        if !self.outputs.contains(task_id) {
            self.outputs.record(
                task_id,
                Some(display.to_string()),
                &output.stdout,
                &output.stderr,
            );
        }
    }

    fn mark_running(&self, task_id: TaskId, started_at: SystemTime) -> bool {
        let mut state = self.state();
        let running = match state.tasks.get_mut(&task_id) {
            Some(task) if task.status == TaskStatus::Queued => {
                task.apply(&TaskPatch::running(started_at))
            }
            _ => false,
        };
        if running && let Some(live) = state.live.get(&task_id) {
            live.completion.send_replace(TaskStatus::Running);
        }
        running
    }

    fn cancel_requested(&self, task_id: TaskId) -> bool {
        self.state()
            .live
            .get(&task_id)
            .is_some_and(|live| live.cancel_requested)
    }

    /// Terminal transition: memory first, then the store, then waiters. The
    /// caller releases the manager lock afterwards.
    async fn finish(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        error: Option<CoreError>,
        has_output: bool,
    ) {
        let patch = TaskPatch::terminal(status, SystemTime::now(), error, has_output);
        let settled = self.apply_in_memory(task_id, &patch);

        if let Err(error) = self.persist_patch(task_id, settled.clone()).await {
            tracing::error!(task_id = %task_id, error = %error, "failed to persist terminal task state");
        }

        self.settle(task_id, settled);
    }

    /// Applies `patch` unless the task is already terminal, and returns the
    /// patch describing the task's actual terminal state.
    fn apply_in_memory(&self, task_id: TaskId, patch: &TaskPatch) -> TaskPatch {
        let mut state = self.state();
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return patch.clone();
        };
        task.apply(patch);
        tracing::debug!(task_id = %task_id, status = %task.status, "task settled");
        TaskPatch::terminal(
            task.status,
            task.finished_at.unwrap_or_else(SystemTime::now),
            task.error.clone(),
            task.has_output,
        )
    }

    /// Drops live bookkeeping and wakes waiters.
    fn settle(&self, task_id: TaskId, patch: TaskPatch) {
        let mut state = self.state();
        if let Some(task) = state.tasks.get_mut(&task_id) {
            task.apply(&patch);
        }
        let status = state
            .tasks
            .get(&task_id)
            .map(|task| task.status)
            .unwrap_or(TaskStatus::Failed);

        clear_inflight(&mut state, task_id);
        if let Some(live) = state.live.remove(&task_id) {
            live.completion.send_replace(status);
        }
        trim_history(&mut state, self.settings.history_limit);
    }

    async fn persist_patch(&self, task_id: TaskId, patch: TaskPatch) -> OrchestrationResult<()> {
        let store = self.store.clone();
        with_retry(self.settings.retry, "update_task", move || {
            store.update_task(task_id, &patch)
        })
        .await
    }
}

fn clear_inflight(state: &mut SchedulerState, task_id: TaskId) {
    let Some(key) = state.live.get(&task_id).map(|live| live.key.clone()) else {
        return;
    };
    if state.inflight.get(&key) == Some(&task_id) {
        state.inflight.remove(&key);
    }
}

fn trim_history(state: &mut SchedulerState, limit: usize) {
    let terminal: Vec<TaskId> = state
        .tasks
        .values()
        .filter(|task| task.status.is_terminal())
        .map(|task| task.id)
        .collect();
    if terminal.len() <= limit {
        return;
    }
    let excess = terminal.len() - limit;
    for task_id in terminal.into_iter().take(excess) {
        state.tasks.remove(&task_id);
    }
}

fn unknown_task(task_id: TaskId) -> CoreError {
    CoreError {
        task_id: Some(task_id),
        ..CoreError::new(
            CoreErrorKind::InvalidInput,
            format!("unknown task id '{task_id}'"),
        )
    }
}
