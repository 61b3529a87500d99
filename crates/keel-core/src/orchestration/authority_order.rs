use std::future::pending;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::models::{AuthorityClass, CoreError, CoreErrorKind, TaskId, TaskStatus};
use crate::orchestration::OrchestrationResult;
use crate::orchestration::scheduler::{TaskRequest, TaskScheduler};

/// Groups items into execution phases by authority class.
///
/// Phases come back in order: Authoritative, Standard, Guarded. Empty phases
/// are omitted and items keep their relative order within a phase.
pub fn authority_phases<T>(
    items: impl IntoIterator<Item = (AuthorityClass, T)>,
) -> Vec<(AuthorityClass, Vec<T>)> {
    let mut phases: Vec<(AuthorityClass, Vec<T>)> = AuthorityClass::PHASE_ORDER
        .into_iter()
        .map(|authority| (authority, Vec::new()))
        .collect();

    for (authority, item) in items {
        if let Some((_, members)) = phases.iter_mut().find(|(class, _)| *class == authority) {
            members.push(item);
        }
    }

    phases.retain(|(_, members)| !members.is_empty());
    phases
}

/// Called for every task as soon as the runner has submitted it.
pub type SubmitObserver = Arc<dyn Fn(&TaskRequest, TaskId) + Send + Sync>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "authority", rename_all = "snake_case")]
pub enum PhaseState {
    Pending,
    Running(AuthorityClass),
    Completed,
    Cancelled,
}

impl PhaseState {
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PhaseTaskOutcome {
    pub request: TaskRequest,
    /// `None` when the submission itself was refused.
    pub task_id: Option<TaskId>,
    pub status: TaskStatus,
    pub error: Option<CoreError>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub authority: AuthorityClass,
    pub tasks: Vec<PhaseTaskOutcome>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub state: PhaseState,
    pub phases: Vec<PhaseReport>,
    /// Phases never started because the run was cancelled first.
    pub skipped: Vec<AuthorityClass>,
}

impl RunProgress {
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.phases
            .iter()
            .flat_map(|phase| phase.tasks.iter().filter_map(|task| task.task_id))
            .collect()
    }
}

pub type OrderedRunReport = RunProgress;

impl OrderedRunReport {
    pub fn cancelled(&self) -> bool {
        self.state == PhaseState::Cancelled
    }

    pub fn failed(&self) -> impl Iterator<Item = &PhaseTaskOutcome> {
        self.phases
            .iter()
            .flat_map(|phase| phase.tasks.iter())
            .filter(|task| task.status == TaskStatus::Failed)
    }
}

/// Handle to a bulk run driven in the background. Dropping it does not stop
/// the run.
pub struct OrderedRun {
    progress: Arc<Mutex<RunProgress>>,
    state: watch::Receiver<PhaseState>,
    cancel: watch::Sender<bool>,
    driver: JoinHandle<()>,
}

impl OrderedRun {
    pub fn progress(&self) -> RunProgress {
        lock_progress(&self.progress).clone()
    }

    /// Follows the run's phase state as it changes.
    pub fn state(&self) -> watch::Receiver<PhaseState> {
        self.state.clone()
    }

    /// Resolves once the run has settled, without consuming the handle.
    pub async fn finished(&self) {
        let mut state = self.state.clone();
        // A dropped sender means the driver is gone; `wait` reports why.
        let _ = state.wait_for(PhaseState::is_settled).await;
    }

    /// Stops further phases and cancels the current phase's tasks. Earlier
    /// phases are left as they are.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub async fn wait(self) -> OrchestrationResult<OrderedRunReport> {
        self.driver.await.map_err(|error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("ordered run driver failed: {error}"),
            )
        })?;
        Ok(lock_progress(&self.progress).clone())
    }
}

#[derive(Clone)]
pub struct AuthorityPhaseRunner {
    scheduler: TaskScheduler,
}

impl AuthorityPhaseRunner {
    pub fn new(scheduler: TaskScheduler) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn run_ordered(&self, tasks: Vec<TaskRequest>) -> OrchestrationResult<OrderedRun> {
        self.run_ordered_with_observer(tasks, Arc::new(|_: &TaskRequest, _: TaskId| {}))
    }

    /// Runs phases strictly in authority order. Every task of a phase is
    /// submitted at once; the next phase starts only when all of them are
    /// terminal, whatever their outcome.
    pub fn run_ordered_with_observer(
        &self,
        tasks: Vec<TaskRequest>,
        observer: SubmitObserver,
    ) -> OrchestrationResult<OrderedRun> {
        let mut classified = Vec::with_capacity(tasks.len());
        for request in tasks {
            let adapter = self.scheduler.registry().adapter(&request.manager)?;
            classified.push((adapter.authority(), request));
        }
        let phases = authority_phases(classified);

        let progress = Arc::new(Mutex::new(RunProgress {
            state: PhaseState::Pending,
            phases: Vec::new(),
            skipped: Vec::new(),
        }));
        let (cancel, cancel_rx) = watch::channel(false);
        let (state_tx, state) = watch::channel(PhaseState::Pending);

        let driver = tokio::spawn(drive_phases(
            self.scheduler.clone(),
            phases,
            RunState {
                progress: progress.clone(),
                state: state_tx,
            },
            cancel_rx,
            observer,
        ));

        Ok(OrderedRun {
            progress,
            state,
            cancel,
            driver,
        })
    }
}

/// Progress snapshot plus the published phase state. The snapshot is updated
/// before the state is announced.
struct RunState {
    progress: Arc<Mutex<RunProgress>>,
    state: watch::Sender<PhaseState>,
}

impl RunState {
    fn publish(&self, state: PhaseState) {
        lock_progress(&self.progress).state = state;
        self.state.send_replace(state);
    }
}

async fn drive_phases(
    scheduler: TaskScheduler,
    phases: Vec<(AuthorityClass, Vec<TaskRequest>)>,
    run: RunState,
    mut cancel_rx: watch::Receiver<bool>,
    observer: SubmitObserver,
) {
    let progress = &run.progress;
    let mut remaining = phases.into_iter();
    // Set only when cancellation stopped a phase or kept one from starting.
    let mut interrupted = false;

    while let Some((authority, requests)) = remaining.next() {
        if *cancel_rx.borrow() {
            let mut progress = lock_progress(progress);
            progress.skipped.push(authority);
            progress
                .skipped
                .extend(remaining.by_ref().map(|(authority, _)| authority));
            interrupted = true;
            break;
        }

        tracing::info!(phase = %authority, tasks = requests.len(), "starting authority phase");
        run.publish(PhaseState::Running(authority));

        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            match scheduler.submit(request.clone()).await {
                Ok(task_id) => {
                    observer(&request, task_id);
                    outcomes.push(PhaseTaskOutcome {
                        request,
                        task_id: Some(task_id),
                        status: TaskStatus::Queued,
                        error: None,
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        phase = %authority,
                        manager = %request.manager,
                        error = %error,
                        "phase task was not submitted"
                    );
                    outcomes.push(PhaseTaskOutcome {
                        request,
                        task_id: None,
                        status: TaskStatus::Failed,
                        error: Some(error),
                    });
                }
            }
        }
        let phase_index = {
            let mut progress = lock_progress(progress);
            progress.phases.push(PhaseReport {
                authority,
                tasks: outcomes.clone(),
            });
            progress.phases.len() - 1
        };

        let task_ids: Vec<TaskId> = outcomes.iter().filter_map(|task| task.task_id).collect();
        let barrier = phase_barrier(&scheduler, &task_ids);
        tokio::pin!(barrier);

        tokio::select! {
            biased;
            () = &mut barrier => {}
            () = cancellation(&mut cancel_rx) => {
                interrupted = true;
                tracing::info!(phase = %authority, "cancelling authority phase");
                for task_id in &task_ids {
                    if let Err(error) = scheduler.cancel(*task_id).await {
                        tracing::warn!(task_id = %task_id, error = %error, "phase task cancel failed");
                    }
                }
                barrier.await;
            }
        }

        for outcome in outcomes.iter_mut() {
            let Some(task_id) = outcome.task_id else {
                continue;
            };
            match scheduler.status(task_id).await {
                Ok(task) => {
                    outcome.status = task.status;
                    outcome.error = task.error;
                }
                Err(error) => outcome.error = Some(error),
            }
        }
        lock_progress(progress).phases[phase_index].tasks = outcomes;
        tracing::info!(phase = %authority, "authority phase drained");
    }

    // A cancel that lands after the last phase drained changes nothing.
    run.publish(if interrupted {
        PhaseState::Cancelled
    } else {
        PhaseState::Completed
    });
}

/// Resolves when every task of the phase is terminal.
async fn phase_barrier(scheduler: &TaskScheduler, task_ids: &[TaskId]) {
    for task_id in task_ids {
        if let Err(error) = scheduler.wait_for_terminal(*task_id, None).await {
            tracing::warn!(task_id = %task_id, error = %error, "lost track of phase task");
        }
    }
}

async fn cancellation(cancel_rx: &mut watch::Receiver<bool>) {
    if cancel_rx.wait_for(|cancelled| *cancelled).await.is_err() {
        // Handle dropped without cancelling: the run continues to completion.
        pending::<()>().await;
    }
}

fn lock_progress(progress: &Mutex<RunProgress>) -> MutexGuard<'_, RunProgress> {
    progress.lock().unwrap_or_else(PoisonError::into_inner)
}
