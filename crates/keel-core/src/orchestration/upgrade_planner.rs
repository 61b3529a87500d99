use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::models::{
    ActionParams, AuthorityClass, ManagerAction, ManagerId, PackageRef, TaskId, TaskStatus,
};
use crate::orchestration::OrchestrationResult;
use crate::orchestration::authority_order::{
    AuthorityPhaseRunner, OrderedRun, OrderedRunReport, RunProgress, SubmitObserver,
};
use crate::orchestration::scheduler::TaskRequest;
use crate::persistence::{PackageStore, PinStore, RetryPolicy, with_retry};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStepStatus {
    /// No task has been submitted for this step yet.
    Planned,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl From<TaskStatus> for PlanStepStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Queued => Self::Queued,
            TaskStatus::Running => Self::Running,
            TaskStatus::Completed => Self::Completed,
            TaskStatus::Failed => Self::Failed,
            TaskStatus::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub order_index: usize,
    pub manager: ManagerId,
    pub authority: AuthorityClass,
    pub package: String,
    pub installed_version: Option<String>,
    pub candidate_version: String,
    pub status: PlanStepStatus,
}

impl PlanStep {
    pub fn package_ref(&self) -> PackageRef {
        PackageRef::new(self.manager.clone(), self.package.clone())
    }

    fn request(&self) -> TaskRequest {
        TaskRequest::new(
            self.manager.clone(),
            ManagerAction::Upgrade,
            ActionParams::package(self.package.clone()),
        )
        .with_label(format!(
            "upgrade {} to {} ({})",
            self.package, self.candidate_version, self.manager
        ))
    }
}

/// Immutable once generated. Step statuses are a projection of task state
/// and only change through [`UpgradePlanner::project`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UpgradePlan {
    pub generated_at: SystemTime,
    pub include_pinned: bool,
    pub allow_guarded: bool,
    pub steps: Vec<PlanStep>,
}

impl UpgradePlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn with_steps(&self, steps: Vec<PlanStep>) -> Self {
        Self {
            generated_at: self.generated_at,
            include_pinned: self.include_pinned,
            allow_guarded: self.allow_guarded,
            steps,
        }
    }
}

/// Narrows a run to chosen managers and/or packages. An empty set does not
/// restrict that dimension.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PlanScope {
    #[serde(default)]
    pub managers: BTreeSet<ManagerId>,
    #[serde(default)]
    pub packages: BTreeSet<PackageRef>,
}

impl PlanScope {
    pub fn managers(managers: impl IntoIterator<Item = ManagerId>) -> Self {
        Self {
            managers: managers.into_iter().collect(),
            packages: BTreeSet::new(),
        }
    }

    pub fn packages(packages: impl IntoIterator<Item = PackageRef>) -> Self {
        Self {
            managers: BTreeSet::new(),
            packages: packages.into_iter().collect(),
        }
    }

    pub fn contains(&self, step: &PlanStep) -> bool {
        (self.managers.is_empty() || self.managers.contains(&step.manager))
            && (self.packages.is_empty() || self.packages.contains(&step.package_ref()))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithheldReason {
    ManagerDisabled,
    UpgradeUnsupported,
    /// Guarded step in a plan generated without `allow_guarded`.
    GuardedNotAllowed,
    SafeMode,
    Pinned,
}

/// A step the planner refused to submit when the run started.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WithheldStep {
    pub step: PlanStep,
    pub reason: WithheldReason,
}

/// A started plan run: the steps it covers plus the underlying ordered run.
pub struct PlanExecution {
    plan: UpgradePlan,
    withheld: Vec<WithheldStep>,
    run: OrderedRun,
}

impl PlanExecution {
    /// Only the steps that were actually submitted.
    pub fn plan(&self) -> &UpgradePlan {
        &self.plan
    }

    pub fn withheld(&self) -> &[WithheldStep] {
        &self.withheld
    }

    pub fn progress(&self) -> RunProgress {
        self.run.progress()
    }

    pub fn cancel(&self) {
        self.run.cancel();
    }

    pub async fn wait(self) -> OrchestrationResult<OrderedRunReport> {
        self.run.wait().await
    }

    pub fn into_parts(self) -> (UpgradePlan, OrderedRun) {
        (self.plan, self.run)
    }
}

#[derive(Clone)]
pub struct UpgradePlanner {
    runner: AuthorityPhaseRunner,
    packages: Arc<dyn PackageStore>,
    pins: Arc<dyn PinStore>,
    retry: RetryPolicy,
    /// Latest task per (manager, package). Plans never hold task ids.
    correlation: Arc<Mutex<HashMap<PackageRef, TaskId>>>,
}

impl UpgradePlanner {
    pub fn new(
        runner: AuthorityPhaseRunner,
        packages: Arc<dyn PackageStore>,
        pins: Arc<dyn PinStore>,
    ) -> Self {
        let retry = runner.scheduler().settings().retry;
        Self {
            runner,
            packages,
            pins,
            retry,
            correlation: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Builds a plan from the current outdated snapshot. Pinned packages are
    /// left out unless `include_pinned`; the Guarded class is left out
    /// entirely unless `allow_guarded`, and always while safe mode is on.
    /// Disabled managers contribute nothing.
    pub async fn preview(
        &self,
        include_pinned: bool,
        allow_guarded: bool,
    ) -> OrchestrationResult<UpgradePlan> {
        let packages = self.packages.clone();
        let outdated = with_retry(self.retry, "list_outdated", move || packages.list_outdated())
            .await?;
        let pins = self.pins.clone();
        let pinned: HashSet<PackageRef> =
            with_retry(self.retry, "list_pins", move || pins.list_pins())
                .await?
                .into_iter()
                .map(|pin| pin.package)
                .collect();

        let registry = self.runner.scheduler().registry();
        let policy = self.runner.scheduler().policy();
        let safe_mode = policy.safe_mode();
        let mut seen = HashSet::new();
        let mut steps = Vec::new();
        for candidate in outdated {
            let Some(adapter) = registry.get(&candidate.package.manager) else {
                tracing::debug!(package = %candidate.package, "skipping package of unregistered manager");
                continue;
            };
            if !adapter.capabilities().supports(ManagerAction::Upgrade)
                || !policy.is_manager_enabled(&candidate.package.manager)
            {
                continue;
            }
            let authority = adapter.authority();
            if authority == AuthorityClass::Guarded && (!allow_guarded || safe_mode) {
                continue;
            }
            if !include_pinned && (candidate.pinned || pinned.contains(&candidate.package)) {
                continue;
            }
            if !seen.insert(candidate.package.clone()) {
                continue;
            }

            steps.push(PlanStep {
                order_index: 0,
                manager: candidate.package.manager,
                authority,
                package: candidate.package.name,
                installed_version: candidate.installed_version,
                candidate_version: candidate.candidate_version,
                status: PlanStepStatus::Planned,
            });
        }

        steps.sort_by(|left, right| {
            (left.authority, &left.manager, &left.package).cmp(&(
                right.authority,
                &right.manager,
                &right.package,
            ))
        });
        for (index, step) in steps.iter_mut().enumerate() {
            step.order_index = index;
        }

        tracing::info!(
            steps = steps.len(),
            include_pinned,
            allow_guarded,
            safe_mode,
            "upgrade plan generated"
        );
        Ok(UpgradePlan {
            generated_at: SystemTime::now(),
            include_pinned,
            allow_guarded,
            steps,
        })
    }

    /// Submits the plan's steps (optionally narrowed by `scope`) through the
    /// authority phase runner. Steps are checked again against the registry,
    /// the plan's own flags, and the current policy; anything that no longer
    /// qualifies is withheld rather than run.
    pub async fn run(
        &self,
        plan: &UpgradePlan,
        scope: Option<&PlanScope>,
    ) -> OrchestrationResult<PlanExecution> {
        let steps: Vec<PlanStep> = plan
            .steps
            .iter()
            .filter(|step| scope.is_none_or(|scope| scope.contains(step)))
            .cloned()
            .collect();
        self.execute(plan.with_steps(steps)).await
    }

    /// Re-submits exactly the steps whose projected status is `Failed`.
    pub async fn retry_failed(&self, plan: &UpgradePlan) -> OrchestrationResult<PlanExecution> {
        let projected = self.project(plan).await?;
        let failed: Vec<PlanStep> = projected
            .steps
            .into_iter()
            .filter(|step| step.status == PlanStepStatus::Failed)
            .collect();
        tracing::info!(steps = failed.len(), "retrying failed plan steps");
        self.execute(plan.with_steps(failed)).await
    }

    /// Copy of `plan` with each step's status taken from its latest task.
    pub async fn project(&self, plan: &UpgradePlan) -> OrchestrationResult<UpgradePlan> {
        let mut projected = plan.clone();
        for step in projected.steps.iter_mut() {
            let task_id = self.correlation().get(&step.package_ref()).copied();
            step.status = match task_id {
                Some(task_id) => self.runner.scheduler().status(task_id).await?.status.into(),
                None => PlanStepStatus::Planned,
            };
        }
        Ok(projected)
    }

    pub fn task_for(&self, package: &PackageRef) -> Option<TaskId> {
        self.correlation().get(package).copied()
    }

    async fn execute(&self, plan: UpgradePlan) -> OrchestrationResult<PlanExecution> {
        let pins = self.pins.clone();
        let pinned: HashSet<PackageRef> =
            with_retry(self.retry, "list_pins", move || pins.list_pins())
                .await?
                .into_iter()
                .map(|pin| pin.package)
                .collect();

        let (admitted, withheld) = self.admit(&plan, &pinned)?;
        let plan = plan.with_steps(admitted);

        let requests = plan.steps.iter().map(PlanStep::request).collect();
        let correlation = self.correlation.clone();
        let observer: SubmitObserver = Arc::new(move |request: &TaskRequest, task_id: TaskId| {
            if let Some(package) = &request.params.package {
                correlation
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(PackageRef::new(request.manager.clone(), package.clone()), task_id);
            }
        });

        let run = self.runner.run_ordered_with_observer(requests, observer)?;
        Ok(PlanExecution {
            plan,
            withheld,
            run,
        })
    }

    /// Splits steps into those that may run now and those withheld. A step
    /// naming an unregistered manager rejects the whole run.
    fn admit(
        &self,
        plan: &UpgradePlan,
        pinned: &HashSet<PackageRef>,
    ) -> OrchestrationResult<(Vec<PlanStep>, Vec<WithheldStep>)> {
        let scheduler = self.runner.scheduler();
        let policy = scheduler.policy();
        let safe_mode = policy.safe_mode();

        let mut admitted = Vec::with_capacity(plan.steps.len());
        let mut withheld = Vec::new();
        for step in &plan.steps {
            let adapter = scheduler.registry().adapter(&step.manager)?;
            let mut step = step.clone();
            step.authority = adapter.authority();

            let guarded = step.authority == AuthorityClass::Guarded;
            let reason = if !policy.is_manager_enabled(&step.manager) {
                Some(WithheldReason::ManagerDisabled)
            } else if !adapter.capabilities().supports(ManagerAction::Upgrade) {
                Some(WithheldReason::UpgradeUnsupported)
            } else if guarded && !plan.allow_guarded {
                Some(WithheldReason::GuardedNotAllowed)
            } else if guarded && safe_mode {
                Some(WithheldReason::SafeMode)
            } else if !plan.include_pinned && pinned.contains(&step.package_ref()) {
                Some(WithheldReason::Pinned)
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    tracing::warn!(
                        manager = %step.manager,
                        package = %step.package,
                        reason = ?reason,
                        "plan step withheld"
                    );
                    withheld.push(WithheldStep { step, reason });
                }
                None => admitted.push(step),
            }
        }
        Ok((admitted, withheld))
    }

    fn correlation(&self) -> MutexGuard<'_, HashMap<PackageRef, TaskId>> {
        self.correlation.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
