pub mod authority_order;
pub mod lock_manager;
pub mod policy;
pub mod scheduler;
pub mod upgrade_planner;

pub use authority_order::{
    AuthorityPhaseRunner, OrderedRun, OrderedRunReport, PhaseReport, PhaseState,
    PhaseTaskOutcome, RunProgress, SubmitObserver, authority_phases,
};
pub use lock_manager::{LockGuard, LockTicket, ResourceLockManager};
pub use policy::EnginePolicy;
pub use scheduler::{
    RecoveryReport, SchedulerParts, SchedulerSettings, TaskRequest, TaskScheduler, TaskWindow,
};
pub use upgrade_planner::{
    PlanExecution, PlanScope, PlanStep, PlanStepStatus, UpgradePlan, UpgradePlanner,
    WithheldReason, WithheldStep,
};

use crate::models::CoreError;

pub type OrchestrationResult<T> = Result<T, CoreError>;
