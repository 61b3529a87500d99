//! Request/response surface for hosting the engine in a separate process.
//!
//! One client at a time: [`ServiceHost::connect`] refuses a second session
//! with a structured error, and a session frees its slot when dropped, so a
//! caller that disappears mid-call never wedges the host.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::execution::TaskOutputRecord;
use crate::models::{
    ActionParams, CoreError, CoreErrorKind, InstalledPackage, ManagerAction, ManagerDescriptor,
    ManagerId, OutdatedPackage, PackageRef, PinRecord, TaskId, TaskSnapshot,
};
use crate::orchestration::{PlanScope, TaskRequest, TaskWindow, UpgradePlan, WithheldStep};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineRequest {
    Managers,
    Submit {
        manager: ManagerId,
        action: ManagerAction,
        #[serde(default)]
        params: ActionParams,
        #[serde(default)]
        label: Option<String>,
    },
    Cancel {
        task_id: TaskId,
    },
    Status {
        task_id: TaskId,
    },
    ListTasks {
        #[serde(default)]
        window: Option<TaskWindow>,
    },
    Output {
        task_id: TaskId,
    },
    Preview {
        #[serde(default)]
        include_pinned: bool,
        #[serde(default)]
        allow_guarded: bool,
    },
    RunPlan {
        plan: UpgradePlan,
        #[serde(default)]
        scope: Option<PlanScope>,
    },
    RetryFailed {
        plan: UpgradePlan,
    },
    ProjectPlan {
        plan: UpgradePlan,
    },
    Refresh,
    RecordOutdated {
        manager: ManagerId,
        packages: Vec<OutdatedPackage>,
    },
    Outdated,
    Installed,
    SetManagerEnabled {
        manager: ManagerId,
        enabled: bool,
    },
    SetSafeMode {
        enabled: bool,
    },
    Preferences,
    Pin {
        package: PackageRef,
        #[serde(default)]
        version: Option<String>,
    },
    Unpin {
        package: PackageRef,
    },
    Pins,
    Prune {
        retention_secs: u64,
    },
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineResponse {
    Managers {
        managers: Vec<ManagerDescriptor>,
    },
    Submitted {
        task_id: TaskId,
    },
    CancelRequested {
        cancelled: bool,
    },
    Task {
        task: TaskSnapshot,
    },
    Tasks {
        tasks: Vec<TaskSnapshot>,
    },
    Output {
        task_id: TaskId,
        output: Option<TaskOutputRecord>,
    },
    Plan {
        plan: UpgradePlan,
    },
    /// The run continues in the engine after this response is sent.
    PlanStarted {
        plan: UpgradePlan,
        #[serde(default)]
        withheld: Vec<WithheldStep>,
    },
    RefreshStarted {
        managers: Vec<ManagerId>,
    },
    Recorded,
    Outdated {
        packages: Vec<OutdatedPackage>,
    },
    Installed {
        packages: Vec<InstalledPackage>,
    },
    Preferences {
        disabled_managers: Vec<ManagerId>,
        safe_mode: bool,
    },
    Pinned {
        pin: PinRecord,
    },
    Unpinned {
        removed: bool,
    },
    Pins {
        pins: Vec<PinRecord>,
    },
    Pruned {
        count: usize,
    },
    Error {
        code: String,
        message: String,
        #[serde(default)]
        manager: Option<ManagerId>,
        #[serde(default)]
        task_id: Option<TaskId>,
        #[serde(default)]
        action: Option<ManagerAction>,
    },
}

impl From<CoreError> for EngineResponse {
    fn from(error: CoreError) -> Self {
        Self::Error {
            code: error.code().to_string(),
            message: error.message,
            manager: error.manager,
            task_id: error.task_id,
            action: error.action,
        }
    }
}

pub struct ServiceHost {
    engine: Arc<Engine>,
    occupied: Arc<AtomicBool>,
}

impl ServiceHost {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            occupied: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn connect(&self) -> Result<ServiceSession, CoreError> {
        if self
            .occupied
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("rejected duplicate service connection");
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "another client is already connected to this engine",
            ));
        }

        tracing::debug!("service client connected");
        Ok(ServiceSession {
            engine: self.engine.clone(),
            occupied: self.occupied.clone(),
        })
    }

    pub fn is_occupied(&self) -> bool {
        self.occupied.load(Ordering::Acquire)
    }
}

pub struct ServiceSession {
    engine: Arc<Engine>,
    occupied: Arc<AtomicBool>,
}

impl ServiceSession {
    /// Every call is self-contained; nothing is left pending on the caller.
    pub async fn handle(&self, request: EngineRequest) -> EngineResponse {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(error) => error.into(),
        }
    }

    /// One JSON request in, one JSON response out. Malformed input becomes
    /// an `invalid_input` error response.
    pub async fn handle_json(&self, line: &str) -> String {
        let response = match serde_json::from_str::<EngineRequest>(line) {
            Ok(request) => self.handle(request).await,
            Err(error) => CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("malformed request: {error}"),
            )
            .into(),
        };
        serde_json::to_string(&response).unwrap_or_else(|error| {
            format!(
                r#"{{"type":"error","code":"internal","message":"response encoding failed: {}"}}"#,
                error.to_string().replace('"', "'")
            )
        })
    }

    async fn dispatch(&self, request: EngineRequest) -> Result<EngineResponse, CoreError> {
        let engine = &self.engine;
        let response = match request {
            EngineRequest::Managers => EngineResponse::Managers {
                managers: engine.managers(),
            },
            EngineRequest::Submit {
                manager,
                action,
                params,
                label,
            } => {
                let mut request = TaskRequest::new(manager, action, params);
                request.label = label;
                EngineResponse::Submitted {
                    task_id: engine.submit(request).await?,
                }
            }
            EngineRequest::Cancel { task_id } => EngineResponse::CancelRequested {
                cancelled: engine.cancel_task(task_id).await?,
            },
            EngineRequest::Status { task_id } => EngineResponse::Task {
                task: engine.task_status(task_id).await?,
            },
            EngineRequest::ListTasks { window } => EngineResponse::Tasks {
                tasks: engine.list_tasks(window.unwrap_or_default()).await?,
            },
            EngineRequest::Output { task_id } => EngineResponse::Output {
                task_id,
                output: engine.get_task_output(task_id),
            },
            EngineRequest::Preview {
                include_pinned,
                allow_guarded,
            } => EngineResponse::Plan {
                plan: engine.preview_plan(include_pinned, allow_guarded).await?,
            },
            EngineRequest::RunPlan { plan, scope } => {
                let execution = engine.run_plan(&plan, scope.as_ref()).await?;
                EngineResponse::PlanStarted {
                    plan: execution.plan().clone(),
                    withheld: execution.withheld().to_vec(),
                }
            }
            EngineRequest::RetryFailed { plan } => {
                let execution = engine.retry_failed(&plan).await?;
                EngineResponse::PlanStarted {
                    plan: execution.plan().clone(),
                    withheld: execution.withheld().to_vec(),
                }
            }
            EngineRequest::ProjectPlan { plan } => EngineResponse::Plan {
                plan: engine.project_plan(&plan).await?,
            },
            EngineRequest::Refresh => {
                engine.refresh_all()?;
                EngineResponse::RefreshStarted {
                    managers: engine
                        .managers()
                        .into_iter()
                        .filter(|descriptor| {
                            engine.is_manager_enabled(&descriptor.id)
                                && (descriptor.supports(ManagerAction::ListOutdated)
                                    || descriptor.supports(ManagerAction::ListInstalled))
                        })
                        .map(|descriptor| descriptor.id)
                        .collect(),
                }
            }
            EngineRequest::RecordOutdated { manager, packages } => {
                engine.record_outdated(manager, packages).await?;
                EngineResponse::Recorded
            }
            EngineRequest::Outdated => EngineResponse::Outdated {
                packages: engine.list_outdated().await?,
            },
            EngineRequest::Installed => EngineResponse::Installed {
                packages: engine.list_installed().await?,
            },
            EngineRequest::SetManagerEnabled { manager, enabled } => {
                engine.set_manager_enabled(manager, enabled).await?;
                preferences(engine)
            }
            EngineRequest::SetSafeMode { enabled } => {
                engine.set_safe_mode(enabled).await?;
                preferences(engine)
            }
            EngineRequest::Preferences => preferences(engine),
            EngineRequest::Pin { package, version } => EngineResponse::Pinned {
                pin: engine.pin_package(package, version).await?,
            },
            EngineRequest::Unpin { package } => EngineResponse::Unpinned {
                removed: engine.unpin_package(package).await?,
            },
            EngineRequest::Pins => EngineResponse::Pins {
                pins: engine.list_pins().await?,
            },
            EngineRequest::Prune { retention_secs } => EngineResponse::Pruned {
                count: engine
                    .prune_tasks(Duration::from_secs(retention_secs))
                    .await?,
            },
        };
        Ok(response)
    }
}

fn preferences(engine: &Engine) -> EngineResponse {
    EngineResponse::Preferences {
        disabled_managers: engine.disabled_managers(),
        safe_mode: engine.safe_mode(),
    }
}

impl Drop for ServiceSession {
    fn drop(&mut self) {
        self.occupied.store(false, Ordering::Release);
        tracing::debug!("service client disconnected");
    }
}
