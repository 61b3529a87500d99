use serde::{Deserialize, Serialize};

use crate::models::{ManagerAction, ManagerId, TaskId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreErrorKind {
    ProcessLaunchFailure,
    Timeout,
    ProcessFailure,
    Cancelled,
    UnsupportedCapability,
    LockTimeout,
    PersistenceTransient,
    StorageFailure,
    InvalidInput,
    Internal,
}

impl CoreErrorKind {
    const ALL: [CoreErrorKind; 10] = [
        CoreErrorKind::ProcessLaunchFailure,
        CoreErrorKind::Timeout,
        CoreErrorKind::ProcessFailure,
        CoreErrorKind::Cancelled,
        CoreErrorKind::UnsupportedCapability,
        CoreErrorKind::LockTimeout,
        CoreErrorKind::PersistenceTransient,
        CoreErrorKind::StorageFailure,
        CoreErrorKind::InvalidInput,
        CoreErrorKind::Internal,
    ];

    /// Stable machine-readable code. Persisted and sent across the service boundary.
    pub fn code(self) -> &'static str {
        match self {
            Self::ProcessLaunchFailure => "process_launch_failure",
            Self::Timeout => "timeout",
            Self::ProcessFailure => "process_failure",
            Self::Cancelled => "cancelled",
            Self::UnsupportedCapability => "unsupported_capability",
            Self::LockTimeout => "lock_timeout",
            Self::PersistenceTransient => "persistence_transient",
            Self::StorageFailure => "storage_failure",
            Self::InvalidInput => "invalid_input",
            Self::Internal => "internal",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}", code = .kind.code())]
pub struct CoreError {
    pub manager: Option<ManagerId>,
    pub task_id: Option<TaskId>,
    pub action: Option<ManagerAction>,
    pub kind: CoreErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            manager: None,
            task_id: None,
            action: None,
            kind,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// Fills in whatever context the error was raised without. Existing
    /// attribution is kept.
    pub fn attribute(
        mut self,
        manager: &ManagerId,
        task_id: Option<TaskId>,
        action: ManagerAction,
    ) -> Self {
        if self.manager.is_none() {
            self.manager = Some(manager.clone());
        }
        if self.task_id.is_none() {
            self.task_id = task_id;
        }
        if self.action.is_none() {
            self.action = Some(action);
        }
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind == CoreErrorKind::PersistenceTransient
    }
}
