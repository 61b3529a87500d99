use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, ManagerAction, ManagerId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Terminal states are final; `Queued` may skip straight to `Cancelled`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match self {
            Self::Queued => next != Self::Queued,
            Self::Running => next.is_terminal(),
            Self::Completed | Self::Cancelled | Self::Failed => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Optional target of an action. Part of the duplicate-submission key.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ActionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

impl ActionParams {
    pub fn package(name: impl Into<String>) -> Self {
        Self {
            package: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn query(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.package.is_none() && self.version.is_none() && self.query.is_none()
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub manager: ManagerId,
    pub action: ManagerAction,
    pub params: ActionParams,
    pub label: String,
    pub status: TaskStatus,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    pub has_output: bool,
    pub error: Option<CoreError>,
}

/// Point-in-time copy of a task handed to callers.
pub type TaskSnapshot = TaskRecord;

impl TaskRecord {
    pub fn queued(
        id: TaskId,
        manager: ManagerId,
        action: ManagerAction,
        params: ActionParams,
        label: String,
    ) -> Self {
        Self {
            id,
            manager,
            action,
            params,
            label,
            status: TaskStatus::Queued,
            created_at: SystemTime::now(),
            started_at: None,
            finished_at: None,
            has_output: false,
            error: None,
        }
    }

    /// Applies a patch, refusing any write that would leave a terminal state.
    /// Returns whether the record changed.
    pub fn apply(&mut self, patch: &TaskPatch) -> bool {
        if let Some(status) = patch.status
            && status != self.status
            && !self.status.can_transition_to(status)
        {
            return false;
        }
        if self.status.is_terminal() && patch.status == Some(self.status) {
            return false;
        }

        if let Some(status) = patch.status {
            self.status = status;
        }
        if patch.started_at.is_some() {
            self.started_at = patch.started_at;
        }
        if patch.finished_at.is_some() {
            self.finished_at = patch.finished_at;
        }
        if let Some(has_output) = patch.has_output {
            self.has_output = has_output;
        }
        if patch.error.is_some() {
            self.error = patch.error.clone();
        }
        true
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    pub has_output: Option<bool>,
    pub error: Option<CoreError>,
}

impl TaskPatch {
    pub fn running(started_at: SystemTime) -> Self {
        Self {
            status: Some(TaskStatus::Running),
            started_at: Some(started_at),
            ..Self::default()
        }
    }

    pub fn terminal(
        status: TaskStatus,
        finished_at: SystemTime,
        error: Option<CoreError>,
        has_output: bool,
    ) -> Self {
        Self {
            status: Some(status),
            finished_at: Some(finished_at),
            has_output: Some(has_output),
            error,
            ..Self::default()
        }
    }
}
