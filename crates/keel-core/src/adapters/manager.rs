use std::time::Duration;

use crate::execution::{CommandSpec, ProcessExitStatus, ProcessOutput};
use crate::models::{
    ActionParams, AuthorityClass, CapabilitySet, CoreError, CoreErrorKind, InstalledPackage,
    ManagerAction, ManagerDescriptor, OutdatedPackage,
};

pub type AdapterResult<T> = Result<T, CoreError>;

const FAILURE_DETAIL_BYTES: usize = 512;

/// What an adapter wants executed for one action.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AdapterCommand {
    pub command: CommandSpec,
    pub requires_elevation: bool,
    /// Overrides the engine's default timeout for this action.
    pub timeout: Option<Duration>,
}

impl AdapterCommand {
    pub fn new(command: CommandSpec) -> Self {
        Self {
            command,
            requires_elevation: false,
            timeout: None,
        }
    }

    pub fn elevated(mut self, requires_elevation: bool) -> Self {
        self.requires_elevation = requires_elevation;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Normalized result an adapter hands back after interpreting output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AdapterOutcome {
    Completed,
    Outdated(Vec<OutdatedPackage>),
    Installed(Vec<InstalledPackage>),
}

pub trait ManagerAdapter: Send + Sync {
    fn descriptor(&self) -> &ManagerDescriptor;

    fn capabilities(&self) -> &CapabilitySet {
        &self.descriptor().capabilities
    }

    fn authority(&self) -> AuthorityClass {
        self.descriptor().authority
    }

    fn build_command(
        &self,
        action: ManagerAction,
        params: &ActionParams,
    ) -> AdapterResult<AdapterCommand>;

    /// Turns a finished process into an outcome. This is also where
    /// post-action validation belongs; the engine never reads output itself.
    fn interpret(
        &self,
        action: ManagerAction,
        _params: &ActionParams,
        output: &ProcessOutput,
    ) -> AdapterResult<AdapterOutcome> {
        require_success(self.descriptor(), action, output)?;
        Ok(AdapterOutcome::Completed)
    }
}

pub fn ensure_action_supported(
    descriptor: &ManagerDescriptor,
    action: ManagerAction,
) -> AdapterResult<()> {
    if descriptor.supports(action) {
        return Ok(());
    }

    Err(CoreError {
        manager: Some(descriptor.id.clone()),
        task_id: None,
        action: Some(action),
        kind: CoreErrorKind::UnsupportedCapability,
        message: format!(
            "manager '{}' does not declare the '{action}' capability",
            descriptor.id
        ),
    })
}

pub fn require_success(
    descriptor: &ManagerDescriptor,
    action: ManagerAction,
    output: &ProcessOutput,
) -> AdapterResult<()> {
    if output.status.success() {
        return Ok(());
    }

    let status = match output.status {
        ProcessExitStatus::ExitCode(code) => format!("exit code {code}"),
        ProcessExitStatus::Terminated => "a signal".to_string(),
    };
    let detail = tail_text(&output.stderr.lossy_text())
        .or_else(|| tail_text(&output.stdout.lossy_text()))
        .map(|text| format!(": {text}"))
        .unwrap_or_default();

    Err(CoreError {
        manager: Some(descriptor.id.clone()),
        task_id: None,
        action: Some(action),
        kind: CoreErrorKind::ProcessFailure,
        message: format!("{} {action} ended with {status}{detail}", descriptor.id),
    })
}

fn tail_text(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let start = trimmed
        .char_indices()
        .map(|(index, _)| index)
        .find(|index| trimmed.len() - index <= FAILURE_DETAIL_BYTES)
        .unwrap_or(0);
    Some(trimmed[start..].to_string())
}
