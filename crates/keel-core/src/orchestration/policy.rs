use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::models::{CoreError, CoreErrorKind, ManagerAction, ManagerId};
use crate::orchestration::OrchestrationResult;

#[derive(Debug, Default)]
struct PolicyState {
    disabled: BTreeSet<ManagerId>,
    safe_mode: bool,
}

/// Operator switches consulted before work is scheduled: which managers are
/// disabled and whether safe mode holds back Guarded upgrades. The engine
/// persists changes first and then updates this copy.
#[derive(Clone, Debug, Default)]
pub struct EnginePolicy {
    state: Arc<Mutex<PolicyState>>,
}

impl EnginePolicy {
    pub fn new(disabled: impl IntoIterator<Item = ManagerId>, safe_mode: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(PolicyState {
                disabled: disabled.into_iter().collect(),
                safe_mode,
            })),
        }
    }

    pub fn is_manager_enabled(&self, manager: &ManagerId) -> bool {
        !self.state().disabled.contains(manager)
    }

    pub fn disabled_managers(&self) -> Vec<ManagerId> {
        self.state().disabled.iter().cloned().collect()
    }

    pub fn safe_mode(&self) -> bool {
        self.state().safe_mode
    }

    pub fn set_manager_enabled(&self, manager: &ManagerId, enabled: bool) {
        let mut state = self.state();
        if enabled {
            state.disabled.remove(manager);
        } else {
            state.disabled.insert(manager.clone());
        }
    }

    pub fn set_safe_mode(&self, enabled: bool) {
        self.state().safe_mode = enabled;
    }

    pub fn ensure_enabled(
        &self,
        manager: &ManagerId,
        action: ManagerAction,
    ) -> OrchestrationResult<()> {
        if self.is_manager_enabled(manager) {
            return Ok(());
        }
        Err(CoreError::new(
            CoreErrorKind::UnsupportedCapability,
            format!("manager '{manager}' is disabled"),
        )
        .attribute(manager, None, action))
    }

    fn state(&self) -> MutexGuard<'_, PolicyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::EnginePolicy;
    use crate::models::{CoreErrorKind, ManagerAction, ManagerId};

    #[test]
    fn disabled_manager_is_refused_with_attribution() {
        let policy = EnginePolicy::new([ManagerId::new("pipx")], false);
        assert!(policy.ensure_enabled(&ManagerId::new("npm"), ManagerAction::Upgrade).is_ok());

        let error = policy
            .ensure_enabled(&ManagerId::new("pipx"), ManagerAction::Upgrade)
            .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::UnsupportedCapability);
        assert_eq!(error.manager, Some(ManagerId::new("pipx")));
        assert_eq!(error.action, Some(ManagerAction::Upgrade));

        policy.set_manager_enabled(&ManagerId::new("pipx"), true);
        assert!(policy.disabled_managers().is_empty());
    }

    #[test]
    fn clones_share_the_same_switches() {
        let policy = EnginePolicy::default();
        let shared = policy.clone();
        shared.set_safe_mode(true);
        assert!(policy.safe_mode());
    }
}
