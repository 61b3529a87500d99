use std::collections::BTreeMap;
use std::sync::Arc;

use crate::adapters::{
    AdapterResult, ManagerAdapter, ManagerTemplate, TemplateAdapter, builtin_templates,
    ensure_action_supported,
};
use crate::models::{CoreError, CoreErrorKind, ManagerAction, ManagerDescriptor, ManagerId};

/// Adapters keyed by manager id. Fixed once the engine starts.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: BTreeMap<ManagerId, Arc<dyn ManagerAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> AdapterResult<Self> {
        Self::from_templates(builtin_templates())
    }

    pub fn from_templates(templates: impl IntoIterator<Item = ManagerTemplate>) -> AdapterResult<Self> {
        let mut registry = Self::new();
        for template in templates {
            registry.register(Arc::new(TemplateAdapter::from_template(template)?))?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, adapter: Arc<dyn ManagerAdapter>) -> AdapterResult<()> {
        let id = adapter.descriptor().id.clone();
        if self.adapters.contains_key(&id) {
            return Err(CoreError {
                manager: Some(id.clone()),
                task_id: None,
                action: None,
                kind: CoreErrorKind::InvalidInput,
                message: format!("duplicate adapter registration for manager '{id}'"),
            });
        }
        self.adapters.insert(id, adapter);
        Ok(())
    }

    pub fn get(&self, manager: &ManagerId) -> Option<Arc<dyn ManagerAdapter>> {
        self.adapters.get(manager).cloned()
    }

    pub fn adapter(&self, manager: &ManagerId) -> AdapterResult<Arc<dyn ManagerAdapter>> {
        self.get(manager).ok_or_else(|| CoreError {
            manager: Some(manager.clone()),
            task_id: None,
            action: None,
            kind: CoreErrorKind::InvalidInput,
            message: format!("no adapter is registered for manager '{manager}'"),
        })
    }

    /// Looks up the adapter and refuses actions outside its capability set.
    pub fn ensure_supported(
        &self,
        manager: &ManagerId,
        action: ManagerAction,
    ) -> AdapterResult<Arc<dyn ManagerAdapter>> {
        let adapter = self.adapter(manager).map_err(|error| CoreError {
            action: Some(action),
            ..error
        })?;
        ensure_action_supported(adapter.descriptor(), action)?;
        Ok(adapter)
    }

    pub fn descriptors(&self) -> Vec<ManagerDescriptor> {
        self.adapters
            .values()
            .map(|adapter| adapter.descriptor().clone())
            .collect()
    }

    pub fn supporting(&self, action: ManagerAction) -> Vec<ManagerDescriptor> {
        self.adapters
            .values()
            .filter(|adapter| adapter.capabilities().supports(action))
            .map(|adapter| adapter.descriptor().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
