pub mod command_template;
pub mod manager;
pub mod presets;

pub use command_template::{
    CommandTemplates, InstalledLayout, ManagerTemplate, OutdatedLayout, TemplateAdapter,
};
pub use manager::{
    AdapterCommand, AdapterOutcome, AdapterResult, ManagerAdapter, ensure_action_supported,
    require_success,
};
pub use presets::builtin_templates;
