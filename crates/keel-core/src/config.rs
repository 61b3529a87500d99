//! Engine configuration.
//!
//! Loaded from TOML with every field defaulted, then adjusted by environment
//! overrides:
//!
//! - `KEEL_DATABASE`: path of the SQLite database.
//! - `KEEL_SUDO_ASKPASS`: askpass helper for elevated commands.
//! - `KEEL_LOG`: tracing filter directive, e.g. `keel_core=debug`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adapters::ManagerTemplate;
use crate::execution::ExecutorSettings;
use crate::execution::task_output_store::DEFAULT_MAX_TASK_OUTPUT_RECORDS;
use crate::execution::tokio_process::DEFAULT_MAX_OUTPUT_BYTES;
use crate::orchestration::SchedulerSettings;
use crate::orchestration::scheduler::DEFAULT_HISTORY_LIMIT;
use crate::persistence::RetryPolicy;
use crate::persistence::retry::{DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_DELAY};

pub const DATABASE_ENV: &str = "KEEL_DATABASE";
pub const LOG_ENV: &str = "KEEL_LOG";
pub use crate::execution::elevation::ASKPASS_ENV;

const DATABASE_FILE: &str = "keel.db";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Defaults to the platform data directory.
    pub database: Option<PathBuf>,
    /// Keep all state in memory; nothing survives the process.
    pub ephemeral: bool,
    /// Tracing filter directive used when `KEEL_LOG` is unset.
    pub log: Option<String>,
    pub execution: ExecutionConfig,
    pub scheduler: SchedulerConfig,
    /// Replaces the built-in manager presets when non-empty.
    pub managers: Vec<ManagerTemplate>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    pub read_timeout_secs: u64,
    pub mutation_timeout_secs: u64,
    pub grace_period_secs: u64,
    pub max_output_bytes: usize,
    pub output_records: usize,
    pub askpass_helper: Option<PathBuf>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        let scheduler = SchedulerSettings::default();
        Self {
            read_timeout_secs: scheduler.read_timeout.as_secs(),
            mutation_timeout_secs: scheduler.mutation_timeout.as_secs(),
            grace_period_secs: scheduler.grace_period.as_secs(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            output_records: DEFAULT_MAX_TASK_OUTPUT_RECORDS,
            askpass_helper: None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub lock_wait_timeout_secs: Option<u64>,
    pub retention_days: u64,
    pub history_limit: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_wait_timeout_secs: None,
            retention_days: 30,
            history_limit: DEFAULT_HISTORY_LIMIT,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY.as_millis() as u64,
        }
    }
}

impl EngineConfig {
    /// Reads `path`, applies environment overrides and validates.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.finish()
    }

    /// Like [`EngineConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) if path.exists() => Self::load(path),
            Some(path) => {
                tracing::debug!(path = %path.display(), "config file not found; using defaults");
                Self::default().finish()
            }
            None => Self::default().finish(),
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.finish()
    }

    fn finish(mut self) -> Result<Self, ConfigError> {
        self.apply_env_overrides(|key| std::env::var_os(key));
        self.validate()?;
        Ok(self)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<std::ffi::OsString>) {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.is_empty());
        if let Some(database) = non_empty(DATABASE_ENV) {
            self.database = Some(PathBuf::from(database));
        }
        if let Some(askpass) = non_empty(ASKPASS_ENV) {
            self.execution.askpass_helper = Some(PathBuf::from(askpass));
        }
        if let Some(log) = non_empty(LOG_ENV) {
            self.log = Some(log.to_string_lossy().into_owned());
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let execution = &self.execution;
        if execution.read_timeout_secs == 0 || execution.mutation_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "execution timeouts must be greater than zero".to_string(),
            ));
        }
        if execution.max_output_bytes == 0 {
            return Err(ConfigError::Invalid(
                "execution.max_output_bytes must be greater than zero".to_string(),
            ));
        }
        if self.scheduler.lock_wait_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "scheduler.lock_wait_timeout_secs must be greater than zero when set".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for manager in &self.managers {
            if !ids.insert(manager.id.trim()) {
                return Err(ConfigError::Invalid(format!(
                    "manager '{}' is configured more than once",
                    manager.id
                )));
            }
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.database.clone().unwrap_or_else(default_database_path)
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            grace_period: Duration::from_secs(self.execution.grace_period_secs),
            max_output_bytes: self.execution.max_output_bytes,
            askpass_helper: self.execution.askpass_helper.clone(),
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            read_timeout: Duration::from_secs(self.execution.read_timeout_secs),
            mutation_timeout: Duration::from_secs(self.execution.mutation_timeout_secs),
            grace_period: Duration::from_secs(self.execution.grace_period_secs),
            lock_wait_timeout: self.scheduler.lock_wait_timeout_secs.map(Duration::from_secs),
            retry: RetryPolicy {
                attempts: self.scheduler.retry_attempts,
                delay: Duration::from_millis(self.scheduler.retry_delay_ms),
            },
            history_limit: self.scheduler.history_limit,
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.scheduler.retention_days.saturating_mul(24 * 60 * 60))
    }
}

/// `$XDG_DATA_HOME/keel/keel.db`, then `~/.local/share/keel/keel.db`, then
/// `keel.db` in the working directory.
pub fn default_database_path() -> PathBuf {
    if let Some(data_home) = std::env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(data_home).join("keel").join(DATABASE_FILE);
    }
    if let Some(home) = std::env::var_os("HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("keel")
            .join(DATABASE_FILE);
    }
    PathBuf::from(DATABASE_FILE)
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;
    use std::path::PathBuf;
    use std::time::Duration;

    use super::{ConfigError, EngineConfig};

    #[test]
    fn empty_file_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.scheduler_settings().retry.attempts, 3);
        assert_eq!(config.scheduler_settings().lock_wait_timeout, None);
    }

    #[test]
    fn parses_manager_templates_and_settings() {
        let config: EngineConfig = toml::from_str(
            r#"
database = "/tmp/keel-test.db"

[execution]
read_timeout_secs = 30
grace_period_secs = 2

[scheduler]
lock_wait_timeout_secs = 600

[[managers]]
id = "gem"
authority = "standard"
program = "gem"

[managers.commands]
list_outdated = ["outdated"]
upgrade = ["update", "{package}"]

[managers.outdated]
trim_chars = "()"
"#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.database_path(), PathBuf::from("/tmp/keel-test.db"));
        let settings = config.scheduler_settings();
        assert_eq!(settings.read_timeout, Duration::from_secs(30));
        assert_eq!(settings.lock_wait_timeout, Some(Duration::from_secs(600)));
        assert_eq!(config.managers.len(), 1);
        assert_eq!(config.managers[0].outdated.trim_chars, "()");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let error = EngineConfig::from_toml_str("[execution]\nread_timeout = 5\n").unwrap_err();
        assert!(matches!(error, ConfigError::Parse { .. }));
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = EngineConfig {
            database: Some(PathBuf::from("from-file.db")),
            ..EngineConfig::default()
        };
        config.apply_env_overrides(|key| match key {
            "KEEL_DATABASE" => Some(OsString::from("/var/lib/keel/keel.db")),
            "KEEL_SUDO_ASKPASS" => Some(OsString::from("/usr/local/bin/askpass")),
            _ => None,
        });
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/keel/keel.db"));
        assert_eq!(
            config.execution.askpass_helper,
            Some(PathBuf::from("/usr/local/bin/askpass"))
        );
        assert_eq!(config.log, None);
    }

    #[test]
    fn duplicate_managers_are_invalid() {
        let mut config = EngineConfig::default();
        let template = crate::adapters::builtin_templates().remove(0);
        config.managers = vec![template.clone(), template];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
