use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::execution::{CommandSpec, ExecutionResult, ProcessSpawnRequest};
use crate::models::CoreErrorKind;

pub const SUDO_PATH: &str = "/usr/bin/sudo";
pub const ASKPASS_ENV: &str = "KEEL_SUDO_ASKPASS";
const PROMPT_ENV: &str = "KEEL_SUDO_PROMPT";
const DEFAULT_PROMPT: &str = "keel requires administrator authentication to continue.";

/// Wraps commands that need administrator privilege in `sudo -A`. The
/// password is always obtained through an askpass helper, never embedded.
#[derive(Debug, Default)]
pub struct ElevationHelper {
    askpass: Option<PathBuf>,
    provisioned: OnceLock<Result<PathBuf, String>>,
}

impl ElevationHelper {
    pub fn new(askpass: Option<PathBuf>) -> Self {
        Self {
            askpass,
            provisioned: OnceLock::new(),
        }
    }

    pub fn wrap(&self, request: &ProcessSpawnRequest) -> ExecutionResult<CommandSpec> {
        let askpass = self.resolve_askpass(request)?;
        Ok(wrap_with_askpass(&request.command, &askpass))
    }

    fn resolve_askpass(&self, request: &ProcessSpawnRequest) -> ExecutionResult<PathBuf> {
        if let Some(path) = &self.askpass {
            validate_askpass(path, request)?;
            return Ok(path.clone());
        }

        if let Some(path) = std::env::var_os(ASKPASS_ENV).filter(|value| !value.is_empty()) {
            let path = PathBuf::from(path);
            validate_askpass(&path, request)?;
            return Ok(path);
        }

        match self.provisioned.get_or_init(provision_default_askpass) {
            Ok(path) => {
                validate_askpass(path, request)?;
                Ok(path.clone())
            }
            Err(message) => Err(request.error(CoreErrorKind::ProcessLaunchFailure, message.clone())),
        }
    }
}

pub fn wrap_with_askpass(command: &CommandSpec, askpass: &Path) -> CommandSpec {
    let mut elevated = CommandSpec::new(SUDO_PATH)
        .arg("-A")
        .arg("--")
        .arg(command.program.to_string_lossy().into_owned())
        .args(command.args.iter().cloned())
        .env("SUDO_ASKPASS", askpass.to_string_lossy().into_owned())
        .env(PROMPT_ENV, DEFAULT_PROMPT)
        .env("SUDO_PROMPT", "");

    for (key, value) in &command.env {
        elevated = elevated.env(key.clone(), value.clone());
    }
    if let Some(dir) = &command.working_dir {
        elevated = elevated.working_dir(dir.clone());
    }
    elevated
}

fn validate_askpass(path: &Path, request: &ProcessSpawnRequest) -> ExecutionResult<()> {
    let metadata = fs::metadata(path).map_err(|error| {
        request.error(
            CoreErrorKind::ProcessLaunchFailure,
            format!("sudo askpass helper is unavailable at '{}': {error}", path.display()),
        )
    })?;
    if !metadata.is_file() {
        return Err(request.error(
            CoreErrorKind::ProcessLaunchFailure,
            format!("sudo askpass helper path '{}' is not a file", path.display()),
        ));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(request.error(
                CoreErrorKind::ProcessLaunchFailure,
                format!("sudo askpass helper '{}' is not executable", path.display()),
            ));
        }
    }

    Ok(())
}

#[cfg(target_os = "macos")]
fn provision_default_askpass() -> Result<PathBuf, String> {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let script = r#"#!/bin/sh
/usr/bin/osascript <<'APPLESCRIPT'
set promptText to system attribute "KEEL_SUDO_PROMPT"
if promptText is "" then set promptText to "keel requires administrator authentication to continue."
try
    display dialog promptText default answer "" with hidden answer buttons {"Cancel", "OK"} default button "OK"
    return text returned of result
on error number -128
    error number 1
end try
APPLESCRIPT
"#;

    let pid = std::process::id();
    for attempt in 0..16_u8 {
        let candidate = std::env::temp_dir().join(format!("keel-sudo-askpass-{pid}-{attempt}.sh"));
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(mut file) => {
                file.write_all(script.as_bytes()).map_err(|error| {
                    format!(
                        "failed to write sudo askpass helper to '{}': {error}",
                        candidate.display()
                    )
                })?;
                fs::set_permissions(&candidate, fs::Permissions::from_mode(0o700)).map_err(
                    |error| {
                        format!(
                            "failed to mark sudo askpass helper '{}' executable: {error}",
                            candidate.display()
                        )
                    },
                )?;
                return Ok(candidate);
            }
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(error) => {
                return Err(format!(
                    "failed to create sudo askpass helper '{}': {error}",
                    candidate.display()
                ));
            }
        }
    }

    Err("failed to create a unique sudo askpass helper in the temporary directory".to_string())
}

#[cfg(not(target_os = "macos"))]
fn provision_default_askpass() -> Result<PathBuf, String> {
    Err(format!(
        "elevated commands need an askpass helper; set {ASKPASS_ENV} or execution.askpass_helper"
    ))
}
