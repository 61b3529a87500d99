use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapters::manager::{
    AdapterCommand, AdapterOutcome, AdapterResult, ManagerAdapter, ensure_action_supported,
    require_success,
};
use crate::execution::{CommandSpec, ProcessOutput};
use crate::models::{
    ActionParams, ActionSafety, AuthorityClass, CoreError, CoreErrorKind, InstalledPackage,
    ManagerAction, ManagerDescriptor, ManagerId, OutdatedPackage, PackageRef,
};

/// Per-action argument templates. An action without a template is not a
/// capability of the manager.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandTemplates {
    pub list_installed: Option<Vec<String>>,
    pub list_outdated: Option<Vec<String>>,
    pub search: Option<Vec<String>>,
    pub install: Option<Vec<String>>,
    pub uninstall: Option<Vec<String>>,
    pub upgrade: Option<Vec<String>>,
    pub pin: Option<Vec<String>>,
    pub unpin: Option<Vec<String>>,
}

impl CommandTemplates {
    pub fn get(&self, action: ManagerAction) -> Option<&[String]> {
        let template = match action {
            ManagerAction::ListInstalled => &self.list_installed,
            ManagerAction::ListOutdated => &self.list_outdated,
            ManagerAction::Search => &self.search,
            ManagerAction::Install => &self.install,
            ManagerAction::Uninstall => &self.uninstall,
            ManagerAction::Upgrade => &self.upgrade,
            ManagerAction::Pin => &self.pin,
            ManagerAction::Unpin => &self.unpin,
        };
        template.as_deref()
    }
}

/// Column layout of a manager's "outdated" listing.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutdatedLayout {
    /// Header lines to ignore.
    pub skip_lines: usize,
    /// Only lines containing this text describe packages.
    pub line_contains: Option<String>,
    /// Field separator; whitespace when unset.
    pub separator: Option<String>,
    pub name_column: usize,
    pub installed_column: Option<usize>,
    pub candidate_column: Option<usize>,
    /// Characters stripped from both ends of every field, e.g. "()".
    pub trim_chars: String,
    /// Lines containing this text are reported as natively pinned.
    pub pinned_marker: Option<String>,
}

impl Default for OutdatedLayout {
    fn default() -> Self {
        Self {
            skip_lines: 0,
            line_contains: None,
            separator: None,
            name_column: 0,
            installed_column: Some(1),
            candidate_column: Some(2),
            trim_chars: String::new(),
            pinned_marker: None,
        }
    }
}

/// Layout of a manager's installed listing.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstalledLayout {
    pub skip_lines: usize,
    pub line_contains: Option<String>,
    pub separator: Option<String>,
    pub name_column: usize,
    pub version_column: Option<usize>,
    /// Splits `name@1.2.3` style fields at the last occurrence.
    pub name_version_separator: Option<String>,
    /// Stripped from both ends of the version only, e.g. "v:" for `v1.2.3:`.
    pub version_trim_chars: String,
}

impl Default for InstalledLayout {
    fn default() -> Self {
        Self {
            skip_lines: 0,
            line_contains: None,
            separator: None,
            name_column: 0,
            version_column: Some(1),
            name_version_separator: None,
            version_trim_chars: String::new(),
        }
    }
}

/// Declarative description of one manager.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerTemplate {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub authority: AuthorityClass,
    pub program: PathBuf,
    /// Mutating actions run through the elevation wrapper.
    #[serde(default)]
    pub elevated: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub commands: CommandTemplates,
    #[serde(default)]
    pub outdated: OutdatedLayout,
    #[serde(default)]
    pub installed: InstalledLayout,
    /// Output fragments that mark an action as failed even on exit code 0.
    #[serde(default)]
    pub failure_markers: Vec<String>,
}

const PLACEHOLDERS: [&str; 3] = ["package", "version", "query"];

/// Adapter driven entirely by a [`ManagerTemplate`]. Placeholders are
/// substituted per argument, so a value can never become more than one argv
/// element.
pub struct TemplateAdapter {
    descriptor: ManagerDescriptor,
    template: ManagerTemplate,
}

impl TemplateAdapter {
    pub fn from_template(template: ManagerTemplate) -> AdapterResult<Self> {
        let id = template.id.trim();
        if id.is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "manager id must not be empty",
            ));
        }
        let manager = ManagerId::new(id);
        let invalid = |message: String| CoreError {
            manager: Some(manager.clone()),
            ..CoreError::new(CoreErrorKind::InvalidInput, message)
        };

        if template.program.as_os_str().is_empty() {
            return Err(invalid("manager program must not be empty".to_string()));
        }

        for action in ManagerAction::ALL {
            let Some(args) = template.commands.get(action) else {
                continue;
            };
            for arg in args {
                for name in placeholder_names(arg) {
                    if !PLACEHOLDERS.contains(&name) {
                        return Err(invalid(format!(
                            "{action} template uses unknown placeholder '{{{name}}}'"
                        )));
                    }
                }
            }
        }

        let capabilities = ManagerAction::ALL
            .into_iter()
            .filter(|action| template.commands.get(*action).is_some())
            .collect();
        let descriptor = ManagerDescriptor {
            display_name: template
                .display_name
                .clone()
                .unwrap_or_else(|| id.to_string()),
            id: manager,
            authority: template.authority,
            capabilities,
        };

        Ok(Self {
            descriptor,
            template,
        })
    }

    pub fn template(&self) -> &ManagerTemplate {
        &self.template
    }

    fn error(&self, action: ManagerAction, kind: CoreErrorKind, message: String) -> CoreError {
        CoreError {
            manager: Some(self.descriptor.id.clone()),
            task_id: None,
            action: Some(action),
            kind,
            message,
        }
    }

    fn parse_outdated(&self, stdout: &str) -> Vec<OutdatedPackage> {
        let layout = &self.template.outdated;
        let trim: Vec<char> = layout.trim_chars.chars().collect();

        stdout
            .lines()
            .skip(layout.skip_lines)
            .filter(|line| !line.trim().is_empty())
            .filter(|line| {
                layout
                    .line_contains
                    .as_deref()
                    .is_none_or(|needle| line.contains(needle))
            })
            .filter_map(|line| {
                let fields: Vec<&str> = match layout.separator.as_deref() {
                    Some(separator) => line.split(separator).collect(),
                    None => line.split_whitespace().collect(),
                };
                let field = |index: usize| {
                    fields
                        .get(index)
                        .map(|value| value.trim().trim_matches(trim.as_slice()))
                        .filter(|value| !value.is_empty())
                };

                let name = field(layout.name_column)?;
                let installed = layout.installed_column.and_then(field);
                let candidate = match layout.candidate_column {
                    Some(column) => field(column)?.to_string(),
                    None => "latest".to_string(),
                };
                Some(OutdatedPackage {
                    package: PackageRef::new(self.descriptor.id.clone(), name),
                    installed_version: installed.map(str::to_string),
                    candidate_version: candidate,
                    pinned: layout
                        .pinned_marker
                        .as_deref()
                        .is_some_and(|marker| line.contains(marker)),
                })
            })
            .collect()
    }

    fn parse_installed(&self, stdout: &str) -> Vec<InstalledPackage> {
        let layout = &self.template.installed;
        let trim: Vec<char> = layout.version_trim_chars.chars().collect();

        stdout
            .lines()
            .skip(layout.skip_lines)
            .filter(|line| !line.trim().is_empty())
            .filter(|line| {
                layout
                    .line_contains
                    .as_deref()
                    .is_none_or(|needle| line.contains(needle))
            })
            .filter_map(|line| {
                let fields: Vec<&str> = match layout.separator.as_deref() {
                    Some(separator) => line.split(separator).map(str::trim).collect(),
                    None => line.split_whitespace().collect(),
                };
                let raw_name = fields.get(layout.name_column).copied()?;
                let (name, embedded) = match layout.name_version_separator.as_deref() {
                    Some(separator) => match raw_name.rsplit_once(separator) {
                        Some((name, version)) if !name.is_empty() => (name, Some(version)),
                        _ => (raw_name, None),
                    },
                    None => (raw_name, None),
                };
                if name.is_empty() {
                    return None;
                }

                let version = embedded
                    .or_else(|| {
                        layout
                            .version_column
                            .and_then(|column| fields.get(column).copied())
                    })
                    .map(|value| value.trim_matches(trim.as_slice()))
                    .filter(|value| !value.is_empty());
                Some(InstalledPackage {
                    package: PackageRef::new(self.descriptor.id.clone(), name),
                    installed_version: version.map(str::to_string),
                    pinned: false,
                })
            })
            .collect()
    }
}

impl ManagerAdapter for TemplateAdapter {
    fn descriptor(&self) -> &ManagerDescriptor {
        &self.descriptor
    }

    fn build_command(
        &self,
        action: ManagerAction,
        params: &ActionParams,
    ) -> AdapterResult<AdapterCommand> {
        ensure_action_supported(&self.descriptor, action)?;
        let Some(template) = self.template.commands.get(action) else {
            return Err(self.error(
                action,
                CoreErrorKind::UnsupportedCapability,
                format!("no command template for {action}"),
            ));
        };

        let mut args = Vec::with_capacity(template.len());
        for arg in template {
            match substitute(arg, params)
                .map_err(|message| self.error(action, CoreErrorKind::InvalidInput, message))?
            {
                Some(value) => args.push(value),
                None => continue,
            }
        }

        let mut command = CommandSpec::new(self.template.program.clone()).args(args);
        for (key, value) in &self.template.env {
            command = command.env(key.clone(), value.clone());
        }

        let mut built = AdapterCommand::new(command)
            .elevated(self.template.elevated && action.safety() == ActionSafety::Mutating);
        if let Some(secs) = self.template.timeout_secs.filter(|secs| *secs > 0) {
            built = built.timeout(Duration::from_secs(secs));
        }
        Ok(built)
    }

    fn interpret(
        &self,
        action: ManagerAction,
        _params: &ActionParams,
        output: &ProcessOutput,
    ) -> AdapterResult<AdapterOutcome> {
        require_success(&self.descriptor, action, output)?;

        let stdout = output.stdout.lossy_text();
        let stderr = output.stderr.lossy_text();
        if let Some(marker) = self
            .template
            .failure_markers
            .iter()
            .find(|marker| stdout.contains(marker.as_str()) || stderr.contains(marker.as_str()))
        {
            return Err(self.error(
                action,
                CoreErrorKind::ProcessFailure,
                format!("output reported failure marker '{marker}' despite a zero exit code"),
            ));
        }

        match action {
            ManagerAction::ListOutdated => Ok(AdapterOutcome::Outdated(self.parse_outdated(&stdout))),
            ManagerAction::ListInstalled => {
                Ok(AdapterOutcome::Installed(self.parse_installed(&stdout)))
            }
            _ => Ok(AdapterOutcome::Completed),
        }
    }
}

fn placeholder_names(arg: &str) -> Vec<&str> {
    let mut names = Vec::new();
    let mut rest = arg;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            break;
        };
        names.push(&after[..close]);
        rest = &after[close + 1..];
    }
    names
}

/// `Ok(None)` drops the argument because a referenced value is absent.
fn substitute(arg: &str, params: &ActionParams) -> Result<Option<String>, String> {
    let mut rendered = arg.to_string();
    for name in placeholder_names(arg) {
        let value = match name {
            "package" => params.package.as_deref(),
            "version" => params.version.as_deref(),
            "query" => params.query.as_deref(),
            _ => return Err(format!("unknown placeholder '{{{name}}}'")),
        };
        let Some(value) = value else {
            return Ok(None);
        };
        if value.is_empty() || value.starts_with('-') || value.contains('\0') {
            return Err(format!("value '{value}' is not allowed for '{{{name}}}'"));
        }
        rendered = rendered.replace(&format!("{{{name}}}"), value);
    }
    Ok(Some(rendered))
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::{
        CommandTemplates, InstalledLayout, ManagerTemplate, OutdatedLayout, TemplateAdapter,
    };
    use crate::adapters::{AdapterOutcome, ManagerAdapter};
    use crate::execution::{CapturedStream, ProcessExitStatus, ProcessOutput};
    use crate::models::{ActionParams, AuthorityClass, CoreErrorKind, ManagerAction};

    fn brew() -> TemplateAdapter {
        TemplateAdapter::from_template(ManagerTemplate {
            id: "homebrew".to_string(),
            display_name: Some("Homebrew".to_string()),
            authority: AuthorityClass::Standard,
            program: "brew".into(),
            elevated: false,
            timeout_secs: None,
            env: [("HOMEBREW_NO_AUTO_UPDATE".to_string(), "1".to_string())].into(),
            commands: CommandTemplates {
                list_installed: Some(vec!["list".into(), "--versions".into()]),
                list_outdated: Some(vec!["outdated".into(), "--verbose".into()]),
                install: Some(vec!["install".into(), "{package}@{version}".into()]),
                upgrade: Some(vec!["upgrade".into(), "{package}".into()]),
                ..CommandTemplates::default()
            },
            outdated: OutdatedLayout {
                installed_column: Some(1),
                candidate_column: Some(3),
                trim_chars: "()".to_string(),
                pinned_marker: Some("[pinned".to_string()),
                ..OutdatedLayout::default()
            },
            installed: InstalledLayout::default(),
            failure_markers: vec!["Error:".to_string()],
        })
        .unwrap()
    }

    fn finished(stdout: &str) -> ProcessOutput {
        ProcessOutput {
            status: ProcessExitStatus::ExitCode(0),
            stdout: CapturedStream::from_bytes(stdout.as_bytes().to_vec()),
            stderr: CapturedStream::default(),
            started_at: SystemTime::now(),
            finished_at: SystemTime::now(),
        }
    }

    #[test]
    fn capabilities_follow_declared_templates() {
        let adapter = brew();
        assert!(adapter.capabilities().supports(ManagerAction::Upgrade));
        assert!(!adapter.capabilities().supports(ManagerAction::Uninstall));
        assert_eq!(
            adapter
                .build_command(ManagerAction::Uninstall, &ActionParams::package("git"))
                .unwrap_err()
                .kind,
            CoreErrorKind::UnsupportedCapability
        );
    }

    #[test]
    fn substitutes_each_argument_separately() {
        let command = brew()
            .build_command(
                ManagerAction::Upgrade,
                &ActionParams::package("git; rm -rf /"),
            )
            .unwrap();
        assert_eq!(command.command.args, vec!["upgrade", "git; rm -rf /"]);
        assert_eq!(
            command.command.env.get("HOMEBREW_NO_AUTO_UPDATE").map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn drops_arguments_with_missing_values() {
        let command = brew()
            .build_command(ManagerAction::Upgrade, &ActionParams::default())
            .unwrap();
        assert_eq!(command.command.args, vec!["upgrade"]);

        let install = brew()
            .build_command(ManagerAction::Install, &ActionParams::package("git"))
            .unwrap();
        assert_eq!(install.command.args, vec!["install"]);

        let pinned_install = brew()
            .build_command(
                ManagerAction::Install,
                &ActionParams::package("git").with_version("2.45.1"),
            )
            .unwrap();
        assert_eq!(pinned_install.command.args, vec!["install", "git@2.45.1"]);
    }

    #[test]
    fn rejects_option_injection() {
        let error = brew()
            .build_command(ManagerAction::Upgrade, &ActionParams::package("--force"))
            .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidInput);
    }

    #[test]
    fn rejects_unknown_placeholders() {
        let mut template = brew().template().clone();
        template.commands.search = Some(vec!["search".into(), "{term}".into()]);
        assert!(TemplateAdapter::from_template(template).is_err());
    }

    #[test]
    fn parses_outdated_columns() {
        let outcome = brew()
            .interpret(
                ManagerAction::ListOutdated,
                &ActionParams::default(),
                &finished("git (2.44.0) < 2.45.1\nnode (21.1.0) < 22.2.0 [pinned at 21.1.0]\n"),
            )
            .unwrap();

        let AdapterOutcome::Outdated(packages) = outcome else {
            panic!("expected outdated packages");
        };
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].package.name, "git");
        assert_eq!(packages[0].installed_version.as_deref(), Some("2.44.0"));
        assert_eq!(packages[0].candidate_version, "2.45.1");
        assert!(!packages[0].pinned);
        assert!(packages[1].pinned);
    }

    #[test]
    fn failure_marker_overrides_zero_exit() {
        let error = brew()
            .interpret(
                ManagerAction::Upgrade,
                &ActionParams::package("git"),
                &finished("Error: git is not installed\n"),
            )
            .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::ProcessFailure);
    }

    #[test]
    fn parses_installed_listing() {
        let outcome = brew()
            .interpret(
                ManagerAction::ListInstalled,
                &ActionParams::default(),
                &finished("git 2.45.1\nwget 1.24.5 1.21.4\nlonely\n"),
            )
            .unwrap();

        let AdapterOutcome::Installed(packages) = outcome else {
            panic!("expected installed packages");
        };
        let listed: Vec<(&str, Option<&str>)> = packages
            .iter()
            .map(|entry| (entry.package.name.as_str(), entry.installed_version.as_deref()))
            .collect();
        assert_eq!(
            listed,
            vec![
                ("git", Some("2.45.1")),
                ("wget", Some("1.24.5")),
                ("lonely", None)
            ]
        );
    }

    #[test]
    fn installed_names_can_embed_their_version() {
        let mut template = brew().template().clone();
        template.installed = InstalledLayout {
            skip_lines: 1,
            name_column: 1,
            version_column: None,
            name_version_separator: Some("@".to_string()),
            ..InstalledLayout::default()
        };
        let adapter = TemplateAdapter::from_template(template).unwrap();

        let outcome = adapter
            .interpret(
                ManagerAction::ListInstalled,
                &ActionParams::default(),
                &finished("/usr/local/lib\n├── @vue/cli@5.0.8\n└── eslint@8.57.0\n"),
            )
            .unwrap();
        let AdapterOutcome::Installed(packages) = outcome else {
            panic!("expected installed packages");
        };
        assert_eq!(packages[0].package.name, "@vue/cli");
        assert_eq!(packages[0].installed_version.as_deref(), Some("5.0.8"));
        assert_eq!(packages[1].package.name, "eslint");
    }
}
