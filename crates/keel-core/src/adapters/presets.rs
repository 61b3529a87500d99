use crate::adapters::command_template::{
    CommandTemplates, InstalledLayout, ManagerTemplate, OutdatedLayout,
};
use crate::models::AuthorityClass;

fn args(values: &[&str]) -> Option<Vec<String>> {
    Some(values.iter().map(|value| value.to_string()).collect())
}

/// Managers registered when the configuration declares none.
pub fn builtin_templates() -> Vec<ManagerTemplate> {
    vec![
        ManagerTemplate {
            id: "mise".to_string(),
            display_name: Some("mise".to_string()),
            authority: AuthorityClass::Authoritative,
            program: "mise".into(),
            elevated: false,
            timeout_secs: None,
            env: Default::default(),
            commands: CommandTemplates {
                list_installed: args(&["ls", "--installed"]),
                list_outdated: args(&["outdated"]),
                install: args(&["install", "{package}@{version}"]),
                uninstall: args(&["uninstall", "{package}"]),
                upgrade: args(&["upgrade", "{package}"]),
                ..CommandTemplates::default()
            },
            outdated: OutdatedLayout {
                skip_lines: 1,
                installed_column: Some(2),
                candidate_column: Some(3),
                ..OutdatedLayout::default()
            },
            installed: InstalledLayout::default(),
            failure_markers: Vec::new(),
        },
        ManagerTemplate {
            id: "rustup".to_string(),
            display_name: Some("rustup".to_string()),
            authority: AuthorityClass::Authoritative,
            program: "rustup".into(),
            elevated: false,
            timeout_secs: None,
            env: Default::default(),
            commands: CommandTemplates {
                list_installed: args(&["toolchain", "list"]),
                list_outdated: args(&["check"]),
                install: args(&["toolchain", "install", "{package}"]),
                uninstall: args(&["toolchain", "uninstall", "{package}"]),
                upgrade: args(&["update", "{package}"]),
                ..CommandTemplates::default()
            },
            outdated: OutdatedLayout {
                line_contains: Some("Update available".to_string()),
                installed_column: Some(5),
                candidate_column: Some(9),
                ..OutdatedLayout::default()
            },
            installed: InstalledLayout {
                version_column: None,
                ..InstalledLayout::default()
            },
            failure_markers: Vec::new(),
        },
        ManagerTemplate {
            id: "homebrew".to_string(),
            display_name: Some("Homebrew".to_string()),
            authority: AuthorityClass::Standard,
            program: "brew".into(),
            elevated: false,
            timeout_secs: None,
            env: [("HOMEBREW_NO_AUTO_UPDATE".to_string(), "1".to_string())].into(),
            commands: CommandTemplates {
                list_installed: args(&["list", "--formula", "--versions"]),
                list_outdated: args(&["outdated", "--formula", "--verbose"]),
                search: args(&["search", "{query}"]),
                install: args(&["install", "{package}"]),
                uninstall: args(&["uninstall", "{package}"]),
                upgrade: args(&["upgrade", "{package}"]),
                pin: args(&["pin", "{package}"]),
                unpin: args(&["unpin", "{package}"]),
            },
            outdated: OutdatedLayout {
                installed_column: Some(1),
                candidate_column: Some(3),
                trim_chars: "()".to_string(),
                pinned_marker: Some("[pinned".to_string()),
                ..OutdatedLayout::default()
            },
            installed: InstalledLayout::default(),
            failure_markers: Vec::new(),
        },
        ManagerTemplate {
            id: "npm".to_string(),
            display_name: Some("npm (global)".to_string()),
            authority: AuthorityClass::Standard,
            program: "npm".into(),
            elevated: false,
            timeout_secs: None,
            env: Default::default(),
            commands: CommandTemplates {
                list_installed: args(&["ls", "--global", "--depth=0"]),
                list_outdated: args(&["outdated", "--global"]),
                search: args(&["search", "{query}"]),
                install: args(&["install", "--global", "{package}"]),
                uninstall: args(&["uninstall", "--global", "{package}"]),
                upgrade: args(&["install", "--global", "{package}@latest"]),
                ..CommandTemplates::default()
            },
            outdated: OutdatedLayout {
                skip_lines: 1,
                installed_column: Some(1),
                candidate_column: Some(3),
                ..OutdatedLayout::default()
            },
            installed: InstalledLayout {
                skip_lines: 1,
                name_column: 1,
                version_column: None,
                name_version_separator: Some("@".to_string()),
                ..InstalledLayout::default()
            },
            failure_markers: vec!["npm ERR!".to_string()],
        },
        ManagerTemplate {
            id: "pipx".to_string(),
            display_name: Some("pipx".to_string()),
            authority: AuthorityClass::Standard,
            program: "pipx".into(),
            elevated: false,
            timeout_secs: None,
            env: Default::default(),
            commands: CommandTemplates {
                list_installed: args(&["list", "--short"]),
                install: args(&["install", "{package}"]),
                uninstall: args(&["uninstall", "{package}"]),
                upgrade: args(&["upgrade", "{package}"]),
                ..CommandTemplates::default()
            },
            outdated: OutdatedLayout::default(),
            installed: InstalledLayout::default(),
            failure_markers: Vec::new(),
        },
        ManagerTemplate {
            id: "cargo".to_string(),
            display_name: Some("cargo install".to_string()),
            authority: AuthorityClass::Standard,
            program: "cargo".into(),
            elevated: false,
            timeout_secs: None,
            env: Default::default(),
            commands: CommandTemplates {
                list_installed: args(&["install", "--list"]),
                search: args(&["search", "{query}"]),
                install: args(&["install", "{package}"]),
                uninstall: args(&["uninstall", "{package}"]),
                upgrade: args(&["install", "{package}"]),
                ..CommandTemplates::default()
            },
            outdated: OutdatedLayout::default(),
            installed: InstalledLayout {
                line_contains: Some(":".to_string()),
                version_trim_chars: "v:".to_string(),
                ..InstalledLayout::default()
            },
            failure_markers: Vec::new(),
        },
        ManagerTemplate {
            id: "softwareupdate".to_string(),
            display_name: Some("macOS Software Update".to_string()),
            authority: AuthorityClass::Guarded,
            program: "/usr/sbin/softwareupdate".into(),
            elevated: true,
            timeout_secs: Some(3600),
            env: Default::default(),
            commands: CommandTemplates {
                list_outdated: args(&["--list"]),
                upgrade: args(&["--install", "{package}"]),
                ..CommandTemplates::default()
            },
            outdated: OutdatedLayout {
                line_contains: Some("Label:".to_string()),
                separator: Some("Label:".to_string()),
                name_column: 1,
                installed_column: None,
                candidate_column: None,
                ..OutdatedLayout::default()
            },
            installed: InstalledLayout::default(),
            failure_markers: Vec::new(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::builtin_templates;
    use crate::adapters::{AdapterOutcome, ManagerAdapter, TemplateAdapter};
    use crate::execution::{CapturedStream, ProcessExitStatus, ProcessOutput};
    use crate::models::{ActionParams, AuthorityClass, ManagerAction};

    #[test]
    fn builtin_templates_are_valid_adapters() {
        for template in builtin_templates() {
            let id = template.id.clone();
            let adapter = TemplateAdapter::from_template(template)
                .unwrap_or_else(|error| panic!("{id}: {error}"));
            assert!(
                adapter.template().commands.get(ManagerAction::Upgrade).is_some(),
                "{id} should support upgrades"
            );
        }
    }

    #[test]
    fn only_system_updates_are_guarded() {
        let guarded: Vec<String> = builtin_templates()
            .into_iter()
            .filter(|template| template.authority == AuthorityClass::Guarded)
            .map(|template| template.id)
            .collect();
        assert_eq!(guarded, vec!["softwareupdate".to_string()]);
    }

    #[test]
    fn cargo_listing_skips_binary_lines() {
        let cargo = builtin_templates()
            .into_iter()
            .find(|template| template.id == "cargo")
            .map(TemplateAdapter::from_template)
            .unwrap()
            .unwrap();
        let output = ProcessOutput {
            status: ProcessExitStatus::ExitCode(0),
            stdout: CapturedStream::from_bytes(
                b"bat v0.24.0:\n    bat\nripgrep v14.1.0:\n    rg\n".to_vec(),
            ),
            stderr: CapturedStream::default(),
            started_at: SystemTime::now(),
            finished_at: SystemTime::now(),
        };

        let Ok(AdapterOutcome::Installed(packages)) =
            cargo.interpret(ManagerAction::ListInstalled, &ActionParams::default(), &output)
        else {
            panic!("expected installed packages");
        };
        let listed: Vec<(String, Option<String>)> = packages
            .into_iter()
            .map(|entry| (entry.package.name, entry.installed_version))
            .collect();
        assert_eq!(
            listed,
            vec![
                ("bat".to_string(), Some("0.24.0".to_string())),
                ("ripgrep".to_string(), Some("14.1.0".to_string())),
            ]
        );
    }
}
