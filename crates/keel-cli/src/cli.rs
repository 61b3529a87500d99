use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Coordinates package managers: serialized per manager, ordered by authority")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Engine configuration file (TOML).
    #[arg(short, long, global = true, env = "KEEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// SQLite database path; overrides the config file.
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    /// Keep all state in memory for this invocation.
    #[arg(long, global = true)]
    pub ephemeral: bool,

    /// Tracing filter directive, e.g. `debug` or `keel_core=trace`.
    #[arg(long, global = true)]
    pub log: Option<String>,

    /// Print machine-readable JSON instead of tables.
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// List registered managers with their authority and capabilities.
    Managers,

    /// Run one action on one manager and wait for it to finish.
    Submit {
        manager: String,
        action: String,
        #[arg(long)]
        package: Option<String>,
        #[arg(long = "pkg-version")]
        version: Option<String>,
        #[arg(long)]
        query: Option<String>,
        #[arg(long)]
        label: Option<String>,
    },

    /// Recent tasks, newest first.
    Tasks {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Only queued and running tasks.
        #[arg(long)]
        active: bool,
    },

    Status {
        task_id: u64,
    },

    /// Captured stdout/stderr of a task run by this process.
    Output {
        task_id: u64,
    },

    Cancel {
        task_id: u64,
    },

    /// Show the upgrade plan without running it.
    Preview {
        #[arg(long)]
        include_pinned: bool,
        #[arg(long)]
        allow_guarded: bool,
    },

    /// Upgrade everything outdated, phase by phase. Ctrl-C cancels the run.
    UpgradeAll {
        #[arg(long)]
        include_pinned: bool,
        #[arg(long)]
        allow_guarded: bool,
        /// Restrict the run to these managers.
        #[arg(long = "manager")]
        managers: Vec<String>,
        /// Retry failed steps once after the run.
        #[arg(long)]
        retry_failed: bool,
        /// Skip the outdated refresh before planning.
        #[arg(long)]
        no_refresh: bool,
    },

    /// Refresh installed and outdated package data from every enabled manager.
    Refresh,

    /// Exclude a package from bulk upgrades.
    Pin {
        manager: String,
        package: String,
        #[arg(long = "pkg-version")]
        version: Option<String>,
    },

    Unpin {
        manager: String,
        package: String,
    },

    Pins,

    /// Installed packages recorded by the last refresh.
    Installed,

    /// Allow a manager to take part in tasks, refreshes and plans again.
    Enable {
        manager: String,
    },

    /// Refuse new tasks for a manager and leave it out of refreshes and plans.
    Disable {
        manager: String,
    },

    /// Show or change safe mode. While on, Guarded upgrades never run.
    SafeMode {
        #[arg(value_parser = ["on", "off"])]
        state: Option<String>,
    },

    /// Delete terminal tasks older than the retention window.
    Prune {
        /// Defaults to the configured retention.
        #[arg(long)]
        days: Option<u64>,
    },

    /// Serve JSON requests on stdin, one per line, answering on stdout.
    Serve,
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};

    use super::{Cli, Command};

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn upgrade_all_collects_repeated_managers() {
        let cli = Cli::parse_from([
            "keel",
            "upgrade-all",
            "--manager",
            "npm",
            "--manager",
            "pipx",
            "--allow-guarded",
        ]);
        match cli.command {
            Command::UpgradeAll {
                managers,
                allow_guarded,
                include_pinned,
                ..
            } => {
                assert_eq!(managers, vec!["npm", "pipx"]);
                assert!(allow_guarded);
                assert!(!include_pinned);
            }
            _ => panic!("expected upgrade-all"),
        }
    }

    #[test]
    fn safe_mode_accepts_only_on_or_off() {
        let cli = Cli::parse_from(["keel", "safe-mode", "on"]);
        assert!(matches!(cli.command, Command::SafeMode { state: Some(state) } if state == "on"));

        let cli = Cli::parse_from(["keel", "safe-mode"]);
        assert!(matches!(cli.command, Command::SafeMode { state: None }));

        assert!(Cli::try_parse_from(["keel", "safe-mode", "maybe"]).is_err());
    }
}
