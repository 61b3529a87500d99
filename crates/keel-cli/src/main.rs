mod cli;
mod render;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use keel_core::logging::init_logging;
use keel_core::models::{
    ActionParams, ManagerAction, ManagerId, PackageRef, TaskId, TaskSnapshot, TaskStatus,
};
use keel_core::orchestration::{
    OrderedRunReport, PlanExecution, PlanScope, TaskRequest, TaskWindow,
};
use keel_core::service::ServiceHost;
use keel_core::{Engine, EngineConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::cli::{Cli, Command};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = EngineConfig::load_or_default(cli.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(database) = cli.database {
        config.database = Some(database);
    }
    if cli.ephemeral {
        config.ephemeral = true;
    }
    init_logging(cli.log.as_deref().or(config.log.as_deref()));

    let engine = Engine::open(&config)
        .await
        .context("failed to start engine")?;
    let json = cli.json;

    match cli.command {
        Command::Managers => {
            let managers = engine.managers();
            if json {
                render::json(&managers)?;
            } else {
                render::managers(&managers);
            }
        }
        Command::Submit {
            manager,
            action,
            package,
            version,
            query,
            label,
        } => {
            let action: ManagerAction = action.parse().map_err(anyhow::Error::msg)?;
            let params = ActionParams {
                package,
                version,
                query,
            };
            let mut request = TaskRequest::new(ManagerId::new(manager), action, params);
            request.label = label;
            let task_id = engine.submit(request).await?;
            tracing::debug!(%task_id, "task submitted");
            let task = wait_with_interrupt(&engine, task_id).await?;
            if json {
                render::json(&task)?;
            } else {
                render::task(&task);
                if let Some(output) = engine.get_task_output(task_id) {
                    render::output(&output);
                }
            }
            return Ok(exit_for(task.status));
        }
        Command::Tasks { limit, active } => {
            let tasks = engine
                .list_tasks(TaskWindow {
                    limit,
                    active_only: active,
                })
                .await?;
            if json {
                render::json(&tasks)?;
            } else {
                render::tasks(&tasks);
            }
        }
        Command::Status { task_id } => {
            let task = engine.task_status(TaskId(task_id)).await?;
            if json {
                render::json(&task)?;
            } else {
                render::task(&task);
            }
        }
        Command::Output { task_id } => match engine.get_task_output(TaskId(task_id)) {
            Some(output) if json => render::json(&output)?,
            Some(output) => render::output(&output),
            None => bail!("no captured output for task {task_id} in this process"),
        },
        Command::Cancel { task_id } => {
            let cancelled = engine.cancel_task(TaskId(task_id)).await?;
            if json {
                render::json(&serde_json::json!({ "task_id": task_id, "cancelled": cancelled }))?;
            } else if cancelled {
                println!("cancellation requested for task {task_id}");
            } else {
                println!("task {task_id} is not cancellable from this process");
            }
        }
        Command::Preview {
            include_pinned,
            allow_guarded,
        } => {
            let plan = engine.preview_plan(include_pinned, allow_guarded).await?;
            if json {
                render::json(&plan)?;
            } else {
                render::plan(&plan);
            }
        }
        Command::UpgradeAll {
            include_pinned,
            allow_guarded,
            managers,
            retry_failed,
            no_refresh,
        } => {
            if !no_refresh {
                let refresh = engine.refresh_all()?;
                let report = refresh.wait().await?;
                for failure in report.failed() {
                    tracing::warn!(
                        manager = %failure.request.manager,
                        error = ?failure.error,
                        "refresh task failed"
                    );
                }
            }

            let plan = engine.preview_plan(include_pinned, allow_guarded).await?;
            if plan.is_empty() {
                if json {
                    render::json(&plan)?;
                } else {
                    println!("nothing to upgrade");
                }
                return Ok(ExitCode::SUCCESS);
            }
            let scope = (!managers.is_empty())
                .then(|| PlanScope::managers(managers.into_iter().map(ManagerId::new)));

            let mut report = drive_plan(engine.run_plan(&plan, scope.as_ref()).await?).await?;
            if retry_failed && !report.cancelled() && report.failed().next().is_some() {
                report = drive_plan(engine.retry_failed(&plan).await?).await?;
            }

            let final_plan = engine.project_plan(&plan).await?;
            if json {
                render::json(&serde_json::json!({ "plan": final_plan, "report": report }))?;
            } else {
                render::report(&report);
                render::plan(&final_plan);
            }
            if report.cancelled() || report.failed().next().is_some() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Refresh => {
            let run = engine.refresh_all()?;
            let report = run.wait().await?;
            let outdated = engine.list_outdated().await?;
            let installed = engine.list_installed().await?;
            if json {
                render::json(&serde_json::json!({
                    "report": report,
                    "outdated": outdated,
                    "installed": installed,
                }))?;
            } else {
                render::report(&report);
                println!("{} installed package(s) recorded", installed.len());
                println!("{} outdated package(s) recorded", outdated.len());
            }
        }
        Command::Pin {
            manager,
            package,
            version,
        } => {
            let pin = engine
                .pin_package(PackageRef::new(ManagerId::new(manager), package), version)
                .await?;
            if json {
                render::json(&pin)?;
            } else {
                println!("pinned {}", pin.package);
            }
        }
        Command::Unpin { manager, package } => {
            let package = PackageRef::new(ManagerId::new(manager), package);
            let removed = engine.unpin_package(package.clone()).await?;
            if json {
                render::json(&serde_json::json!({ "package": package, "removed": removed }))?;
            } else if removed {
                println!("unpinned {package}");
            } else {
                println!("{package} was not pinned");
            }
        }
        Command::Pins => {
            let pins = engine.list_pins().await?;
            if json {
                render::json(&pins)?;
            } else {
                render::pins(&pins);
            }
        }
        Command::Installed => {
            let installed = engine.list_installed().await?;
            if json {
                render::json(&installed)?;
            } else {
                render::installed(&installed);
            }
        }
        Command::Enable { manager } => {
            engine.set_manager_enabled(ManagerId::new(manager), true).await?;
            show_preferences(&engine, json)?;
        }
        Command::Disable { manager } => {
            engine.set_manager_enabled(ManagerId::new(manager), false).await?;
            show_preferences(&engine, json)?;
        }
        Command::SafeMode { state } => {
            if let Some(state) = state {
                engine.set_safe_mode(state == "on").await?;
            }
            show_preferences(&engine, json)?;
        }
        Command::Prune { days } => {
            let retention = days
                .map(|days| Duration::from_secs(days * SECONDS_PER_DAY))
                .unwrap_or_else(|| config.retention());
            let count = engine.prune_tasks(retention).await?;
            if json {
                render::json(&serde_json::json!({ "pruned": count }))?;
            } else {
                println!("pruned {count} task(s)");
            }
        }
        Command::Serve => serve(engine).await?,
    }

    Ok(ExitCode::SUCCESS)
}

/// Waits for a task; the first Ctrl-C asks the engine to cancel it and the
/// wait continues until the task settles.
async fn wait_with_interrupt(engine: &Engine, task_id: TaskId) -> Result<TaskSnapshot> {
    let wait = engine.wait_for_task(task_id, None);
    tokio::pin!(wait);
    tokio::select! {
        task = &mut wait => return Ok(task?),
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for interrupt")?;
            eprintln!("interrupted; cancelling task {task_id}");
            engine.cancel_task(task_id).await?;
        }
    }
    Ok(wait.await?)
}

async fn drive_plan(execution: PlanExecution) -> Result<OrderedRunReport> {
    render::withheld(execution.withheld());
    let (plan, run) = execution.into_parts();
    tracing::info!(steps = plan.steps.len(), "upgrade run started");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for interrupt")?;
            eprintln!("interrupted; cancelling the remaining upgrade phases");
            run.cancel();
        }
        () = run.finished() => {}
    }
    Ok(run.wait().await?)
}

fn show_preferences(engine: &Engine, json: bool) -> Result<()> {
    let disabled = engine.disabled_managers();
    let safe_mode = engine.safe_mode();
    if json {
        render::json(&serde_json::json!({
            "disabled_managers": disabled,
            "safe_mode": safe_mode,
        }))?;
    } else {
        render::preferences(&disabled, safe_mode);
    }
    Ok(())
}

async fn serve(engine: Engine) -> Result<()> {
    let host = ServiceHost::new(Arc::new(engine));
    let session = host.connect()?;
    tracing::info!("serving requests on stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let mut response = session.handle_json(&line).await;
        response.push('\n');
        stdout.write_all(response.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}

fn exit_for(status: TaskStatus) -> ExitCode {
    match status {
        TaskStatus::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}
