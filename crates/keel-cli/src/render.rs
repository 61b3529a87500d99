use std::time::SystemTime;

use keel_core::execution::TaskOutputRecord;
use keel_core::models::{InstalledPackage, ManagerDescriptor, ManagerId, PinRecord, TaskSnapshot};
use keel_core::orchestration::{OrderedRunReport, UpgradePlan, WithheldStep};
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub fn json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn timestamp(value: SystemTime) -> String {
    OffsetDateTime::from(value)
        .format(&Rfc3339)
        .unwrap_or_else(|_| "-".to_string())
}

pub fn managers(descriptors: &[ManagerDescriptor]) {
    println!("{:<16} {:<14} CAPABILITIES", "MANAGER", "AUTHORITY");
    for descriptor in descriptors {
        let capabilities: Vec<&str> = descriptor
            .capabilities
            .iter()
            .map(|action| action.as_str())
            .collect();
        println!(
            "{:<16} {:<14} {}",
            descriptor.id,
            descriptor.authority,
            capabilities.join(",")
        );
    }
}

pub fn tasks(tasks: &[TaskSnapshot]) {
    if tasks.is_empty() {
        println!("no tasks");
        return;
    }
    println!("{:>6}  {:<10} {:<14} {:<26} LABEL", "ID", "STATUS", "MANAGER", "CREATED");
    for task in tasks {
        println!(
            "{:>6}  {:<10} {:<14} {:<26} {}",
            task.id,
            task.status,
            task.manager,
            timestamp(task.created_at),
            task.label
        );
    }
}

pub fn task(task: &TaskSnapshot) {
    println!("task {}: {}", task.id, task.label);
    println!("  manager:  {}", task.manager);
    println!("  action:   {}", task.action);
    println!("  status:   {}", task.status);
    println!("  created:  {}", timestamp(task.created_at));
    if let Some(started_at) = task.started_at {
        println!("  started:  {}", timestamp(started_at));
    }
    if let Some(finished_at) = task.finished_at {
        println!("  finished: {}", timestamp(finished_at));
    }
    if let Some(error) = &task.error {
        println!("  error:    {error}");
    }
}

pub fn output(record: &TaskOutputRecord) {
    if let Some(command) = &record.command {
        println!("$ {command}");
    }
    if let Some(stdout) = &record.stdout {
        print!("{stdout}");
    }
    if let Some(stderr) = &record.stderr {
        eprint!("{stderr}");
    }
}

pub fn plan(plan: &UpgradePlan) {
    if plan.is_empty() {
        println!("nothing to upgrade");
        return;
    }
    println!(
        "{:>3}  {:<14} {:<14} {:<28} {:<14} {:<14} STATUS",
        "#", "AUTHORITY", "MANAGER", "PACKAGE", "INSTALLED", "CANDIDATE"
    );
    for step in &plan.steps {
        println!(
            "{:>3}  {:<14} {:<14} {:<28} {:<14} {:<14} {:?}",
            step.order_index,
            step.authority,
            step.manager,
            step.package,
            step.installed_version.as_deref().unwrap_or("-"),
            step.candidate_version,
            step.status
        );
    }
}

pub fn report(report: &OrderedRunReport) {
    for phase in &report.phases {
        println!("phase {}:", phase.authority);
        for task in &phase.tasks {
            let id = task
                .task_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string());
            match &task.error {
                Some(error) => println!("  [{id}] {} {}: {error}", task.status, task.request.display_label()),
                None => println!("  [{id}] {} {}", task.status, task.request.display_label()),
            }
        }
    }
    for authority in &report.skipped {
        println!("phase {authority}: skipped");
    }
    if report.cancelled() {
        println!("run cancelled");
    }
}

pub fn pins(pins: &[PinRecord]) {
    if pins.is_empty() {
        println!("no pins");
        return;
    }
    for pin in pins {
        match &pin.pinned_version {
            Some(version) => println!("{} @ {version}", pin.package),
            None => println!("{}", pin.package),
        }
    }
}

pub fn withheld(withheld: &[WithheldStep]) {
    for entry in withheld {
        eprintln!(
            "withheld {}:{} ({:?})",
            entry.step.manager, entry.step.package, entry.reason
        );
    }
}

pub fn installed(packages: &[InstalledPackage]) {
    if packages.is_empty() {
        println!("no installed packages recorded; run `keel refresh`");
        return;
    }
    println!("{:<14} {:<32} VERSION", "MANAGER", "PACKAGE");
    for entry in packages {
        println!(
            "{:<14} {:<32} {}",
            entry.package.manager,
            entry.package.name,
            entry.installed_version.as_deref().unwrap_or("-")
        );
    }
}

pub fn preferences(disabled: &[ManagerId], safe_mode: bool) {
    println!("safe mode: {}", if safe_mode { "on" } else { "off" });
    if disabled.is_empty() {
        println!("all managers enabled");
    } else {
        let names: Vec<String> = disabled.iter().map(ToString::to_string).collect();
        println!("disabled: {}", names.join(", "));
    }
}
