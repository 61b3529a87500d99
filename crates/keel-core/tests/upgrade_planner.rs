mod common;

use std::time::Duration;

use common::{Behavior, Event, Harness, harness, manager};
use keel_core::models::{
    AuthorityClass, CoreErrorKind, ManagerAction, OutdatedPackage, PackageRef, TaskStatus,
};
use keel_core::orchestration::{PlanScope, PlanStep, PlanStepStatus, UpgradePlan, WithheldReason};

const MANAGERS: [(&str, AuthorityClass); 3] = [
    ("brew", AuthorityClass::Authoritative),
    ("npm", AuthorityClass::Standard),
    ("softwareupdate", AuthorityClass::Guarded),
];

fn outdated(manager_id: &str, name: &str, installed: &str, candidate: &str) -> OutdatedPackage {
    OutdatedPackage {
        package: PackageRef::new(manager(manager_id), name),
        installed_version: Some(installed.to_string()),
        candidate_version: candidate.to_string(),
        pinned: false,
    }
}

async fn seeded() -> Harness {
    let h = harness(&MANAGERS).await;
    h.engine
        .record_outdated(manager("brew"), vec![outdated("brew", "wget", "1.21", "1.24")])
        .await
        .unwrap();
    h.engine
        .record_outdated(
            manager("npm"),
            vec![
                outdated("npm", "prettier", "3.0.0", "3.2.5"),
                outdated("npm", "eslint", "8.57.0", "9.1.0"),
            ],
        )
        .await
        .unwrap();
    h.engine
        .record_outdated(
            manager("softwareupdate"),
            vec![outdated("softwareupdate", "macOS", "14.4", "14.5")],
        )
        .await
        .unwrap();
    h
}

fn packages(plan: &UpgradePlan) -> Vec<String> {
    plan.steps
        .iter()
        .map(|step| format!("{}:{}", step.manager, step.package))
        .collect()
}

fn statuses(plan: &UpgradePlan) -> Vec<(String, PlanStepStatus)> {
    plan.steps
        .iter()
        .map(|step| (step.package.clone(), step.status))
        .collect()
}

#[tokio::test]
async fn preview_orders_by_authority_and_filters_pins_and_guarded() {
    let h = seeded().await;
    h.engine
        .pin_package(PackageRef::new(manager("npm"), "prettier"), None)
        .await
        .unwrap();

    let plan = h.engine.preview_plan(false, false).await.unwrap();
    assert_eq!(packages(&plan), vec!["brew:wget", "npm:eslint"]);
    assert!(plan.steps.iter().all(|step| step.status == PlanStepStatus::Planned));
    assert_eq!(
        plan.steps.iter().map(|step| step.order_index).collect::<Vec<_>>(),
        vec![0, 1]
    );

    let plan = h.engine.preview_plan(true, true).await.unwrap();
    assert_eq!(
        packages(&plan),
        vec![
            "brew:wget",
            "npm:eslint",
            "npm:prettier",
            "softwareupdate:macOS"
        ]
    );
    assert_eq!(plan.steps[3].authority, AuthorityClass::Guarded);
    assert_eq!(h.executor.spawn_count(), 0);
}

#[tokio::test]
async fn natively_pinned_packages_are_left_out() {
    let h = harness(&MANAGERS).await;
    let mut held = outdated("brew", "postgresql", "15", "16");
    held.pinned = true;
    h.engine
        .record_outdated(manager("brew"), vec![held, outdated("brew", "wget", "1.21", "1.24")])
        .await
        .unwrap();

    let plan = h.engine.preview_plan(false, false).await.unwrap();
    assert_eq!(packages(&plan), vec!["brew:wget"]);

    h.engine
        .unpin_package(PackageRef::new(manager("brew"), "postgresql"))
        .await
        .unwrap();
    let plan = h.engine.preview_plan(false, false).await.unwrap();
    assert_eq!(packages(&plan), vec!["brew:wget"]);
}

#[tokio::test]
async fn running_a_plan_upgrades_authoritative_managers_first() {
    let h = seeded().await;
    h.executor
        .always("brew upgrade", Behavior::succeed("", Duration::from_millis(40)));

    let plan = h.engine.preview_plan(false, false).await.unwrap();
    let report = h.engine.run_plan(&plan, None).await.unwrap().wait().await.unwrap();
    assert!(!report.cancelled());
    assert_eq!(report.failed().count(), 0);

    let events = h.executor.events();
    let wget_done = events
        .iter()
        .position(|event| matches!(event, Event::Exited { command, .. } if command == "brew upgrade wget"))
        .unwrap();
    let first_npm = events
        .iter()
        .position(|event| matches!(event, Event::Started { manager, .. } if manager.as_str() == "npm"))
        .unwrap();
    assert!(wget_done < first_npm);

    let projected = h.engine.project_plan(&plan).await.unwrap();
    assert!(
        projected
            .steps
            .iter()
            .all(|step| step.status == PlanStepStatus::Completed)
    );
    // The plan handed in is never mutated.
    assert!(plan.steps.iter().all(|step| step.status == PlanStepStatus::Planned));
}

#[tokio::test]
async fn retry_resubmits_exactly_the_failed_steps() {
    let h = seeded().await;
    h.executor
        .once("npm upgrade eslint", Behavior::fail(1, "ERESOLVE could not resolve"));

    let plan = h.engine.preview_plan(false, false).await.unwrap();
    h.engine.run_plan(&plan, None).await.unwrap().wait().await.unwrap();

    let projected = h.engine.project_plan(&plan).await.unwrap();
    assert_eq!(
        statuses(&projected),
        vec![
            ("wget".to_string(), PlanStepStatus::Completed),
            ("eslint".to_string(), PlanStepStatus::Failed),
            ("prettier".to_string(), PlanStepStatus::Completed),
        ]
    );
    let failed_task = h
        .engine
        .scheduler()
        .list_tasks(Default::default())
        .await
        .unwrap()
        .into_iter()
        .find(|task| task.status == TaskStatus::Failed)
        .unwrap();
    assert_eq!(failed_task.error.unwrap().kind, CoreErrorKind::ProcessFailure);

    let retry = h.engine.retry_failed(&plan).await.unwrap();
    assert_eq!(packages(retry.plan()), vec!["npm:eslint"]);
    retry.wait().await.unwrap();

    let started = h.executor.started_commands();
    let count = |command: &str| started.iter().filter(|started| *started == command).count();
    assert_eq!(count("npm upgrade eslint"), 2);
    assert_eq!(count("npm upgrade prettier"), 1);
    assert_eq!(count("brew upgrade wget"), 1);

    let projected = h.engine.project_plan(&plan).await.unwrap();
    assert!(
        projected
            .steps
            .iter()
            .all(|step| step.status == PlanStepStatus::Completed)
    );
}

#[tokio::test]
async fn scope_limits_the_run_to_chosen_managers() {
    let h = seeded().await;
    let plan = h.engine.preview_plan(false, false).await.unwrap();

    let scope = PlanScope::managers([manager("npm")]);
    let execution = h.engine.run_plan(&plan, Some(&scope)).await.unwrap();
    assert_eq!(packages(execution.plan()), vec!["npm:eslint", "npm:prettier"]);
    execution.wait().await.unwrap();

    assert!(
        h.executor
            .started_commands()
            .iter()
            .all(|command| command.starts_with("npm upgrade"))
    );
    let projected = h.engine.project_plan(&plan).await.unwrap();
    assert_eq!(projected.steps[0].status, PlanStepStatus::Planned);
}

#[tokio::test]
async fn outdated_records_must_belong_to_their_manager() {
    let h = harness(&MANAGERS).await;
    let error = h
        .engine
        .record_outdated(manager("npm"), vec![outdated("brew", "wget", "1.21", "1.24")])
        .await
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::InvalidInput);
    assert!(h.engine.list_outdated().await.unwrap().is_empty());
}

#[tokio::test]
async fn pins_are_listed_and_removed() {
    let h = harness(&MANAGERS).await;
    let package = PackageRef::new(manager("npm"), "eslint");

    let pin = h
        .engine
        .pin_package(package.clone(), Some("8.57.0".to_string()))
        .await
        .unwrap();
    assert_eq!(pin.pinned_version.as_deref(), Some("8.57.0"));
    assert_eq!(h.engine.list_pins().await.unwrap().len(), 1);

    assert!(h.engine.unpin_package(package.clone()).await.unwrap());
    assert!(!h.engine.unpin_package(package).await.unwrap());
    assert!(h.engine.list_pins().await.unwrap().is_empty());

    let error = h
        .engine
        .pin_package(PackageRef::new(manager("zypper"), "vim"), None)
        .await
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::InvalidInput);
}

fn guarded_step(order_index: usize) -> PlanStep {
    PlanStep {
        order_index,
        manager: manager("softwareupdate"),
        // Claims a lower authority than the registry grants.
        authority: AuthorityClass::Standard,
        package: "macOS".to_string(),
        installed_version: Some("14.4".to_string()),
        candidate_version: "14.5".to_string(),
        status: PlanStepStatus::Planned,
    }
}

#[tokio::test]
async fn run_withholds_guarded_steps_the_plan_never_allowed() {
    let h = seeded().await;
    let mut plan = h.engine.preview_plan(false, false).await.unwrap();
    let next = plan.steps.len();
    plan.steps.push(guarded_step(next));

    let execution = h.engine.run_plan(&plan, None).await.unwrap();
    assert_eq!(
        packages(execution.plan()),
        vec!["brew:wget", "npm:eslint", "npm:prettier"]
    );
    assert_eq!(execution.withheld().len(), 1);
    assert_eq!(execution.withheld()[0].reason, WithheldReason::GuardedNotAllowed);
    assert_eq!(execution.withheld()[0].step.authority, AuthorityClass::Guarded);
    execution.wait().await.unwrap();

    assert!(
        h.executor
            .started_commands()
            .iter()
            .all(|command| !command.starts_with("softwareupdate"))
    );
}

#[tokio::test]
async fn run_rejects_steps_for_unknown_managers() {
    let h = seeded().await;
    let mut plan = h.engine.preview_plan(false, false).await.unwrap();
    plan.steps[0].manager = manager("zypper");

    let error = h.engine.run_plan(&plan, None).await.err().unwrap();
    assert_eq!(error.kind, CoreErrorKind::InvalidInput);
    assert_eq!(h.executor.spawn_count(), 0);
}

#[tokio::test]
async fn run_withholds_steps_pinned_after_the_plan_was_made() {
    let h = seeded().await;
    let plan = h.engine.preview_plan(false, false).await.unwrap();
    h.engine
        .pin_package(PackageRef::new(manager("npm"), "eslint"), None)
        .await
        .unwrap();

    let execution = h.engine.run_plan(&plan, None).await.unwrap();
    assert_eq!(packages(execution.plan()), vec!["brew:wget", "npm:prettier"]);
    assert_eq!(execution.withheld()[0].reason, WithheldReason::Pinned);
    execution.wait().await.unwrap();
    assert!(
        !h.executor
            .started_commands()
            .contains(&"npm upgrade eslint".to_string())
    );
}

#[tokio::test]
async fn safe_mode_keeps_guarded_upgrades_out_even_when_allowed() {
    let h = seeded().await;
    let allowed = h.engine.preview_plan(false, true).await.unwrap();
    assert!(packages(&allowed).contains(&"softwareupdate:macOS".to_string()));

    h.engine.set_safe_mode(true).await.unwrap();
    assert!(h.engine.safe_mode());

    let plan = h.engine.preview_plan(false, true).await.unwrap();
    assert_eq!(
        packages(&plan),
        vec!["brew:wget", "npm:eslint", "npm:prettier"]
    );

    let execution = h.engine.run_plan(&allowed, None).await.unwrap();
    assert_eq!(execution.withheld().len(), 1);
    assert_eq!(execution.withheld()[0].reason, WithheldReason::SafeMode);
    execution.wait().await.unwrap();
    assert!(
        h.executor
            .started_commands()
            .iter()
            .all(|command| !command.starts_with("softwareupdate"))
    );
}

#[tokio::test]
async fn disabled_manager_is_left_out_of_plans_and_refused() {
    let h = seeded().await;
    let before = h.engine.preview_plan(false, false).await.unwrap();

    h.engine
        .set_manager_enabled(manager("npm"), false)
        .await
        .unwrap();
    assert!(!h.engine.is_manager_enabled(&manager("npm")));
    assert_eq!(h.engine.disabled_managers(), vec![manager("npm")]);

    let plan = h.engine.preview_plan(false, false).await.unwrap();
    assert_eq!(packages(&plan), vec!["brew:wget"]);

    let execution = h.engine.run_plan(&before, None).await.unwrap();
    assert_eq!(packages(execution.plan()), vec!["brew:wget"]);
    assert!(
        execution
            .withheld()
            .iter()
            .all(|withheld| withheld.reason == WithheldReason::ManagerDisabled)
    );
    execution.wait().await.unwrap();

    let error = h
        .engine
        .submit_task(manager("npm"), ManagerAction::Upgrade, common::upgrade("eslint"))
        .await
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::UnsupportedCapability);
    assert_eq!(error.manager, Some(manager("npm")));
    assert_eq!(h.executor.started_commands(), vec!["brew upgrade wget"]);

    h.engine.set_manager_enabled(manager("npm"), true).await.unwrap();
    let plan = h.engine.preview_plan(false, false).await.unwrap();
    assert_eq!(packages(&plan).len(), 3);
}

#[tokio::test]
async fn preferences_survive_an_engine_restart() {
    let h = seeded().await;
    h.engine
        .set_manager_enabled(manager("brew"), false)
        .await
        .unwrap();
    h.engine.set_safe_mode(true).await.unwrap();

    let restarted = common::harness_with_store(&MANAGERS, h.store.clone()).await;
    assert!(restarted.engine.safe_mode());
    assert_eq!(restarted.engine.disabled_managers(), vec![manager("brew")]);
}

#[tokio::test]
async fn retry_with_no_failures_submits_nothing() {
    let h = seeded().await;
    let plan = h.engine.preview_plan(false, false).await.unwrap();
    h.engine.run_plan(&plan, None).await.unwrap().wait().await.unwrap();
    let spawned = h.executor.spawn_count();

    let retry = h.engine.retry_failed(&plan).await.unwrap();
    assert!(retry.plan().is_empty());
    assert!(retry.withheld().is_empty());
    let report = retry.wait().await.unwrap();

    assert!(report.phases.is_empty());
    assert!(!report.cancelled());
    assert_eq!(h.executor.spawn_count(), spawned);
}

#[tokio::test]
async fn refresh_records_the_installed_inventory() {
    let h = harness(&MANAGERS).await;
    h.executor.always(
        "npm installed",
        Behavior::succeed("eslint 8.57.0\ntypescript 5.4.5\n", Duration::from_millis(5)),
    );
    h.executor.always(
        "brew installed",
        Behavior::succeed("wget 1.24.5\n", Duration::from_millis(5)),
    );
    h.engine
        .set_manager_enabled(manager("softwareupdate"), false)
        .await
        .unwrap();

    let report = h.engine.refresh_all().unwrap().wait().await.unwrap();
    let actions: Vec<(String, ManagerAction)> = report
        .phases
        .iter()
        .flat_map(|phase| phase.tasks.iter())
        .map(|task| (task.request.manager.to_string(), task.request.action))
        .collect();
    assert!(actions.iter().all(|(manager, _)| manager != "softwareupdate"));
    assert!(actions.contains(&("npm".to_string(), ManagerAction::ListInstalled)));

    let installed: Vec<String> = h
        .engine
        .list_installed()
        .await
        .unwrap()
        .into_iter()
        .map(|entry| format!("{}@{}", entry.package, entry.installed_version.unwrap_or_default()))
        .collect();
    assert_eq!(
        installed,
        vec!["brew:wget@1.24.5", "npm:eslint@8.57.0", "npm:typescript@5.4.5"]
    );
}
