#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use keel_core::adapters::{CommandTemplates, InstalledLayout, ManagerTemplate, OutdatedLayout};
use keel_core::engine::{Engine, EngineParts};
use keel_core::execution::{
    CapturedStream, ExecutionResult, ProcessExecutor, ProcessExitStatus, ProcessOutput,
    ProcessSpawnRequest, ProcessTerminationMode, ProcessWaitFuture, RunningProcess,
};
use keel_core::models::{AuthorityClass, CoreError, CoreErrorKind, ManagerAction, ManagerId};
use keel_core::orchestration::SchedulerSettings;
use keel_core::persistence::{InMemoryStore, RetryPolicy};
use keel_core::registry::AdapterRegistry;
use tokio::sync::Notify;

/// What a fake process does once spawned.
#[derive(Clone, Debug)]
pub enum Behavior {
    Succeed { stdout: String, delay: Duration },
    Fail { code: i32, stderr: String },
    /// Runs until terminated.
    Hang,
}

impl Behavior {
    pub fn ok() -> Self {
        Self::succeed("", Duration::from_millis(10))
    }

    pub fn succeed(stdout: &str, delay: Duration) -> Self {
        Self::Succeed {
            stdout: stdout.to_string(),
            delay,
        }
    }

    pub fn fail(code: i32, stderr: &str) -> Self {
        Self::Fail {
            code,
            stderr: stderr.to_string(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    Started { manager: ManagerId, command: String },
    Exited { manager: ManagerId, command: String },
}

#[derive(Default)]
struct ExecutorState {
    once: Vec<(String, VecDeque<Behavior>)>,
    always: Vec<(String, Behavior)>,
    events: Vec<Event>,
    running: HashMap<ManagerId, usize>,
    peak: HashMap<ManagerId, usize>,
    running_total: usize,
    peak_total: usize,
}

/// Scripted executor. Behaviors are matched by substring against
/// `program args...`; one-shot scripts win over standing ones, and anything
/// unmatched succeeds quickly with empty output.
#[derive(Clone, Default)]
pub struct FakeExecutor {
    state: Arc<Mutex<ExecutorState>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn once(&self, needle: &str, behavior: Behavior) {
        let mut state = self.state();
        match state.once.iter_mut().find(|(existing, _)| existing == needle) {
            Some((_, queue)) => queue.push_back(behavior),
            None => state
                .once
                .push((needle.to_string(), VecDeque::from([behavior]))),
        }
    }

    pub fn always(&self, needle: &str, behavior: Behavior) {
        self.state().always.push((needle.to_string(), behavior));
    }

    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    pub fn started_commands(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Started { command, .. } => Some(command),
                Event::Exited { .. } => None,
            })
            .collect()
    }

    pub fn spawn_count(&self) -> usize {
        self.started_commands().len()
    }

    pub fn peak_for(&self, manager: &str) -> usize {
        self.state()
            .peak
            .get(&ManagerId::new(manager))
            .copied()
            .unwrap_or(0)
    }

    pub fn peak_total(&self) -> usize {
        self.state().peak_total
    }

    fn state(&self) -> MutexGuard<'_, ExecutorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn behavior_for(&self, command: &str) -> Behavior {
        let mut state = self.state();
        if let Some((_, queue)) = state
            .once
            .iter_mut()
            .find(|(needle, queue)| !queue.is_empty() && command.contains(needle.as_str()))
            && let Some(behavior) = queue.pop_front()
        {
            return behavior;
        }
        state
            .always
            .iter()
            .rev()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, behavior)| behavior.clone())
            .unwrap_or_else(Behavior::ok)
    }

    fn started(&self, manager: &ManagerId, command: &str) {
        let mut state = self.state();
        state.events.push(Event::Started {
            manager: manager.clone(),
            command: command.to_string(),
        });
        let running = {
            let running = state.running.entry(manager.clone()).or_default();
            *running += 1;
            *running
        };
        let peak = state.peak.entry(manager.clone()).or_default();
        *peak = (*peak).max(running);
        state.running_total += 1;
        state.peak_total = state.peak_total.max(state.running_total);
    }

    fn exited(&self, manager: &ManagerId, command: &str) {
        let mut state = self.state();
        state.events.push(Event::Exited {
            manager: manager.clone(),
            command: command.to_string(),
        });
        if let Some(running) = state.running.get_mut(manager) {
            *running = running.saturating_sub(1);
        }
        state.running_total = state.running_total.saturating_sub(1);
    }
}

impl ProcessExecutor for FakeExecutor {
    fn spawn(&self, request: ProcessSpawnRequest) -> ExecutionResult<Box<dyn RunningProcess>> {
        let command = request.command.display();
        let behavior = self.behavior_for(&command);
        self.started(&request.manager, &command);
        Ok(Box::new(FakeProcess {
            executor: self.clone(),
            manager: request.manager,
            command,
            behavior,
            terminated: Arc::new(Notify::new()),
            consumed: AtomicBool::new(false),
        }))
    }
}

struct FakeProcess {
    executor: FakeExecutor,
    manager: ManagerId,
    command: String,
    behavior: Behavior,
    terminated: Arc<Notify>,
    consumed: AtomicBool,
}

impl RunningProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn terminate(&self, _mode: ProcessTerminationMode) -> ExecutionResult<()> {
        self.terminated.notify_one();
        Ok(())
    }

    fn wait(&self) -> ProcessWaitFuture {
        if self.consumed.swap(true, Ordering::SeqCst) {
            return Box::pin(async {
                Err(CoreError::new(
                    CoreErrorKind::Internal,
                    "fake process already consumed",
                ))
            });
        }

        let executor = self.executor.clone();
        let manager = self.manager.clone();
        let command = self.command.clone();
        let behavior = self.behavior.clone();
        let terminated = self.terminated.clone();
        Box::pin(async move {
            let started_at = SystemTime::now();
            let finished = async {
                match &behavior {
                    Behavior::Succeed { delay, .. } => tokio::time::sleep(*delay).await,
                    Behavior::Fail { .. } => tokio::time::sleep(Duration::from_millis(5)).await,
                    Behavior::Hang => std::future::pending::<()>().await,
                }
            };

            let (status, stdout, stderr) = tokio::select! {
                _ = finished => match &behavior {
                    Behavior::Succeed { stdout, .. } => {
                        (ProcessExitStatus::ExitCode(0), stdout.clone(), String::new())
                    }
                    Behavior::Fail { code, stderr } => {
                        (ProcessExitStatus::ExitCode(*code), String::new(), stderr.clone())
                    }
                    Behavior::Hang => unreachable!("hanging process finished"),
                },
                _ = terminated.notified() => {
                    (ProcessExitStatus::Terminated, String::new(), String::new())
                }
            };

            executor.exited(&manager, &command);
            Ok(ProcessOutput {
                status,
                stdout: CapturedStream::from_bytes(stdout.into_bytes()),
                stderr: CapturedStream::from_bytes(stderr.into_bytes()),
                started_at,
                finished_at: SystemTime::now(),
            })
        })
    }
}

/// Manager whose program is its own id: `upgrade <package>`,
/// `install <package>`, `search <query>`, `outdated` and `installed`.
pub fn template(id: &str, authority: AuthorityClass) -> ManagerTemplate {
    let args = |values: &[&str]| Some(values.iter().map(|value| value.to_string()).collect());
    ManagerTemplate {
        id: id.to_string(),
        display_name: None,
        authority,
        program: PathBuf::from(id),
        elevated: false,
        timeout_secs: None,
        env: Default::default(),
        commands: CommandTemplates {
            list_installed: args(&["installed"]),
            list_outdated: args(&["outdated"]),
            search: args(&["search", "{query}"]),
            install: args(&["install", "{package}"]),
            upgrade: args(&["upgrade", "{package}"]),
            ..CommandTemplates::default()
        },
        outdated: OutdatedLayout::default(),
        installed: InstalledLayout::default(),
        failure_markers: Vec::new(),
    }
}

pub fn registry(managers: &[(&str, AuthorityClass)]) -> AdapterRegistry {
    AdapterRegistry::from_templates(
        managers
            .iter()
            .map(|(id, authority)| template(id, *authority)),
    )
    .expect("test templates are valid")
}

pub fn fast_settings() -> SchedulerSettings {
    SchedulerSettings {
        retry: RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(1),
        },
        grace_period: Duration::from_millis(50),
        ..SchedulerSettings::default()
    }
}

pub struct Harness {
    pub engine: Engine,
    pub executor: FakeExecutor,
    pub store: Arc<InMemoryStore>,
}

pub async fn harness(managers: &[(&str, AuthorityClass)]) -> Harness {
    harness_with_store(managers, Arc::new(InMemoryStore::new())).await
}

pub async fn harness_with_store(
    managers: &[(&str, AuthorityClass)],
    store: Arc<InMemoryStore>,
) -> Harness {
    let executor = FakeExecutor::new();
    let parts = EngineParts {
        tasks: store.clone(),
        pins: store.clone(),
        packages: store.clone(),
        preferences: store.clone(),
        settings: fast_settings(),
        ..EngineParts::in_memory(registry(managers), Arc::new(executor.clone()))
    };
    let engine = Engine::start(parts).await.expect("engine starts");
    Harness {
        engine,
        executor,
        store,
    }
}

pub const WAIT: Option<Duration> = Some(Duration::from_secs(5));

pub fn upgrade(package: &str) -> keel_core::models::ActionParams {
    keel_core::models::ActionParams::package(package)
}

pub fn manager(id: &str) -> ManagerId {
    ManagerId::new(id)
}

pub const UPGRADE: ManagerAction = ManagerAction::Upgrade;

pub async fn wait_for_spawns(executor: &FakeExecutor, count: usize) {
    for _ in 0..400 {
        if executor.spawn_count() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {count} spawns, saw {}", executor.spawn_count());
}

pub async fn wait_for_status(
    engine: &Engine,
    task_id: keel_core::models::TaskId,
    wanted: keel_core::models::TaskStatus,
) {
    for _ in 0..400 {
        if engine.task_status(task_id).await.map(|task| task.status) == Ok(wanted) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {task_id} never reached {wanted}");
}
