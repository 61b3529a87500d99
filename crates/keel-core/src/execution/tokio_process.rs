use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

use crate::execution::{
    BoundedBuffer, CapturedStream, ElevationHelper, ExecutionResult, ProcessExecutor,
    ProcessExitStatus, ProcessOutput, ProcessSpawnRequest, ProcessTerminationMode,
    ProcessWaitFuture, RunningProcess, TaskOutputStore,
};
use crate::models::CoreErrorKind;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 128 * 1024;

const READ_CHUNK_BYTES: usize = 4096;
const OUTPUT_DRAIN_WINDOW: Duration = Duration::from_millis(250);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecutorSettings {
    /// How long a SIGTERM'd process group gets before SIGKILL.
    pub grace_period: Duration,
    /// Per-stream cap; older bytes are dropped past it.
    pub max_output_bytes: usize,
    pub askpass_helper: Option<PathBuf>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            askpass_helper: None,
        }
    }
}

/// Spawns each command as the leader of its own process group so that
/// termination reaches anything the manager forks.
pub struct TokioProcessExecutor {
    settings: ExecutorSettings,
    elevation: ElevationHelper,
    outputs: Option<Arc<TaskOutputStore>>,
}

impl Default for TokioProcessExecutor {
    fn default() -> Self {
        Self::new(ExecutorSettings::default())
    }
}

impl TokioProcessExecutor {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self {
            elevation: ElevationHelper::new(settings.askpass_helper.clone()),
            settings,
            outputs: None,
        }
    }

    pub fn with_output_store(mut self, outputs: Arc<TaskOutputStore>) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }
}

impl ProcessExecutor for TokioProcessExecutor {
    fn spawn(&self, request: ProcessSpawnRequest) -> ExecutionResult<Box<dyn RunningProcess>> {
        let command = if request.requires_elevation {
            self.elevation.wrap(&request)?
        } else {
            request.command.clone()
        };

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args);

        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|error| {
            request.error(
                CoreErrorKind::ProcessLaunchFailure,
                format!("failed to launch '{}': {error}", command.program.display()),
            )
        })?;

        let pid = child.id();
        let started_at = SystemTime::now();
        let stdout = Arc::new(Mutex::new(BoundedBuffer::new(self.settings.max_output_bytes)));
        let stderr = Arc::new(Mutex::new(BoundedBuffer::new(self.settings.max_output_bytes)));
        let readers = [
            child
                .stdout
                .take()
                .map(|pipe| spawn_reader(pipe, stdout.clone())),
            child
                .stderr
                .take()
                .map(|pipe| spawn_reader(pipe, stderr.clone())),
        ];

        tracing::debug!(
            manager = %request.manager,
            task_id = request.task_id.map(|id| id.0),
            action = %request.action,
            pid,
            elevated = request.requires_elevation,
            "spawned manager process"
        );

        let exited = Arc::new(AtomicBool::new(false));
        let deadline = Arc::new(Deadline::default());
        let watchdog = match (request.timeout, pid) {
            (Some(limit), Some(pid)) => Some(spawn_watchdog(
                &request,
                pid,
                limit,
                self.settings.grace_period,
                exited.clone(),
                deadline.clone(),
            )),
            _ => None,
        };

        Ok(Box::new(TokioRunningProcess {
            child: Mutex::new(Some(child)),
            pid,
            started_at,
            command_display: command.display(),
            stdout,
            stderr,
            readers: Mutex::new(Some(readers)),
            exited,
            deadline,
            watchdog: Mutex::new(watchdog),
            outputs: self.outputs.clone(),
            request,
        }))
    }
}

type SharedBuffer = Arc<Mutex<BoundedBuffer>>;

/// What the watchdog did once the deadline passed.
#[derive(Default)]
struct Deadline {
    expired: AtomicBool,
    killed: AtomicBool,
}

/// Enforces the timeout from spawn onwards, whether or not anyone is waiting
/// on the process: SIGTERM to the group at the deadline, SIGKILL if it is
/// still alive after the grace period.
fn spawn_watchdog(
    request: &ProcessSpawnRequest,
    pid: u32,
    limit: Duration,
    grace_period: Duration,
    exited: Arc<AtomicBool>,
    deadline: Arc<Deadline>,
) -> JoinHandle<()> {
    let manager = request.manager.clone();
    let task_id = request.task_id;
    tokio::spawn(async move {
        tokio::time::sleep(limit).await;
        if exited.load(Ordering::SeqCst) {
            return;
        }

        deadline.expired.store(true, Ordering::SeqCst);
        tracing::warn!(
            manager = %manager,
            task_id = task_id.map(|id| id.0),
            pid,
            timeout_ms = limit.as_millis() as u64,
            "process exceeded its timeout; terminating process group"
        );
        let _ = signal_process_group(pid, libc::SIGTERM);

        tokio::time::sleep(grace_period).await;
        if !exited.load(Ordering::SeqCst) {
            deadline.killed.store(true, Ordering::SeqCst);
            let _ = signal_process_group(pid, libc::SIGKILL);
        }
    })
}

fn spawn_reader<R>(mut pipe: R, buffer: SharedBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0_u8; READ_CHUNK_BYTES];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(read) => buffer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(&chunk[..read]),
            }
        }
    })
}

struct TokioRunningProcess {
    child: Mutex<Option<tokio::process::Child>>,
    pid: Option<u32>,
    started_at: SystemTime,
    command_display: String,
    stdout: SharedBuffer,
    stderr: SharedBuffer,
    readers: Mutex<Option<[Option<JoinHandle<()>>; 2]>>,
    exited: Arc<AtomicBool>,
    deadline: Arc<Deadline>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    outputs: Option<Arc<TaskOutputStore>>,
    request: ProcessSpawnRequest,
}

impl RunningProcess for TokioRunningProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn terminate(&self, mode: ProcessTerminationMode) -> ExecutionResult<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }

        let signal = match mode {
            ProcessTerminationMode::Immediate => libc::SIGKILL,
            ProcessTerminationMode::Graceful { .. } => libc::SIGTERM,
        };
        signal_process_group(pid, signal).map_err(|error| {
            self.request.error(
                CoreErrorKind::ProcessFailure,
                format!("failed to send signal {signal} to process group {pid}: {error}"),
            )
        })?;

        if let ProcessTerminationMode::Graceful { grace_period } = mode {
            let exited = self.exited.clone();
            let escalate = async move {
                tokio::time::sleep(grace_period).await;
                if !exited.load(Ordering::SeqCst) {
                    let _ = signal_process_group(pid, libc::SIGKILL);
                }
            };
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(escalate);
                }
                Err(_) => {
                    let exited = self.exited.clone();
                    std::thread::spawn(move || {
                        std::thread::sleep(grace_period);
                        if !exited.load(Ordering::SeqCst) {
                            let _ = signal_process_group(pid, libc::SIGKILL);
                        }
                    });
                }
            }
        }

        Ok(())
    }

    fn wait(&self) -> ProcessWaitFuture {
        let child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let readers = self
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let watchdog = self
            .watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let request = self.request.clone();
        let started_at = self.started_at;
        let command_display = self.command_display.clone();
        let stdout = self.stdout.clone();
        let stderr = self.stderr.clone();
        let exited = self.exited.clone();
        let deadline = self.deadline.clone();
        let outputs = self.outputs.clone();

        Box::pin(async move {
            let mut child = child.ok_or_else(|| {
                request.error(CoreErrorKind::Internal, "child process already consumed")
            })?;

            let status = child.wait().await;
            exited.store(true, Ordering::SeqCst);
            if let Some(watchdog) = watchdog {
                watchdog.abort();
            }
            let status = status.map_err(|error| {
                request.error(
                    CoreErrorKind::ProcessFailure,
                    format!("failed to wait for process: {error}"),
                )
            })?;

            let (stdout, stderr) = drain_output(readers, &stdout, &stderr).await;
            record_output(&outputs, &request, command_display, &stdout, &stderr);

            if deadline.expired.load(Ordering::SeqCst) {
                let limit = request.timeout.unwrap_or_default();
                let how = if deadline.killed.load(Ordering::SeqCst) {
                    "killed after the grace period"
                } else {
                    "terminated gracefully"
                };
                return Err(request.error(
                    CoreErrorKind::Timeout,
                    format!("process timed out after {}ms and was {how}", limit.as_millis()),
                ));
            }

            let status = match status.code() {
                Some(code) => ProcessExitStatus::ExitCode(code),
                None => ProcessExitStatus::Terminated,
            };

            Ok(ProcessOutput {
                status,
                stdout,
                stderr,
                started_at,
                finished_at: SystemTime::now(),
            })
        })
    }
}

// Descendants may keep the pipes open after the child exits, so the readers
// only get a short window before whatever was captured is taken.
async fn drain_output(
    readers: Option<[Option<JoinHandle<()>>; 2]>,
    stdout: &SharedBuffer,
    stderr: &SharedBuffer,
) -> (CapturedStream, CapturedStream) {
    for mut reader in readers.into_iter().flatten().flatten() {
        if tokio::time::timeout(OUTPUT_DRAIN_WINDOW, &mut reader)
            .await
            .is_err()
        {
            reader.abort();
        }
    }

    let snapshot = |buffer: &SharedBuffer| {
        buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    };
    (snapshot(stdout), snapshot(stderr))
}

fn record_output(
    outputs: &Option<Arc<TaskOutputStore>>,
    request: &ProcessSpawnRequest,
    command_display: String,
    stdout: &CapturedStream,
    stderr: &CapturedStream,
) {
    if let (Some(outputs), Some(task_id)) = (outputs, request.task_id) {
        outputs.record(task_id, Some(command_display), stdout, stderr);
    }
}

fn signal_process_group(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let pgid = -(pid as libc::pid_t);
    let result = unsafe { libc::kill(pgid, signal) };
    if result != 0 {
        let os_error = std::io::Error::last_os_error();
        if os_error.raw_os_error() != Some(libc::ESRCH) {
            return Err(os_error);
        }
    }
    Ok(())
}
