//! Process supervision layer
//!
//! Spawns MCP server processes, tracks them until their exit has been
//! observed, and stops whole process groups gracefully first and forcefully
//! second. A background reaper collects processes that exit on their own so
//! no zombie is left behind without the caller having to poll.

use crate::config::ConnectionConfig;
use crate::io::capture::EarlyOutput;
use crate::io::controller::{ProcessController, ProcessGroup, default_controller};
use crate::settings::{DEFAULT_KILL_WAIT, DEFAULT_TERMINATE_GRACE};
use crate::sync::MutexExt;
use futures::future::join_all;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// How often the reaper looks for exited processes
const REAP_INTERVAL: Duration = Duration::from_millis(100);

/// Poll interval of `wait_for_exit`
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Number of exit records kept for late queries
const EXIT_HISTORY: usize = 64;

// ============================================================================
// Process State Management
// ============================================================================

/// Supervisor-assigned identity of a managed process
///
/// Unlike a pid it is never reused within one supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Process lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Process has not been started yet
    Unspawned,
    /// Process is running
    Running { pid: u32 },
    /// An explicit terminate request is in progress
    Terminating { pid: u32 },
    /// Exit has been observed
    Exited { code: Option<i32> },
}

impl ProcessState {
    /// Get the process ID if the process is alive
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } | ProcessState::Terminating { pid } => Some(*pid),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }

    pub fn is_exited(&self) -> bool {
        matches!(self, ProcessState::Exited { .. })
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: &ProcessState) -> bool {
        matches!(
            (self, next),
            (ProcessState::Unspawned, ProcessState::Running { .. })
                | (ProcessState::Running { .. }, ProcessState::Terminating { .. })
                | (ProcessState::Running { .. }, ProcessState::Exited { .. })
                | (ProcessState::Terminating { .. }, ProcessState::Exited { .. })
        )
    }
}

/// Observed exit of a managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRecord {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    /// Whether the forceful kill was needed
    pub forced: bool,
}

/// Result of a terminate request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// Exit observed after the graceful signal or the forceful kill
    Exited(ExitRecord),
    /// The process was no longer tracked
    AlreadyExited { code: Option<i32> },
    /// The OS did not report an exit within both windows; the reaper keeps tracking it
    Unconfirmed,
}

// ============================================================================
// Process Management
// ============================================================================

/// Error types for process management
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Executable not found: {command}")]
    ExecutableNotFound {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Process {command} exited before its pid could be read")]
    MissingPid { command: String },

    #[error("Stdin not available")]
    StdinNotAvailable,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,
}

/// What to execute
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ..Default::default()
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            program: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            cwd: config.cwd.clone(),
        }
    }
}

/// Copyable reference to a supervised process
///
/// Carries no access to the process itself; every operation goes through
/// the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    id: ProcessId,
    pid: u32,
}

impl ProcessHandle {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// A freshly spawned process and the pipes a transport can claim
#[derive(Debug)]
pub struct SpawnedProcess {
    handle: ProcessHandle,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    early_output: EarlyOutput,
}

impl SpawnedProcess {
    pub fn handle(&self) -> ProcessHandle {
        self.handle
    }

    /// Pre-handshake output of this process
    pub fn early_output(&self) -> &EarlyOutput {
        &self.early_output
    }

    /// Take stdin/stdout for a transport; `None` once claimed
    pub fn take_stdio(&mut self) -> Option<(ChildStdin, ChildStdout)> {
        match (self.stdin.take(), self.stdout.take()) {
            (Some(stdin), Some(stdout)) => Some((stdin, stdout)),
            _ => None,
        }
    }
}

/// Tracked process; never leaves the supervisor
struct ManagedProcess {
    id: ProcessId,
    pid: u32,
    group: ProcessGroup,
    command: String,
    state: Mutex<ProcessState>,
    /// Held by an explicit terminate for its whole wait
    child: tokio::sync::Mutex<Child>,
}

impl ManagedProcess {
    fn state(&self) -> ProcessState {
        *self.state.lock_unpoisoned()
    }

    /// Move to `next` if the transition is legal
    fn advance(&self, next: ProcessState) -> bool {
        let mut state = self.state.lock_unpoisoned();
        if state.can_transition_to(&next) {
            trace!("Process {} ({}): {:?} -> {:?}", self.id, self.command, *state, next);
            *state = next;
            true
        } else {
            false
        }
    }
}

/// Counts a background task while alive
struct TaskGuard(Arc<AtomicUsize>);

impl TaskGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct SupervisorInner {
    controller: Box<dyn ProcessController>,
    tracked: Mutex<HashMap<ProcessId, Arc<ManagedProcess>>>,
    exits: Mutex<VecDeque<(ProcessId, ExitRecord)>>,
    next_id: AtomicU64,
    live_tasks: Arc<AtomicUsize>,
    terminate_grace: Duration,
    kill_wait: Duration,
}

impl SupervisorInner {
    fn entry(&self, id: ProcessId) -> Option<Arc<ManagedProcess>> {
        self.tracked.lock_unpoisoned().get(&id).cloned()
    }

    fn entries(&self) -> Vec<Arc<ManagedProcess>> {
        self.tracked.lock_unpoisoned().values().cloned().collect()
    }

    fn exit_record(&self, id: ProcessId) -> Option<ExitRecord> {
        self.exits
            .lock_unpoisoned()
            .iter()
            .rev()
            .find(|(exited, _)| *exited == id)
            .map(|(_, record)| *record)
    }

    /// Record an observed exit and stop tracking the process
    ///
    /// Returns false when someone else already did.
    fn finish(&self, entry: &ManagedProcess, record: ExitRecord) -> bool {
        entry.advance(ProcessState::Exited { code: record.code });

        if self.tracked.lock_unpoisoned().remove(&entry.id).is_none() {
            return false;
        }

        let mut exits = self.exits.lock_unpoisoned();
        exits.push_back((entry.id, record));
        while exits.len() > EXIT_HISTORY {
            exits.pop_front();
        }

        info!(
            "Process {} (pid {}, {}) exited with code {:?}{}",
            entry.id,
            entry.pid,
            entry.command,
            record.code,
            if record.forced { " after forced kill" } else { "" }
        );
        true
    }

    /// One non-blocking pass over tracked processes
    fn reap_once(&self) -> usize {
        let mut reaped = 0;

        for entry in self.entries() {
            // A terminate in progress holds the child and takes precedence
            let Ok(mut child) = entry.child.try_lock() else {
                continue;
            };

            match child.try_wait() {
                Ok(Some(status)) => {
                    drop(child);
                    let record = ExitRecord {
                        code: status.code(),
                        forced: false,
                    };
                    if self.finish(&entry, record) {
                        reaped += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to poll process {} (pid {}): {}", entry.id, entry.pid, e),
            }
        }

        reaped
    }

    async fn terminate_entry(&self, entry: Arc<ManagedProcess>) -> TerminationOutcome {
        entry.advance(ProcessState::Terminating { pid: entry.pid });
        info!(
            "Gracefully stopping process {} (pid {}, {})",
            entry.id, entry.pid, entry.command
        );

        if let Err(e) = self.controller.signal_graceful(&entry.group) {
            warn!("Graceful stop signal failed for group {}: {}", entry.group.id, e);
        }

        let mut child = entry.child.lock().await;

        match tokio::time::timeout(self.terminate_grace, child.wait()).await {
            Ok(Ok(status)) => {
                drop(child);
                let record = ExitRecord {
                    code: status.code(),
                    forced: false,
                };
                self.finish(&entry, record);
                return TerminationOutcome::Exited(record);
            }
            Ok(Err(e)) => warn!("Waiting for process {} failed: {}", entry.id, e),
            Err(_) => debug!(
                "Process {} still alive after {:?}",
                entry.id, self.terminate_grace
            ),
        }

        warn!(
            "Force killing process group {} ({})",
            entry.group.id, entry.command
        );
        if let Err(e) = self.controller.kill_forcefully(&entry.group) {
            warn!("Forceful kill failed for group {}: {}", entry.group.id, e);
        }
        if let Err(e) = child.start_kill() {
            trace!("Direct kill of pid {} failed: {}", entry.pid, e);
        }

        match tokio::time::timeout(self.kill_wait, child.wait()).await {
            Ok(Ok(status)) => {
                drop(child);
                let record = ExitRecord {
                    code: status.code(),
                    forced: true,
                };
                self.finish(&entry, record);
                TerminationOutcome::Exited(record)
            }
            Ok(Err(e)) => {
                error!("Process {} did not report its exit: {}", entry.id, e);
                TerminationOutcome::Unconfirmed
            }
            Err(_) => {
                error!(
                    "Process {} (pid {}) did not exit within {:?} of the forced kill; leaving it to the reaper",
                    entry.id, entry.pid, self.kill_wait
                );
                TerminationOutcome::Unconfirmed
            }
        }
    }
}

/// Spawns, tracks and stops MCP server processes
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("controller", &self.inner.controller)
            .field("tracked", &self.tracked_count())
            .finish()
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    /// Supervisor with the platform controller and default windows
    pub fn new() -> Self {
        Self::with_controller(default_controller(), DEFAULT_TERMINATE_GRACE, DEFAULT_KILL_WAIT)
    }

    /// Supervisor with explicit termination windows
    pub fn with_windows(terminate_grace: Duration, kill_wait: Duration) -> Self {
        Self::with_controller(default_controller(), terminate_grace, kill_wait)
    }

    pub fn with_controller(
        controller: Box<dyn ProcessController>,
        terminate_grace: Duration,
        kill_wait: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                controller,
                tracked: Mutex::new(HashMap::new()),
                exits: Mutex::new(VecDeque::new()),
                next_id: AtomicU64::new(1),
                live_tasks: Arc::new(AtomicUsize::new(0)),
                terminate_grace,
                kill_wait,
            }),
            reaper: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start a process in its own group and begin tracking it
    pub fn spawn(&self, spec: &CommandSpec) -> Result<SpawnedProcess, ProcessError> {
        info!("Starting process: {} {:?}", spec.program, spec.args);

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        self.inner.controller.configure(&mut command);

        let mut child = command.spawn().map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                ProcessError::ExecutableNotFound {
                    command: spec.program.clone(),
                    source,
                }
            } else {
                ProcessError::Spawn {
                    command: spec.program.clone(),
                    source,
                }
            }
        })?;

        let pid = child.id().ok_or_else(|| ProcessError::MissingPid {
            command: spec.program.clone(),
        })?;

        let group = match self.inner.controller.attach(pid) {
            Ok(group) => group,
            Err(source) => {
                let _ = child.start_kill();
                return Err(ProcessError::Spawn {
                    command: spec.program.clone(),
                    source,
                });
            }
        };

        // Extract stdio streams before the child is moved into tracking
        let stdin = child.stdin.take().ok_or(ProcessError::StdinNotAvailable)?;
        let stdout = child.stdout.take().ok_or(ProcessError::StdoutNotAvailable)?;
        let stderr = child.stderr.take().ok_or(ProcessError::StderrNotAvailable)?;

        let id = ProcessId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let managed = Arc::new(ManagedProcess {
            id,
            pid,
            group,
            command: spec.program.clone(),
            state: Mutex::new(ProcessState::Unspawned),
            child: tokio::sync::Mutex::new(child),
        });
        managed.advance(ProcessState::Running { pid });

        let early_output = EarlyOutput::new();
        self.spawn_stderr_drain(stderr, early_output.clone(), id);

        self.inner.tracked.lock_unpoisoned().insert(id, managed);
        self.ensure_reaper();

        info!("Process {} started with pid {} (group {})", id, pid, group.id);

        Ok(SpawnedProcess {
            handle: ProcessHandle { id, pid },
            stdin: Some(stdin),
            stdout: Some(stdout),
            early_output,
        })
    }

    /// Always drain stderr so the child never blocks on a full pipe
    fn spawn_stderr_drain(&self, stderr: ChildStderr, early_output: EarlyOutput, id: ProcessId) {
        let guard = TaskGuard::new(&self.inner.live_tasks);

        tokio::spawn(async move {
            let _guard = guard;
            let mut lines = BufReader::new(stderr).lines();

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim_end();
                        if !line.is_empty() {
                            trace!("Process {} stderr: {}", id, line);
                            early_output.record_line(line);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Failed to read stderr of process {}: {}", id, e);
                        break;
                    }
                }
            }

            trace!("Process {}: stderr drain finished", id);
        });
    }

    fn ensure_reaper(&self) {
        let mut slot = self.reaper.lock_unpoisoned();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let weak: Weak<SupervisorInner> = Arc::downgrade(&self.inner);
        let shutdown = self.shutdown.clone();
        let guard = TaskGuard::new(&self.inner.live_tasks);

        *slot = Some(tokio::spawn(async move {
            let _guard = guard;
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let reaped = inner.reap_once();
                        if reaped > 0 {
                            debug!("Reaper collected {} exited process(es)", reaped);
                        }
                    }
                }
            }

            trace!("Reaper finished");
        }));
    }

    /// Stop a process group: graceful signal, grace window, forced kill, second window
    pub async fn terminate(&self, handle: ProcessHandle) -> TerminationOutcome {
        match self.inner.entry(handle.id) {
            Some(entry) => self.inner.terminate_entry(entry).await,
            None => TerminationOutcome::AlreadyExited {
                code: self.inner.exit_record(handle.id).and_then(|r| r.code),
            },
        }
    }

    /// Terminate every tracked process concurrently and wait for all of them
    pub async fn kill_all(&self) -> Vec<TerminationOutcome> {
        let entries = self.inner.entries();
        if entries.is_empty() {
            return Vec::new();
        }

        info!("Terminating {} tracked process(es)", entries.len());
        join_all(
            entries
                .into_iter()
                .map(|entry| self.inner.terminate_entry(entry)),
        )
        .await
    }

    /// Run one reaper pass now; returns how many processes were collected
    pub fn reap(&self) -> usize {
        self.inner.reap_once()
    }

    /// Current lifecycle state, `None` for unknown handles
    pub fn state(&self, handle: ProcessHandle) -> Option<ProcessState> {
        if let Some(entry) = self.inner.entry(handle.id) {
            return Some(entry.state());
        }
        self.inner
            .exit_record(handle.id)
            .map(|record| ProcessState::Exited { code: record.code })
    }

    /// Exit record of a process whose exit has been observed
    pub fn exit_status(&self, handle: ProcessHandle) -> Option<ExitRecord> {
        self.inner.exit_record(handle.id)
    }

    /// Wait up to `timeout` for a process to exit on its own
    pub async fn wait_for_exit(
        &self,
        handle: ProcessHandle,
        timeout: Duration,
    ) -> Option<ExitRecord> {
        let deadline = Instant::now() + timeout;

        loop {
            self.inner.reap_once();

            if let Some(record) = self.inner.exit_record(handle.id) {
                return Some(record);
            }
            if self.inner.entry(handle.id).is_none() || Instant::now() >= deadline {
                return None;
            }

            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    pub fn is_tracked(&self, handle: ProcessHandle) -> bool {
        self.inner.entry(handle.id).is_some()
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.tracked.lock_unpoisoned().len()
    }

    /// Live reaper and stderr drain tasks
    pub fn background_task_count(&self) -> usize {
        self.inner.live_tasks.load(Ordering::SeqCst)
    }

    /// Synchronous force kill for Drop
    fn kill_sync(&self) {
        for entry in self.inner.entries() {
            info!("Synchronously force killing process group {}", entry.group.id);
            let _ = self.inner.controller.kill_forcefully(&entry.group);
            if let Ok(mut child) = entry.child.try_lock() {
                let _ = child.start_kill();
            }
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.kill_sync();
    }
}
