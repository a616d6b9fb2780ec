//! Worker process lifecycle
//!
//! A [`Supervisor`] owns one worker at a time. Per worker it runs:
//!
//! - a writer task that owns stdin and writes lines in dispatch order,
//! - a stderr task that forwards diagnostics to the log,
//! - the supervise task, which reads stdout, watches for exit, enforces the
//!   readiness deadline and respawns with backoff.
//!
//! The dispatcher and the writer handle share one lock, so a dispatch
//! decision and its hand-off to the writer happen atomically.

use crate::dispatcher::{Dispatch, DispatcherState, RequestDispatcher};
use crate::errors::{BridgeError, Result};
use crate::framer::{LineFramer, WireMessage};
use crate::platform::{HostOs, PlatformStrategy};
use halftone_config::Config;
use halftone_logger as logger;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};

const READ_CHUNK: usize = 8 * 1024;
const DRAIN_AFTER_EXIT: Duration = Duration::from_secs(1);

/// Program, arguments and environment overlay for the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// `<runtime> -u <script>` with unbuffered output
    pub fn python(runtime: &str, script: &Path) -> Self {
        Self::new(runtime)
            .arg("-u")
            .arg(script.to_string_lossy().into_owned())
            .env("PYTHONUNBUFFERED", "1")
    }

    /// Append the platform's extra binary and library directories to the
    /// current search paths. Windows is left untouched.
    pub fn with_platform_paths(
        mut self,
        strategy: &PlatformStrategy,
        current_path: Option<&str>,
        current_library_path: Option<&str>,
    ) -> Self {
        if strategy.os == HostOs::Windows {
            return self;
        }
        let path = strategy.merge_search_path(current_path, strategy.extra_bin_dirs);
        self = self.env("PATH", path);
        if let Some(var) = strategy.library_path_var {
            let libs = strategy.merge_search_path(current_library_path, strategy.extra_lib_dirs);
            self = self.env(var, libs);
        }
        self
    }

    /// Worker command for this host, using the process's own environment
    pub fn for_host(runtime: &str, script: &Path) -> Self {
        let strategy = HostOs::current().strategy();
        let path = std::env::var("PATH").ok();
        let libs = strategy
            .library_path_var
            .and_then(|var| std::env::var(var).ok());
        Self::python(runtime, script).with_platform_paths(strategy, path.as_deref(), libs.as_deref())
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub ready_timeout: Duration,
    /// Respawns allowed between two readiness signals; 0 disables restart
    pub max_restarts: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(60),
            max_restarts: 3,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
        }
    }
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        let (backoff_initial, backoff_max) = config.restart_backoff();
        Self {
            ready_timeout: config.timeouts.ready(),
            max_restarts: config.restart.max_restarts(),
            backoff_initial,
            backoff_max,
        }
    }

    /// Delay before respawn `attempt` (1-based): doubling, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff_initial
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Never started
    Idle,
    Starting,
    Ready,
    Restarting { attempt: u32 },
    Stopped,
    Failed(String),
}

struct BridgeState {
    dispatcher: RequestDispatcher,
    writer: Option<mpsc::UnboundedSender<String>>,
    /// Deadline task of the in-flight request
    timer: Option<(u64, AbortHandle)>,
    /// Incremented on every start and every unexpected exit
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl BridgeState {
    /// Cancel the deadline once its request is no longer in flight
    fn settle_timer(&mut self) {
        let in_flight = self.dispatcher.in_flight_id();
        if let Some((id, handle)) = self.timer.take() {
            if in_flight == Some(id) {
                self.timer = Some((id, handle));
            } else {
                handle.abort();
            }
        }
    }
}

struct Shared {
    state: Mutex<BridgeState>,
    status: watch::Sender<WorkerStatus>,
    stop: watch::Sender<bool>,
    settings: SupervisorSettings,
}

impl Shared {
    fn set_status(&self, status: WorkerStatus) {
        tracing::debug!(?status, "worker status");
        self.status.send_replace(status);
    }

    /// Write a dispatched line and arm its deadline. Caller holds the lock.
    fn hand_off(self: &Arc<Self>, state: &mut BridgeState, dispatch: Dispatch) {
        state.settle_timer();
        let Some(writer) = state.writer.as_ref() else {
            tracing::debug!(id = dispatch.id, "no writer; request is rejected when the exit is observed");
            return;
        };
        tracing::debug!(id = dispatch.id, command = %dispatch.command, "dispatching");
        if writer.send(dispatch.line).is_err() {
            tracing::debug!(id = dispatch.id, "writer closed before dispatch");
            return;
        }

        let shared = Arc::downgrade(self);
        let id = dispatch.id;
        let timeout = dispatch.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = shared.upgrade() {
                shared.expire(id);
            }
        });
        state.timer = Some((id, timer.abort_handle()));
    }

    fn expire(self: &Arc<Self>, id: u64) {
        let mut state = self.state.lock();
        if let Some(next) = state.dispatcher.on_timeout(id) {
            self.hand_off(&mut state, next);
        }
        state.settle_timer();
    }

    /// Feed decoded stdout lines to the dispatcher
    fn deliver(self: &Arc<Self>, frames: Vec<Result<WireMessage>>, ready_seen: &mut bool) {
        let mut became_ready = false;
        {
            let mut state = self.state.lock();
            for frame in frames {
                let next = match frame {
                    Ok(WireMessage::Ready) => {
                        if !*ready_seen {
                            *ready_seen = true;
                            became_ready = true;
                        }
                        state.dispatcher.on_ready()
                    }
                    Ok(message) => state.dispatcher.on_message(message),
                    Err(e) => {
                        logger::warn(&e.to_string());
                        state.dispatcher.on_parse_error(e)
                    }
                };
                if let Some(dispatch) = next {
                    self.hand_off(&mut state, dispatch);
                }
                state.settle_timer();
            }
        }
        if became_ready {
            logger::debug("Worker is ready");
            self.set_status(WorkerStatus::Ready);
        }
    }

    fn reject_outstanding(&self, reason: &str) -> usize {
        let mut state = self.state.lock();
        state.writer = None;
        let rejected = state.dispatcher.on_exit(reason);
        state.settle_timer();
        rejected
    }
}

enum Exit {
    /// `stop()` was called
    Stopped,
    Exited { reason: String, was_ready: bool },
}

/// Owns the worker process and the request dispatcher
///
/// Requests sent before the worker is ready are buffered and delivered in
/// order once it is. Dropping the supervisor kills the worker.
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(SupervisorSettings::default())
    }
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        let (status, _) = watch::channel(WorkerStatus::Idle);
        let (stop, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BridgeState {
                    dispatcher: RequestDispatcher::new(),
                    writer: None,
                    timer: None,
                    generation: 0,
                    task: None,
                }),
                status,
                stop,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.shared.settings
    }

    /// Subscribe to status changes
    pub fn status(&self) -> watch::Receiver<WorkerStatus> {
        self.shared.status.subscribe()
    }

    pub fn current_status(&self) -> WorkerStatus {
        self.shared.status.borrow().clone()
    }

    pub fn dispatcher_state(&self) -> DispatcherState {
        self.shared.state.lock().dispatcher.state()
    }

    /// Changes whenever a new worker process may have replaced the old one,
    /// so worker-side state (such as the stored image) must be assumed lost
    pub fn generation(&self) -> u64 {
        self.shared.state.lock().generation
    }

    /// Spawn the worker; fails only if the first spawn fails
    pub async fn start(&self, command: WorkerCommand) -> Result<()> {
        let previous = {
            let mut state = self.shared.state.lock();
            if state.task.as_ref().is_some_and(|task| !task.is_finished()) {
                return Err(BridgeError::Spawn {
                    program: command.program,
                    reason: "worker is already running".to_string(),
                });
            }
            state.dispatcher.restart();
            state.generation += 1;
            state.task.take()
        };
        if let Some(previous) = previous {
            let _ = previous.await;
        }

        self.shared.stop.send_replace(false);
        self.shared.set_status(WorkerStatus::Starting);

        let child = match spawn_child(&command) {
            Ok(child) => child,
            Err(e) => {
                self.shared.reject_outstanding(&e.to_string());
                self.shared.set_status(WorkerStatus::Failed(e.to_string()));
                return Err(e);
            }
        };

        let task = tokio::spawn(supervise(Arc::clone(&self.shared), command, child));
        self.shared.state.lock().task = Some(task);
        Ok(())
    }

    /// Resolve once the worker is ready; fail if it stops or gives up first
    pub async fn wait_ready(&self) -> Result<()> {
        let mut status = self.status();
        let reached = status
            .wait_for(|s| {
                matches!(
                    s,
                    WorkerStatus::Ready | WorkerStatus::Stopped | WorkerStatus::Failed(_)
                )
            })
            .await
            .map(|s| s.clone())
            .map_err(|_| BridgeError::WorkerExited("supervisor dropped".to_string()))?;

        match reached {
            WorkerStatus::Ready => Ok(()),
            WorkerStatus::Failed(reason) => Err(BridgeError::WorkerExited(reason)),
            _ => Err(BridgeError::WorkerExited("worker stopped".to_string())),
        }
    }

    /// Queue a command and wait for its response
    pub async fn send(
        &self,
        command: &str,
        payload: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let receiver = {
            let mut state = self.shared.state.lock();
            let (receiver, dispatch) = state.dispatcher.submit(command, payload, timeout);
            if let Some(dispatch) = dispatch {
                self.shared.hand_off(&mut state, dispatch);
            }
            receiver
        };

        receiver
            .await
            .map_err(|_| BridgeError::WorkerExited("request dropped".to_string()))?
    }

    /// Terminate the worker without restarting it
    pub async fn stop(&self) {
        self.shared.stop.send_replace(true);
        let task = {
            let mut state = self.shared.state.lock();
            state.writer = None;
            state.task.take()
        };
        if let Some(task) = task {
            let _ = task.await;
        }
        self.shared.reject_outstanding("worker stopped");
        self.shared.set_status(WorkerStatus::Stopped);
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shared.stop.send_replace(true);
        // Dropping the task drops the child, which kills it
        if let Some(task) = self.shared.state.lock().task.take() {
            task.abort();
        }
    }
}

fn spawn_child(command: &WorkerCommand) -> Result<Child> {
    logger::debug(&format!("Starting worker: {}", command.display()));
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    cmd.spawn().map_err(|e| BridgeError::Spawn {
        program: command.program.clone(),
        reason: e.to_string(),
    })
}

async fn supervise(shared: Arc<Shared>, command: WorkerCommand, first: Child) {
    let mut stop = shared.stop.subscribe();
    let mut attempts: u32 = 0;
    let mut spawned: Result<Child> = Ok(first);

    loop {
        let exit = match spawned {
            Ok(child) => run_child(&shared, child, &mut stop).await,
            Err(e) => Exit::Exited {
                reason: e.to_string(),
                was_ready: false,
            },
        };
        let reason = match exit {
            Exit::Stopped => break,
            Exit::Exited { reason, was_ready } => {
                if was_ready {
                    attempts = 0;
                }
                reason
            }
        };

        if *stop.borrow() {
            break;
        }

        // Decided under the same lock as the rejection so that a request
        // sent right after it is buffered for the respawn
        let restarting = attempts < shared.settings.max_restarts;
        let rejected = {
            let mut state = shared.state.lock();
            state.writer = None;
            state.generation += 1;
            let rejected = state.dispatcher.on_exit(&reason);
            state.settle_timer();
            if restarting {
                state.dispatcher.restart();
            }
            rejected
        };
        logger::warn(&format!("Worker stopped unexpectedly: {}", reason));
        tracing::debug!(rejected, "rejected outstanding requests");

        if !restarting {
            if shared.settings.max_restarts > 0 {
                logger::error(&format!(
                    "Worker failed {} restart attempts; giving up",
                    shared.settings.max_restarts
                ));
            }
            shared.set_status(WorkerStatus::Failed(reason));
            return;
        }

        attempts += 1;
        shared.set_status(WorkerStatus::Restarting { attempt: attempts });

        let delay = shared.settings.backoff(attempts);
        logger::info(&format!(
            "Restarting worker in {:?} (attempt {}/{})",
            delay, attempts, shared.settings.max_restarts
        ));
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = stop_requested(&mut stop) => break,
        }

        spawned = spawn_child(&command);
        if spawned.is_ok() {
            shared.set_status(WorkerStatus::Starting);
        }
    }

    shared.reject_outstanding("worker stopped");
    shared.set_status(WorkerStatus::Stopped);
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn run_child(shared: &Arc<Shared>, mut child: Child, stop: &mut watch::Receiver<bool>) -> Exit {
    let (Some(stdin), Some(mut stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        let _ = child.kill().await;
        return Exit::Exited {
            reason: "worker pipes unavailable".to_string(),
            was_ready: false,
        };
    };
    logger::info(&format!("Worker started (pid {})", child.id().unwrap_or_default()));

    let (tx, rx) = mpsc::unbounded_channel();
    shared.state.lock().writer = Some(tx);
    let mut writer = tokio::spawn(write_lines(stdin, rx));
    tokio::spawn(forward_stderr(stderr));

    let mut framer = LineFramer::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut ready_seen = false;
    let mut stdout_open = true;
    let mut writer_running = true;
    let ready_timeout = shared.settings.ready_timeout;
    let ready_deadline = tokio::time::sleep(ready_timeout);
    tokio::pin!(ready_deadline);

    let exit = loop {
        tokio::select! {
            biased;

            read = stdout.read(&mut buf), if stdout_open => match read {
                Ok(0) => {
                    stdout_open = false;
                    if let Some(last) = framer.finish() {
                        shared.deliver(vec![last], &mut ready_seen);
                    }
                }
                Ok(n) => {
                    let frames = framer.push(&buf[..n]);
                    shared.deliver(frames, &mut ready_seen);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "reading worker stdout failed");
                    stdout_open = false;
                }
            },

            status = child.wait() => {
                if stdout_open {
                    drain_stdout(shared, &mut stdout, &mut framer, &mut ready_seen).await;
                }
                break Exit::Exited {
                    reason: describe_exit(status),
                    was_ready: ready_seen,
                };
            }

            () = stop_requested(stop) => {
                let _ = child.kill().await;
                break Exit::Stopped;
            }

            written = &mut writer, if writer_running => {
                writer_running = false;
                if let Ok(Err(e)) = written {
                    logger::warn(&format!("Writing to worker failed: {}", e));
                    let _ = child.kill().await;
                    break Exit::Exited {
                        reason: format!("write to worker failed: {}", e),
                        was_ready: ready_seen,
                    };
                }
            }

            () = &mut ready_deadline, if !ready_seen => {
                logger::warn(&format!("Worker did not signal readiness within {:?}", ready_timeout));
                let _ = child.kill().await;
                break Exit::Exited {
                    reason: format!("worker did not signal readiness within {:?}", ready_timeout),
                    was_ready: false,
                };
            }
        }
    };

    if writer_running {
        writer.abort();
    }
    exit
}

/// Read whatever the worker wrote before exiting
async fn drain_stdout(
    shared: &Arc<Shared>,
    stdout: &mut ChildStdout,
    framer: &mut LineFramer,
    ready_seen: &mut bool,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    let drained = tokio::time::timeout(DRAIN_AFTER_EXIT, async {
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let frames = framer.push(&buf[..n]);
                    shared.deliver(frames, ready_seen);
                }
            }
        }
    })
    .await;
    if drained.is_err() {
        tracing::debug!("worker stdout still open after exit");
    }
    if let Some(last) = framer.finish() {
        shared.deliver(vec![last], ready_seen);
    }
}

async fn write_lines(
    mut stdin: ChildStdin,
    mut lines: mpsc::UnboundedReceiver<String>,
) -> std::io::Result<()> {
    while let Some(line) = lines.recv().await {
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
    }
    Ok(())
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        logger::worker(&line);
    }
}

fn describe_exit(status: std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => format!("worker exited ({})", status),
        Err(e) => format!("failed to wait for worker: {}", e),
    }
}
