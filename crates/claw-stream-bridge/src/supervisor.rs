//! Engine process supervision.
//!
//! The supervisor owns exactly one engine incarnation at a time and drives it
//! through an explicit state machine:
//!
//! ```text
//! Starting ──spawned──▶ Running ──exit──▶ Exited ──▶ Restarting ──backoff──▶ Starting
//!    │                                       ▲
//!    └──────────────spawn failed─────────────┘
//!
//! any state ──stop()──▶ ShuttingDown
//! ```
//!
//! Spawn failures are handled exactly like crashes. Restarts are unbounded;
//! each one is logged with the incarnation's age and exit reason.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::{self, BridgeConfig};
use crate::engine::{CurrentEngine, EngineHandle, EngineState, ExitReason};
use crate::framer::{frame_stream, FrameEvent};
use crate::hub::FrameSink;

/// How to launch and restart the engine.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Engine executable.
    pub program: PathBuf,
    /// Engine arguments.
    pub args: Vec<String>,
    /// Longest accepted output line.
    pub max_line_length: usize,
    /// Capacity of the per-incarnation stdin queue.
    pub input_queue_capacity: usize,
    /// Restart backoff.
    pub backoff: BackoffPolicy,
    /// Time the engine gets to exit after SIGTERM.
    pub shutdown_grace: Duration,
}

impl SupervisorConfig {
    /// Supervise `program` with default policy.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            max_line_length: config::DEFAULT_MAX_LINE_LENGTH,
            input_queue_capacity: config::DEFAULT_ROUTER_QUEUE_CAPACITY,
            backoff: BackoffPolicy::default(),
            shutdown_grace: config::DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Set the engine arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the restart backoff.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the stdin queue capacity.
    #[must_use]
    pub const fn with_input_queue_capacity(mut self, capacity: usize) -> Self {
        self.input_queue_capacity = capacity;
        self
    }

    /// Set the maximum output line length.
    #[must_use]
    pub const fn with_max_line_length(mut self, max: usize) -> Self {
        self.max_line_length = max;
        self
    }

    /// Set the shutdown grace period.
    #[must_use]
    pub const fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

impl From<&BridgeConfig> for SupervisorConfig {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            program: config.engine_path.clone(),
            args: config.engine_args.clone(),
            max_line_length: config.max_line_length,
            input_queue_capacity: config.router_queue_capacity,
            backoff: config.backoff.clone(),
            shutdown_grace: config.shutdown_grace,
        }
    }
}

/// Point-in-time view of the supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    /// Current lifecycle state.
    pub state: EngineState,
    /// Restarts performed so far.
    pub restart_count: u64,
    /// PID of the running incarnation.
    pub pid: Option<u32>,
    /// Start time of the running incarnation.
    pub engine_started_at: Option<DateTime<Utc>>,
    /// Why the previous incarnation stopped.
    pub last_exit: Option<ExitReason>,
    /// When the previous incarnation stopped.
    pub last_exit_at: Option<DateTime<Utc>>,
}

impl SupervisorStatus {
    const fn initial() -> Self {
        Self {
            state: EngineState::Starting,
            restart_count: 0,
            pid: None,
            engine_started_at: None,
            last_exit: None,
            last_exit_at: None,
        }
    }
}

struct Inner {
    config: SupervisorConfig,
    sink: Arc<dyn FrameSink>,
    current: CurrentEngine,
    status: RwLock<SupervisorStatus>,
    state_tx: watch::Sender<EngineState>,
    shutdown: CancellationToken,
}

/// A live incarnation and the tasks attached to its pipes.
struct RunningEngine {
    child: Child,
    handle: EngineHandle,
    writer_cancel: CancellationToken,
    reader: JoinHandle<()>,
    started: Instant,
}

enum Outcome {
    Exited { reason: ExitReason, uptime: Duration },
    Stopped,
}

/// Keeps one engine process alive until told to stop.
pub struct EngineSupervisor {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for EngineSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSupervisor")
            .field("config", &self.inner.config)
            .field("status", &*self.inner.status.read())
            .finish_non_exhaustive()
    }
}

impl EngineSupervisor {
    /// Create a supervisor that publishes engine output into `sink`.
    ///
    /// Nothing is spawned until [`start`](Self::start).
    pub fn new(config: SupervisorConfig, sink: Arc<dyn FrameSink>) -> Self {
        let (state_tx, _) = watch::channel(EngineState::Starting);
        Self {
            inner: Arc::new(Inner {
                config,
                sink,
                current: CurrentEngine::new(),
                status: RwLock::new(SupervisorStatus::initial()),
                state_tx,
                shutdown: CancellationToken::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Start the supervision loop. Calling it again is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() || self.inner.shutdown.is_cancelled() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(run(inner)));
    }

    /// The slot holding the writable engine, shared with the router.
    #[must_use]
    pub fn current(&self) -> CurrentEngine {
        self.inner.current.clone()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.inner.state_tx.borrow()
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.inner.state_tx.subscribe()
    }

    /// Snapshot of state, counters and last exit.
    #[must_use]
    pub fn status(&self) -> SupervisorStatus {
        self.inner.status.read().clone()
    }

    /// Supervisor configuration.
    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Stop supervising: terminate the engine and never restart it.
    ///
    /// The engine receives SIGTERM, then SIGKILL after the grace period.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        self.inner.set_state(EngineState::ShuttingDown);

        let task = self.task.lock().take();
        let Some(mut task) = task else {
            return;
        };

        // Grace for the engine plus the same again for draining its output.
        let limit = self.inner.config.shutdown_grace * 2 + Duration::from_secs(1);
        match timeout(limit, &mut task).await {
            Ok(Ok(())) => info!("engine supervisor stopped"),
            Ok(Err(e)) => error!(error = %e, "engine supervisor task failed"),
            Err(_) => {
                warn!("engine supervisor did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

impl Inner {
    fn set_state(&self, state: EngineState) {
        if self.shutdown.is_cancelled() && state != EngineState::ShuttingDown {
            return;
        }
        self.status.write().state = state;
        self.state_tx.send_replace(state);
        debug!(state = %state, "engine state changed");
    }

    fn spawn(&self, incarnation: u64) -> Result<RunningEngine, ExitReason> {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        info!(
            program = %self.config.program.display(),
            args = ?self.config.args,
            incarnation,
            "spawning engine"
        );
        let mut child = cmd.spawn().map_err(|e| ExitReason::SpawnFailed {
            error: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| ExitReason::SpawnFailed {
            error: "engine stdin was not captured".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ExitReason::SpawnFailed {
            error: "engine stdout was not captured".to_string(),
        })?;

        let pid = child.id();
        let (input_tx, input_rx) = mpsc::channel(self.config.input_queue_capacity.max(1));
        let writer_cancel = self.shutdown.child_token();

        tokio::spawn(write_stdin(stdin, input_rx, writer_cancel.clone(), pid));
        let reader = tokio::spawn(pump_stdout(
            stdout,
            self.config.max_line_length,
            Arc::clone(&self.sink),
            pid,
        ));

        Ok(RunningEngine {
            child,
            handle: EngineHandle::new(pid, incarnation, input_tx),
            writer_cancel,
            reader,
            started: Instant::now(),
        })
    }

    async fn supervise(&self, mut engine: RunningEngine) -> Outcome {
        let pid = engine.handle.pid();
        {
            let mut status = self.status.write();
            status.pid = pid;
            status.engine_started_at = Some(engine.handle.started_at());
        }
        self.current.install(engine.handle.clone());
        self.set_state(EngineState::Running);
        info!(pid, incarnation = engine.handle.incarnation(), "engine running");

        let exit = tokio::select! {
            status = engine.child.wait() => Some(status),
            () = self.shutdown.cancelled() => None,
        };

        // Unpublish first so no new envelope is accepted for this incarnation.
        self.current.clear();
        engine.writer_cancel.cancel();

        let Some(exit) = exit else {
            terminate(&mut engine.child, self.config.shutdown_grace).await;
            self.drain_reader(engine.reader, pid).await;
            return Outcome::Stopped;
        };

        let reason = match exit {
            Ok(status) => ExitReason::from(status),
            Err(e) => {
                if let Err(kill_err) = engine.child.start_kill() {
                    debug!(pid, error = %kill_err, "kill after failed wait");
                }
                ExitReason::WaitFailed {
                    error: e.to_string(),
                }
            }
        };
        let uptime = engine.started.elapsed();

        // The process is gone even if a descendant still holds its stdout.
        self.record_exit(&reason);
        self.drain_reader(engine.reader, pid).await;

        Outcome::Exited { reason, uptime }
    }

    /// Let the old incarnation's output finish before another one starts.
    async fn drain_reader(&self, mut reader: JoinHandle<()>, pid: Option<u32>) {
        if timeout(self.config.shutdown_grace, &mut reader).await.is_err() {
            warn!(pid, "engine stdout still open after exit, abandoning reader");
            reader.abort();
        }
    }

    fn record_exit(&self, reason: &ExitReason) {
        let mut status = self.status.write();
        status.pid = None;
        status.engine_started_at = None;
        status.last_exit = Some(reason.clone());
        status.last_exit_at = Some(Utc::now());
        drop(status);
        self.set_state(EngineState::Exited);
    }

    fn begin_restart(&self) -> u64 {
        let restart_count = {
            let mut status = self.status.write();
            status.restart_count += 1;
            status.restart_count
        };
        self.set_state(EngineState::Restarting);
        restart_count
    }
}

async fn run(inner: Arc<Inner>) {
    let mut incarnation: u64 = 0;
    let mut failure_streak: u32 = 0;

    while !inner.shutdown.is_cancelled() {
        inner.set_state(EngineState::Starting);

        let outcome = match inner.spawn(incarnation) {
            Ok(engine) => inner.supervise(engine).await,
            Err(reason) => {
                inner.record_exit(&reason);
                Outcome::Exited {
                    reason,
                    uptime: Duration::ZERO,
                }
            }
        };
        incarnation += 1;

        let Outcome::Exited { reason, uptime } = outcome else {
            break;
        };

        if inner.config.backoff.is_stable(uptime) {
            failure_streak = 0;
        }
        failure_streak = failure_streak.saturating_add(1);

        warn!(
            reason = %reason,
            uptime_ms = u64::try_from(uptime.as_millis()).unwrap_or(u64::MAX),
            failure_streak,
            "engine exited"
        );

        if inner.shutdown.is_cancelled() {
            break;
        }

        let delay = inner.config.backoff.delay_for_attempt(failure_streak);
        let restart_count = inner.begin_restart();
        info!(
            restart_count,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "restarting engine"
        );

        tokio::select! {
            () = sleep(delay) => {}
            () = inner.shutdown.cancelled() => break,
        }
    }

    inner.set_state(EngineState::ShuttingDown);
    debug!("supervision loop finished");
}

/// Single writer for one incarnation's stdin.
async fn write_stdin(
    mut stdin: ChildStdin,
    mut rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
    pid: Option<u32>,
) {
    loop {
        let line = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            line = rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        let written = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = write_line(&mut stdin, &line) => result,
        };
        if let Err(e) = written {
            warn!(pid, error = %e, "failed to write to engine stdin");
            break;
        }
    }

    rx.close();
    let mut dropped = 0usize;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        warn!(pid, dropped, "discarded envelopes queued for an exited engine");
    }
    debug!(pid, "engine stdin writer finished");
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Frame one incarnation's stdout into the sink until EOF.
async fn pump_stdout(
    stdout: ChildStdout,
    max_line_length: usize,
    sink: Arc<dyn FrameSink>,
    pid: Option<u32>,
) {
    let mut frames = frame_stream(stdout, max_line_length);
    while let Some(next) = frames.next().await {
        match next {
            Ok(event) => {
                if let FrameEvent::Malformed(failure) = &event {
                    let preview: String = failure.raw.chars().take(120).collect();
                    warn!(pid, error = %failure.error, raw = %preview, "malformed engine output");
                }
                sink.publish(event);
            }
            Err(e) => {
                warn!(pid, error = %e, "failed to read engine stdout");
                break;
            }
        }
    }
    debug!(pid, "engine stdout closed");
}

async fn terminate(child: &mut Child, grace: Duration) {
    let pid = child.id();

    #[cfg(unix)]
    if let Some(pid) = pid {
        send_sigterm(pid);
    }

    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => info!(pid, %status, "engine exited after stop request"),
        Ok(Err(e)) => {
            warn!(pid, error = %e, "error waiting for engine, killing");
            if let Err(e) = child.kill().await {
                warn!(pid, error = %e, "failed to kill engine");
            }
        }
        Err(_) => {
            warn!(
                pid,
                grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                "engine ignored SIGTERM, killing"
            );
            if let Err(e) = child.kill().await {
                warn!(pid, error = %e, "failed to kill engine");
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        warn!(pid, error = %e, "failed to send SIGTERM to engine");
    }
}
