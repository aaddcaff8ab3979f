//! Worker process supervisor.
//!
//! Owns one subprocess, its pipes, and the lifecycle state machine.
//! Three sources of asynchronous truth meet here: the OS process
//! (exit/crash), the line-oriented wire (reader tasks), and caller
//! lifecycle commands (start/stop). Every validated transition is
//! observable on the event channel handed out at construction.
//!
//! The supervisor is protocol-agnostic: inbound lines reach the caller's
//! handler unmodified, and handshake-driven transitions (`mark_ready` and
//! friends) are explicit caller calls, never inferred from content.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::StreamExt;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex as TokioMutex, mpsc, watch};
use tokio_util::codec::FramedRead;

use crate::bridge::codec::LineCodec;
use crate::lifecycle::WorkerState;

/// How long `stop` waits for a graceful exit before escalating.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(5000);

/// Callback invoked once per complete line from a worker output stream.
pub type LineHandler = Box<dyn FnMut(String) + Send + 'static>;

/// Launch descriptor for a worker process. Immutable once built; the
/// supervisor only reads it.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    program: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env: HashMap<String, String>,
}

impl BridgeConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        // Line-buffering assumptions hold only if the worker flushes per
        // line; ask for unbuffered output before caller overrides apply.
        cmd.env("PYTHONUNBUFFERED", "1");
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

/// Lifecycle notifications, one per observable fact.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    StateChanged {
        from: WorkerState,
        to: WorkerState,
    },
    ProcessError {
        message: String,
    },
    ProcessExited {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Supervisor failures surfaced synchronously to the caller.
///
/// `InvalidTransition` marks a caller invariant violation (double start,
/// out-of-order lifecycle calls) and is never swallowed. Process faults
/// discovered asynchronously travel the event channel instead.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid worker state transition: {from} -> {to}")]
    InvalidTransition {
        from: WorkerState,
        to: WorkerState,
    },

    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("worker {stream} pipe was not captured")]
    PipeSetup { stream: &'static str },
}

struct Shared {
    state: WorkerState,
    /// Pid recorded at spawn; sticky across exit for diagnostics.
    pid: Option<u32>,
    started_at: Option<Instant>,
    /// Handle present and not killed.
    alive: bool,
    stdin_open: bool,
    exit_rx: Option<watch::Receiver<bool>>,
    /// Bumped per spawn; stale exit notifications carry an older value.
    epoch: u64,
}

struct Inner {
    shared: StdMutex<Shared>,
    // Writes await, so the writer lives apart from the sync metadata.
    stdin: TokioMutex<Option<ChildStdin>>,
    events: mpsc::UnboundedSender<BridgeEvent>,
}

impl Inner {
    fn lock_shared(&self) -> MutexGuard<'_, Shared> {
        self.shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Apply a table-checked transition and notify. Caller holds the lock.
    fn transition_locked(
        &self,
        shared: &mut Shared,
        to: WorkerState,
    ) -> Result<(), BridgeError> {
        let from = shared.state;
        if !from.can_transition_to(to) {
            return Err(BridgeError::InvalidTransition { from, to });
        }
        shared.state = to;
        tracing::debug!(%from, %to, "worker state changed");
        let _ = self.events.send(BridgeEvent::StateChanged { from, to });
        Ok(())
    }
}

/// Supervisor for a single worker process.
///
/// Cheap to clone; all clones drive the same worker. Construction hands
/// back the lifecycle event receiver.
#[derive(Clone)]
pub struct WorkerBridge {
    inner: Arc<Inner>,
}

impl WorkerBridge {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let bridge = Self {
            inner: Arc::new(Inner {
                shared: StdMutex::new(Shared {
                    state: WorkerState::Stopped,
                    pid: None,
                    started_at: None,
                    alive: false,
                    stdin_open: false,
                    exit_rx: None,
                    epoch: 0,
                }),
                stdin: TokioMutex::new(None),
                events,
            }),
        };
        (bridge, events_rx)
    }

    /// Spawn the worker and wire its streams.
    ///
    /// Allowed only from `Stopped` or `Crashed`. `on_line` receives each
    /// complete line from the worker's primary output, in byte order,
    /// partial lines never included. `on_err_line` receives diagnostic
    /// output without protocol interpretation; when absent, diagnostics
    /// drain into tracing so the worker cannot block on a full pipe.
    pub async fn start(
        &self,
        config: BridgeConfig,
        on_line: LineHandler,
        on_err_line: Option<LineHandler>,
    ) -> Result<(), BridgeError> {
        let (child, stdin, stdout, stderr, epoch, exit_tx) = {
            let mut shared = self.inner.lock_shared();
            if !matches!(shared.state, WorkerState::Stopped | WorkerState::Crashed) {
                return Err(BridgeError::InvalidTransition {
                    from: shared.state,
                    to: WorkerState::Starting,
                });
            }
            self.inner
                .transition_locked(&mut shared, WorkerState::Starting)?;

            tracing::info!(program = %config.program.display(), "spawning worker");
            let mut child = match config.command().spawn() {
                Ok(child) => child,
                Err(err) => {
                    return Err(self.fail_spawn_locked(&mut shared, BridgeError::Spawn(err)));
                }
            };

            let stdin = child.stdin.take();
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
                let _ = child.start_kill();
                return Err(self.fail_spawn_locked(
                    &mut shared,
                    BridgeError::PipeSetup { stream: "stdio" },
                ));
            };

            let pid = child.id();
            let (exit_tx, exit_rx) = watch::channel(false);
            shared.pid = pid;
            shared.started_at = Some(Instant::now());
            shared.alive = true;
            shared.stdin_open = true;
            shared.exit_rx = Some(exit_rx);
            shared.epoch += 1;
            tracing::debug!(?pid, epoch = shared.epoch, "worker spawned");
            (child, stdin, stdout, stderr, shared.epoch, exit_tx)
        };

        *self.inner.stdin.lock().await = Some(stdin);

        tokio::spawn(pump_lines(stdout, on_line, "stdout"));
        if let Some(stderr) = stderr {
            let handler = on_err_line.unwrap_or_else(|| {
                Box::new(|line: String| {
                    tracing::debug!(target: "scriblet::worker", "{line}");
                })
            });
            tokio::spawn(pump_lines(stderr, handler, "stderr"));
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            watch_exit(inner, child, epoch, exit_tx).await;
        });
        Ok(())
    }

    fn fail_spawn_locked(&self, shared: &mut Shared, err: BridgeError) -> BridgeError {
        tracing::error!(error = %err, "worker spawn failed");
        let _ = self.inner.events.send(BridgeEvent::ProcessError {
            message: err.to_string(),
        });
        if !matches!(shared.state, WorkerState::Stopping | WorkerState::Stopped)
            && let Err(transition_err) =
                self.inner.transition_locked(shared, WorkerState::Crashed)
        {
            tracing::error!(error = %transition_err, "crash transition refused after spawn failure");
        }
        err
    }

    /// Caller observed a successful handshake. No-op outside `Starting`.
    pub fn mark_ready(&self) {
        self.transition_if(WorkerState::Starting, WorkerState::Ready);
    }

    /// First request dispatched. No-op outside `Ready`.
    pub fn mark_running(&self) {
        self.transition_if(WorkerState::Ready, WorkerState::Running);
    }

    /// Response delivered, worker idle again. No-op outside `Running`.
    pub fn mark_idle(&self) {
        self.transition_if(WorkerState::Running, WorkerState::Ready);
    }

    // Benign double-signalling from the caller must not corrupt state.
    fn transition_if(&self, from: WorkerState, to: WorkerState) {
        let mut shared = self.inner.lock_shared();
        if shared.state == from {
            if let Err(err) = self.inner.transition_locked(&mut shared, to) {
                tracing::error!(error = %err, "guarded transition refused");
            }
        } else {
            tracing::trace!(state = %shared.state, %from, %to, "ignoring out-of-state signal");
        }
    }

    /// Gracefully stop the worker, escalating to a forced kill after
    /// `timeout`.
    ///
    /// No-op when already `Stopped`, or `Crashed` with the handle long
    /// gone. Resolves only once the exit has been observed and every
    /// owned resource released.
    pub async fn stop(&self, timeout: Duration) -> Result<(), BridgeError> {
        let (pid, exit_rx) = {
            let mut shared = self.inner.lock_shared();
            match shared.state {
                WorkerState::Stopped | WorkerState::Crashed => return Ok(()),
                WorkerState::Stopping => {}
                _ => {
                    self.inner
                        .transition_locked(&mut shared, WorkerState::Stopping)?;
                }
            }
            (shared.pid.filter(|_| shared.alive), shared.exit_rx.clone())
        };

        let Some(mut exit_rx) = exit_rx else {
            // Nothing was ever spawned under this state; close the loop.
            let mut shared = self.inner.lock_shared();
            if shared.state == WorkerState::Stopping {
                self.inner
                    .transition_locked(&mut shared, WorkerState::Stopped)?;
            }
            return Ok(());
        };

        if let Some(pid) = pid {
            tracing::info!(pid, "requesting graceful worker shutdown");
            send_signal(pid, Signal::SIGTERM);
        }

        // Observing the exit drops the timer, so escalation cannot fire
        // after a clean shutdown.
        let graceful = tokio::time::timeout(timeout, exit_rx.wait_for(|&done| done)).await;
        let timed_out = graceful.is_err();
        drop(graceful);
        if timed_out {
            tracing::warn!(?timeout, "graceful shutdown timed out, escalating");
            if let Some(pid) = pid {
                send_signal(pid, Signal::SIGKILL);
            }
            let _ = exit_rx.wait_for(|&done| done).await;
        }
        Ok(())
    }

    /// Emergency termination: forced kill, synchronous resource release,
    /// `Crashed` from any prior state. Never fails, even when the OS
    /// reports the process already gone.
    pub fn force_kill(&self) {
        let mut shared = self.inner.lock_shared();
        if let Some(pid) = shared.pid.filter(|_| shared.alive) {
            tracing::warn!(pid, "force-killing worker");
            send_signal(pid, Signal::SIGKILL);
        }
        shared.alive = false;
        shared.stdin_open = false;
        shared.exit_rx = None;

        let from = shared.state;
        if from != WorkerState::Crashed {
            // Emergency path: the one sanctioned edge outside the table.
            shared.state = WorkerState::Crashed;
            let _ = self.inner.events.send(BridgeEvent::StateChanged {
                from,
                to: WorkerState::Crashed,
            });
        }
        drop(shared);

        if let Ok(mut stdin) = self.inner.stdin.try_lock() {
            *stdin = None;
        }
    }

    /// Write one raw chunk to the worker's stdin.
    ///
    /// Returns `false`, never an error, when the pipe is absent or has
    /// failed; a failed write latches the pipe closed. The supervisor
    /// never queues writes on the caller's behalf.
    pub async fn write_stdin(&self, data: &str) -> bool {
        let mut guard = self.inner.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return false;
        };
        if !self.inner.lock_shared().stdin_open {
            return false;
        }
        let write = async {
            stdin.write_all(data.as_bytes()).await?;
            stdin.flush().await
        };
        match write.await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "stdin write failed, latching pipe closed");
                *guard = None;
                self.inner.lock_shared().stdin_open = false;
                false
            }
        }
    }

    pub fn state(&self) -> WorkerState {
        self.inner.lock_shared().state
    }

    /// Pid recorded at the most recent spawn.
    pub fn pid(&self) -> Option<u32> {
        self.inner.lock_shared().pid
    }

    /// Time since the most recent spawn; zero if never started.
    pub fn uptime(&self) -> Duration {
        self.inner
            .lock_shared()
            .started_at
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Handle present and not killed.
    pub fn is_alive(&self) -> bool {
        self.inner.lock_shared().alive
    }

    /// Whether the caller may issue logical requests.
    pub fn can_accept_requests(&self) -> bool {
        self.inner.lock_shared().state.can_accept_requests()
    }

    /// Whether the input pipe is present and writable.
    pub fn can_write(&self) -> bool {
        let shared = self.inner.lock_shared();
        shared.alive && shared.stdin_open
    }
}

/// Drain one output stream, delivering complete lines in order.
async fn pump_lines<R>(reader: R, mut handler: LineHandler, stream: &'static str)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, LineCodec::new());
    while let Some(next) = frames.next().await {
        match next {
            Ok(line) => handler(line),
            Err(err) => {
                tracing::warn!(stream, error = %err, "worker stream read failed");
                break;
            }
        }
    }
    tracing::trace!(stream, "worker stream closed");
}

/// Own the child until it exits, then release resources and settle state.
async fn watch_exit(
    inner: Arc<Inner>,
    mut child: Child,
    epoch: u64,
    exit_tx: watch::Sender<bool>,
) {
    let status = child.wait().await;

    let (code, signal) = match &status {
        Ok(status) => {
            use std::os::unix::process::ExitStatusExt;
            (status.code(), status.signal())
        }
        Err(_) => (None, None),
    };
    if let Err(err) = &status {
        tracing::error!(error = %err, "waiting on worker failed");
        let _ = inner.events.send(BridgeEvent::ProcessError {
            message: format!("waiting on worker failed: {err}"),
        });
    }

    {
        // Hold both locks so a restart cannot interleave; the epoch check
        // keeps a force-killed predecessor's exit from touching the
        // successor's resources.
        let mut stdin = inner.stdin.lock().await;
        let mut shared = inner.lock_shared();
        if shared.epoch == epoch {
            *stdin = None;
            shared.alive = false;
            shared.stdin_open = false;
            shared.exit_rx = None;

            let settled = match shared.state {
                WorkerState::Stopping => WorkerState::Stopped,
                WorkerState::Stopped | WorkerState::Crashed => shared.state,
                _ => WorkerState::Crashed,
            };
            if settled != shared.state {
                if let Err(err) = inner.transition_locked(&mut shared, settled) {
                    tracing::error!(error = %err, "exit transition refused");
                }
            }
            drop(shared);
            tracing::info!(?code, ?signal, "worker exited");
            let _ = inner.events.send(BridgeEvent::ProcessExited { code, signal });
        } else {
            tracing::debug!(epoch, ?code, ?signal, "stale worker exit, ignoring");
        }
    }

    let _ = exit_tx.send(true);
}

fn send_signal(pid: u32, sig: Signal) {
    if let Err(err) = signal::kill(Pid::from_raw(pid as i32), sig) {
        tracing::debug!(pid, %sig, %err, "signal delivery failed");
    }
}
