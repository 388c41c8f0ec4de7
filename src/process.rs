//! Supervised engine processes
//!
//! Every prober/encoder invocation is started through a [`ProcessSupervisor`],
//! which keeps a registry of live processes so that teardown can reach all of
//! them. A monitor task owns each child: it records the exit code, flips the
//! state to exited and unregisters the process, all under the registry lock.
//!
//! Termination is two-phase. The engine flushes its output when it reads `q`
//! on stdin, so that is tried first; a hard kill only follows if the caller
//! allows it and the grace window runs out.

use crate::error::{EncoderError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Program plus argument vector for one engine invocation
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn command_line(&self) -> String {
        format!("{} {}", self.program.display(), self.args.join(" "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Normal,
    GracefulQuit,
    ForceKilled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited {
        code: Option<i32>,
        reason: ExitReason,
    },
}

impl ProcessState {
    pub fn is_exited(&self) -> bool {
        matches!(self, ProcessState::Exited { .. })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessState::Exited { code, .. } => *code,
            ProcessState::Running => None,
        }
    }
}

#[derive(Default)]
struct Signals {
    quit_requested: AtomicBool,
    kill_requested: AtomicBool,
    kill: Notify,
}

/// Shareable view of a live process: enough to observe and terminate it
#[derive(Clone)]
pub struct ProcessHandle {
    id: u64,
    pid: Option<u32>,
    program: PathBuf,
    arguments: String,
    stdin: Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
    state: watch::Receiver<ProcessState>,
    signals: Arc<Signals>,
}

impl ProcessHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &str {
        &self.arguments
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.state().is_exited()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.state().exit_code()
    }

    /// Wait for the exit notification. `None` means the timeout elapsed first.
    pub async fn wait_for_exit(&self, timeout: Option<Duration>) -> Option<ProcessState> {
        let mut rx = self.state.clone();
        let wait = async move {
            match rx.wait_for(ProcessState::is_exited).await {
                Ok(state) => *state,
                // monitor gone without reporting
                Err(_) => ProcessState::Exited {
                    code: None,
                    reason: ExitReason::Normal,
                },
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.ok(),
            None => Some(wait.await),
        }
    }

    async fn send_quit(&self) -> std::io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        match stdin.as_mut() {
            Some(pipe) => {
                pipe.write_all(b"q\n").await?;
                pipe.flush().await
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stdin already closed",
            )),
        }
    }

    fn force_kill(&self) {
        self.signals.kill_requested.store(true, Ordering::SeqCst);
        self.signals.kill.notify_one();
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("program", &self.program)
            .field("state", &self.state())
            .finish()
    }
}

type Registry = HashMap<u64, ProcessHandle>;

struct SupervisorInner {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    kill_wait: Duration,
}

impl SupervisorInner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Owner of the live-process registry. Cloning shares the same registry.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ProcessSupervisor {
    /// `kill_wait` bounds how long to wait for exit after a hard kill
    pub fn new(kill_wait: Duration) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                registry: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                kill_wait,
            }),
        }
    }

    /// Spawn with all three standard streams piped and register the process.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, spec: ProcessSpec) -> Result<ManagedProcess> {
        debug!("{}", spec.command_line());

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| {
                error!(program = %spec.program.display(), "Error starting engine process: {}", source);
                EncoderError::StartFailure {
                    program: spec.program.clone(),
                    source,
                }
            })?;

        let (state_tx, state_rx) = watch::channel(ProcessState::Running);
        let handle = ProcessHandle {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            pid: child.id(),
            program: spec.program,
            arguments: spec.args.join(" "),
            stdin: Arc::new(tokio::sync::Mutex::new(child.stdin.take())),
            state: state_rx,
            signals: Arc::new(Signals::default()),
        };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // registered before the monitor exists, so an early exit cannot
        // unregister ahead of registration
        self.inner.registry().insert(handle.id, handle.clone());
        tokio::spawn(monitor(
            Arc::clone(&self.inner),
            child,
            state_tx,
            handle.clone(),
        ));

        Ok(ManagedProcess {
            handle,
            stdout,
            stderr,
            supervisor: Arc::clone(&self.inner),
            disposed: false,
        })
    }

    /// Ask the process to quit, wait up to `wait`, then optionally kill it.
    /// Returns whether the process is known to have exited.
    pub async fn terminate(
        &self,
        process: &ProcessHandle,
        wait: Duration,
        allow_force_kill: bool,
    ) -> bool {
        if process.has_exited() {
            return true;
        }

        info!(
            pid = ?process.pid(),
            program = %process.program().display(),
            "Stopping engine process"
        );

        process.signals.quit_requested.store(true, Ordering::SeqCst);
        if let Err(e) = process.send_quit().await {
            // usually already on its way out
            warn!(pid = ?process.pid(), "Error sending q command to process: {}", e);
        }

        if process.wait_for_exit(Some(wait)).await.is_some() {
            return true;
        }

        if !allow_force_kill {
            debug!(pid = ?process.pid(), "Process ignored quit; leaving it running");
            return false;
        }

        process.force_kill();
        match process.wait_for_exit(Some(self.inner.kill_wait)).await {
            Some(_) => true,
            None => {
                error!(pid = ?process.pid(), "Process still running after kill");
                false
            }
        }
    }

    /// Snapshot and clear the registry, then stop whatever is still running
    pub async fn shutdown(&self, grace: Duration) {
        let snapshot: Vec<ProcessHandle> = {
            let mut registry = self.inner.registry();
            registry.drain().map(|(_, handle)| handle).collect()
        };

        if !snapshot.is_empty() {
            info!("Stopping {} engine process(es)", snapshot.len());
        }

        for process in snapshot {
            if !process.has_exited() {
                self.terminate(&process, grace, true).await;
            }
        }
    }

    pub fn running_count(&self) -> usize {
        self.inner.registry().len()
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

async fn monitor(
    inner: Arc<SupervisorInner>,
    mut child: Child,
    state_tx: watch::Sender<ProcessState>,
    handle: ProcessHandle,
) {
    let signals = Arc::clone(&handle.signals);

    let status = tokio::select! {
        status = child.wait() => status,
        _ = signals.kill.notified() => {
            if let Err(e) = child.start_kill() {
                warn!(pid = ?handle.pid, "Error killing process: {}", e);
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(pid = ?handle.pid, "Error waiting for process: {}", e);
            None
        }
    };

    let reason = if signals.kill_requested.load(Ordering::SeqCst) {
        ExitReason::ForceKilled
    } else if signals.quit_requested.load(Ordering::SeqCst) {
        ExitReason::GracefulQuit
    } else {
        ExitReason::Normal
    };

    {
        let mut registry = inner.registry();
        state_tx.send_replace(ProcessState::Exited { code, reason });
        registry.remove(&handle.id);
    }

    debug!(pid = ?handle.pid, ?code, ?reason, "Engine process exited");
}

/// One started invocation, exclusively owned by the operation that started it.
///
/// Exit bookkeeping lives in the monitor task rather than here, so dropping
/// this value before the process exits cannot race a late exit notification.
/// A process disposed while still running stays registered until it exits,
/// which keeps it reachable by [`ProcessSupervisor::shutdown`].
pub struct ManagedProcess {
    handle: ProcessHandle,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    supervisor: Arc<SupervisorInner>,
    disposed: bool,
}

impl ManagedProcess {
    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Keep stderr flowing for the life of the process
    pub fn drain_stderr(&mut self) -> Option<JoinHandle<()>> {
        let label = self
            .handle
            .program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "engine".to_string());
        self.stderr.take().map(|stderr| spawn_log_drain(stderr, label))
    }

    pub async fn wait_for_exit(&self, timeout: Option<Duration>) -> Option<ProcessState> {
        self.handle.wait_for_exit(timeout).await
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        self.stdout.take();
        self.stderr.take();

        if self.handle.has_exited() {
            self.supervisor.registry().remove(&self.handle.id);
        }
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Read a stream to EOF, logging each line at debug level
pub fn spawn_log_drain<R>(reader: R, label: String) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    let text = text.trim_end();
                    if !text.is_empty() {
                        debug!(target: "soma_encoder::engine", "{}: {}", label, text);
                    }
                }
                Err(e) => {
                    debug!("Stopped reading {} output: {}", label, e);
                    break;
                }
            }
        }
    })
}
