// worker/supervisor.rs
//
// Owns the lifecycle of one inference worker process: spawn with a prepared
// environment, readiness handshake, stdout decoding, stderr capture, exit
// detection and termination. At most one process is supervised at a time.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::protocol::{kinds, LineDecoder, ProtocolError, WireMessage};

/// Windows flag to prevent console window from appearing
#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Lines of stderr kept around for startup diagnostics
const STDERR_TAIL_LINES: usize = 20;

/// How long the exit monitor waits for stdout to drain after the process is gone
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long `stop()` waits for the exit monitor before giving up on it
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Process-level failures
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to start worker `{program}`: {reason}")]
    Spawn { program: String, reason: String },
    #[error("worker did not report ready within {0:?}")]
    StartupTimeout(Duration),
    #[error("worker exited during startup: {0}")]
    ExitedDuringStartup(String),
    #[error("worker is not running")]
    NotRunning,
    #[error("worker I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// How to launch the worker
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Logical engine name, used in logs
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Prepended to the platform's dynamic library search path
    pub library_paths: Vec<PathBuf>,
    pub env: HashMap<String, String>,
    pub startup_timeout: Duration,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            library_paths: Vec::new(),
            env: HashMap::new(),
            startup_timeout: Duration::from_secs(60),
        }
    }
}

/// Details announced by the worker's `ready` message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerInfo {
    pub generation: u64,
    pub device: Option<String>,
    pub version: Option<String>,
    pub compute_type: Option<String>,
}

impl WorkerInfo {
    fn from_ready(generation: u64, message: &WireMessage) -> Self {
        Self {
            generation,
            device: message.str_field("device").map(str::to_string),
            version: message.str_field("version").map(str::to_string),
            compute_type: message.str_field("computeType").map(str::to_string),
        }
    }
}

/// Exit notification delivered to listeners
#[derive(Debug, Clone)]
pub struct WorkerExit {
    pub generation: u64,
    /// True when the exit was caused by `stop()`
    pub requested: bool,
    pub description: String,
}

/// Receives decoded output and exit notifications, synchronously, from the
/// supervisor's reader tasks
pub trait WorkerListener: Send + Sync {
    fn on_message(&self, message: &WireMessage);
    fn on_exit(&self, exit: &WorkerExit);
}

type Listeners = Arc<StdRwLock<Vec<Arc<dyn WorkerListener>>>>;

struct RunningWorker {
    generation: u64,
    pid: Option<u32>,
    stdin: ChildStdin,
    alive: Arc<AtomicBool>,
    shutdown: CancellationToken,
    monitor: JoinHandle<()>,
}

/// Supervises a single worker process
pub struct WorkerSupervisor {
    spec: WorkerSpec,
    listeners: Listeners,
    slot: Mutex<Option<RunningWorker>>,
    generation: AtomicU64,
    info: Arc<StdMutex<Option<WorkerInfo>>>,
}

impl WorkerSupervisor {
    pub fn new(spec: WorkerSpec) -> Self {
        Self {
            spec,
            listeners: Arc::new(StdRwLock::new(Vec::new())),
            slot: Mutex::new(None),
            generation: AtomicU64::new(0),
            info: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    /// Register a listener for every decoded message and exit event
    pub fn subscribe(&self, listener: Arc<dyn WorkerListener>) {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(listener),
            Err(e) => error!("Failed to register worker listener: {}", e),
        }
    }

    /// Check if a worker process is currently alive
    pub async fn is_running(&self) -> bool {
        let slot = self.slot.lock().await;
        slot.as_ref()
            .map(|w| w.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Generation number of the live process, if any
    pub async fn running_generation(&self) -> Option<u64> {
        let slot = self.slot.lock().await;
        slot.as_ref()
            .filter(|w| w.alive.load(Ordering::SeqCst))
            .map(|w| w.generation)
    }

    /// Details from the most recent ready handshake
    pub fn info(&self) -> Option<WorkerInfo> {
        self.info.lock().ok().and_then(|guard| guard.clone())
    }

    /// Launch the worker and wait for its ready handshake.
    /// Returns the existing process info if one is already running.
    pub async fn start(&self) -> Result<WorkerInfo, WorkerError> {
        self.ensure_started().await
    }

    /// Ensure a worker is running, starting one if needed
    pub async fn ensure_started(&self) -> Result<WorkerInfo, WorkerError> {
        let mut slot = self.slot.lock().await;

        if let Some(worker) = slot.as_ref() {
            if worker.alive.load(Ordering::SeqCst) {
                if let Some(info) = self.info() {
                    if info.generation == worker.generation {
                        return Ok(info);
                    }
                }
            }
        }

        // Reap a process that died on its own
        if let Some(dead) = slot.take() {
            debug!(
                "[{}] Clearing exited worker (generation {})",
                self.spec.name, dead.generation
            );
            dead.shutdown.cancel();
            let _ = tokio::time::timeout(STOP_TIMEOUT, dead.monitor).await;
        }

        let (worker, info) = self.spawn().await?;
        *slot = Some(worker);
        Ok(info)
    }

    /// Write one encoded line to the worker's stdin
    pub async fn send(&self, line: &str) -> Result<(), WorkerError> {
        let mut slot = self.slot.lock().await;
        let worker = match slot.as_mut() {
            Some(worker) if worker.alive.load(Ordering::SeqCst) => worker,
            _ => return Err(WorkerError::NotRunning),
        };

        worker.stdin.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            worker.stdin.write_all(b"\n").await?;
        }
        worker.stdin.flush().await?;
        Ok(())
    }

    /// Terminate the worker. Idempotent. Returns once exit listeners have run.
    pub async fn stop(&self) {
        let worker = {
            let mut slot = self.slot.lock().await;
            slot.take()
        };

        let Some(worker) = worker else {
            return;
        };

        info!(
            "[{}] Stopping worker (generation {}, pid {:?})",
            self.spec.name, worker.generation, worker.pid
        );

        worker.shutdown.cancel();
        drop(worker.stdin);

        match tokio::time::timeout(STOP_TIMEOUT, worker.monitor).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("[{}] Worker monitor task failed: {}", self.spec.name, e),
            Err(_) => warn!(
                "[{}] Worker did not exit within {:?} after kill",
                self.spec.name, STOP_TIMEOUT
            ),
        }
    }

    async fn spawn(&self) -> Result<(RunningWorker, WorkerInfo), WorkerError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        info!(
            "[{}] Starting worker: {} {:?}",
            self.spec.name,
            self.spec.program.display(),
            self.spec.args
        );

        let mut cmd = self.build_command();
        let mut child = cmd.spawn().map_err(|e| WorkerError::Spawn {
            program: self.spec.program.display().to_string(),
            reason: e.to_string(),
        })?;

        let pid = child.id();
        let (stdin, stdout, stderr) = match take_pipes(&mut child) {
            Ok(pipes) => pipes,
            Err(e) => {
                let _ = child.start_kill();
                return Err(e);
            }
        };

        let alive = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();
        let stderr_tail = Arc::new(StdMutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let (ready_tx, ready_rx) = oneshot::channel::<WorkerInfo>();

        let stdout_task = tokio::spawn(read_stdout(
            self.spec.name.clone(),
            generation,
            stdout,
            self.listeners.clone(),
            ready_tx,
        ));
        let stderr_task =
            tokio::spawn(read_stderr(self.spec.name.clone(), stderr, stderr_tail.clone()));

        let monitor = tokio::spawn(monitor_exit(
            self.spec.name.clone(),
            generation,
            child,
            stdout_task,
            stderr_task,
            alive.clone(),
            shutdown.clone(),
            self.listeners.clone(),
        ));

        let worker = RunningWorker {
            generation,
            pid,
            stdin,
            alive,
            shutdown,
            monitor,
        };

        match tokio::time::timeout(self.spec.startup_timeout, ready_rx).await {
            Ok(Ok(info)) => {
                info!(
                    "[{}] Worker ready (generation {}, pid {:?}, device {:?})",
                    self.spec.name, generation, pid, info.device
                );
                if let Ok(mut guard) = self.info.lock() {
                    *guard = Some(info.clone());
                }
                Ok((worker, info))
            }
            Ok(Err(_)) => {
                // stdout closed before the handshake: the process is gone
                worker.shutdown.cancel();
                let _ = tokio::time::timeout(STOP_TIMEOUT, worker.monitor).await;
                let tail = stderr_summary(&stderr_tail);
                error!("[{}] Worker exited during startup: {}", self.spec.name, tail);
                Err(WorkerError::ExitedDuringStartup(tail))
            }
            Err(_) => {
                error!(
                    "[{}] Worker did not become ready within {:?}",
                    self.spec.name, self.spec.startup_timeout
                );
                worker.shutdown.cancel();
                let _ = tokio::time::timeout(STOP_TIMEOUT, worker.monitor).await;
                Err(WorkerError::StartupTimeout(self.spec.startup_timeout))
            }
        }
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.spec.program);
        cmd.args(&self.spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = self.spec.working_dir {
            cmd.current_dir(dir);
        }

        for (key, value) in &self.spec.env {
            cmd.env(key, value);
        }

        if !self.spec.library_paths.is_empty() {
            let var = library_path_var();
            let mut paths = self.spec.library_paths.clone();
            if let Some(existing) = std::env::var_os(var) {
                paths.extend(std::env::split_paths(&existing));
            }
            match std::env::join_paths(paths) {
                Ok(joined) => {
                    cmd.env(var, joined);
                }
                Err(e) => warn!("[{}] Ignoring library paths: {}", self.spec.name, e),
            }
        }

        // Hide console window on Windows
        #[cfg(target_os = "windows")]
        cmd.creation_flags(CREATE_NO_WINDOW);

        cmd
    }
}

/// Dynamic library search path variable for this platform
fn library_path_var() -> &'static str {
    if cfg!(target_os = "macos") {
        "DYLD_LIBRARY_PATH"
    } else if cfg!(target_os = "windows") {
        "PATH"
    } else {
        "LD_LIBRARY_PATH"
    }
}

fn take_pipes(child: &mut Child) -> Result<(ChildStdin, ChildStdout, ChildStderr), WorkerError> {
    let missing = |pipe: &str| {
        WorkerError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            format!("failed to capture worker {}", pipe),
        ))
    };
    let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
    Ok((stdin, stdout, stderr))
}

fn snapshot(listeners: &Listeners) -> Vec<Arc<dyn WorkerListener>> {
    listeners.read().map(|l| l.clone()).unwrap_or_default()
}

fn stderr_summary(tail: &StdMutex<VecDeque<String>>) -> String {
    let lines: Vec<String> = tail
        .lock()
        .map(|t| t.iter().cloned().collect())
        .unwrap_or_default();
    if lines.is_empty() {
        "no output on stderr".to_string()
    } else {
        lines.join(" | ")
    }
}

async fn read_stdout(
    name: String,
    generation: u64,
    mut stdout: ChildStdout,
    listeners: Listeners,
    ready_tx: oneshot::Sender<WorkerInfo>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut decoder = LineDecoder::new();
    let mut buf = [0u8; 8192];

    let mut deliver = |result: Result<WireMessage, ProtocolError>| match result {
        Ok(message) => {
            if message.kind == kinds::READY {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(WorkerInfo::from_ready(generation, &message));
                }
            }
            for listener in snapshot(&listeners) {
                listener.on_message(&message);
            }
        }
        Err(e) => warn!("[{}] Ignoring worker output: {}", name, e),
    };

    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for result in decoder.push(&buf[..n]) {
                    deliver(result);
                }
            }
            Err(e) => {
                warn!("[{}] Failed to read worker stdout: {}", name, e);
                break;
            }
        }
    }

    if let Some(result) = decoder.finish() {
        deliver(result);
    }
    debug!("[{}] Worker stdout closed (generation {})", name, generation);
}

async fn read_stderr(name: String, stderr: ChildStderr, tail: Arc<StdMutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                debug!(target: "worker", "[{}] {}", name, line);
                if let Ok(mut tail) = tail.lock() {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("[{}] Worker stderr read failed: {}", name, e);
                break;
            }
        }
    }
}

async fn monitor_exit(
    name: String,
    generation: u64,
    mut child: Child,
    stdout_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
    alive: Arc<AtomicBool>,
    shutdown: CancellationToken,
    listeners: Listeners,
) {
    let (requested, status) = tokio::select! {
        _ = shutdown.cancelled() => {
            if let Err(e) = child.start_kill() {
                debug!("[{}] Kill failed (process may have exited): {}", name, e);
            }
            (true, child.wait().await)
        }
        status = child.wait() => (false, status),
    };

    // Deliver any responses the worker flushed before exiting
    if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, stdout_task).await.is_err() {
        warn!("[{}] Worker stdout did not close after exit", name);
    }
    let _ = tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, stderr_task).await;

    alive.store(false, Ordering::SeqCst);

    let description = match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("unknown exit status ({})", e),
    };

    if requested {
        info!("[{}] Worker stopped (generation {}): {}", name, generation, description);
    } else {
        error!("[{}] Worker exited unexpectedly (generation {}): {}", name, generation, description);
    }

    let exit = WorkerExit {
        generation,
        requested,
        description,
    };
    for listener in snapshot(&listeners) {
        listener.on_exit(&exit);
    }
}
