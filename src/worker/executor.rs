use std::collections::HashMap;
use std::io::{Seek, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::protocol::{DispatchResult, ErrorKind};

/// How often a running child is checked for exit and timeout.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long captured pipes may stay open after the child exited, e.g. when a
/// grandchild inherited them.
const CAPTURE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Where the child's standard input comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum StdinSource {
    /// Text spooled to an anonymous temporary file.
    Text(String),
    /// An existing file.
    File(PathBuf),
}

/// Everything needed to launch one process.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    /// `argv[0]` is the executable
    pub argv: Vec<String>,
    pub stdin: Option<StdinSource>,
    /// Redirect target for stdout; captured in memory when `None`
    pub stdout: Option<PathBuf>,
    /// Redirect target for stderr; captured in memory when `None`
    pub stderr: Option<PathBuf>,
    /// Merged over the inherited environment, or used alone
    pub environment: HashMap<String, String>,
    pub inherit_env: bool,
    /// Working directory; the worker's own when `None`
    pub cwd: Option<PathBuf>,
    /// Zero disables the timeout
    pub timeout: Duration,
    /// Time between SIGTERM and SIGKILL
    pub grace: Duration,
}

impl ExecSpec {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            stdin: None,
            stdout: None,
            stderr: None,
            environment: HashMap::new(),
            inherit_env: true,
            cwd: None,
            timeout: Duration::ZERO,
            grace: Duration::ZERO,
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn stdin_text(mut self, text: impl Into<String>) -> Self {
        self.stdin = Some(StdinSource::Text(text.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration, grace: Duration) -> Self {
        self.timeout = timeout;
        self.grace = grace;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    fn cwd_display(&self) -> String {
        match &self.cwd {
            Some(cwd) => cwd.display().to_string(),
            None => std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        }
    }
}

/// Snapshot handed to a [`ProgressObserver`] while the child runs.
#[derive(Debug, Clone, Copy)]
pub struct ProgressReport {
    pub pid: u32,
    /// Epoch seconds
    pub start_time: f64,
    pub elapsed: Duration,
}

/// Receives periodic reports about a running child.
pub trait ProgressObserver: Send + Sync {
    fn interval(&self) -> Duration;
    fn on_progress(&self, report: ProgressReport);
}

/// Runs external commands with timeout enforcement.
///
/// A child that outlives its timeout gets SIGTERM, and SIGKILL if it is
/// still alive once the grace period is over. Every outcome, including a
/// failure to launch, is reported as a [`DispatchResult`].
#[derive(Debug, Clone, Copy)]
pub struct ProcessExecutor {
    poll_interval: Duration,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub async fn execute(&self, spec: &ExecSpec) -> DispatchResult {
        self.execute_observed(spec, None).await
    }

    /// Like [`execute`](Self::execute), notifying `observer` every
    /// `observer.interval()` while the child runs.
    pub async fn execute_observed(
        &self,
        spec: &ExecSpec,
        observer: Option<&dyn ProgressObserver>,
    ) -> DispatchResult {
        let mut result = DispatchResult::pending(spec.argv.clone(), spec.cwd_display());
        let started = Instant::now();

        let mut command = match build_command(spec) {
            Ok(command) => command,
            Err(e) => return launch_failed(result, started, e),
        };

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("failed to launch {}: {}", display_argv(&spec.argv), e);
                return launch_failed(result, started, message);
            }
        };
        // Release our copies of the child's stdio (including the stdin spool).
        drop(command);

        let pid = child.id();
        result.pid = pid;
        tracing::info!(pid = ?pid, command = %display_argv(&spec.argv), "Process started");

        let stdout = child.stdout.take().map(Capture::spawn);
        let stderr = child.stderr.take().map(Capture::spawn);

        let outcome = self
            .supervise(&mut child, spec, observer, started, result.start_time)
            .await;

        result.exec_time = started.elapsed().as_secs_f64();
        result.terminated = outcome.terminated;
        if let Some(status) = outcome.status {
            // A signal death reports the negated signal number as its code.
            result.signal = status.signal();
            result.exit_code = status.code().or(result.signal.map(|s| -s));
        }
        if let Some(capture) = stdout {
            result.stdout = Some(capture.finish().await);
        }
        if let Some(capture) = stderr {
            result.stderr = Some(capture.finish().await);
        }

        tracing::info!(
            pid = ?result.pid,
            exit_code = ?result.exit_code,
            signal = ?result.signal,
            terminated = result.terminated,
            exec_time = result.exec_time,
            "Process finished"
        );
        result
    }

    async fn supervise(
        &self,
        child: &mut Child,
        spec: &ExecSpec,
        observer: Option<&dyn ProgressObserver>,
        started: Instant,
        start_time: f64,
    ) -> Outcome {
        let mut next_report = observer.and_then(|o| started.checked_add(o.interval()));

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Outcome {
                        status: Some(status),
                        terminated: false,
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to poll child, waiting for exit");
                    return Outcome {
                        status: child.wait().await.ok(),
                        terminated: false,
                    };
                }
            }

            let elapsed = started.elapsed();
            if !spec.timeout.is_zero() && elapsed >= spec.timeout {
                tracing::warn!(
                    pid = ?child.id(),
                    timeout_secs = spec.timeout.as_secs_f64(),
                    "Process still executing after timeout, sending SIGTERM"
                );
                terminate(child);
                return Outcome {
                    status: escalate(child, spec.grace).await,
                    terminated: true,
                };
            }

            if let (Some(observer), Some(due)) = (observer, next_report) {
                if Instant::now() >= due {
                    if let Some(pid) = child.id() {
                        observer.on_progress(ProgressReport {
                            pid,
                            start_time,
                            elapsed,
                        });
                    }
                    // An interval past the end of time means no further reports.
                    next_report = due.checked_add(observer.interval().max(self.poll_interval));
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

struct Outcome {
    status: Option<ExitStatus>,
    terminated: bool,
}

/// Send SIGTERM to a child that has not been reaped yet.
fn terminate(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs to
    // our unreaped child so it cannot have been recycled.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        tracing::warn!(
            pid,
            error = %std::io::Error::last_os_error(),
            "Failed to send SIGTERM"
        );
    }
}

/// Wait up to `grace` for a terminated child, then SIGKILL it.
async fn escalate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => {
            tracing::warn!(
                pid = ?child.id(),
                grace_secs = grace.as_secs_f64(),
                "Process still executing after grace period, sending SIGKILL"
            );
            if let Err(e) = child.start_kill() {
                tracing::warn!(error = %e, "Failed to send SIGKILL");
            }
            child.wait().await.ok()
        }
    }
}

fn build_command(spec: &ExecSpec) -> Result<Command, String> {
    let Some((program, args)) = spec.argv.split_first() else {
        return Err("empty argument vector".to_string());
    };

    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);

    if !spec.inherit_env {
        command.env_clear();
    }
    command.envs(&spec.environment);

    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }

    let stdin = match &spec.stdin {
        None => Stdio::null(),
        Some(StdinSource::Text(text)) => {
            Stdio::from(spool(text).map_err(|e| format!("failed to spool stdin: {}", e))?)
        }
        Some(StdinSource::File(path)) => Stdio::from(
            std::fs::File::open(path)
                .map_err(|e| format!("failed to open stdin {}: {}", path.display(), e))?,
        ),
    };
    command.stdin(stdin);
    command.stdout(output_target(spec.stdout.as_deref())?);
    command.stderr(output_target(spec.stderr.as_deref())?);

    Ok(command)
}

fn output_target(path: Option<&Path>) -> Result<Stdio, String> {
    match path {
        None => Ok(Stdio::piped()),
        Some(path) => std::fs::File::create(path)
            .map(Stdio::from)
            .map_err(|e| format!("failed to open {} for writing: {}", path.display(), e)),
    }
}

/// Write `text` to an anonymous temporary file positioned at its start.
fn spool(text: &str) -> std::io::Result<std::fs::File> {
    let mut file = tempfile::tempfile()?;
    file.write_all(text.as_bytes())?;
    file.rewind()?;
    Ok(file)
}

fn launch_failed(
    mut result: DispatchResult,
    started: Instant,
    message: impl Into<String>,
) -> DispatchResult {
    let message = message.into();
    tracing::error!(error = %message, "Process launch failed");
    result.exec_time = started.elapsed().as_secs_f64();
    result.error = Some(crate::protocol::DispatchError {
        kind: ErrorKind::Launch,
        message,
    });
    result
}

fn display_argv(argv: &[String]) -> String {
    argv.join(" ")
}

/// Background reader for one captured pipe. The buffer is shared so that
/// whatever was read survives if the reader has to be abandoned.
struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<()>,
}

impl Capture {
    fn spawn<R>(mut reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = buf.clone();
        let handle = tokio::spawn(async move {
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => match sink.lock() {
                        Ok(mut buf) => buf.extend_from_slice(&chunk[..n]),
                        Err(_) => break,
                    },
                    Err(e) => {
                        tracing::debug!(error = %e, "Capture read failed");
                        break;
                    }
                }
            }
        });
        Self { buf, handle }
    }

    async fn finish(mut self) -> String {
        if tokio::time::timeout(CAPTURE_DRAIN_TIMEOUT, &mut self.handle)
            .await
            .is_err()
        {
            tracing::warn!("Output pipe still open after process exit, capture truncated");
            self.handle.abort();
        }
        let bytes = match self.buf.lock() {
            Ok(buf) => buf.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
