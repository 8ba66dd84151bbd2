use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::{secs_to_duration, JobDefaults};
use crate::protocol::{DispatchResult, ErrorKind, SystemOptions};
use crate::worker::classad::{self, ExecutionSummary};
use crate::worker::executor::{
    ExecSpec, ProcessExecutor, ProgressObserver, ProgressReport, StdinSource,
};
use crate::worker::workdir::{CleanupOutcome, WorkDir};

/// Pause between a failed attempt and the next one.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// A fully resolved `system` job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub argv: Vec<String>,
    pub environment: HashMap<String, String>,
    pub inherit_env: bool,
    pub timeout: Duration,
    pub grace: Duration,
    pub scratch_root: Option<PathBuf>,
    pub cleanup_after_error: bool,
    /// Explicit working directory; disables work directory creation
    pub cwd: Option<PathBuf>,
    pub pre_hook: Option<String>,
    pub update_hook: Option<String>,
    pub update_interval: Duration,
    pub post_hook: Option<String>,
    /// Job descriptor handed to the hooks; hooks only run when it is set
    pub classad: Option<String>,
    /// Extra attempts after a non-zero exit
    pub retries: u32,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    pub stdin_path: Option<PathBuf>,
}

impl JobRequest {
    pub fn new(argv: Vec<String>, defaults: &JobDefaults) -> Self {
        Self {
            argv,
            environment: HashMap::new(),
            inherit_env: defaults.inherit_env,
            timeout: secs_to_duration(defaults.timeout_secs),
            grace: secs_to_duration(defaults.grace_secs),
            scratch_root: defaults.scratch_root.clone(),
            cleanup_after_error: defaults.cleanup_after_error,
            cwd: None,
            pre_hook: None,
            update_hook: None,
            update_interval: secs_to_duration(defaults.update_interval_secs),
            post_hook: None,
            classad: None,
            retries: clamp_retries(defaults.retries),
            stdout_path: None,
            stderr_path: None,
            stdin_path: None,
        }
    }

    /// Apply the named options of a request on top of the worker defaults.
    pub fn from_options(argv: Vec<String>, options: SystemOptions, defaults: &JobDefaults) -> Self {
        let mut job = Self::new(argv, defaults);
        if let Some(environment) = options.environment {
            job.environment = environment;
        }
        if let Some(inherit_env) = options.inherit_env {
            job.inherit_env = inherit_env;
        }
        if let Some(timeout) = options.timeout {
            job.timeout = secs_to_duration(timeout);
        }
        if let Some(grace) = options.grace {
            job.grace = secs_to_duration(grace);
        }
        if options.scratch_root.is_some() {
            job.scratch_root = options.scratch_root;
        }
        if let Some(cleanup) = options.cleanup_after_error {
            job.cleanup_after_error = cleanup;
        }
        if let Some(interval) = options.update_interval {
            job.update_interval = secs_to_duration(interval);
        }
        if let Some(retries) = options.retries {
            job.retries = clamp_retries(retries);
        }
        job.cwd = options.cwd;
        job.pre_hook = options.pre_hook;
        job.update_hook = options.update_hook;
        job.post_hook = options.post_hook;
        job.classad = options.classad;
        job.stdout_path = options.stdout_path;
        job.stderr_path = options.stderr_path;
        job.stdin_path = options.stdin_path;
        job
    }
}

fn clamp_retries(retries: i64) -> u32 {
    retries.clamp(0, u32::MAX as i64) as u32
}

/// Runs a job with retries, hooks and a private work directory.
///
/// Nothing here fails: every problem ends up in the returned result or in
/// the log.
#[derive(Debug, Clone)]
pub struct JobRunner {
    executor: ProcessExecutor,
    retry_backoff: Duration,
}

impl Default for JobRunner {
    fn default() -> Self {
        Self::new(ProcessExecutor::new())
    }
}

impl JobRunner {
    pub fn new(executor: ProcessExecutor) -> Self {
        Self {
            executor,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub async fn run(&self, job: &JobRequest) -> DispatchResult {
        let workdir = match WorkDir::resolve(job.cwd.as_deref(), job.scratch_root.as_deref()) {
            Ok(workdir) => workdir,
            Err(e) => {
                tracing::error!(error = %e, "Failed to prepare work directory");
                return DispatchResult::failure(
                    job.argv.clone(),
                    ErrorKind::Launch,
                    format!("failed to prepare work directory: {}", e),
                );
            }
        };

        let hook_base = ExecSpec {
            argv: Vec::new(),
            stdin: None,
            stdout: None,
            stderr: None,
            environment: job.environment.clone(),
            inherit_env: job.inherit_env,
            cwd: Some(workdir.path().to_path_buf()),
            timeout: job.timeout,
            grace: job.grace,
        };

        let pre_result = match (&job.pre_hook, &job.classad) {
            (Some(hook), Some(descriptor)) => {
                tracing::info!(hook = %hook, "Running pre hook");
                let spec = hook_spec(&hook_base, vec![hook.clone()], descriptor.clone());
                let result = self.executor.execute(&spec).await;
                tracing::info!(exit_code = ?result.exit_code, "Pre hook done");
                Some(result)
            }
            _ => None,
        };

        let spec = ExecSpec {
            argv: job.argv.clone(),
            stdin: job
                .stdin_path
                .as_deref()
                .map(|p| StdinSource::File(workdir.resolve_path(p))),
            stdout: job.stdout_path.as_deref().map(|p| workdir.resolve_path(p)),
            stderr: job.stderr_path.as_deref().map(|p| workdir.resolve_path(p)),
            ..hook_base.clone()
        };

        let updater = match (&job.update_hook, &job.classad) {
            (Some(hook), Some(descriptor)) if !job.update_interval.is_zero() => Some(UpdateHook {
                executor: self.executor,
                base: hook_spec(&hook_base, vec![hook.clone()], String::new()),
                descriptor: descriptor.clone(),
                interval: job.update_interval,
                running: Mutex::new(Vec::new()),
            }),
            _ => None,
        };

        tracing::info!(command = %job.argv.join(" "), cwd = %workdir.path().display(), "Running job");
        let result = self
            .run_with_retries(&spec, job.retries, updater.as_ref())
            .await;
        tracing::info!(
            exit_code = ?result.exit_code,
            terminated = result.terminated,
            "Job done"
        );

        if let Some(updater) = updater {
            updater.drain().await;
        }

        let pre_ok = pre_result.as_ref().map_or(true, |r| r.exit_code == Some(0));
        if let (Some(hook), Some(descriptor), true) = (&job.post_hook, &job.classad, pre_ok) {
            tracing::info!(hook = %hook, "Running post hook");
            let record = classad::exited_record(&ExecutionSummary::from(&result));
            let spec = hook_spec(
                &hook_base,
                vec![hook.clone(), "exit".to_string()],
                classad::append(descriptor, &record),
            );
            let post_result = self.executor.execute(&spec).await;
            tracing::info!(exit_code = ?post_result.exit_code, "Post hook done");
        }

        if let CleanupOutcome::Partial(leftovers) =
            workdir.finish(result.failed(), job.cleanup_after_error)
        {
            tracing::warn!(
                remaining = leftovers.len(),
                "Work directory only partially removed"
            );
        }

        result
    }

    /// Run `spec` until it exits 0 or `retries` extra attempts are used up.
    /// Launch failures and timeouts end the loop at once.
    async fn run_with_retries(
        &self,
        spec: &ExecSpec,
        retries: u32,
        observer: Option<&UpdateHook>,
    ) -> DispatchResult {
        let observer = observer.map(|o| o as &dyn ProgressObserver);
        let mut remaining = retries;
        let mut attempt = 1u32;
        loop {
            let result = self.executor.execute_observed(spec, observer).await;
            if result.is_success() || result.error.is_some() || result.terminated {
                return result;
            }
            if remaining == 0 {
                tracing::warn!(attempts = attempt, "Job failed, no retries left");
                return result;
            }
            tracing::warn!(
                attempt,
                exit_code = ?result.exit_code,
                retries_left = remaining,
                "Job failed, retrying"
            );
            remaining -= 1;
            attempt += 1;
            tokio::time::sleep(self.retry_backoff).await;
        }
    }
}

fn hook_spec(base: &ExecSpec, argv: Vec<String>, stdin: String) -> ExecSpec {
    ExecSpec {
        argv,
        stdin: Some(StdinSource::Text(stdin)),
        ..base.clone()
    }
}

/// Launches the update hook in the background on every progress report.
struct UpdateHook {
    executor: ProcessExecutor,
    base: ExecSpec,
    descriptor: String,
    interval: Duration,
    running: Mutex<Vec<JoinHandle<()>>>,
}

impl UpdateHook {
    /// Wait for every hook launched so far.
    async fn drain(self) {
        let handles = match self.running.into_inner() {
            Ok(handles) => handles,
            Err(poisoned) => poisoned.into_inner(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Update hook task failed");
            }
        }
    }
}

impl ProgressObserver for UpdateHook {
    fn interval(&self) -> Duration {
        self.interval
    }

    fn on_progress(&self, report: ProgressReport) {
        let record = classad::running_record(&ExecutionSummary {
            pid: Some(report.pid),
            start_time: report.start_time,
            exec_time: report.elapsed.as_secs_f64(),
            ..Default::default()
        });
        let spec = ExecSpec {
            stdin: Some(StdinSource::Text(classad::append(&self.descriptor, &record))),
            ..self.base.clone()
        };
        let executor = self.executor;
        let handle = tokio::spawn(async move {
            let result = executor.execute(&spec).await;
            tracing::debug!(exit_code = ?result.exit_code, "Update hook done");
        });

        match self.running.lock() {
            Ok(mut running) => {
                running.retain(|h| !h.is_finished());
                running.push(handle);
            }
            Err(_) => tracing::warn!("Update hook registry poisoned, not tracking hook"),
        }
    }
}
