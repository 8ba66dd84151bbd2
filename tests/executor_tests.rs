use std::time::{Duration, Instant};

use spreader::protocol::ErrorKind;
use spreader::worker::{ExecSpec, ProcessExecutor, ProgressObserver, ProgressReport, StdinSource};

fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn sh(script: &str) -> ExecSpec {
    ExecSpec::new(argv(&["/bin/sh", "-c", script]))
}

#[tokio::test]
async fn test_execute_simple_command() {
    let executor = ProcessExecutor::new();
    let result = executor.execute(&ExecSpec::new(argv(&["echo", "hello"]))).await;

    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout.as_deref(), Some("hello\n"));
    assert_eq!(result.stderr.as_deref(), Some(""));
    assert_eq!(result.args, vec!["echo", "hello"]);
    assert!(result.pid.is_some());
    assert!(result.signal.is_none());
    assert!(!result.terminated);
    assert!(result.error.is_none());
    assert!(result.start_time > 0.0);
    assert!(result.is_success());
}

#[tokio::test]
async fn test_execute_large_output() {
    let executor = ProcessExecutor::new();
    let result = executor.execute(&ExecSpec::new(argv(&["seq", "1", "20000"]))).await;

    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout.unwrap().lines().count(), 20000);
}

#[tokio::test]
async fn test_execute_command_failure() {
    let executor = ProcessExecutor::new();
    let result = executor
        .execute(&sh("echo 'error message' >&2; exit 3"))
        .await;

    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.stderr.as_deref(), Some("error message\n"));
    assert!(result.error.is_none());
    assert!(result.failed());
}

#[tokio::test]
async fn test_missing_executable_is_launch_failure() {
    let executor = ProcessExecutor::new();
    let result = executor
        .execute(&ExecSpec::new(argv(&["/nonexistent/definitely-not-here"])))
        .await;

    assert!(result.exit_code.is_none());
    assert!(result.pid.is_none());
    assert_eq!(result.error_kind(), Some(ErrorKind::Launch));
    assert_eq!(result.exit_status(), 127);
}

#[tokio::test]
async fn test_unopenable_redirect_is_launch_failure() {
    let executor = ProcessExecutor::new();
    let mut spec = ExecSpec::new(argv(&["true"]));
    spec.stdout = Some("/nonexistent/dir/out.txt".into());

    let result = executor.execute(&spec).await;
    assert_eq!(result.error_kind(), Some(ErrorKind::Launch));
    assert!(result.exit_code.is_none());
}

#[tokio::test]
async fn test_timeout_sends_sigterm() {
    let executor = ProcessExecutor::new();
    let spec = ExecSpec::new(argv(&["sleep", "5"]))
        .timeout(Duration::from_secs(1), Duration::from_secs(1));

    let started = Instant::now();
    let result = executor.execute(&spec).await;

    assert!(result.terminated);
    assert_eq!(result.exit_code, Some(-libc::SIGTERM));
    assert_eq!(result.signal, Some(libc::SIGTERM));
    assert!(result.exec_time >= 1.0, "exec_time {}", result.exec_time);
    assert!(result.exec_time <= 2.2, "exec_time {}", result.exec_time);
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(result.failed());
}

#[tokio::test]
async fn test_sigkill_after_grace() {
    let executor = ProcessExecutor::new();
    let spec = sh("trap '' TERM; sleep 5")
        .timeout(Duration::from_millis(500), Duration::from_millis(500));

    let result = executor.execute(&spec).await;

    assert!(result.terminated);
    assert_eq!(result.signal, Some(libc::SIGKILL));
    assert!(result.exec_time >= 1.0, "exec_time {}", result.exec_time);
    assert!(result.exec_time < 3.0, "exec_time {}", result.exec_time);
}

#[tokio::test]
async fn test_signal_death_reports_negative_exit_code() {
    let executor = ProcessExecutor::new();
    let result = executor.execute(&sh("kill -9 $$")).await;

    assert!(!result.terminated);
    assert_eq!(result.exit_code, Some(-libc::SIGKILL));
    assert_eq!(result.signal, Some(libc::SIGKILL));
    assert_eq!(result.exit_status(), 128 + libc::SIGKILL);
    assert!(result.failed());
}

#[tokio::test]
async fn test_zero_timeout_is_unbounded() {
    let executor = ProcessExecutor::new();
    let spec = ExecSpec::new(argv(&["sleep", "0.3"])).timeout(Duration::ZERO, Duration::ZERO);

    let result = executor.execute(&spec).await;
    assert!(!result.terminated);
    assert_eq!(result.exit_code, Some(0));
}

#[tokio::test]
async fn test_environment_overrides_inherited() {
    std::env::set_var("SPREADER_TEST_INHERITED", "from-parent");
    let executor = ProcessExecutor::new();

    let spec = sh("echo \"$SPREADER_TEST_INHERITED:$SPREADER_TEST_EXTRA\"")
        .env("SPREADER_TEST_EXTRA", "extra");
    let result = executor.execute(&spec).await;
    assert_eq!(result.stdout.as_deref(), Some("from-parent:extra\n"));

    let spec = sh("echo \"$SPREADER_TEST_INHERITED\"")
        .env("SPREADER_TEST_INHERITED", "override");
    let result = executor.execute(&spec).await;
    assert_eq!(result.stdout.as_deref(), Some("override\n"));
}

#[tokio::test]
async fn test_empty_environment_without_inherit() {
    let executor = ProcessExecutor::new();
    let spec = ExecSpec::new(argv(&["/usr/bin/env"])).inherit_env(false);

    let result = executor.execute(&spec).await;
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout.as_deref(), Some(""));
}

#[tokio::test]
async fn test_stdin_text_is_spooled() {
    let executor = ProcessExecutor::new();
    let spec = ExecSpec::new(argv(&["cat"])).stdin_text("JobState=Idle\nOwner=\"me\"\n");

    let result = executor.execute(&spec).await;
    assert_eq!(result.stdout.as_deref(), Some("JobState=Idle\nOwner=\"me\"\n"));
}

#[tokio::test]
async fn test_stdin_from_file_and_redirects() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.txt");
    let output = dir.path().join("out.txt");
    let errors = dir.path().join("err.txt");
    std::fs::write(&input, "line one\nline two\n").unwrap();
    std::fs::write(&output, "stale content that must be truncated\n").unwrap();

    let mut spec = sh("cat; echo oops >&2");
    spec.stdin = Some(StdinSource::File(input));
    spec.stdout = Some(output.clone());
    spec.stderr = Some(errors.clone());

    let result = ProcessExecutor::new().execute(&spec).await;
    assert_eq!(result.exit_code, Some(0));
    assert!(result.stdout.is_none());
    assert!(result.stderr.is_none());
    assert_eq!(std::fs::read_to_string(output).unwrap(), "line one\nline two\n");
    assert_eq!(std::fs::read_to_string(errors).unwrap(), "oops\n");
}

#[tokio::test]
async fn test_runs_in_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    let spec = ExecSpec::new(argv(&["pwd"])).cwd(dir.path());

    let result = ProcessExecutor::new().execute(&spec).await;
    let expected = dir.path().canonicalize().unwrap();
    assert_eq!(result.stdout.as_deref().map(str::trim), expected.to_str());
    assert_eq!(result.cwd, dir.path().display().to_string());
}

#[tokio::test]
async fn test_invalid_utf8_output_is_lossy() {
    let result = ProcessExecutor::new()
        .execute(&sh("printf 'ok\\377'"))
        .await;
    assert_eq!(result.stdout.as_deref(), Some("ok\u{FFFD}"));
}

struct CountingObserver {
    reports: std::sync::Mutex<Vec<ProgressReport>>,
}

impl ProgressObserver for CountingObserver {
    fn interval(&self) -> Duration {
        Duration::from_millis(200)
    }

    fn on_progress(&self, report: ProgressReport) {
        self.reports.lock().unwrap().push(report);
    }
}

#[tokio::test]
async fn test_progress_observer_is_notified() {
    let observer = CountingObserver {
        reports: std::sync::Mutex::new(Vec::new()),
    };
    let spec = ExecSpec::new(argv(&["sleep", "1"]));

    let result = ProcessExecutor::new()
        .execute_observed(&spec, Some(&observer))
        .await;
    assert_eq!(result.exit_code, Some(0));

    let reports = observer.reports.lock().unwrap();
    assert!(reports.len() >= 2, "got {} reports", reports.len());
    assert!(reports.iter().all(|r| Some(r.pid) == result.pid));
    assert!(reports.windows(2).all(|w| w[0].elapsed < w[1].elapsed));
}
