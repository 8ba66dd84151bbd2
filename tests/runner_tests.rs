use std::path::{Path, PathBuf};
use std::time::Duration;

use spreader::config::JobDefaults;
use spreader::protocol::ErrorKind;
use spreader::worker::workdir::WORKDIR_PREFIX;
use spreader::worker::{JobRequest, JobRunner};

fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn job(args: &[&str]) -> JobRequest {
    let defaults = JobDefaults {
        timeout_secs: 10.0,
        grace_secs: 1.0,
        ..JobDefaults::default()
    };
    JobRequest::new(argv(args), &defaults)
}

fn runner() -> JobRunner {
    JobRunner::default().with_retry_backoff(Duration::from_millis(10))
}

/// Work directories currently present under `root`.
fn workdirs(root: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(root)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(WORKDIR_PREFIX))
        })
        .collect()
}

/// Write an executable shell script and return its path.
fn script(dir: &Path, name: &str, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.display().to_string()
}

#[tokio::test]
async fn test_permanent_failure_uses_all_retries() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("attempts");
    let cmd = format!("echo x >> {}; exec /bin/false", counter.display());

    let mut request = job(&["/bin/sh", "-c", &cmd]);
    request.retries = 2;

    let result = runner().run(&request).await;
    assert_eq!(result.exit_code, Some(1));
    assert_eq!(
        std::fs::read_to_string(&counter).unwrap().lines().count(),
        3,
        "retries + 1 attempts"
    );
}

#[tokio::test]
async fn test_retry_stops_at_first_success() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("attempts");
    // Fails twice, then succeeds.
    let cmd = format!(
        "echo x >> {0}; [ $(wc -l < {0}) -ge 3 ]",
        counter.display()
    );

    let mut request = job(&["/bin/sh", "-c", &cmd]);
    request.retries = 5;

    let result = runner().run(&request).await;
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(std::fs::read_to_string(&counter).unwrap().lines().count(), 3);
}

#[tokio::test]
async fn test_timeout_is_not_retried() {
    let mut request = job(&["sleep", "5"]);
    request.timeout = Duration::from_millis(300);
    request.grace = Duration::from_millis(300);
    request.retries = 3;

    let started = std::time::Instant::now();
    let result = runner().run(&request).await;
    assert!(result.terminated);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_launch_failure_is_not_retried() {
    let mut request = job(&["/nonexistent/binary"]);
    request.retries = 3;

    let result = runner().run(&request).await;
    assert_eq!(result.error_kind(), Some(ErrorKind::Launch));
}

#[tokio::test]
async fn test_workdir_created_and_removed_on_success() {
    let root = tempfile::tempdir().unwrap();
    let mut request = job(&["pwd"]);
    request.scratch_root = Some(root.path().to_path_buf());

    let result = runner().run(&request).await;
    assert_eq!(result.exit_code, Some(0));
    assert!(result.cwd.contains(WORKDIR_PREFIX), "cwd {}", result.cwd);
    assert!(workdirs(root.path()).is_empty());
}

#[tokio::test]
async fn test_failed_workdir_kept_when_cleanup_disabled() {
    let root = tempfile::tempdir().unwrap();
    let mut request = job(&["/bin/sh", "-c", "echo partial > result.txt; exit 2"]);
    request.scratch_root = Some(root.path().to_path_buf());
    request.cleanup_after_error = false;
    request.retries = 0;

    let result = runner().run(&request).await;
    assert_eq!(result.exit_code, Some(2));

    let kept = workdirs(root.path());
    assert_eq!(kept.len(), 1);
    assert_eq!(
        std::fs::read_to_string(kept[0].join("result.txt")).unwrap(),
        "partial\n"
    );
}

#[tokio::test]
async fn test_failed_workdir_removed_by_default() {
    let root = tempfile::tempdir().unwrap();
    let mut request = job(&["/bin/false"]);
    request.scratch_root = Some(root.path().to_path_buf());
    request.retries = 0;

    let result = runner().run(&request).await;
    assert!(result.failed());
    assert!(workdirs(root.path()).is_empty());
}

#[tokio::test]
async fn test_explicit_cwd_is_never_removed() {
    let dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let mut request = job(&["touch", "marker"]);
    request.cwd = Some(dir.path().to_path_buf());
    request.scratch_root = Some(root.path().to_path_buf());

    let result = runner().run(&request).await;
    assert_eq!(result.exit_code, Some(0));
    assert!(dir.path().join("marker").exists());
    assert!(workdirs(root.path()).is_empty());
}

#[tokio::test]
async fn test_relative_redirects_resolve_against_cwd() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("input.txt"), "hello from stdin\n").unwrap();

    let mut request = job(&["cat"]);
    request.cwd = Some(dir.path().to_path_buf());
    request.stdin_path = Some("input.txt".into());
    request.stdout_path = Some("output.txt".into());

    let result = runner().run(&request).await;
    assert_eq!(result.exit_code, Some(0));
    assert!(result.stdout.is_none());
    assert_eq!(
        std::fs::read_to_string(dir.path().join("output.txt")).unwrap(),
        "hello from stdin\n"
    );
}

#[tokio::test]
async fn test_pre_and_post_hooks_receive_classad() {
    let dir = tempfile::tempdir().unwrap();
    let pre_out = dir.path().join("pre.txt");
    let post_out = dir.path().join("post.txt");
    let pre = script(dir.path(), "pre.sh", &format!("cat > {}", pre_out.display()));
    let post = script(
        dir.path(),
        "post.sh",
        &format!("echo \"arg=$1\" > {0}; cat >> {0}", post_out.display()),
    );

    let mut request = job(&["/bin/sh", "-c", "exit 4"]);
    request.retries = 0;
    request.pre_hook = Some(pre);
    request.post_hook = Some(post);
    request.classad = Some("Owner=\"tester\"".to_string());

    let result = runner().run(&request).await;
    assert_eq!(result.exit_code, Some(4));

    assert_eq!(std::fs::read_to_string(&pre_out).unwrap(), "Owner=\"tester\"");

    let post_input = std::fs::read_to_string(&post_out).unwrap();
    let lines: Vec<&str> = post_input.lines().collect();
    assert_eq!(lines[0], "arg=exit");
    assert_eq!(lines[1], "Owner=\"tester\"");
    assert_eq!(lines[2], "JobState=Exited");
    assert_eq!(lines[3], format!("JobPid={}", result.pid.unwrap()));
    assert!(lines.contains(&"ExitCode=4"));
    assert!(lines.contains(&"ExitBySignal=false"));
    assert!(lines.contains(&"ExitReason=exited"));
}

#[tokio::test]
async fn test_post_hook_skipped_when_pre_hook_fails() {
    let dir = tempfile::tempdir().unwrap();
    let post_out = dir.path().join("post.txt");
    let pre = script(dir.path(), "pre.sh", "exit 1");
    let post = script(dir.path(), "post.sh", &format!("touch {}", post_out.display()));

    let mut request = job(&["true"]);
    request.pre_hook = Some(pre);
    request.post_hook = Some(post);
    request.classad = Some("Owner=\"tester\"\n".to_string());

    let result = runner().run(&request).await;
    // A failing pre hook never stops the job itself.
    assert_eq!(result.exit_code, Some(0));
    assert!(!post_out.exists());
}

#[tokio::test]
async fn test_hooks_need_classad() {
    let dir = tempfile::tempdir().unwrap();
    let pre_out = dir.path().join("pre.txt");
    let pre = script(dir.path(), "pre.sh", &format!("touch {}", pre_out.display()));

    let mut request = job(&["true"]);
    request.pre_hook = Some(pre);

    let result = runner().run(&request).await;
    assert_eq!(result.exit_code, Some(0));
    assert!(!pre_out.exists());
}

#[tokio::test]
async fn test_update_hook_runs_while_job_runs() {
    let dir = tempfile::tempdir().unwrap();
    let updates = dir.path().join("updates.txt");
    let update = script(
        dir.path(),
        "update.sh",
        &format!("grep JobState= >> {}", updates.display()),
    );

    let mut request = job(&["sleep", "1"]);
    request.update_hook = Some(update);
    request.update_interval = Duration::from_millis(250);
    request.classad = Some("Owner=\"tester\"".to_string());

    let result = runner().run(&request).await;
    assert_eq!(result.exit_code, Some(0));

    // Update hooks are drained before run() returns.
    let seen = std::fs::read_to_string(&updates).unwrap();
    assert!(seen.lines().count() >= 2, "updates: {:?}", seen);
    assert!(seen.lines().all(|l| l == "JobState=Running"));
}

#[tokio::test]
async fn test_update_interval_beyond_clock_range_skips_updates() {
    let dir = tempfile::tempdir().unwrap();
    let updates = dir.path().join("updates.txt");
    let update = script(dir.path(), "update.sh", &format!("touch {}", updates.display()));

    let mut request = job(&["sleep", "0.3"]);
    request.update_hook = Some(update);
    request.update_interval = Duration::MAX;
    request.classad = Some("Owner=\"tester\"".to_string());

    let result = runner().run(&request).await;
    assert_eq!(result.exit_code, Some(0));
    assert!(!updates.exists());
}
