//! Job descriptor records appended before the update and post hooks.
//!
//! The descriptor itself is opaque text. The runner only appends a
//! `key=value` record built from the running or finished process.

use crate::protocol::DispatchResult;

/// The process facts substituted into a record.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExecutionSummary {
    pub pid: Option<u32>,
    /// Epoch seconds
    pub start_time: f64,
    /// Wall-clock seconds
    pub exec_time: f64,
    pub terminated: bool,
    pub signal: Option<i32>,
    pub exit_code: Option<i32>,
}

impl From<&DispatchResult> for ExecutionSummary {
    fn from(result: &DispatchResult) -> Self {
        Self {
            pid: result.pid,
            start_time: result.start_time,
            exec_time: result.exec_time,
            terminated: result.terminated,
            signal: result.signal,
            exit_code: result.exit_code,
        }
    }
}

/// Record describing a job that is still running.
pub fn running_record(summary: &ExecutionSummary) -> String {
    common_lines("Running", summary).join("\n")
}

/// Record describing a job that has exited.
pub fn exited_record(summary: &ExecutionSummary) -> String {
    let mut lines = common_lines("Exited", summary);
    lines.extend([
        "ExitReason=exited".to_string(),
        format!("ExitBySignal={}", summary.terminated),
        format!("ExitSignal={}", optional(summary.signal)),
        format!("ExitCode={}", optional(summary.exit_code)),
        format!("JobDuration={:.2}", summary.exec_time),
    ]);
    lines.join("\n")
}

fn common_lines(state: &str, summary: &ExecutionSummary) -> Vec<String> {
    vec![
        format!("JobState={}", state),
        format!("JobPid={}", optional(summary.pid)),
        "NumPids=1".to_string(),
        format!("JobStartDate={}", summary.start_time.trunc() as i64),
        "RemoteSysCpu=0.00".to_string(),
        format!("RemoteUserCpu={:.2}", summary.exec_time),
        "ImageSize=0.00".to_string(),
    ]
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "undefined".to_string())
}

/// Append `record` to `descriptor`, starting it on a fresh line.
pub fn append(descriptor: &str, record: &str) -> String {
    let mut out = String::with_capacity(descriptor.len() + record.len() + 1);
    out.push_str(descriptor);
    if !descriptor.is_empty() && !descriptor.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(record);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> ExecutionSummary {
        ExecutionSummary {
            pid: Some(4242),
            start_time: 1_700_000_000.75,
            exec_time: 3.14159,
            terminated: false,
            signal: None,
            exit_code: Some(0),
        }
    }

    #[test]
    fn running_record_format() {
        let record = running_record(&summary());
        assert_eq!(
            record,
            "JobState=Running\nJobPid=4242\nNumPids=1\nJobStartDate=1700000000\n\
             RemoteSysCpu=0.00\nRemoteUserCpu=3.14\nImageSize=0.00"
        );
    }

    #[test]
    fn exited_record_format() {
        let record = exited_record(&summary());
        let lines: Vec<&str> = record.lines().collect();
        assert_eq!(lines[0], "JobState=Exited");
        assert_eq!(lines[6], "ImageSize=0.00");
        assert_eq!(
            &lines[7..],
            &[
                "ExitReason=exited",
                "ExitBySignal=false",
                "ExitSignal=undefined",
                "ExitCode=0",
                "JobDuration=3.14",
            ]
        );
    }

    #[test]
    fn exited_record_for_killed_job() {
        let record = exited_record(&ExecutionSummary {
            terminated: true,
            signal: Some(15),
            exit_code: Some(-15),
            ..summary()
        });
        assert!(record.contains("ExitBySignal=true\n"));
        assert!(record.contains("ExitSignal=15\n"));
        assert!(record.contains("ExitCode=-15\n"));
    }

    #[test]
    fn append_starts_record_on_new_line() {
        assert_eq!(
            append("Owner=\"alice\"", "JobState=Running"),
            "Owner=\"alice\"\nJobState=Running"
        );
        assert_eq!(
            append("Owner=\"alice\"\n", "JobState=Running"),
            "Owner=\"alice\"\nJobState=Running"
        );
        assert_eq!(append("", "JobState=Running"), "JobState=Running");
    }
}
