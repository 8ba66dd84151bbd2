//! Wire types exchanged between RPC clients and workers.
//!
//! Requests travel as the JSON triple `[operation, args, options]`; replies
//! are a JSON [`DispatchResult`] record.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Exit code reported by the client CLI for protocol-level failures.
pub const PROTOCOL_FAILURE_EXIT_CODE: i32 = 125;

/// Exit code reported by the client CLI when the command could not be started.
pub const LAUNCH_FAILURE_EXIT_CODE: i32 = 127;

/// Named options of a dispatch request.
pub type Options = Map<String, Value>;

type RequestWire = (String, Vec<Value>, Options);

/// A request for a worker to run `operation` with `args` and `options`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RequestWire", into = "RequestWire")]
pub struct DispatchRequest {
    pub operation: String,
    pub args: Vec<String>,
    pub options: Options,
}

impl DispatchRequest {
    pub fn new(operation: impl Into<String>, args: Vec<String>, options: Options) -> Self {
        Self {
            operation: operation.into(),
            args,
            options,
        }
    }
}

impl From<RequestWire> for DispatchRequest {
    fn from((operation, args, options): RequestWire) -> Self {
        Self {
            operation,
            args: args.into_iter().map(stringify_arg).collect(),
            options,
        }
    }
}

impl From<DispatchRequest> for RequestWire {
    fn from(req: DispatchRequest) -> Self {
        (
            req.operation,
            req.args.into_iter().map(Value::String).collect(),
            req.options,
        )
    }
}

/// Arguments are opaque strings; anything else is sent in its textual form.
fn stringify_arg(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The executable could not be started.
    Launch,
    /// Unknown operation, malformed request or undecodable reply.
    Protocol,
    /// The worker failed for a reason unrelated to the request.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Launch => write!(f, "launch"),
            ErrorKind::Protocol => write!(f, "protocol"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of one process execution, as returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    #[serde(alias = "argv")]
    pub args: Vec<String>,
    #[serde(alias = "hostname")]
    pub host: String,
    /// Epoch seconds
    pub start_time: f64,
    /// Wall-clock seconds
    pub exec_time: f64,
    pub terminated: bool,
    pub cwd: String,
    pub pid: Option<u32>,
    pub signal: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DispatchError>,
}

impl DispatchResult {
    /// A result for a process that has not finished (or not started) yet.
    pub fn pending(args: Vec<String>, cwd: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            stdout: None,
            stderr: None,
            args,
            host: local_hostname().to_string(),
            start_time: now_epoch_secs(),
            exec_time: 0.0,
            terminated: false,
            cwd: cwd.into(),
            pid: None,
            signal: None,
            error: None,
        }
    }

    /// Error-shaped result sent back when a request cannot be honoured.
    pub fn protocol_error(args: Vec<String>, message: impl Into<String>) -> Self {
        Self::failure(args, ErrorKind::Protocol, message)
    }

    pub fn failure(args: Vec<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        let cwd = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let mut result = Self::pending(args, cwd);
        result.error = Some(DispatchError {
            kind,
            message: message.into(),
        });
        result
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.terminated && self.exit_code == Some(0)
    }

    /// True when the job did not complete successfully, for any reason.
    pub fn failed(&self) -> bool {
        !self.is_success()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Process exit code a CLI should report for this result.
    pub fn exit_status(&self) -> i32 {
        match self.error_kind() {
            Some(ErrorKind::Launch) => return LAUNCH_FAILURE_EXIT_CODE,
            Some(ErrorKind::Protocol) | Some(ErrorKind::Internal) => {
                return PROTOCOL_FAILURE_EXIT_CODE
            }
            None => {}
        }
        match (self.exit_code, self.signal) {
            (_, Some(signal)) => 128 + signal,
            (Some(code), None) => code,
            (None, None) => 1,
        }
    }
}

/// Named options understood by the `system` operation.
///
/// Every field is optional; the worker fills the gaps from its
/// [`JobDefaults`](crate::config::JobDefaults). Older option names are
/// accepted as aliases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SystemOptions {
    pub environment: Option<HashMap<String, String>>,
    #[serde(alias = "getenv")]
    pub inherit_env: Option<bool>,
    pub timeout: Option<f64>,
    #[serde(alias = "kill_after")]
    pub grace: Option<f64>,
    #[serde(alias = "root_dir")]
    pub scratch_root: Option<PathBuf>,
    #[serde(alias = "cleanup_after_errors")]
    pub cleanup_after_error: Option<bool>,
    pub cwd: Option<PathBuf>,
    #[serde(alias = "pre_proc")]
    pub pre_hook: Option<String>,
    #[serde(alias = "update_proc")]
    pub update_hook: Option<String>,
    pub update_interval: Option<f64>,
    #[serde(alias = "post_proc")]
    pub post_hook: Option<String>,
    pub classad: Option<String>,
    #[serde(alias = "output")]
    pub stdout_path: Option<PathBuf>,
    #[serde(alias = "error")]
    pub stderr_path: Option<PathBuf>,
    #[serde(alias = "input")]
    pub stdin_path: Option<PathBuf>,
    #[serde(deserialize_with = "deserialize_retries")]
    pub retries: Option<i64>,
}

impl SystemOptions {
    pub fn from_options(options: Options) -> serde_json::Result<Self> {
        serde_json::from_value(Value::Object(options))
    }

    /// Options map with unset fields left out.
    pub fn to_options(&self) -> serde_json::Result<Options> {
        match serde_json::to_value(self)? {
            Value::Object(mut map) => {
                map.retain(|_, v| !v.is_null());
                Ok(map)
            }
            _ => Ok(Options::new()),
        }
    }
}

/// Current time as fractional seconds since the Unix epoch.
pub fn now_epoch_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Hostname of this machine, resolved once.
pub fn local_hostname() -> &'static str {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    HOSTNAME.get_or_init(|| read_hostname().unwrap_or_else(|| "localhost".to_string()))
}

fn read_hostname() -> Option<String> {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().into_owned())
        .filter(|s| !s.trim().is_empty())
}

/// Accept a retry count written as an integer or as an integral float
/// such as `2.0`.
fn deserialize_retries<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<serde_json::Number>::deserialize(deserializer)? {
        None => Ok(None),
        Some(n) => {
            if let Some(v) = n.as_i64() {
                return Ok(Some(v));
            }
            if n.is_u64() {
                return Ok(Some(i64::MAX));
            }
            match n.as_f64() {
                Some(f) if f.is_finite() && f.fract() == 0.0 => Ok(Some(f as i64)),
                _ => Err(D::Error::custom(format!(
                    "retries must be a whole number, got {}",
                    n
                ))),
            }
        }
    }
}
