use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Well-known queue that workers consume dispatch requests from.
pub const DEFAULT_QUEUE: &str = "rpc_queue";

/// Default gRPC port of the broker.
pub const DEFAULT_BROKER_PORT: u16 = 50051;

/// Where to reach the message broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker hostname or IP address
    pub host: String,
    pub port: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_BROKER_PORT,
        }
    }
}

impl BrokerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// gRPC endpoint URI for this broker.
    pub fn endpoint(&self) -> String {
        if self.host.starts_with("http://") || self.host.starts_with("https://") {
            format!("{}:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }
}

/// Defaults applied to every `system` call unless the request overrides them.
///
/// These mirror the knobs a caller can pass as named options; the worker
/// operator can change them per worker process from the command line.
#[derive(Debug, Clone)]
pub struct JobDefaults {
    /// Seconds before SIGTERM is sent. Zero or negative disables the timeout.
    pub timeout_secs: f64,
    /// Seconds between SIGTERM and SIGKILL.
    pub grace_secs: f64,
    /// Extra attempts after a non-zero exit.
    pub retries: i64,
    /// Root under which per-job work directories are created.
    pub scratch_root: Option<PathBuf>,
    /// Remove the work directory even when the job failed.
    pub cleanup_after_error: bool,
    /// Start jobs from the worker's own environment.
    pub inherit_env: bool,
    /// Seconds between update hook invocations.
    pub update_interval_secs: f64,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: 600.0,
            grace_secs: 10.0,
            retries: 3,
            scratch_root: None,
            cleanup_after_error: true,
            inherit_env: true,
            update_interval_secs: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub broker: BrokerConfig,
    /// Queue to consume dispatch requests from
    pub queue: String,
    /// In-flight deliveries per worker process
    pub prefetch: u32,
    pub defaults: JobDefaults,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            queue: DEFAULT_QUEUE.to_string(),
            prefetch: 1,
            defaults: JobDefaults::default(),
        }
    }
}

impl WorkerConfig {
    pub fn new(broker: BrokerConfig) -> Self {
        Self {
            broker,
            ..Default::default()
        }
    }

    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.defaults.scratch_root = Some(root.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub broker: BrokerConfig,
    /// Queue requests are published to
    pub queue: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            queue: DEFAULT_QUEUE.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerServerConfig {
    pub listen_addr: SocketAddr,
}

impl Default for BrokerServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_BROKER_PORT)),
        }
    }
}

/// Convert a seconds value coming from the wire into a `Duration`,
/// treating negative, NaN and infinite values as zero.
pub fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_config_default() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.host, "localhost");
        assert_eq!(cfg.port, 50051);
        assert_eq!(cfg.endpoint(), "http://localhost:50051");
    }

    #[test]
    fn broker_config_keeps_explicit_scheme() {
        let cfg = BrokerConfig::new("https://broker.example.com", 443);
        assert_eq!(cfg.endpoint(), "https://broker.example.com:443");
    }

    #[test]
    fn job_defaults_default() {
        let cfg = JobDefaults::default();
        assert_eq!(cfg.timeout_secs, 600.0);
        assert_eq!(cfg.grace_secs, 10.0);
        assert_eq!(cfg.retries, 3);
        assert!(cfg.scratch_root.is_none());
        assert!(cfg.cleanup_after_error);
        assert!(cfg.inherit_env);
        assert_eq!(cfg.update_interval_secs, 1.0);
    }

    #[test]
    fn worker_config_default() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.queue, "rpc_queue");
        assert_eq!(cfg.prefetch, 1);
        assert_eq!(cfg.broker.host, "localhost");
    }

    #[test]
    fn worker_config_with_scratch_root() {
        let cfg =
            WorkerConfig::new(BrokerConfig::new("10.0.0.1", 9000)).with_scratch_root("/scratch");
        assert_eq!(cfg.broker.endpoint(), "http://10.0.0.1:9000");
        assert_eq!(cfg.defaults.scratch_root, Some(PathBuf::from("/scratch")));
    }

    #[test]
    fn broker_server_config_default() {
        let cfg = BrokerServerConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:50051");
    }

    #[test]
    fn secs_to_duration_clamps_invalid_values() {
        assert_eq!(secs_to_duration(1.5), Duration::from_millis(1500));
        assert_eq!(secs_to_duration(0.0), Duration::ZERO);
        assert_eq!(secs_to_duration(-3.0), Duration::ZERO);
        assert_eq!(secs_to_duration(f64::NAN), Duration::ZERO);
        assert_eq!(secs_to_duration(f64::INFINITY), Duration::ZERO);
    }
}
