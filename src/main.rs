use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing_subscriber::EnvFilter;

use spreader::broker::MemoryBroker;
use spreader::config::{
    BrokerConfig, ClientConfig, JobDefaults, WorkerConfig, DEFAULT_BROKER_PORT, DEFAULT_QUEUE,
};
use spreader::grpc::BrokerServer;
use spreader::node::WorkerNode;
use spreader::protocol::{DispatchResult, Options, SystemOptions};
use spreader::rpc::RpcClient;
use spreader::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "spreader")]
#[command(version)]
#[command(about = "Dispatch shell jobs to a pool of workers over a message broker")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the message broker
    Broker(BrokerArgs),

    /// Run a worker that executes dispatched jobs
    Worker(WorkerArgs),

    /// Dispatch one request and wait for its result
    Call(CallArgs),

    /// Launch several worker processes and supervise them
    StartWorkers(StartWorkersArgs),
}

// =============================================================================
// Broker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct BrokerArgs {
    /// Port to listen on for gRPC
    #[arg(long, default_value_t = DEFAULT_BROKER_PORT)]
    port: u16,
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Broker hostname
    #[arg(default_value = "localhost")]
    broker_host: String,

    /// Broker port
    #[arg(long, default_value_t = DEFAULT_BROKER_PORT)]
    port: u16,

    /// Queue to take requests from
    #[arg(long, default_value = DEFAULT_QUEUE)]
    queue: String,

    /// Create a private work directory per job under this directory
    #[arg(long)]
    scratch_root: Option<PathBuf>,

    // === Job Defaults ===
    /// Seconds before a job is sent SIGTERM (0 disables)
    #[arg(long, default_value_t = 600.0)]
    timeout: f64,

    /// Seconds between SIGTERM and SIGKILL
    #[arg(long, default_value_t = 10.0)]
    grace: f64,

    /// Extra attempts after a non-zero exit
    #[arg(long, default_value_t = 3)]
    retries: i64,

    /// Keep the work directory of failed jobs
    #[arg(long)]
    keep_failed_workdirs: bool,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct CallArgs {
    /// Broker hostname
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Broker port
    #[arg(long, default_value_t = DEFAULT_BROKER_PORT)]
    port: u16,

    /// Queue to publish the request to
    #[arg(long, default_value = DEFAULT_QUEUE)]
    queue: String,

    /// Working directory for the job on the worker
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Job timeout in seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Seconds between SIGTERM and SIGKILL
    #[arg(long)]
    grace: Option<f64>,

    /// Extra attempts after a non-zero exit
    #[arg(long)]
    retries: Option<i64>,

    /// Extra named option, value parsed as JSON when possible (repeatable)
    #[arg(long = "opt", value_name = "KEY=VALUE")]
    opts: Vec<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    /// Log broker traffic
    #[arg(short, long)]
    verbose: bool,

    /// Operation to invoke (e.g. "system")
    operation: String,

    /// Arguments of the operation
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Start-Workers Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct StartWorkersArgs {
    /// Number of workers (default: number of CPUs)
    #[arg(short = 'n', long)]
    count: Option<usize>,

    /// File receiving the output of all workers
    #[arg(long, default_value = "workers.log")]
    log: PathBuf,

    /// Arguments passed to every `spreader worker`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    worker_args: Vec<String>,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct WorkerPoolOutput {
    started: usize,
    completed: usize,
    failed: usize,
    killed: usize,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Parse `KEY=VALUE`, reading VALUE as JSON and falling back to a string.
fn parse_opt(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("invalid option '{}', expected KEY=VALUE", raw))?;
    if key.is_empty() {
        return Err(format!("invalid option '{}', empty key", raw));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn call_options(args: &CallArgs) -> Result<Options, Box<dyn std::error::Error>> {
    let system = SystemOptions {
        cwd: args.cwd.clone(),
        timeout: args.timeout,
        grace: args.grace,
        retries: args.retries,
        ..Default::default()
    };
    let mut options = system.to_options()?;
    for raw in &args.opts {
        let (key, value) = parse_opt(raw)?;
        options.insert(key, value);
    }
    Ok(options)
}

fn print_result(result: &DispatchResult, output_format: &OutputFormat) -> serde_json::Result<()> {
    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?);
        }
        OutputFormat::Table => {
            println!("Command:     {}", result.args.join(" "));
            println!("Host:        {}", result.host);
            println!("Cwd:         {}", result.cwd);
            if let Some(pid) = result.pid {
                println!("Pid:         {}", pid);
            }
            match result.exit_code {
                Some(code) => println!("Exit Code:   {}", code),
                None => println!("Exit Code:   -"),
            }
            if let Some(signal) = result.signal {
                println!("Signal:      {}", signal);
            }
            if result.terminated {
                println!("Terminated:  timeout");
            }
            println!("Exec Time:   {:.2}s", result.exec_time);
            if let Some(error) = &result.error {
                println!("Error:       {} ({})", error.message, error.kind);
            }
            for (label, stream) in [("Stdout", &result.stdout), ("Stderr", &result.stderr)] {
                if let Some(text) = stream.as_deref().filter(|s| !s.is_empty()) {
                    println!("{}:", label);
                    for line in text.lines() {
                        println!("  {}", line);
                    }
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Broker
// =============================================================================

async fn run_broker(args: BrokerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging("info");

    let listen_addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let shutdown = install_shutdown_handler();
    BrokerServer::new(listen_addr, MemoryBroker::new())
        .run(shutdown)
        .await?;
    Ok(())
}

// =============================================================================
// Worker
// =============================================================================

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging("info");

    let config = WorkerConfig {
        broker: BrokerConfig::new(args.broker_host, args.port),
        queue: args.queue,
        prefetch: 1,
        defaults: JobDefaults {
            timeout_secs: args.timeout,
            grace_secs: args.grace,
            retries: args.retries,
            scratch_root: args.scratch_root,
            cleanup_after_error: !args.keep_failed_workdirs,
            ..JobDefaults::default()
        },
    };

    tracing::info!(
        broker = %config.broker.endpoint(),
        queue = %config.queue,
        scratch_root = ?config.defaults.scratch_root,
        "Starting worker"
    );

    let node = WorkerNode::connect(config).await?;
    node.run(install_shutdown_handler()).await?;
    Ok(())
}

// =============================================================================
// Client
// =============================================================================

async fn run_call(args: CallArgs) -> Result<i32, Box<dyn std::error::Error>> {
    init_logging(if args.verbose { "debug" } else { "warn" });

    let options = call_options(&args)?;
    let config = ClientConfig {
        broker: BrokerConfig::new(args.host.clone(), args.port),
        queue: args.queue.clone(),
    };
    let client = RpcClient::connect(&config).await?;

    eprintln!("Requesting {}({})", args.operation, args.args.join(", "));
    let result = client
        .call_and_wait(args.operation.clone(), args.args.clone(), options)
        .await?;

    print_result(&result, &args.output)?;
    Ok(result.exit_status())
}

// =============================================================================
// Worker Pool
// =============================================================================

fn spawn_worker(
    exe: &std::path::Path,
    worker_args: &[String],
    log: &std::fs::File,
) -> std::io::Result<Child> {
    Command::new(exe)
        .arg("worker")
        .args(worker_args)
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log.try_clone()?)
        .kill_on_drop(true)
        .spawn()
}

async fn run_start_workers(args: StartWorkersArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging("info");

    let count = match args.count {
        Some(n) => n,
        None => std::thread::available_parallelism().map_or(1, |n| n.get()),
    };
    let exe = std::env::current_exe()?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.log)?;

    println!("Starting {} workers", count);
    println!("STDOUT and STDERR in {}", args.log.display());

    let mut running = Vec::with_capacity(count);
    for _ in 0..count {
        running.push(spawn_worker(&exe, &args.worker_args, &log)?);
    }

    let shutdown = install_shutdown_handler();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut summary = WorkerPoolOutput {
        started: count,
        completed: 0,
        failed: 0,
        killed: 0,
    };

    while !running.is_empty() {
        tokio::select! {
            _ = shutdown.cancelled() => {
                println!("Killing all running workers");
                for mut child in running.drain(..) {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(pid = ?child.id(), error = %e, "Failed to kill worker");
                    }
                    summary.killed += 1;
                }
                break;
            }
            _ = ticker.tick() => {
                let mut still_running = Vec::with_capacity(running.len());
                for mut child in running.drain(..) {
                    match child.try_wait() {
                        Ok(None) => still_running.push(child),
                        Ok(Some(status)) if status.success() => summary.completed += 1,
                        Ok(Some(status)) => {
                            tracing::warn!(status = %status, "Worker exited with errors");
                            summary.failed += 1;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to poll worker");
                            summary.failed += 1;
                        }
                    }
                }
                running = still_running;
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Broker(broker_args) => run_broker(broker_args).await?,
        Commands::Worker(worker_args) => run_worker(worker_args).await?,
        Commands::Call(call_args) => {
            let code = run_call(call_args).await?;
            std::process::exit(code);
        }
        Commands::StartWorkers(pool_args) => run_start_workers(pool_args).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_opt_reads_json_values() {
        assert_eq!(parse_opt("retries=2").unwrap(), ("retries".to_string(), json!(2)));
        assert_eq!(
            parse_opt("getenv=false").unwrap(),
            ("getenv".to_string(), json!(false))
        );
        assert_eq!(
            parse_opt("output=out.txt").unwrap(),
            ("output".to_string(), json!("out.txt"))
        );
        assert!(parse_opt("novalue").is_err());
        assert!(parse_opt("=1").is_err());
    }

    #[test]
    fn call_args_parse() {
        let args = Args::parse_from([
            "spreader", "call", "--timeout", "5", "--opt", "retries=0", "system", "ls", "-l",
        ]);
        let Commands::Call(call) = args.command else {
            panic!("expected call");
        };
        assert_eq!(call.operation, "system");
        assert_eq!(call.args, vec!["ls", "-l"]);

        let options = call_options(&call).unwrap();
        assert_eq!(options["timeout"], json!(5.0));
        assert_eq!(options["retries"], json!(0));
    }

    #[test]
    fn worker_args_default_to_localhost() {
        let args = Args::parse_from(["spreader", "worker"]);
        let Commands::Worker(worker) = args.command else {
            panic!("expected worker");
        };
        assert_eq!(worker.broker_host, "localhost");
        assert_eq!(worker.port, DEFAULT_BROKER_PORT);
        assert_eq!(worker.retries, 3);
    }
}
