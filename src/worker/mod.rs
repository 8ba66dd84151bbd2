//! Worker-side job execution.
//!
//! # Components
//!
//! - [`ProcessExecutor`]: runs one external command with timeout enforcement
//!   (SIGTERM, then SIGKILL after a grace period) and captures or redirects
//!   its output
//! - [`JobRunner`]: wraps the executor with retries, a private work
//!   directory and the pre/update/post hooks
//! - [`classad`]: job descriptor records handed to the hooks
//! - [`OperationRegistry`]: the closed set of operations a worker accepts
//!
//! # Execution Flow
//!
//! 1. [`WorkerNode`](crate::node::WorkerNode) decodes a dispatch request
//! 2. The named [`Operation`] is looked up in the registry
//! 3. `system` builds a [`JobRequest`] from the request options and the
//!    worker's [`JobDefaults`](crate::config::JobDefaults)
//! 4. [`JobRunner::run`] returns the [`DispatchResult`](crate::protocol::DispatchResult)
//!    of the last attempt
//!
//! # Security Note
//!
//! Commands run with the worker's privileges, without sandboxing.

pub mod classad;
pub mod executor;
pub mod registry;
pub mod runner;
pub mod workdir;

pub use executor::{ExecSpec, ProcessExecutor, ProgressObserver, ProgressReport, StdinSource};
pub use registry::{Operation, OperationRegistry, SystemOperation};
pub use runner::{JobRequest, JobRunner};
pub use workdir::{CleanupOutcome, WorkDir};
