use std::collections::HashMap;
use std::sync::Arc;

use crate::config::JobDefaults;
use crate::error::{Result, SpreaderError};
use crate::protocol::{DispatchResult, Options, SystemOptions};
use crate::worker::runner::{JobRequest, JobRunner};

/// Something a worker can be asked to do by name.
#[tonic::async_trait]
pub trait Operation: Send + Sync {
    /// Run the operation. Errors are protocol failures of this request.
    async fn invoke(&self, args: Vec<String>, options: Options) -> Result<DispatchResult>;
}

/// Closed set of operations a worker accepts, fixed at startup.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    operations: HashMap<String, Arc<dyn Operation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `system` operation.
    pub fn with_defaults(defaults: JobDefaults) -> Self {
        let mut registry = Self::new();
        registry.register(
            SystemOperation::NAME,
            SystemOperation::new(JobRunner::default(), defaults),
        );
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, operation: impl Operation + 'static) {
        self.operations.insert(name.into(), Arc::new(operation));
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Operation>> {
        self.operations
            .get(name)
            .cloned()
            .ok_or_else(|| SpreaderError::UnknownOperation(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.names())
            .finish()
    }
}

/// Runs an external command through the [`JobRunner`].
#[derive(Debug, Clone)]
pub struct SystemOperation {
    runner: JobRunner,
    defaults: JobDefaults,
}

impl SystemOperation {
    pub const NAME: &'static str = "system";

    pub fn new(runner: JobRunner, defaults: JobDefaults) -> Self {
        Self { runner, defaults }
    }
}

#[tonic::async_trait]
impl Operation for SystemOperation {
    async fn invoke(&self, args: Vec<String>, options: Options) -> Result<DispatchResult> {
        if args.is_empty() {
            return Err(SpreaderError::MalformedRequest(
                "system needs at least an executable".to_string(),
            ));
        }
        let options = SystemOptions::from_options(options)
            .map_err(|e| SpreaderError::MalformedRequest(format!("invalid options: {}", e)))?;

        let job = JobRequest::from_options(args, options, &self.defaults);
        Ok(self.runner.run(&job).await)
    }
}
