use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::broker::{ConsumeOptions, Delivery, Message, RemoteBroker, Transport};
use crate::config::WorkerConfig;
use crate::error::{Result, SpreaderError};
use crate::protocol::{DispatchRequest, DispatchResult, ErrorKind};
use crate::worker::OperationRegistry;

/// Where a worker is in its request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Receiving,
    Dispatching,
    Replying,
    ShutDown,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Idle => write!(f, "idle"),
            WorkerState::Receiving => write!(f, "receiving"),
            WorkerState::Dispatching => write!(f, "dispatching"),
            WorkerState::Replying => write!(f, "replying"),
            WorkerState::ShutDown => write!(f, "shut down"),
        }
    }
}

/// A worker process: consumes dispatch requests from the request queue, one
/// at a time, and answers each on its reply queue.
pub struct WorkerNode {
    config: WorkerConfig,
    transport: Arc<dyn Transport>,
    registry: OperationRegistry,
    state_tx: watch::Sender<WorkerState>,
}

impl WorkerNode {
    pub fn new(
        config: WorkerConfig,
        transport: Arc<dyn Transport>,
        registry: OperationRegistry,
    ) -> Self {
        let (state_tx, _) = watch::channel(WorkerState::Idle);
        Self {
            config,
            transport,
            registry,
            state_tx,
        }
    }

    /// Connect to the broker named in `config`, serving the built-in
    /// operations with the configured job defaults.
    pub async fn connect(config: WorkerConfig) -> Result<Self> {
        let transport = RemoteBroker::connect(&config.broker).await?;
        let registry = OperationRegistry::with_defaults(config.defaults.clone());
        Ok(Self::new(config, Arc::new(transport), registry))
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Watch the worker move through its request cycle.
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: WorkerState) {
        self.state_tx.send_replace(state);
    }

    /// Serve requests until `shutdown` is cancelled.
    ///
    /// A request already being handled runs to completion before the loop
    /// stops. Returns an error if the broker goes away.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let queue = self
            .transport
            .declare_queue(Some(self.config.queue.as_str()), false)
            .await?;
        let mut deliveries = self
            .transport
            .consume(&queue, ConsumeOptions::with_prefetch(self.config.prefetch))
            .await?;

        tracing::info!(
            queue = %queue,
            operations = ?self.registry.names(),
            "Awaiting RPC requests"
        );
        self.set_state(WorkerState::Idle);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("Worker shutting down");
                    break Ok(());
                }
                next = deliveries.recv() => match next {
                    Some(delivery) => {
                        if let Err(e) = self.handle_delivery(delivery).await {
                            break Err(e);
                        }
                    }
                    None => {
                        tracing::error!(queue = %queue, "Delivery stream closed by broker");
                        break Err(SpreaderError::ConnectionClosed);
                    }
                }
            }
        };

        self.set_state(WorkerState::ShutDown);
        outcome
    }

    /// Run one request and reply to it. The delivery is acknowledged only
    /// after the reply was published.
    pub async fn handle_delivery(&self, delivery: Delivery) -> Result<()> {
        self.set_state(WorkerState::Receiving);
        let Delivery {
            queue,
            delivery_tag,
            message,
        } = delivery;
        tracing::debug!(
            queue = %queue,
            delivery_tag,
            correlation_id = ?message.correlation_id,
            "Received request"
        );

        self.set_state(WorkerState::Dispatching);
        let result = self.dispatch(&message.body).await;

        self.set_state(WorkerState::Replying);
        let body = serde_json::to_vec(&result)?;
        match message.reply_to {
            Some(reply_to) => {
                let mut reply = Message::new(body);
                reply.correlation_id = message.correlation_id;
                let routed = self.transport.publish(&reply_to, reply).await?;
                if !routed {
                    tracing::warn!(reply_to = %reply_to, "Reply queue gone, result dropped");
                }
            }
            None => {
                tracing::warn!(
                    result = %String::from_utf8_lossy(&body),
                    "Request has no reply address, result dropped"
                );
            }
        }

        self.transport.ack(&queue, delivery_tag).await?;
        self.set_state(WorkerState::Idle);
        Ok(())
    }

    /// Decode a request body and invoke the operation it names. Problems
    /// with the request itself become error-shaped results.
    pub async fn dispatch(&self, body: &[u8]) -> DispatchResult {
        let request: DispatchRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed request");
                return DispatchResult::protocol_error(
                    Vec::new(),
                    SpreaderError::MalformedRequest(e.to_string()).to_string(),
                );
            }
        };

        let operation = match self.registry.get(&request.operation) {
            Ok(operation) => operation,
            Err(e) => {
                tracing::warn!(operation = %request.operation, "Unknown operation requested");
                return DispatchResult::protocol_error(request.args, e.to_string());
            }
        };

        tracing::info!(
            operation = %request.operation,
            args = ?request.args,
            "Dispatching request"
        );
        match operation.invoke(request.args.clone(), request.options).await {
            Ok(result) => result,
            Err(e) if e.is_protocol() => {
                tracing::warn!(error = %e, "Rejected request");
                DispatchResult::protocol_error(request.args, e.to_string())
            }
            Err(e) => {
                tracing::error!(error = %e, "Operation failed");
                DispatchResult::failure(request.args, ErrorKind::Internal, e.to_string())
            }
        }
    }
}
