use std::sync::Arc;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broker::{ConsumeOptions, DeliveryStream, Message, RemoteBroker, Transport};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::protocol::{DispatchRequest, DispatchResult, Options, SystemOptions};
use crate::rpc::future::{PendingCalls, RpcFuture};

/// Issues dispatch requests and matches replies to their calls.
///
/// Each client owns a private reply queue. Any number of calls may be
/// outstanding at once; replies are routed by correlation token, so they
/// may arrive in any order.
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    queue: String,
    reply_queue: String,
    pending: PendingCalls,
    router: JoinHandle<()>,
}

impl RpcClient {
    /// Connect to the broker named in `config`.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let transport = RemoteBroker::connect(&config.broker).await?;
        Self::with_transport(Arc::new(transport), config.queue.clone()).await
    }

    /// Build a client publishing requests to `queue` over `transport`.
    pub async fn with_transport(
        transport: Arc<dyn Transport>,
        queue: impl Into<String>,
    ) -> Result<Self> {
        let queue = queue.into();
        // Requests published before any worker started must not be dropped.
        transport.declare_queue(Some(queue.as_str()), false).await?;

        let reply_queue = transport.declare_queue(None, true).await?;
        let replies = transport
            .consume(&reply_queue, ConsumeOptions::auto_ack())
            .await?;

        let pending = PendingCalls::default();
        let router = tokio::spawn(route_replies(
            replies,
            pending.clone(),
            reply_queue.clone(),
        ));

        tracing::debug!(queue = %queue, reply_queue = %reply_queue, "RPC client ready");
        Ok(Self {
            transport,
            queue,
            reply_queue,
            pending,
            router,
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Calls still waiting for a reply.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Publish a request and return a handle to its eventual result.
    pub async fn call(
        &self,
        operation: impl Into<String>,
        args: Vec<String>,
        options: Options,
    ) -> Result<RpcFuture> {
        let request = DispatchRequest::new(operation, args, options);
        let body = serde_json::to_vec(&request)?;
        let token = Uuid::new_v4().to_string();

        // Register before publishing so a fast reply cannot be missed.
        let rx = self.pending.register(&token);
        let message = Message::new(body)
            .with_reply_to(self.reply_queue.as_str())
            .with_correlation_id(token.as_str());
        if let Err(e) = self.transport.publish(&self.queue, message).await {
            self.pending.remove(&token);
            return Err(e);
        }

        tracing::debug!(
            operation = %request.operation,
            correlation_id = %token,
            "Request published"
        );
        Ok(RpcFuture::new(
            token,
            self.reply_queue.clone(),
            rx,
            self.pending.clone(),
        ))
    }

    /// Call and wait for the result. No timeout is applied.
    pub async fn call_and_wait(
        &self,
        operation: impl Into<String>,
        args: Vec<String>,
        options: Options,
    ) -> Result<DispatchResult> {
        self.call(operation, args, options).await?.into_result().await
    }

    /// Shorthand for the `system` operation.
    pub async fn system(&self, argv: Vec<String>, options: &SystemOptions) -> Result<RpcFuture> {
        self.call("system", argv, options.to_options()?).await
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.router.abort();
        self.pending.clear();
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("queue", &self.queue)
            .field("reply_queue", &self.reply_queue)
            .field("outstanding", &self.pending.len())
            .finish()
    }
}

/// Hand each reply to the call waiting for its token.
async fn route_replies(mut replies: DeliveryStream, pending: PendingCalls, reply_queue: String) {
    while let Some(delivery) = replies.recv().await {
        let Some(token) = delivery.message.correlation_id else {
            tracing::warn!(reply_queue = %reply_queue, "Reply without correlation id ignored");
            continue;
        };
        let Some(tx) = pending.take(&token) else {
            tracing::warn!(correlation_id = %token, "Reply for unknown call ignored");
            continue;
        };

        let result = serde_json::from_slice::<DispatchResult>(&delivery.message.body)
            .unwrap_or_else(|e| {
                tracing::warn!(correlation_id = %token, error = %e, "Undecodable reply");
                DispatchResult::protocol_error(Vec::new(), format!("undecodable reply: {}", e))
            });
        if tx.send(result).is_err() {
            tracing::debug!(correlation_id = %token, "Call dropped before its reply arrived");
        }
    }

    tracing::debug!(reply_queue = %reply_queue, "Reply stream closed");
    pending.clear();
}
