//! Message broker transport.
//!
//! Workers and clients only talk to the broker through the [`Transport`]
//! trait: direct queues addressed by name, broker-named exclusive reply
//! queues, a reply-to address and correlation token on every message, and
//! explicit acknowledgement of deliveries.
//!
//! # Implementations
//!
//! - [`MemoryBroker`]: in-process broker state; also backs the gRPC broker
//!   server.
//! - [`RemoteBroker`]: gRPC client for a broker running in another process.

pub mod memory;
pub mod remote;

pub use memory::MemoryBroker;
pub use remote::RemoteBroker;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::proto;

/// A message as published to a queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub body: Vec<u8>,
    /// Queue the receiver should answer to
    pub reply_to: Option<String>,
    /// Opaque token echoed back on the reply
    pub correlation_id: Option<String>,
}

impl Message {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub queue: String,
    /// Tag to acknowledge the delivery with
    pub delivery_tag: u64,
    pub message: Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Maximum unacknowledged deliveries; 0 means unlimited
    pub prefetch: u32,
    /// Deliveries count as acknowledged as soon as they are sent
    pub auto_ack: bool,
}

impl ConsumeOptions {
    pub fn with_prefetch(prefetch: u32) -> Self {
        Self {
            prefetch,
            auto_ack: false,
        }
    }

    pub fn auto_ack() -> Self {
        Self {
            prefetch: 0,
            auto_ack: true,
        }
    }
}

/// Deliveries for one consumer. Dropping the receiver cancels the consumer
/// and returns its unacknowledged deliveries to the queue.
pub type DeliveryStream = mpsc::UnboundedReceiver<Delivery>;

#[tonic::async_trait]
pub trait Transport: Send + Sync {
    /// Declare a queue, returning its name. `None` asks the broker for a
    /// fresh unique name. Declaring an existing queue is a no-op.
    async fn declare_queue(&self, name: Option<&str>, exclusive: bool) -> Result<String>;

    /// Publish to the queue named by `routing_key`. Returns false when no
    /// such queue exists and the message was dropped.
    async fn publish(&self, routing_key: &str, message: Message) -> Result<bool>;

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream>;

    async fn ack(&self, queue: &str, delivery_tag: u64) -> Result<()>;
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

impl From<proto::Envelope> for Message {
    fn from(envelope: proto::Envelope) -> Self {
        Self {
            body: envelope.body,
            reply_to: non_empty(envelope.reply_to),
            correlation_id: non_empty(envelope.correlation_id),
        }
    }
}

impl From<Message> for proto::Envelope {
    fn from(message: Message) -> Self {
        Self {
            body: message.body,
            reply_to: message.reply_to.unwrap_or_default(),
            correlation_id: message.correlation_id.unwrap_or_default(),
        }
    }
}

impl From<Delivery> for proto::Delivery {
    fn from(delivery: Delivery) -> Self {
        Self {
            queue: delivery.queue,
            delivery_tag: delivery.delivery_tag,
            message: Some(delivery.message.into()),
        }
    }
}

impl From<proto::Delivery> for Delivery {
    fn from(delivery: proto::Delivery) -> Self {
        Self {
            queue: delivery.queue,
            delivery_tag: delivery.delivery_tag,
            message: delivery.message.map(Message::from).unwrap_or_default(),
        }
    }
}
