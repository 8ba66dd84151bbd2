use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::broker::{ConsumeOptions, Delivery, DeliveryStream, Message, Transport};
use crate::error::{Result, SpreaderError};

/// Prefix of broker-generated queue names.
const GENERATED_QUEUE_PREFIX: &str = "spreader.gen-";

/// In-process broker.
///
/// Messages are handed round-robin to consumers that still have prefetch
/// capacity. Unacknowledged deliveries go back to the head of the queue when
/// their consumer disappears. An exclusive queue is deleted once its last
/// consumer is gone.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

/// Snapshot of a queue, for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub unacked: usize,
    pub consumers: usize,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    next_tag: u64,
}

#[derive(Debug)]
struct QueueState {
    exclusive: bool,
    ready: VecDeque<Message>,
    consumers: Vec<Consumer>,
    unacked: HashMap<u64, Unacked>,
    cursor: usize,
}

#[derive(Debug)]
struct Consumer {
    id: Uuid,
    tx: mpsc::UnboundedSender<Delivery>,
    options: ConsumeOptions,
    in_flight: u32,
}

impl Consumer {
    fn has_capacity(&self) -> bool {
        self.options.auto_ack
            || self.options.prefetch == 0
            || self.in_flight < self.options.prefetch
    }
}

#[derive(Debug)]
struct Unacked {
    consumer: Uuid,
    message: Message,
}

impl QueueState {
    fn new(exclusive: bool) -> Self {
        Self {
            exclusive,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            unacked: HashMap::new(),
            cursor: 0,
        }
    }

    fn next_consumer_with_capacity(&mut self) -> Option<usize> {
        let n = self.consumers.len();
        (0..n)
            .map(|offset| (self.cursor + offset) % n)
            .find(|&idx| self.consumers[idx].has_capacity())
    }

    /// Hand ready messages to consumers until either runs out.
    fn dispatch(&mut self, name: &str, next_tag: &mut u64) {
        while !self.ready.is_empty() {
            let Some(idx) = self.next_consumer_with_capacity() else {
                break;
            };
            let Some(message) = self.ready.pop_front() else {
                break;
            };
            *next_tag += 1;
            let tag = *next_tag;
            let consumer = &mut self.consumers[idx];
            // Keep a copy for redelivery until the consumer acknowledges it.
            let retained = (!consumer.options.auto_ack).then(|| message.clone());
            let delivery = Delivery {
                queue: name.to_string(),
                delivery_tag: tag,
                message,
            };

            match consumer.tx.send(delivery) {
                Ok(()) => {
                    if let Some(message) = retained {
                        consumer.in_flight += 1;
                        let consumer_id = consumer.id;
                        self.unacked.insert(
                            tag,
                            Unacked {
                                consumer: consumer_id,
                                message,
                            },
                        );
                    }
                    self.cursor = (idx + 1) % self.consumers.len();
                }
                Err(mpsc::error::SendError(returned)) => {
                    // Receiver is gone; put the message back and drop the consumer.
                    let consumer_id = consumer.id;
                    self.ready.push_front(returned.message);
                    self.remove_consumer(consumer_id);
                }
            }
        }
    }

    fn remove_consumer(&mut self, id: Uuid) -> bool {
        let before = self.consumers.len();
        self.consumers.retain(|c| c.id != id);
        if self.consumers.len() == before {
            return false;
        }
        if self.cursor >= self.consumers.len() {
            self.cursor = 0;
        }

        let mut returned: Vec<(u64, Message)> = Vec::new();
        self.unacked.retain(|tag, pending| {
            if pending.consumer == id {
                returned.push((*tag, std::mem::take(&mut pending.message)));
                false
            } else {
                true
            }
        });
        returned.sort_by_key(|(tag, _)| *tag);
        for (_, message) in returned.into_iter().rev() {
            self.ready.push_front(message);
        }
        true
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            ready: self.ready.len(),
            unacked: self.unacked.len(),
            consumers: self.consumers.len(),
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn queue_stats(&self, name: &str) -> Option<QueueStats> {
        self.state.lock().await.queues.get(name).map(QueueState::stats)
    }

    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().await.queues.keys().cloned().collect();
        names.sort();
        names
    }

    async fn cancel_consumer(&self, queue: &str, consumer_id: Uuid) {
        let mut state = self.state.lock().await;
        let BrokerState { queues, next_tag } = &mut *state;

        let Some(q) = queues.get_mut(queue) else {
            return;
        };
        let removed = q.remove_consumer(consumer_id);
        if removed {
            tracing::debug!(queue, consumer_id = %consumer_id, "Consumer cancelled");
        }

        if q.exclusive && q.consumers.is_empty() {
            queues.remove(queue);
            tracing::debug!(queue, "Exclusive queue deleted");
        } else if removed {
            q.dispatch(queue, next_tag);
        }
    }
}

#[tonic::async_trait]
impl Transport for MemoryBroker {
    async fn declare_queue(&self, name: Option<&str>, exclusive: bool) -> Result<String> {
        let name = match name {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => format!("{}{}", GENERATED_QUEUE_PREFIX, Uuid::new_v4().simple()),
        };

        let mut state = self.state.lock().await;
        state.queues.entry(name.clone()).or_insert_with(|| {
            tracing::debug!(queue = %name, exclusive, "Queue declared");
            QueueState::new(exclusive)
        });
        Ok(name)
    }

    async fn publish(&self, routing_key: &str, message: Message) -> Result<bool> {
        let mut state = self.state.lock().await;
        let BrokerState { queues, next_tag } = &mut *state;

        match queues.get_mut(routing_key) {
            Some(q) => {
                q.ready.push_back(message);
                q.dispatch(routing_key, next_tag);
                Ok(true)
            }
            None => {
                tracing::warn!(queue = routing_key, "Unroutable message dropped");
                Ok(false)
            }
        }
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let consumer_id = Uuid::new_v4();
        {
            let mut state = self.state.lock().await;
            let BrokerState { queues, next_tag } = &mut *state;
            let q = queues
                .get_mut(queue)
                .ok_or_else(|| SpreaderError::QueueNotFound(queue.to_string()))?;
            q.consumers.push(Consumer {
                id: consumer_id,
                tx: tx.clone(),
                options,
                in_flight: 0,
            });
            q.dispatch(queue, next_tag);
        }
        tracing::debug!(
            queue,
            consumer_id = %consumer_id,
            prefetch = options.prefetch,
            auto_ack = options.auto_ack,
            "Consumer registered"
        );

        // Cancel the consumer once its receiver is dropped.
        let broker = self.clone();
        let queue = queue.to_string();
        tokio::spawn(async move {
            tx.closed().await;
            broker.cancel_consumer(&queue, consumer_id).await;
        });

        Ok(rx)
    }

    async fn ack(&self, queue: &str, delivery_tag: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let BrokerState { queues, next_tag } = &mut *state;

        let q = queues
            .get_mut(queue)
            .ok_or_else(|| SpreaderError::QueueNotFound(queue.to_string()))?;
        let pending = q
            .unacked
            .remove(&delivery_tag)
            .ok_or(SpreaderError::UnknownDeliveryTag(delivery_tag))?;
        if let Some(consumer) = q.consumers.iter_mut().find(|c| c.id == pending.consumer) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }
        q.dispatch(queue, next_tag);
        Ok(())
    }
}
