use tokio::sync::mpsc;
use tonic::transport::{Channel, Endpoint};

use crate::broker::{ConsumeOptions, Delivery, DeliveryStream, Message, Transport};
use crate::config::BrokerConfig;
use crate::error::{Result, SpreaderError};
use crate::proto::broker_service_client::BrokerServiceClient;
use crate::proto::{AckRequest, ConsumeRequest, DeclareQueueRequest, PublishRequest};

/// [`Transport`] backed by a broker reached over gRPC.
#[derive(Debug, Clone)]
pub struct RemoteBroker {
    client: BrokerServiceClient<Channel>,
    endpoint: String,
}

impl RemoteBroker {
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let endpoint = config.endpoint();
        let channel = Endpoint::from_shared(endpoint.clone())
            .map_err(|e| SpreaderError::Internal(format!("Invalid endpoint {}: {}", endpoint, e)))?
            .connect()
            .await?;

        tracing::info!(endpoint = %endpoint, "Connected to broker");
        Ok(Self {
            client: BrokerServiceClient::new(channel),
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[tonic::async_trait]
impl Transport for RemoteBroker {
    async fn declare_queue(&self, name: Option<&str>, exclusive: bool) -> Result<String> {
        let response = self
            .client
            .clone()
            .declare_queue(DeclareQueueRequest {
                name: name.unwrap_or_default().to_string(),
                exclusive,
            })
            .await?
            .into_inner();
        Ok(response.name)
    }

    async fn publish(&self, routing_key: &str, message: Message) -> Result<bool> {
        let response = self
            .client
            .clone()
            .publish(PublishRequest {
                routing_key: routing_key.to_string(),
                message: Some(message.into()),
            })
            .await?
            .into_inner();
        Ok(response.routed)
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream> {
        let mut stream = self
            .client
            .clone()
            .consume(ConsumeRequest {
                queue: queue.to_string(),
                prefetch: options.prefetch,
                auto_ack: options.auto_ack,
            })
            .await?
            .into_inner();

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = queue.to_string();

        // Forward deliveries until either side goes away. Dropping the gRPC
        // stream cancels the consumer on the broker.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    next = stream.message() => match next {
                        Ok(Some(delivery)) => {
                            if tx.send(Delivery::from(delivery)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            tracing::debug!(queue = %queue, "Broker closed the delivery stream");
                            break;
                        }
                        Err(status) => {
                            tracing::warn!(queue = %queue, error = %status, "Delivery stream failed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn ack(&self, queue: &str, delivery_tag: u64) -> Result<()> {
        self.client
            .clone()
            .ack(AckRequest {
                queue: queue.to_string(),
                delivery_tag,
            })
            .await?;
        Ok(())
    }
}
