use std::pin::Pin;

use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status};

use crate::broker::{ConsumeOptions, MemoryBroker, Message, Transport};
use crate::error::SpreaderError;
use crate::proto::broker_service_server::BrokerService;
use crate::proto::{
    AckRequest, AckResponse, ConsumeRequest, DeclareQueueRequest, DeclareQueueResponse,
    Delivery as ProtoDelivery, PublishRequest, PublishResponse,
};

/// gRPC service exposing a [`MemoryBroker`] to remote workers and clients.
pub struct BrokerServiceImpl {
    broker: MemoryBroker,
}

impl BrokerServiceImpl {
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }
}

type DeliveryStream =
    Pin<Box<dyn tokio_stream::Stream<Item = Result<ProtoDelivery, Status>> + Send>>;

#[tonic::async_trait]
impl BrokerService for BrokerServiceImpl {
    type ConsumeStream = DeliveryStream;

    async fn declare_queue(
        &self,
        request: Request<DeclareQueueRequest>,
    ) -> Result<Response<DeclareQueueResponse>, Status> {
        let req = request.into_inner();
        let name = if req.name.is_empty() {
            None
        } else {
            Some(req.name.as_str())
        };

        let name = self
            .broker
            .declare_queue(name, req.exclusive)
            .await
            .map_err(to_status)?;
        Ok(Response::new(DeclareQueueResponse { name }))
    }

    async fn publish(
        &self,
        request: Request<PublishRequest>,
    ) -> Result<Response<PublishResponse>, Status> {
        let req = request.into_inner();
        if req.routing_key.is_empty() {
            return Err(Status::invalid_argument("Routing key cannot be empty"));
        }

        let message = req.message.map(Message::from).unwrap_or_default();
        let routed = self
            .broker
            .publish(&req.routing_key, message)
            .await
            .map_err(to_status)?;
        Ok(Response::new(PublishResponse { routed }))
    }

    async fn consume(
        &self,
        request: Request<ConsumeRequest>,
    ) -> Result<Response<Self::ConsumeStream>, Status> {
        let req = request.into_inner();
        if req.queue.is_empty() {
            return Err(Status::invalid_argument("Queue name cannot be empty"));
        }

        let options = ConsumeOptions {
            prefetch: req.prefetch,
            auto_ack: req.auto_ack,
        };
        let deliveries = self
            .broker
            .consume(&req.queue, options)
            .await
            .map_err(to_status)?;

        // When the client goes away tonic drops this stream, which drops the
        // receiver and cancels the consumer.
        let stream = UnboundedReceiverStream::new(deliveries)
            .map(|delivery| Ok(ProtoDelivery::from(delivery)));
        Ok(Response::new(Box::pin(stream) as Self::ConsumeStream))
    }

    async fn ack(&self, request: Request<AckRequest>) -> Result<Response<AckResponse>, Status> {
        let req = request.into_inner();
        self.broker
            .ack(&req.queue, req.delivery_tag)
            .await
            .map_err(to_status)?;
        Ok(Response::new(AckResponse {}))
    }
}

fn to_status(err: SpreaderError) -> Status {
    match err {
        SpreaderError::QueueNotFound(_) => Status::not_found(err.to_string()),
        SpreaderError::UnknownDeliveryTag(_) => Status::failed_precondition(err.to_string()),
        other => Status::internal(other.to_string()),
    }
}
