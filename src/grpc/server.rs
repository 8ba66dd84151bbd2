use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::broker::MemoryBroker;
use crate::grpc::broker_service::BrokerServiceImpl;
use crate::proto::broker_service_server::BrokerServiceServer;

pub struct BrokerServer {
    addr: SocketAddr,
    broker: MemoryBroker,
}

impl BrokerServer {
    pub fn new(addr: SocketAddr, broker: MemoryBroker) -> Self {
        Self { addr, broker }
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        let service = BrokerServiceImpl::new(self.broker.clone());

        tracing::info!(addr = %self.addr, "Starting broker gRPC server");

        Server::builder()
            .add_service(BrokerServiceServer::new(service))
            .serve_with_shutdown(self.addr, async move { shutdown.cancelled().await })
            .await
    }
}
