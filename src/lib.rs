pub mod broker;
pub mod config;
pub mod error;
pub mod grpc;
pub mod node;
pub mod protocol;
pub mod rpc;
pub mod shutdown;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("broker");
}
