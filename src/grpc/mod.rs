//! gRPC face of the in-process broker.
//!
//! - [`BrokerServer`]: binds the listener and serves `broker.BrokerService`
//! - [`BrokerServiceImpl`]: maps RPCs onto a [`MemoryBroker`](crate::broker::MemoryBroker)

pub mod broker_service;
pub mod server;

pub use broker_service::BrokerServiceImpl;
pub use server::BrokerServer;
