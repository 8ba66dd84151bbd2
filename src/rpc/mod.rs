//! Client side of the dispatch protocol.
//!
//! [`RpcClient::call`] publishes `[operation, args, options]` with a fresh
//! correlation token and the client's reply queue, and returns an
//! [`RpcFuture`] right away. A background task routes each reply to the
//! future holding the matching token; replies for unknown tokens are logged
//! and dropped.

pub mod client;
pub mod future;

pub use client::RpcClient;
pub use future::RpcFuture;
