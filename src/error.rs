use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpreaderError {
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Broker connection closed")]
    ConnectionClosed,

    #[error("gRPC error: {0}")]
    GrpcError(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SpreaderError {
    /// Protocol failures are reported back to the caller as error-shaped
    /// results instead of being treated as worker faults.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            SpreaderError::UnknownOperation(_) | SpreaderError::MalformedRequest(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SpreaderError>;
