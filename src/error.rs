use thiserror::Error;

/// Errors that can occur while issuing or awaiting remote calls.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Request arguments or a reply could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Call arguments did not serialize to an ordered sequence.
    #[error("invalid call arguments: {0}")]
    InvalidArguments(String),

    /// The broker collaborator reported a failure (publish, declare, consume, ack).
    #[error("transport error: {0}")]
    Transport(String),

    /// The broker channel has been closed; no further publishes are possible.
    #[error("broker channel closed")]
    ChannelClosed,

    /// A correlation id was registered while an entry with the same id is
    /// still pending. Indicates a broken id generator.
    #[error("correlation id already pending: {0}")]
    DuplicateCorrelationId(String),

    /// No reply arrived within the caller-supplied bound.
    #[error("request timed out")]
    Timeout,

    /// The pending call was disposed before a reply was delivered.
    #[error("pending call disposed before a reply arrived")]
    Disposed,

    /// Client configuration rejected at build time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;
