use hc_protocol::{BindError, ProtocolError};

/// Errors surfaced by a [`crate::HubConnectionHandle`], its [`crate::ReceiveStream`],
/// or its invocation futures/streams. Mirrors `SessionError` in shape: one
/// variant per failure kind, `#[from]` for the two wrapped error types.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("argument binding failed: {0}")]
    Bind(#[from] BindError),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("invocation failed: {0}")]
    Invocation(String),

    #[error("connection closed")]
    ConnectionClosed,
}
