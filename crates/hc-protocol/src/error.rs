/// An argument or stream item could not be coerced to the declared target
/// type. Carries the underlying decoder's message; never corrupts the
/// connection — the caller reports this per-argument.
#[derive(Debug, Clone, thiserror::Error)]
#[error("could not bind value: {0}")]
pub struct BindError(pub String);

/// Malformed frame, unknown required field, size-cap exceeded, or any
/// other violation of the wire contract in a single message.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid MessagePack: {0}")]
    MsgPack(String),

    #[error("frame length prefix {declared} exceeds maximum receive message size {maximum}")]
    FrameTooLarge { declared: usize, maximum: usize },

    #[error("message missing required field `{0}`")]
    MissingField(&'static str),

    #[error("unknown message type tag {0}")]
    UnknownType(i64),

    #[error("completion for invocation {0} carries both a result and an error")]
    CompletionHasBothResultAndError(String),

    #[error("completion received for unknown invocation id {0}")]
    UnknownInvocationId(String),
}
