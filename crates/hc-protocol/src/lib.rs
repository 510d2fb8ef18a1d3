//! Wire message model and codecs for the SignalR-compatible hub protocol.
//!
//! Two codecs implement [`HubProtocol`] over the same logical [`Message`]
//! shapes: [`json::JsonHubProtocol`] (record-separator-delimited JSON) and
//! [`messagepack::MessagePackHubProtocol`] (LEB128-length-prefixed
//! MessagePack). [`handshake`] is framed separately since it always
//! precedes protocol negotiation.

pub mod codec;
pub mod error;
pub mod handshake;
pub mod json;
pub mod message;
pub mod messagepack;

pub use codec::{HubProtocol, TransferMode};
pub use error::{BindError, ProtocolError};
pub use handshake::{HandshakeRequest, HandshakeResponse};
pub use json::JsonHubProtocol;
pub use message::{
    CancelInvocation, Close, Completion, CompletionPayload, Headers, Invocation, Message,
    RawValue, StreamInvocation, StreamItem,
};
pub use messagepack::MessagePackHubProtocol;
