use crate::error::ProtocolError;
use crate::message::Message;

/// Frame kind a transport should use, consulted once after handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Text,
    Binary,
}

/// A stateless-except-for-residual-buffer codec for one wire encoding.
///
/// Implementations: [`crate::json::JsonHubProtocol`],
/// [`crate::messagepack::MessagePackHubProtocol`].
pub trait HubProtocol {
    /// Frame kind this protocol expects the transport to use.
    fn transfer_mode(&self) -> TransferMode;

    /// Serialize one logical message, appending its bytes to `sink`.
    fn write_message(&self, message: &Message, sink: &mut Vec<u8>) -> Result<(), ProtocolError>;

    /// Consume as many complete frames as `residual` (callers append newly
    /// read bytes to `residual` before calling) contains.
    ///
    /// Each complete frame decodes to either a [`Message`] or, for a
    /// malformed frame, a [`ProtocolError`] — one result per frame, in
    /// receipt order, so the caller can push each onto the receive channel
    /// positionally (a single malformed frame does not stop the others from
    /// decoding; see the data model's framing invariant). Bytes belonging
    /// to an incomplete trailing frame are left in `residual` for the next
    /// call.
    fn parse_messages(
        &self,
        residual: &mut Vec<u8>,
        maximum_message_size: usize,
    ) -> Vec<Result<Message, ProtocolError>>;
}
