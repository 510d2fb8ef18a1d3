//! The byte-oriented transport contract [`crate::start_client`] and
//! [`crate::start_server`] pump messages over. Read and write are split into
//! independent halves so a long-idle read (the common case) never blocks a
//! keep-alive ping.

use tokio_util::sync::CancellationToken;

/// The read half of a connected transport.
#[async_trait::async_trait]
pub trait TransportReader: Send + 'static {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
}

/// The write half of a connected transport.
#[async_trait::async_trait]
pub trait TransportWriter: Send + 'static {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;
}

/// A single, already-established, ordered, full-duplex byte connection.
///
/// Implementors own the underlying socket/stream. `split` is called exactly
/// once, immediately before the connection enters its active pump phase;
/// `connection_id` and `cancellation_token` must be read before that (they
/// are not available on the split halves).
pub trait Transport: Send + 'static {
    type Reader: TransportReader;
    type Writer: TransportWriter;

    fn split(self) -> (Self::Reader, Self::Writer);
    fn connection_id(&self) -> &str;
    fn cancellation_token(&self) -> CancellationToken;
}
