use hc_core::{Transport, TransportReader, TransportWriter};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One side of an in-memory duplex pair. Cheap, ordered, full-duplex, and
/// byte-oriented, like the contract requires — no framing of its own.
pub struct DuplexTransport {
    id: String,
    cancel: CancellationToken,
    stream: tokio::io::DuplexStream,
}

pub struct DuplexReader(ReadHalf<tokio::io::DuplexStream>);
pub struct DuplexWriter(WriteHalf<tokio::io::DuplexStream>);

#[async_trait::async_trait]
impl TransportReader for DuplexReader {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf).await
    }
}

#[async_trait::async_trait]
impl TransportWriter for DuplexWriter {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.0.write_all(buf).await
    }
}

impl Transport for DuplexTransport {
    type Reader = DuplexReader;
    type Writer = DuplexWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (read, write) = tokio::io::split(self.stream);
        (DuplexReader(read), DuplexWriter(write))
    }

    fn connection_id(&self) -> &str {
        &self.id
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Builds two [`DuplexTransport`]s wired together: bytes written to one are
/// read from the other. Each side gets its own connection ID and
/// cancellation token, mirroring two independently owned connections that
/// happen to share a wire.
pub fn connected_pair(buffer_size: usize) -> (DuplexTransport, DuplexTransport) {
    let (a, b) = tokio::io::duplex(buffer_size);
    let transport_a = DuplexTransport {
        id: format!("test-{}", Uuid::new_v4()),
        cancel: CancellationToken::new(),
        stream: a,
    };
    let transport_b = DuplexTransport {
        id: format!("test-{}", Uuid::new_v4()),
        cancel: CancellationToken::new(),
        stream: b,
    };
    (transport_a, transport_b)
}
