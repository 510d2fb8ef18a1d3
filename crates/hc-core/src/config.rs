use std::time::Duration;

/// Tunables governing keep-alive cadence, handshake patience, and the
/// receive-side size/backpressure limits. Constructed programmatically by
/// the owning application; there is no file loader here (see
/// `forwarder::config` in the wider pack for that idiom — out of scope for
/// a connection-scoped options struct).
#[derive(Debug, Clone)]
pub struct HubConnectionOptions {
    /// How long the write side may sit idle before an automatic `Ping` is
    /// emitted.
    pub keep_alive_interval: Duration,
    /// How long the read side may sit idle before the connection is
    /// considered dead and aborted with [`crate::CloseReason::TimedOut`].
    pub client_timeout_interval: Duration,
    /// How long the initial handshake exchange may take before it fails.
    pub handshake_timeout: Duration,
    /// Hard cap on a single frame's declared size; frames larger than this
    /// are rejected before their body is buffered.
    pub maximum_receive_message_size: usize,
    /// Bounded capacity of a server-stream's item queue.
    pub stream_buffer_capacity: usize,
    /// Whether invocation errors should carry detailed (potentially
    /// sensitive) diagnostic text back to the peer.
    pub enable_detailed_errors: bool,
}

impl Default for HubConnectionOptions {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(15),
            client_timeout_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(15),
            maximum_receive_message_size: 32 * 1024,
            stream_buffer_capacity: 10,
            enable_detailed_errors: false,
        }
    }
}
