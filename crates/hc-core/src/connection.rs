//! The hub connection state machine and its two-stage read pump.
//!
//! `start_client`/`start_server` perform the handshake directly over the raw
//! transport, then split it and hand the halves to two spawned tasks: a
//! byte-reader stage that only shuttles bytes from the transport into an
//! in-memory pipe, and a parser stage that drains that pipe through a
//! [`HubProtocol`] and pushes decoded messages onto the receive channel. The
//! split keeps a slow/backpressured consumer from starving the transport
//! read loop of a reason to keep reading, while still letting the parser's
//! residual buffer be the only place frame-boundary bookkeeping lives.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use hc_protocol::{
    handshake, CancelInvocation, Close, Completion, CompletionPayload, HandshakeRequest,
    HandshakeResponse, HubProtocol, Invocation, Message, RawValue, StreamInvocation, StreamItem,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HubConnectionOptions;
use crate::error::HubError;
use crate::registry::InvocationRegistry;
use crate::transport::{Transport, TransportReader, TransportWriter};

/// Why a connection ended. Set exactly once, at whichever transition first
/// leaves `Active`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `HubConnectionHandle::abort` was called locally.
    LocalAbort,
    /// The peer sent a `Close` message.
    PeerClose(Option<String>),
    /// A transport read or write failed.
    TransportError(String),
    /// No bytes arrived within `client_timeout_interval`.
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    HandshakeInit = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::HandshakeInit,
            1 => ConnectionState::Active,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

pub(crate) struct ConnectionInner {
    pub connection_id: String,
    protocol: Arc<dyn HubProtocol + Send + Sync>,
    options: HubConnectionOptions,
    cancel: CancellationToken,
    writer: AsyncMutex<Box<dyn TransportWriter>>,
    last_write: StdMutex<Instant>,
    last_read: StdMutex<Instant>,
    state: AtomicU8,
    close_reason: StdMutex<Option<CloseReason>>,
    items: tokio::sync::RwLock<std::collections::HashMap<String, serde_json::Value>>,
    pub registry: InvocationRegistry,
}

impl ConnectionInner {
    pub(crate) fn idle_write_time(&self) -> Duration {
        self.last_write.lock().unwrap().elapsed()
    }

    pub(crate) fn idle_read_time(&self) -> Duration {
        self.last_read.lock().unwrap().elapsed()
    }

    fn mark_read(&self) {
        *self.last_read.lock().unwrap() = Instant::now();
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition_to_closing(&self, reason: CloseReason) {
        let mut guard = self.close_reason.lock().unwrap();
        if guard.is_none() {
            *guard = Some(reason);
        }
        drop(guard);
        let _ = self.state.compare_exchange(
            ConnectionState::Active as u8,
            ConnectionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn mark_closed(&self) {
        self.state.store(ConnectionState::Closed as u8, Ordering::Release);
    }

    pub(crate) fn abort(&self, reason: CloseReason) {
        self.transition_to_closing(reason);
        self.cancel.cancel();
    }

    async fn send_message(&self, message: &Message) -> Result<(), HubError> {
        if self.state() == ConnectionState::Closed {
            return Err(HubError::ConnectionClosed);
        }
        let mut buf = Vec::new();
        self.protocol.write_message(message, &mut buf)?;
        let mut writer = self.writer.lock().await;
        if self.cancel.is_cancelled() {
            return Err(HubError::ConnectionClosed);
        }
        *self.last_write.lock().unwrap() = Instant::now();
        let result = writer.write_all(&buf).await;
        drop(writer);
        if let Err(e) = result {
            let text = e.to_string();
            self.abort(CloseReason::TransportError(text.clone()));
            return Err(HubError::Transport(e));
        }
        Ok(())
    }

    pub(crate) async fn send_ping(&self) -> Result<(), HubError> {
        self.send_message(&Message::Ping).await
    }
}

/// A cheap, cloneable handle to an active hub connection. All send-side and
/// inspection operations live here; the receive side is the separate
/// [`ReceiveStream`] returned alongside it, matching a single-producer
/// channel's split into a sender side (many owners) and a receiver side
/// (exactly one).
#[derive(Clone)]
pub struct HubConnectionHandle {
    inner: Arc<ConnectionInner>,
}

impl HubConnectionHandle {
    pub fn connection_id(&self) -> &str {
        &self.inner.connection_id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason.lock().unwrap().clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub async fn get_item(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.items.read().await.get(key).cloned()
    }

    pub async fn set_item(&self, key: String, value: serde_json::Value) {
        self.inner.items.write().await.insert(key, value);
    }

    /// Fire-and-forget invocation: no `InvocationID`, no reply expected.
    pub async fn send(&self, target: impl Into<String>, arguments: Vec<RawValue>) -> Result<(), HubError> {
        self.inner
            .send_message(&Message::Invocation(Invocation {
                invocation_id: None,
                target: target.into(),
                arguments,
                stream_ids: vec![],
                headers: None,
            }))
            .await
    }

    /// Request/response invocation. Resolves once the peer's terminal
    /// `Completion` arrives, or with [`HubError::ConnectionClosed`] if the
    /// connection dies first.
    pub async fn invoke(
        &self,
        target: impl Into<String>,
        arguments: Vec<RawValue>,
    ) -> Result<Option<RawValue>, HubError> {
        let id = self.inner.registry.next_id();
        let rx = self
            .inner
            .registry
            .register_awaiting(id.clone())
            .map_err(|e| HubError::Invocation(e.to_string()))?;
        self.inner
            .send_message(&Message::Invocation(Invocation {
                invocation_id: Some(id),
                target: target.into(),
                arguments,
                stream_ids: vec![],
                headers: None,
            }))
            .await?;
        rx.await.map_err(|_| HubError::ConnectionClosed)?
    }

    /// Server-stream invocation: returns a handle the caller polls for a
    /// bounded sequence of items followed by a terminal completion.
    pub async fn stream(
        &self,
        target: impl Into<String>,
        arguments: Vec<RawValue>,
    ) -> Result<mpsc::Receiver<crate::registry::StreamEvent>, HubError> {
        let id = self.inner.registry.next_id();
        let rx = self
            .inner
            .registry
            .register_streaming(id.clone(), self.inner.options.stream_buffer_capacity)
            .map_err(|e| HubError::Invocation(e.to_string()))?;
        self.inner
            .send_message(&Message::StreamInvocation(StreamInvocation {
                invocation_id: id,
                target: target.into(),
                arguments,
                stream_ids: vec![],
                headers: None,
            }))
            .await?;
        Ok(rx)
    }

    /// Cancels a locally originated invocation. The peer may still deliver
    /// a terminal completion afterward; that completion is still honored.
    pub async fn cancel(&self, invocation_id: impl Into<String>) -> Result<(), HubError> {
        let id = invocation_id.into();
        self.inner.registry.mark_cancelled(&id);
        self.inner
            .send_message(&Message::CancelInvocation(CancelInvocation {
                invocation_id: id,
                headers: None,
            }))
            .await
    }

    /// Sends one item of a client-to-server upload stream this side started.
    pub async fn send_stream_item(
        &self,
        invocation_id: impl Into<String>,
        item: RawValue,
    ) -> Result<(), HubError> {
        self.inner
            .send_message(&Message::StreamItem(StreamItem {
                invocation_id: invocation_id.into(),
                item,
                headers: None,
            }))
            .await
    }

    /// Completes an invocation this side is serving as a hub target.
    pub async fn complete(
        &self,
        invocation_id: impl Into<String>,
        payload: CompletionPayload,
    ) -> Result<(), HubError> {
        self.inner
            .send_message(&Message::Completion(Completion {
                invocation_id: invocation_id.into(),
                payload,
                headers: None,
            }))
            .await
    }

    /// Sends a graceful `Close` and begins the shutdown sequence locally.
    pub async fn close(&self, error: Option<String>, allow_reconnect: bool) -> Result<(), HubError> {
        let result = self
            .inner
            .send_message(&Message::Close(Close {
                error: error.clone(),
                allow_reconnect,
            }))
            .await;
        self.inner.abort(CloseReason::LocalAbort);
        result
    }

    /// Sends an application-level `Ping`, e.g. to probe liveness outside the
    /// automatic keep-alive cadence.
    pub async fn ping(&self) -> Result<(), HubError> {
        self.inner.send_ping().await
    }

    /// Tears the connection down immediately without notifying the peer.
    pub fn abort(&self) {
        self.inner.abort(CloseReason::LocalAbort);
    }
}

/// The single consumer of decoded inbound messages and pump-surfaced
/// errors. Obtained once, alongside a [`HubConnectionHandle`], from
/// `start_client`/`start_server`.
pub struct ReceiveStream {
    rx: mpsc::Receiver<Result<Message, HubError>>,
}

impl ReceiveStream {
    pub async fn recv(&mut self) -> Option<Result<Message, HubError>> {
        self.rx.recv().await
    }
}

const RECEIVE_CHANNEL_CAPACITY: usize = 64;

async fn run_handshake_client<W: TransportWriter, R: TransportReader>(
    writer: &mut W,
    reader: &mut R,
    protocol_name: &str,
    protocol_version: i32,
    timeout: Duration,
) -> Result<(), HubError> {
    tokio::time::timeout(timeout, async {
        let mut buf = Vec::new();
        handshake::write_request(
            &HandshakeRequest {
                protocol: protocol_name.to_string(),
                version: protocol_version,
            },
            &mut buf,
        )
        .map_err(HubError::Protocol)?;
        writer.write_all(&buf).await.map_err(HubError::Transport)?;

        let mut residual = Vec::new();
        let mut scratch = [0u8; 512];
        loop {
            if let Some(response) =
                handshake::parse_framed::<HandshakeResponse>(&mut residual).map_err(HubError::Protocol)?
            {
                if !response.is_success() {
                    return Err(HubError::Handshake(
                        response.error.unwrap_or_else(|| "unknown error".into()),
                    ));
                }
                return Ok(());
            }
            let n = reader.read(&mut scratch).await.map_err(HubError::Transport)?;
            if n == 0 {
                return Err(HubError::Handshake("peer closed before responding".into()));
            }
            residual.extend_from_slice(&scratch[..n]);
        }
    })
    .await
    .map_err(|_| HubError::Handshake("handshake timed out".into()))?
}

async fn run_handshake_server<W: TransportWriter, R: TransportReader>(
    writer: &mut W,
    reader: &mut R,
    negotiate: impl Fn(&str) -> Option<Arc<dyn HubProtocol + Send + Sync>>,
    timeout: Duration,
) -> Result<Arc<dyn HubProtocol + Send + Sync>, HubError> {
    tokio::time::timeout(timeout, async {
        let mut residual = Vec::new();
        let mut scratch = [0u8; 512];
        let request = loop {
            if let Some(request) =
                handshake::parse_framed::<HandshakeRequest>(&mut residual).map_err(HubError::Protocol)?
            {
                break request;
            }
            let n = reader.read(&mut scratch).await.map_err(HubError::Transport)?;
            if n == 0 {
                return Err(HubError::Handshake("peer closed before sending a handshake".into()));
            }
            residual.extend_from_slice(&scratch[..n]);
        };

        let protocol = negotiate(&request.protocol);
        let mut buf = Vec::new();
        match &protocol {
            Some(_) => handshake::write_response(&HandshakeResponse::default(), &mut buf),
            None => handshake::write_response(
                &HandshakeResponse {
                    error: Some(format!("unsupported protocol '{}'", request.protocol)),
                    minor_version: None,
                },
                &mut buf,
            ),
        }
        .map_err(HubError::Protocol)?;
        writer.write_all(&buf).await.map_err(HubError::Transport)?;

        protocol.ok_or_else(|| HubError::Handshake(format!("unsupported protocol '{}'", request.protocol)))
    })
    .await
    .map_err(|_| HubError::Handshake("handshake timed out".into()))?
}

fn spawn_pumps(
    inner: Arc<ConnectionInner>,
    mut reader: Box<dyn TransportReader>,
    protocol: Arc<dyn HubProtocol + Send + Sync>,
    options: HubConnectionOptions,
    cancel: CancellationToken,
) -> mpsc::Receiver<Result<Message, HubError>> {
    let (receive_tx, receive_rx) = mpsc::channel(RECEIVE_CHANNEL_CAPACITY);
    let max_size = options.maximum_receive_message_size;
    let (mut pipe_writer, mut pipe_reader) = tokio::io::duplex(max_size.max(4096));

    let byte_reader_cancel = cancel.clone();
    let byte_reader_inner = inner.clone();
    let byte_reader_tx = receive_tx.clone();
    let byte_reader_handle = tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            // `biased` always polls the read branch first: as long as the
            // transport already has bytes ready, they're pulled in and
            // pushed to the pipe before the cancellation branch is even
            // considered, so a cancellation racing a ready read never wins
            // by chance.
            let n = tokio::select! {
                biased;
                res = reader.read(&mut buf) => match res {
                    Ok(n) => n,
                    Err(e) => {
                        error!(connection_id = %byte_reader_inner.connection_id, error = %e, "transport read failed");
                        byte_reader_inner.abort(CloseReason::TransportError(e.to_string()));
                        let _ = byte_reader_tx.send(Err(HubError::Transport(e))).await;
                        break;
                    }
                },
                _ = byte_reader_cancel.cancelled() => break,
            };
            if n == 0 {
                debug!(connection_id = %byte_reader_inner.connection_id, "transport reached eof");
                break;
            }
            byte_reader_inner.mark_read();
            if tokio::io::AsyncWriteExt::write_all(&mut pipe_writer, &buf[..n])
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let parser_cancel = cancel.clone();
    let parser_inner = inner.clone();
    let parser_handle = tokio::spawn(async move {
        let mut residual = Vec::new();
        let mut scratch = vec![0u8; 4096];
        // Once cancellation is observed, the loop stops racing it against
        // the pipe read and instead reads the pipe straight through to EOF.
        // The byte-reader stage drops its write half as soon as it too sees
        // the same cancellation, so this converges quickly rather than
        // blocking forever, and any bytes it already pushed through before
        // exiting still get parsed and delivered instead of silently
        // dropped by a `select!` that happened to favor the cancel branch.
        let mut draining = false;
        loop {
            let n = if draining {
                match pipe_reader.read(&mut scratch).await {
                    Ok(n) => n,
                    Err(_) => break,
                }
            } else {
                tokio::select! {
                    biased;
                    res = pipe_reader.read(&mut scratch) => match res {
                        Ok(n) => n,
                        Err(_) => break,
                    },
                    _ = parser_cancel.cancelled() => {
                        draining = true;
                        continue;
                    }
                }
            };
            if n == 0 {
                break;
            }
            residual.extend_from_slice(&scratch[..n]);
            let results = protocol.parse_messages(&mut residual, max_size);
            let mut peer_close: Option<Option<String>> = None;
            for result in results {
                // A frame that decoded fine can still be a semantic
                // anomaly (e.g. a Completion for an ID nobody is waiting
                // on) — in that case the receive channel sees the
                // ProtocolError in place of the message, not in addition
                // to it.
                let outcome: Result<Message, hc_protocol::ProtocolError> = match result {
                    Ok(message) => match dispatch_to_registry(&parser_inner, &message).await {
                        Ok(()) => {
                            if let Message::Close(close) = &message {
                                peer_close = Some(close.error.clone());
                            }
                            Ok(message)
                        }
                        Err(protocol_err) => {
                            warn!(connection_id = %parser_inner.connection_id, error = %protocol_err, "protocol anomaly");
                            Err(protocol_err)
                        }
                    },
                    Err(e) => Err(e),
                };
                if receive_tx.send(outcome.map_err(HubError::Protocol)).await.is_err() {
                    return;
                }
            }
            if let Some(error) = peer_close {
                parser_inner.abort(CloseReason::PeerClose(error));
                break;
            }
        }
    });

    // Pumps above drop their `receive_tx` clones as they exit; once both are
    // gone the channel closes on its own. This task waits for the
    // connection to be told to stop, then waits for both pump tasks to
    // actually finish draining before failing pending invocations and
    // marking the state `Closed` — otherwise a write or state check could
    // observe `Closed` while the parser is still mid-flight delivering a
    // message it already decoded.
    tokio::spawn(async move {
        cancel.cancelled().await;
        let _ = byte_reader_handle.await;
        let _ = parser_handle.await;
        inner.registry.fail_all(|| HubError::ConnectionClosed).await;
        inner.mark_closed();
        info!(connection_id = %inner.connection_id, "connection closed");
    });

    receive_rx
}

async fn dispatch_to_registry(
    inner: &ConnectionInner,
    message: &Message,
) -> Result<(), hc_protocol::ProtocolError> {
    match message {
        Message::StreamItem(item) => {
            inner
                .registry
                .deliver_stream_item(&item.invocation_id, item.item.clone())
                .await
        }
        Message::Completion(completion) => {
            inner
                .registry
                .deliver_completion(&completion.invocation_id, completion.payload.clone())
                .await
        }
        _ => Ok(()),
    }
}

/// Performs the client side of the handshake over `transport`, then starts
/// the active pump. Returns a send-side handle and the receive stream.
pub async fn start_client<T: Transport>(
    transport: T,
    protocol: Arc<dyn HubProtocol + Send + Sync>,
    protocol_name: &str,
    protocol_version: i32,
    options: HubConnectionOptions,
) -> Result<(HubConnectionHandle, ReceiveStream), HubError> {
    let connection_id = transport.connection_id().to_string();
    let cancel = transport.cancellation_token();
    let (mut reader, mut writer) = transport.split();

    run_handshake_client(
        &mut writer,
        &mut reader,
        protocol_name,
        protocol_version,
        options.handshake_timeout,
    )
    .await?;
    info!(%connection_id, protocol = protocol_name, "handshake complete (client)");

    let now = Instant::now();
    let inner = Arc::new(ConnectionInner {
        connection_id,
        protocol: protocol.clone(),
        options: options.clone(),
        cancel: cancel.clone(),
        writer: AsyncMutex::new(Box::new(writer)),
        last_write: StdMutex::new(now),
        last_read: StdMutex::new(now),
        state: AtomicU8::new(ConnectionState::Active as u8),
        close_reason: StdMutex::new(None),
        items: tokio::sync::RwLock::new(std::collections::HashMap::new()),
        registry: InvocationRegistry::new(),
    });

    let rx = spawn_pumps(inner.clone(), Box::new(reader), protocol, options.clone(), cancel.clone());
    tokio::spawn(crate::keepalive::run(inner.clone(), options, cancel));

    Ok((HubConnectionHandle { inner }, ReceiveStream { rx }))
}

/// Performs the server side of the handshake: reads the client's requested
/// protocol name, resolves it via `negotiate`, and replies accordingly.
pub async fn start_server<T: Transport>(
    transport: T,
    negotiate: impl Fn(&str) -> Option<Arc<dyn HubProtocol + Send + Sync>>,
    options: HubConnectionOptions,
) -> Result<(HubConnectionHandle, ReceiveStream), HubError> {
    let connection_id = transport.connection_id().to_string();
    let cancel = transport.cancellation_token();
    let (mut reader, mut writer) = transport.split();

    let protocol = run_handshake_server(&mut writer, &mut reader, negotiate, options.handshake_timeout).await?;
    info!(%connection_id, "handshake complete (server)");

    let now = Instant::now();
    let inner = Arc::new(ConnectionInner {
        connection_id,
        protocol: protocol.clone(),
        options: options.clone(),
        cancel: cancel.clone(),
        writer: AsyncMutex::new(Box::new(writer)),
        last_write: StdMutex::new(now),
        last_read: StdMutex::new(now),
        state: AtomicU8::new(ConnectionState::Active as u8),
        close_reason: StdMutex::new(None),
        items: tokio::sync::RwLock::new(std::collections::HashMap::new()),
        registry: InvocationRegistry::new(),
    });

    let rx = spawn_pumps(inner.clone(), Box::new(reader), protocol, options.clone(), cancel.clone());
    tokio::spawn(crate::keepalive::run(inner.clone(), options, cancel));

    Ok((HubConnectionHandle { inner }, ReceiveStream { rx }))
}
