//! Tracks invocations this side has started and is waiting on a peer to
//! resolve. One entry per live `InvocationID`; removed the moment a
//! terminal `Completion` arrives (or, for the whole table at once, when the
//! connection dies).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use hc_protocol::{CompletionPayload, ProtocolError, RawValue};
use tokio::sync::{mpsc, oneshot};

use crate::error::HubError;

/// Result delivered to a request/response caller: `Ok(None)` for a void
/// completion, `Ok(Some(_))` for a result payload, `Err` for a peer-sent
/// error completion or a connection failure.
pub type AwaitingResult = Result<Option<RawValue>, HubError>;
pub type AwaitingSlot = oneshot::Sender<AwaitingResult>;

/// One event in a server stream: items as they arrive, then exactly one
/// terminal `Completed`.
#[derive(Debug)]
pub enum StreamEvent {
    Item(RawValue),
    Completed(Result<(), HubError>),
}
pub type StreamingSlot = mpsc::Sender<StreamEvent>;

enum Sink {
    Awaiting(AwaitingSlot),
    Streaming(StreamingSlot),
}

struct PendingInvocation {
    sink: Sink,
    cancelled: bool,
}

/// A monotonically increasing decimal-string ID allocator, used for
/// invocations this side originates. Cheap and dependency-free; `uuid` is
/// reserved for IDs that must stay unique across process restarts or
/// machines (see `hc-test-support`'s scripted session/batch IDs).
#[derive(Debug, Default)]
pub struct InvocationIdGenerator {
    next: AtomicU64,
}

impl InvocationIdGenerator {
    pub fn next_id(&self) -> String {
        (self.next.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }
}

/// Error returned when registering an ID that's already live.
#[derive(Debug, thiserror::Error)]
#[error("invocation id {0} is already registered")]
pub struct DuplicateInvocationId(pub String);

#[derive(Default)]
pub struct InvocationRegistry {
    entries: Mutex<HashMap<String, PendingInvocation>>,
    ids: InvocationIdGenerator,
}

impl InvocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        self.ids.next_id()
    }

    pub fn register_awaiting(
        &self,
        id: String,
    ) -> Result<oneshot::Receiver<AwaitingResult>, DuplicateInvocationId> {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&id) {
            return Err(DuplicateInvocationId(id));
        }
        entries.insert(
            id,
            PendingInvocation {
                sink: Sink::Awaiting(tx),
                cancelled: false,
            },
        );
        Ok(rx)
    }

    pub fn register_streaming(
        &self,
        id: String,
        capacity: usize,
    ) -> Result<mpsc::Receiver<StreamEvent>, DuplicateInvocationId> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&id) {
            return Err(DuplicateInvocationId(id));
        }
        entries.insert(
            id,
            PendingInvocation {
                sink: Sink::Streaming(tx),
                cancelled: false,
            },
        );
        Ok(rx)
    }

    /// Marks an invocation as locally cancelled. The entry is kept alive:
    /// the peer may still send a terminal `Completion`, which is delivered
    /// normally. Returns whether the ID was known.
    pub fn mark_cancelled(&self, id: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(id) {
            Some(entry) => {
                entry.cancelled = true;
                true
            }
            None => false,
        }
    }

    pub fn is_cancelled(&self, id: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(id)
            .map(|e| e.cancelled)
            .unwrap_or(false)
    }

    /// A `StreamItem` arrived. Unknown or non-streaming IDs are a protocol
    /// anomaly but not fatal to the connection; the caller decides whether
    /// to surface it.
    pub async fn deliver_stream_item(
        &self,
        id: &str,
        item: RawValue,
    ) -> Result<(), ProtocolError> {
        let sender = {
            let entries = self.entries.lock().unwrap();
            match entries.get(id) {
                Some(PendingInvocation {
                    sink: Sink::Streaming(tx),
                    ..
                }) => tx.clone(),
                Some(_) => return Err(ProtocolError::UnknownInvocationId(id.to_string())),
                None => return Err(ProtocolError::UnknownInvocationId(id.to_string())),
            }
        };
        let _ = sender.send(StreamEvent::Item(item)).await;
        Ok(())
    }

    /// A `Completion` arrived. Terminal: the entry is removed.
    pub async fn deliver_completion(
        &self,
        id: &str,
        payload: CompletionPayload,
    ) -> Result<(), ProtocolError> {
        let entry = {
            let mut entries = self.entries.lock().unwrap();
            entries.remove(id)
        };
        let Some(entry) = entry else {
            return Err(ProtocolError::UnknownInvocationId(id.to_string()));
        };
        match entry.sink {
            Sink::Awaiting(tx) => {
                let result = match payload {
                    CompletionPayload::Void => Ok(None),
                    CompletionPayload::Result(v) => Ok(Some(v)),
                    CompletionPayload::Error(e) => Err(HubError::Invocation(e)),
                };
                let _ = tx.send(result);
            }
            Sink::Streaming(tx) => {
                let result = match payload {
                    CompletionPayload::Error(e) => Err(HubError::Invocation(e)),
                    _ => Ok(()),
                };
                let _ = tx.send(StreamEvent::Completed(result)).await;
            }
        }
        Ok(())
    }

    /// Resolves every live entry with `reason` and empties the table. Called
    /// once the connection has died so no caller waits forever.
    pub async fn fail_all(&self, reason: impl Fn() -> HubError) {
        let drained: Vec<PendingInvocation> = {
            let mut entries = self.entries.lock().unwrap();
            entries.drain().map(|(_, v)| v).collect()
        };
        for entry in drained {
            match entry.sink {
                Sink::Awaiting(tx) => {
                    let _ = tx.send(Err(reason()));
                }
                Sink::Streaming(tx) => {
                    let _ = tx.send(StreamEvent::Completed(Err(reason()))).await;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(v: serde_json::Value) -> RawValue {
        RawValue::Json(serde_json::value::RawValue::from_string(v.to_string()).unwrap())
    }

    #[test]
    fn ids_are_monotonic() {
        let gen = InvocationIdGenerator::default();
        assert_eq!(gen.next_id(), "1");
        assert_eq!(gen.next_id(), "2");
        assert_eq!(gen.next_id(), "3");
    }

    #[test]
    fn registering_a_live_id_twice_fails() {
        let reg = InvocationRegistry::new();
        reg.register_awaiting("1".into()).unwrap();
        assert!(reg.register_awaiting("1".into()).is_err());
        assert!(reg.register_streaming("1".into(), 4).is_err());
    }

    #[tokio::test]
    async fn awaiting_completion_delivers_result() {
        let reg = InvocationRegistry::new();
        let rx = reg.register_awaiting("1".into()).unwrap();
        reg.deliver_completion("1", CompletionPayload::Result(raw(42.into())))
            .await
            .unwrap();
        let result = rx.await.unwrap().unwrap();
        assert!(result.is_some());
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn awaiting_completion_with_error_surfaces_invocation_error() {
        let reg = InvocationRegistry::new();
        let rx = reg.register_awaiting("1".into()).unwrap();
        reg.deliver_completion("1", CompletionPayload::Error("boom".into()))
            .await
            .unwrap();
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, HubError::Invocation(ref m) if m == "boom"));
    }

    #[tokio::test]
    async fn completion_for_unknown_id_is_a_protocol_error() {
        let reg = InvocationRegistry::new();
        let err = reg
            .deliver_completion("missing", CompletionPayload::Void)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownInvocationId(_)));
    }

    #[tokio::test]
    async fn streaming_items_then_terminal_completion() {
        let reg = InvocationRegistry::new();
        let mut rx = reg.register_streaming("1".into(), 4).unwrap();
        reg.deliver_stream_item("1", raw(1.into())).await.unwrap();
        reg.deliver_stream_item("1", raw(2.into())).await.unwrap();
        reg.deliver_completion("1", CompletionPayload::Void)
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(StreamEvent::Item(_))));
        assert!(matches!(rx.recv().await, Some(StreamEvent::Item(_))));
        assert!(matches!(
            rx.recv().await,
            Some(StreamEvent::Completed(Ok(())))
        ));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn cancelling_keeps_the_entry_until_terminal_completion() {
        let reg = InvocationRegistry::new();
        let rx = reg.register_awaiting("1".into()).unwrap();
        assert!(reg.mark_cancelled("1"));
        assert!(reg.is_cancelled("1"));
        assert_eq!(reg.len(), 1);
        reg.deliver_completion("1", CompletionPayload::Void)
            .await
            .unwrap();
        rx.await.unwrap().unwrap();
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn fail_all_resolves_every_live_entry() {
        let reg = InvocationRegistry::new();
        let awaiting = reg.register_awaiting("1".into()).unwrap();
        let mut streaming = reg.register_streaming("2".into(), 4).unwrap();
        reg.fail_all(|| HubError::ConnectionClosed).await;
        assert!(matches!(
            awaiting.await.unwrap().unwrap_err(),
            HubError::ConnectionClosed
        ));
        assert!(matches!(
            streaming.recv().await,
            Some(StreamEvent::Completed(Err(HubError::ConnectionClosed)))
        ));
        assert!(reg.is_empty());
    }
}
