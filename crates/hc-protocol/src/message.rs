//! Logical message shapes shared by both wire encodings.
//!
//! Arguments and stream items are kept as opaque [`RawValue`]s: the codec
//! never inspects their shape, it only round-trips them. Binding a raw
//! value to a declared parameter type is the dispatcher's job (out of
//! scope here), so `RawValue::bind` is the only thing this crate offers
//! toward that.

use std::collections::HashMap;

use serde::de::DeserializeOwned;

use crate::error::BindError;

/// Headers carried by several message variants. Absent on the wire when
/// empty/missing; never interpreted by the codec or the connection.
pub type Headers = HashMap<String, String>;

/// An opaque, codec-specific encoding of one argument or stream item.
///
/// Preserves the original dynamic shape until the application binds it to
/// a declared target type.
#[derive(Debug, Clone)]
pub enum RawValue {
    Json(Box<serde_json::value::RawValue>),
    MsgPack(rmpv::Value),
}

impl RawValue {
    /// Decode this value as `T`. Never corrupts the connection on failure;
    /// the caller reports `BindError` per-argument.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T, BindError> {
        match self {
            RawValue::Json(raw) => {
                serde_json::from_str(raw.get()).map_err(|e| BindError(e.to_string()))
            }
            RawValue::MsgPack(value) => {
                rmpv::ext::from_value(value.clone()).map_err(|e| BindError(e.to_string()))
            }
        }
    }
}

impl PartialEq for RawValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RawValue::Json(a), RawValue::Json(b)) => a.get() == b.get(),
            (RawValue::MsgPack(a), RawValue::MsgPack(b)) => a == b,
            _ => false,
        }
    }
}

/// Either a successful [`Completion`] result or an application error; never
/// both, per the invariant in the data model.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionPayload {
    /// Void-return success: neither a result nor an error was carried.
    Void,
    Result(RawValue),
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub invocation_id: Option<String>,
    pub target: String,
    pub arguments: Vec<RawValue>,
    pub stream_ids: Vec<String>,
    pub headers: Option<Headers>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamItem {
    pub invocation_id: String,
    pub item: RawValue,
    pub headers: Option<Headers>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub invocation_id: String,
    pub payload: CompletionPayload,
    pub headers: Option<Headers>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamInvocation {
    pub invocation_id: String,
    pub target: String,
    pub arguments: Vec<RawValue>,
    pub stream_ids: Vec<String>,
    pub headers: Option<Headers>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancelInvocation {
    pub invocation_id: String,
    pub headers: Option<Headers>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Close {
    pub error: Option<String>,
    pub allow_reconnect: bool,
}

/// The tagged union of all in-session message shapes (handshake messages
/// are modeled separately — see [`crate::handshake`] — since they are
/// always JSON-framed and precede protocol negotiation).
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Invocation(Invocation),
    StreamItem(StreamItem),
    Completion(Completion),
    StreamInvocation(StreamInvocation),
    CancelInvocation(CancelInvocation),
    Ping,
    Close(Close),
}

impl Message {
    /// Numeric `Type` tag used by both wire encodings.
    pub fn type_tag(&self) -> i64 {
        match self {
            Message::Invocation(_) => 1,
            Message::StreamItem(_) => 2,
            Message::Completion(_) => 3,
            Message::StreamInvocation(_) => 4,
            Message::CancelInvocation(_) => 5,
            Message::Ping => 6,
            Message::Close(_) => 7,
        }
    }

    /// The invocation ID this message correlates with, if any.
    pub fn invocation_id(&self) -> Option<&str> {
        match self {
            Message::Invocation(m) => m.invocation_id.as_deref(),
            Message::StreamItem(m) => Some(&m.invocation_id),
            Message::Completion(m) => Some(&m.invocation_id),
            Message::StreamInvocation(m) => Some(&m.invocation_id),
            Message::CancelInvocation(m) => Some(&m.invocation_id),
            Message::Ping | Message::Close(_) => None,
        }
    }
}
