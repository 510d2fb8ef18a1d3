//! Binary wire encoding: each message is a MessagePack array whose first
//! element is the numeric `Type`, prefixed by its LEB128-encoded byte length.
//!
//! Positional layout (our own internal schema — the "SignalR binary
//! protocol spec" spec.md defers to is an external document this pack does
//! not ship; see `DESIGN.md` for the call):
//!
//! | Type | Elements |
//! |---|---|
//! | 1 Invocation | `[1, headers, invocationId\|nil, target, arguments, streamIds]` |
//! | 2 StreamItem | `[2, headers, invocationId, item]` |
//! | 3 Completion | `[3, headers, invocationId, resultKind, payload]` |
//! | 4 StreamInvocation | `[4, headers, invocationId, target, arguments, streamIds]` |
//! | 5 CancelInvocation | `[5, headers, invocationId]` |
//! | 6 Ping | `[6]` |
//! | 7 Close | `[7, error\|nil, allowReconnect]` |
//!
//! `resultKind`: 0 = void, 1 = error, 2 = result.

use integer_encoding::VarInt;
use rmpv::Value;

use crate::codec::{HubProtocol, TransferMode};
use crate::error::ProtocolError;
use crate::message::{
    CancelInvocation, Close, Completion, CompletionPayload, Headers, Invocation, Message,
    RawValue, StreamInvocation, StreamItem,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct MessagePackHubProtocol;

impl HubProtocol for MessagePackHubProtocol {
    fn transfer_mode(&self) -> TransferMode {
        TransferMode::Binary
    }

    fn write_message(&self, message: &Message, sink: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let value = to_msgpack_value(message);
        let mut body = Vec::new();
        rmpv::encode::write_value(&mut body, &value)
            .map_err(|e| ProtocolError::MsgPack(e.to_string()))?;
        sink.extend_from_slice(&body.len().encode_var_vec());
        sink.extend_from_slice(&body);
        Ok(())
    }

    fn parse_messages(
        &self,
        residual: &mut Vec<u8>,
        maximum_message_size: usize,
    ) -> Vec<Result<Message, ProtocolError>> {
        let mut out = Vec::new();
        let mut consumed = 0usize;

        loop {
            let remaining = &residual[consumed..];
            let Some((len, prefix_len)) = usize::decode_var(remaining) else {
                break;
            };

            if len > maximum_message_size {
                out.push(Err(ProtocolError::FrameTooLarge {
                    declared: len,
                    maximum: maximum_message_size,
                }));
                // The declared body is refused unread; nothing after an
                // oversized prefix can be safely resynchronized, so the
                // rest of the buffer is discarded.
                residual.clear();
                return out;
            }

            if remaining.len() < prefix_len + len {
                break; // wait for the rest of the body
            }

            let body = &remaining[prefix_len..prefix_len + len];
            out.push(decode_body(body));
            consumed += prefix_len + len;
        }

        residual.drain(0..consumed);
        out
    }
}

fn decode_body(body: &[u8]) -> Result<Message, ProtocolError> {
    let mut cursor = body;
    let value =
        rmpv::decode::read_value(&mut cursor).map_err(|e| ProtocolError::MsgPack(e.to_string()))?;
    from_msgpack_value(&value)
}

fn elements(value: &Value) -> Result<&[Value], ProtocolError> {
    value
        .as_array()
        .ok_or_else(|| ProtocolError::MsgPack("expected top-level array".into()))
}

fn as_str_owned(value: &Value) -> Option<String> {
    value.as_str().map(str::to_owned)
}

fn headers_from_value(value: &Value) -> Option<Headers> {
    let map = value.as_map()?;
    if map.is_empty() {
        return None;
    }
    Some(
        map.iter()
            .filter_map(|(k, v)| Some((k.as_str()?.to_owned(), v.as_str()?.to_owned())))
            .collect(),
    )
}

fn headers_to_value(headers: &Option<Headers>) -> Value {
    match headers {
        Some(h) if !h.is_empty() => Value::Map(
            h.iter()
                .map(|(k, v)| (Value::String(k.clone().into()), Value::String(v.clone().into())))
                .collect(),
        ),
        _ => Value::Map(vec![]),
    }
}

fn string_array(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|a| a.iter().filter_map(as_str_owned).collect())
        .unwrap_or_default()
}

fn raw_array(value: &Value) -> Vec<RawValue> {
    value
        .as_array()
        .map(|a| a.iter().map(|v| RawValue::MsgPack(v.clone())).collect())
        .unwrap_or_default()
}

fn raw_value_to_msgpack(raw: &RawValue) -> Value {
    match raw {
        RawValue::MsgPack(v) => v.clone(),
        RawValue::Json(r) => {
            let json: serde_json::Value = serde_json::from_str(r.get()).unwrap_or(serde_json::Value::Null);
            serde_json::from_value(json).unwrap_or(Value::Nil)
        }
    }
}

fn from_msgpack_value(value: &Value) -> Result<Message, ProtocolError> {
    let elems = elements(value)?;
    let tag = elems
        .first()
        .and_then(Value::as_i64)
        .ok_or(ProtocolError::MissingField("type"))?;

    match tag {
        1 => {
            let headers = elems.get(1).and_then(headers_from_value);
            let invocation_id = elems.get(2).and_then(as_str_owned);
            let target = elems
                .get(3)
                .and_then(as_str_owned)
                .ok_or(ProtocolError::MissingField("target"))?;
            let arguments = elems.get(4).map(raw_array).unwrap_or_default();
            let stream_ids = elems.get(5).map(string_array).unwrap_or_default();
            Ok(Message::Invocation(Invocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
                headers,
            }))
        }
        2 => {
            let headers = elems.get(1).and_then(headers_from_value);
            let invocation_id = elems
                .get(2)
                .and_then(as_str_owned)
                .ok_or(ProtocolError::MissingField("invocationId"))?;
            let item = elems
                .get(3)
                .map(|v| RawValue::MsgPack(v.clone()))
                .ok_or(ProtocolError::MissingField("item"))?;
            Ok(Message::StreamItem(StreamItem {
                invocation_id,
                item,
                headers,
            }))
        }
        3 => {
            let headers = elems.get(1).and_then(headers_from_value);
            let invocation_id = elems
                .get(2)
                .and_then(as_str_owned)
                .ok_or(ProtocolError::MissingField("invocationId"))?;
            let kind = elems.get(3).and_then(Value::as_u64).unwrap_or(0);
            let payload = match kind {
                0 => CompletionPayload::Void,
                1 => CompletionPayload::Error(
                    elems
                        .get(4)
                        .and_then(as_str_owned)
                        .ok_or(ProtocolError::MissingField("error"))?,
                ),
                2 => CompletionPayload::Result(
                    elems
                        .get(4)
                        .map(|v| RawValue::MsgPack(v.clone()))
                        .ok_or(ProtocolError::MissingField("result"))?,
                ),
                other => {
                    return Err(ProtocolError::MsgPack(format!(
                        "unknown completion result kind {other}"
                    )))
                }
            };
            Ok(Message::Completion(Completion {
                invocation_id,
                payload,
                headers,
            }))
        }
        4 => {
            let headers = elems.get(1).and_then(headers_from_value);
            let invocation_id = elems
                .get(2)
                .and_then(as_str_owned)
                .ok_or(ProtocolError::MissingField("invocationId"))?;
            let target = elems
                .get(3)
                .and_then(as_str_owned)
                .ok_or(ProtocolError::MissingField("target"))?;
            let arguments = elems.get(4).map(raw_array).unwrap_or_default();
            let stream_ids = elems.get(5).map(string_array).unwrap_or_default();
            Ok(Message::StreamInvocation(StreamInvocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
                headers,
            }))
        }
        5 => {
            let headers = elems.get(1).and_then(headers_from_value);
            let invocation_id = elems
                .get(2)
                .and_then(as_str_owned)
                .ok_or(ProtocolError::MissingField("invocationId"))?;
            Ok(Message::CancelInvocation(CancelInvocation {
                invocation_id,
                headers,
            }))
        }
        6 => Ok(Message::Ping),
        7 => {
            let error = elems.get(1).and_then(as_str_owned);
            let allow_reconnect = elems.get(2).and_then(Value::as_bool).unwrap_or(false);
            Ok(Message::Close(Close {
                error,
                allow_reconnect,
            }))
        }
        other => Err(ProtocolError::UnknownType(other)),
    }
}

fn to_msgpack_value(message: &Message) -> Value {
    match message {
        Message::Invocation(m) => Value::Array(vec![
            Value::from(1),
            headers_to_value(&m.headers),
            m.invocation_id.clone().map(|s| Value::String(s.into())).unwrap_or(Value::Nil),
            Value::String(m.target.clone().into()),
            Value::Array(m.arguments.iter().map(raw_value_to_msgpack).collect()),
            Value::Array(m.stream_ids.iter().cloned().map(|s| Value::String(s.into())).collect()),
        ]),
        Message::StreamItem(m) => Value::Array(vec![
            Value::from(2),
            headers_to_value(&m.headers),
            Value::String(m.invocation_id.clone().into()),
            raw_value_to_msgpack(&m.item),
        ]),
        Message::Completion(m) => {
            let (kind, payload) = match &m.payload {
                CompletionPayload::Void => (0u8, Value::Nil),
                CompletionPayload::Error(e) => (1u8, Value::String(e.clone().into())),
                CompletionPayload::Result(v) => (2u8, raw_value_to_msgpack(v)),
            };
            Value::Array(vec![
                Value::from(3),
                headers_to_value(&m.headers),
                Value::String(m.invocation_id.clone().into()),
                Value::from(kind),
                payload,
            ])
        }
        Message::StreamInvocation(m) => Value::Array(vec![
            Value::from(4),
            headers_to_value(&m.headers),
            Value::String(m.invocation_id.clone().into()),
            Value::String(m.target.clone().into()),
            Value::Array(m.arguments.iter().map(raw_value_to_msgpack).collect()),
            Value::Array(m.stream_ids.iter().cloned().map(|s| Value::String(s.into())).collect()),
        ]),
        Message::CancelInvocation(m) => Value::Array(vec![
            Value::from(5),
            headers_to_value(&m.headers),
            Value::String(m.invocation_id.clone().into()),
        ]),
        Message::Ping => Value::Array(vec![Value::from(6)]),
        Message::Close(m) => Value::Array(vec![
            Value::from(7),
            m.error.clone().map(|e| Value::String(e.into())).unwrap_or(Value::Nil),
            Value::Boolean(m.allow_reconnect),
        ]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let protocol = MessagePackHubProtocol;
        let mut buf = Vec::new();
        protocol.write_message(&msg, &mut buf).unwrap();
        let mut residual = buf;
        let out = protocol.parse_messages(&mut residual, 1 << 20);
        assert_eq!(out.len(), 1);
        assert_eq!(out.into_iter().next().unwrap().unwrap(), msg);
        assert!(residual.is_empty());
    }

    #[test]
    fn invocation_round_trip() {
        roundtrip(Message::Invocation(Invocation {
            invocation_id: Some("1".into()),
            target: "Add".into(),
            arguments: vec![
                RawValue::MsgPack(Value::from(2)),
                RawValue::MsgPack(Value::from(3)),
            ],
            stream_ids: vec![],
            headers: None,
        }));
    }

    #[test]
    fn completion_variants_round_trip() {
        roundtrip(Message::Completion(Completion {
            invocation_id: "1".into(),
            payload: CompletionPayload::Void,
            headers: None,
        }));
        roundtrip(Message::Completion(Completion {
            invocation_id: "1".into(),
            payload: CompletionPayload::Result(RawValue::MsgPack(Value::from(5))),
            headers: None,
        }));
        roundtrip(Message::Completion(Completion {
            invocation_id: "1".into(),
            payload: CompletionPayload::Error("boom".into()),
            headers: None,
        }));
    }

    #[test]
    fn ping_and_close_round_trip() {
        roundtrip(Message::Ping);
        roundtrip(Message::Close(Close {
            error: Some("bye".into()),
            allow_reconnect: true,
        }));
    }

    #[test]
    fn two_frames_back_to_back_parse_independently() {
        let protocol = MessagePackHubProtocol;
        let mut residual = Vec::new();
        protocol
            .write_message(&Message::Ping, &mut residual)
            .unwrap();
        protocol
            .write_message(
                &Message::CancelInvocation(CancelInvocation {
                    invocation_id: "9".into(),
                    headers: None,
                }),
                &mut residual,
            )
            .unwrap();
        let out = protocol.parse_messages(&mut residual, 1 << 20);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap(), &Message::Ping);
        assert!(residual.is_empty());
    }

    #[test]
    fn oversized_length_prefix_is_rejected_without_buffering_body_s6() {
        let protocol = MessagePackHubProtocol;
        // Declare a length far larger than the actual (absent) body and
        // larger than the configured maximum.
        let mut residual = 10_000usize.encode_var_vec();
        let out = protocol.parse_messages(&mut residual, 1024);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(ProtocolError::FrameTooLarge { .. })));
        assert!(residual.is_empty());
    }

    #[test]
    fn partial_body_is_buffered_until_complete() {
        let protocol = MessagePackHubProtocol;
        let mut full = Vec::new();
        protocol
            .write_message(&Message::Ping, &mut full)
            .unwrap();
        let (first_half, second_half) = full.split_at(full.len() - 1);
        let mut residual = first_half.to_vec();
        let out = protocol.parse_messages(&mut residual, 1 << 20);
        assert!(out.is_empty());
        residual.extend_from_slice(second_half);
        let out = protocol.parse_messages(&mut residual, 1 << 20);
        assert_eq!(out.len(), 1);
        assert!(residual.is_empty());
    }
}
