//! Text wire encoding: one JSON object per message, terminated by the ASCII
//! record separator `0x1E`.

use serde_json::{Map, Value};

use crate::codec::{HubProtocol, TransferMode};
use crate::error::ProtocolError;
use crate::message::{
    CancelInvocation, Close, Completion, CompletionPayload, Headers, Invocation, Message,
    RawValue, StreamInvocation, StreamItem,
};

pub const RECORD_SEPARATOR: u8 = 0x1E;

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonHubProtocol;

impl HubProtocol for JsonHubProtocol {
    fn transfer_mode(&self) -> TransferMode {
        TransferMode::Text
    }

    fn write_message(&self, message: &Message, sink: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let value = to_json_value(message);
        serde_json::to_writer(&mut *sink, &value)?;
        sink.push(RECORD_SEPARATOR);
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
            match find_frame(&residual[consumed..]) {
                None => break,
                Some(frame_len) => {
                    let frame = &residual[consumed..consumed + frame_len];
                    consumed += frame_len + 1; // + the record separator byte

                    if frame.len() > maximum_message_size {
                        out.push(Err(ProtocolError::FrameTooLarge {
                            declared: frame.len(),
                            maximum: maximum_message_size,
                        }));
                        continue;
                    }

                    out.push(decode_frame(frame));
                }
            }
        }

        residual.drain(0..consumed);
        out
    }
}

/// Find the length (excluding the record separator) of the next complete
/// JSON-object-then-separator frame in `buf`, starting from its first
/// non-whitespace byte. Tracks brace depth and JSON string/escape state so
/// a `0x1E` inside a string value never splits the frame early. Returns
/// `None` if `buf` doesn't yet contain a complete frame.
fn find_frame(buf: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < buf.len() && buf[i].is_ascii_whitespace() {
        i += 1;
    }
    if i >= buf.len() || buf[i] != b'{' {
        return None;
    }

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    while i < buf.len() {
        let b = buf[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
        } else {
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        // Object closed; the next non-whitespace byte must
                        // be the record separator.
                        let mut j = i + 1;
                        while j < buf.len() && buf[j].is_ascii_whitespace() {
                            j += 1;
                        }
                        if j >= buf.len() {
                            return None; // wait for the separator
                        }
                        if buf[j] == RECORD_SEPARATOR {
                            return Some(j);
                        }
                        // No separator where one was expected: treat the
                        // run up to (but excluding) the next separator
                        // (if any) as one malformed frame so a single bad
                        // message doesn't wedge the whole stream.
                        return buf[j..].iter().position(|&c| c == RECORD_SEPARATOR).map(|p| j + p);
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn decode_frame(frame: &[u8]) -> Result<Message, ProtocolError> {
    let value: Value = serde_json::from_slice(frame)?;
    from_json_value(&value)
}

fn get_type_tag(obj: &Map<String, Value>) -> Result<i64, ProtocolError> {
    obj.get("type")
        .and_then(Value::as_i64)
        .ok_or(ProtocolError::MissingField("type"))
}

fn json_raw(value: &Value) -> RawValue {
    let text = value.to_string();
    let raw = serde_json::value::RawValue::from_string(text)
        .expect("serde_json::Value always reserializes to valid JSON");
    RawValue::Json(raw)
}

fn headers_from_json(obj: &Map<String, Value>) -> Option<Headers> {
    obj.get("headers").and_then(|v| v.as_object()).map(|m| {
        m.iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
            .collect()
    })
}

fn headers_to_json(headers: &Option<Headers>, obj: &mut Map<String, Value>) {
    if let Some(h) = headers {
        if !h.is_empty() {
            obj.insert(
                "headers".into(),
                Value::Object(h.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect()),
            );
        }
    }
}

fn from_json_value(value: &Value) -> Result<Message, ProtocolError> {
    let obj = value
        .as_object()
        .ok_or(ProtocolError::MissingField("<object>"))?;
    match get_type_tag(obj)? {
        1 => {
            let target = obj
                .get("target")
                .and_then(Value::as_str)
                .ok_or(ProtocolError::MissingField("target"))?
                .to_owned();
            let arguments = obj
                .get("arguments")
                .and_then(Value::as_array)
                .ok_or(ProtocolError::MissingField("arguments"))?
                .iter()
                .map(json_raw)
                .collect();
            let stream_ids = obj
                .get("streamIds")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
                .unwrap_or_default();
            let invocation_id = obj.get("invocationId").and_then(Value::as_str).map(str::to_owned);
            Ok(Message::Invocation(Invocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
                headers: headers_from_json(obj),
            }))
        }
        2 => {
            let invocation_id = obj
                .get("invocationId")
                .and_then(Value::as_str)
                .ok_or(ProtocolError::MissingField("invocationId"))?
                .to_owned();
            let item = obj
                .get("item")
                .map(json_raw)
                .ok_or(ProtocolError::MissingField("item"))?;
            Ok(Message::StreamItem(StreamItem {
                invocation_id,
                item,
                headers: headers_from_json(obj),
            }))
        }
        3 => {
            let invocation_id = obj
                .get("invocationId")
                .and_then(Value::as_str)
                .ok_or(ProtocolError::MissingField("invocationId"))?
                .to_owned();
            let has_result = obj.contains_key("result");
            let has_error = obj.get("error").and_then(Value::as_str).is_some();
            if has_result && has_error {
                return Err(ProtocolError::CompletionHasBothResultAndError(invocation_id));
            }
            let payload = if has_error {
                CompletionPayload::Error(obj["error"].as_str().unwrap().to_owned())
            } else if has_result {
                CompletionPayload::Result(json_raw(&obj["result"]))
            } else {
                CompletionPayload::Void
            };
            Ok(Message::Completion(Completion {
                invocation_id,
                payload,
                headers: headers_from_json(obj),
            }))
        }
        4 => {
            let invocation_id = obj
                .get("invocationId")
                .and_then(Value::as_str)
                .ok_or(ProtocolError::MissingField("invocationId"))?
                .to_owned();
            let target = obj
                .get("target")
                .and_then(Value::as_str)
                .ok_or(ProtocolError::MissingField("target"))?
                .to_owned();
            let arguments = obj
                .get("arguments")
                .and_then(Value::as_array)
                .ok_or(ProtocolError::MissingField("arguments"))?
                .iter()
                .map(json_raw)
                .collect();
            let stream_ids = obj
                .get("streamIds")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
                .unwrap_or_default();
            Ok(Message::StreamInvocation(StreamInvocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
                headers: headers_from_json(obj),
            }))
        }
        5 => {
            let invocation_id = obj
                .get("invocationId")
                .and_then(Value::as_str)
                .ok_or(ProtocolError::MissingField("invocationId"))?
                .to_owned();
            Ok(Message::CancelInvocation(CancelInvocation {
                invocation_id,
                headers: headers_from_json(obj),
            }))
        }
        6 => Ok(Message::Ping),
        7 => {
            let error = obj.get("error").and_then(Value::as_str).map(str::to_owned);
            let allow_reconnect = obj.get("allowReconnect").and_then(Value::as_bool).unwrap_or(false);
            Ok(Message::Close(Close {
                error,
                allow_reconnect,
            }))
        }
        other => Err(ProtocolError::UnknownType(other)),
    }
}

fn raw_value_to_json(raw: &RawValue) -> Value {
    match raw {
        RawValue::Json(r) => serde_json::from_str(r.get()).unwrap_or(Value::Null),
        RawValue::MsgPack(v) => {
            // Cross-codec reuse: a MessagePack value flowing through the
            // JSON writer (e.g. a test harness) is converted structurally.
            serde_json::to_value(v).unwrap_or(Value::Null)
        }
    }
}

fn to_json_value(message: &Message) -> Value {
    let mut obj = Map::new();
    obj.insert("type".into(), Value::from(message.type_tag()));
    match message {
        Message::Invocation(m) => {
            if let Some(id) = &m.invocation_id {
                obj.insert("invocationId".into(), Value::String(id.clone()));
            }
            obj.insert("target".into(), Value::String(m.target.clone()));
            obj.insert(
                "arguments".into(),
                Value::Array(m.arguments.iter().map(raw_value_to_json).collect()),
            );
            if !m.stream_ids.is_empty() {
                obj.insert(
                    "streamIds".into(),
                    Value::Array(m.stream_ids.iter().cloned().map(Value::String).collect()),
                );
            }
            headers_to_json(&m.headers, &mut obj);
        }
        Message::StreamItem(m) => {
            obj.insert("invocationId".into(), Value::String(m.invocation_id.clone()));
            obj.insert("item".into(), raw_value_to_json(&m.item));
            headers_to_json(&m.headers, &mut obj);
        }
        Message::Completion(m) => {
            obj.insert("invocationId".into(), Value::String(m.invocation_id.clone()));
            match &m.payload {
                CompletionPayload::Void => {}
                CompletionPayload::Result(v) => {
                    obj.insert("result".into(), raw_value_to_json(v));
                }
                CompletionPayload::Error(e) => {
                    obj.insert("error".into(), Value::String(e.clone()));
                }
            }
            headers_to_json(&m.headers, &mut obj);
        }
        Message::StreamInvocation(m) => {
            obj.insert("invocationId".into(), Value::String(m.invocation_id.clone()));
            obj.insert("target".into(), Value::String(m.target.clone()));
            obj.insert(
                "arguments".into(),
                Value::Array(m.arguments.iter().map(raw_value_to_json).collect()),
            );
            if !m.stream_ids.is_empty() {
                obj.insert(
                    "streamIds".into(),
                    Value::Array(m.stream_ids.iter().cloned().map(Value::String).collect()),
                );
            }
            headers_to_json(&m.headers, &mut obj);
        }
        Message::CancelInvocation(m) => {
            obj.insert("invocationId".into(), Value::String(m.invocation_id.clone()));
            headers_to_json(&m.headers, &mut obj);
        }
        Message::Ping => {}
        Message::Close(m) => {
            if let Some(e) = &m.error {
                obj.insert("error".into(), Value::String(e.clone()));
            }
            if m.allow_reconnect {
                obj.insert("allowReconnect".into(), Value::Bool(true));
            }
        }
    }
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let protocol = JsonHubProtocol;
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
            arguments: vec![json_raw(&Value::from(2)), json_raw(&Value::from(3))],
            stream_ids: vec![],
            headers: None,
        }));
    }

    #[test]
    fn fire_and_forget_invocation_round_trip() {
        roundtrip(Message::Invocation(Invocation {
            invocation_id: None,
            target: "Notify".into(),
            arguments: vec![],
            stream_ids: vec![],
            headers: None,
        }));
    }

    #[test]
    fn completion_void_round_trip() {
        roundtrip(Message::Completion(Completion {
            invocation_id: "1".into(),
            payload: CompletionPayload::Void,
            headers: None,
        }));
    }

    #[test]
    fn completion_result_round_trip() {
        roundtrip(Message::Completion(Completion {
            invocation_id: "1".into(),
            payload: CompletionPayload::Result(json_raw(&Value::from(5))),
            headers: None,
        }));
    }

    #[test]
    fn completion_error_round_trip() {
        roundtrip(Message::Completion(Completion {
            invocation_id: "1".into(),
            payload: CompletionPayload::Error("boom".into()),
            headers: None,
        }));
    }

    #[test]
    fn completion_rejects_both_result_and_error() {
        let protocol = JsonHubProtocol;
        let mut residual = br#"{"type":3,"invocationId":"1","result":5,"error":"boom"}"#.to_vec();
        residual.push(RECORD_SEPARATOR);
        let out = protocol.parse_messages(&mut residual, 1 << 20);
        assert_eq!(out.len(), 1);
        assert!(matches!(
            out[0],
            Err(ProtocolError::CompletionHasBothResultAndError(_))
        ));
    }

    #[test]
    fn ping_round_trip() {
        roundtrip(Message::Ping);
    }

    #[test]
    fn close_round_trip() {
        roundtrip(Message::Close(Close {
            error: Some("bye".into()),
            allow_reconnect: true,
        }));
    }

    #[test]
    fn stream_item_and_stream_invocation_round_trip() {
        roundtrip(Message::StreamInvocation(StreamInvocation {
            invocation_id: "2".into(),
            target: "Counter".into(),
            arguments: vec![json_raw(&Value::from(3)), json_raw(&Value::from(1))],
            stream_ids: vec![],
            headers: None,
        }));
        roundtrip(Message::StreamItem(StreamItem {
            invocation_id: "2".into(),
            item: json_raw(&Value::from(0)),
            headers: None,
        }));
    }

    #[test]
    fn cancel_invocation_round_trip() {
        roundtrip(Message::CancelInvocation(CancelInvocation {
            invocation_id: "2".into(),
            headers: None,
        }));
    }

    #[test]
    fn braces_inside_string_values_do_not_desync_frame_scanning() {
        // A string argument containing literal '{' and '}' is valid JSON and
        // must not confuse the brace-depth scanner into splitting early.
        let protocol = JsonHubProtocol;
        let mut residual = Vec::new();
        residual.extend_from_slice(
            br#"{"type":4,"invocationId":"1","target":"Echo","arguments":["a{b}c"]}"#,
        );
        residual.push(RECORD_SEPARATOR);
        residual.extend_from_slice(b"{\"type\":6}");
        residual.push(RECORD_SEPARATOR);
        let out = protocol.parse_messages(&mut residual, 1 << 20);
        assert_eq!(out.len(), 2);
        assert!(out[0].is_ok());
        assert_eq!(out[1].as_ref().unwrap(), &Message::Ping);
        assert!(residual.is_empty());
    }

    #[test]
    fn malformed_frame_then_ping_s4() {
        let protocol = JsonHubProtocol;
        let mut residual = b"{not json}".to_vec();
        residual.push(RECORD_SEPARATOR);
        residual.extend_from_slice(b"{\"type\":6}");
        residual.push(RECORD_SEPARATOR);
        let out = protocol.parse_messages(&mut residual, 1 << 20);
        assert_eq!(out.len(), 2);
        assert!(out[0].is_err());
        assert_eq!(out[1].as_ref().unwrap(), &Message::Ping);
        assert!(residual.is_empty());
    }

    #[test]
    fn partial_frame_is_buffered_until_complete() {
        let protocol = JsonHubProtocol;
        let mut residual = b"{\"type\":6".to_vec();
        let out = protocol.parse_messages(&mut residual, 1 << 20);
        assert!(out.is_empty());
        assert_eq!(residual, b"{\"type\":6");
        residual.push(b'}');
        residual.push(RECORD_SEPARATOR);
        let out = protocol.parse_messages(&mut residual, 1 << 20);
        assert_eq!(out.len(), 1);
        assert!(residual.is_empty());
    }

    #[test]
    fn oversized_frame_is_rejected_without_full_allocation() {
        let protocol = JsonHubProtocol;
        let mut residual = br#"{"type":6,"pad":"xxxxxxxxxxxxxxxxxxxx"}"#.to_vec();
        residual.push(RECORD_SEPARATOR);
        let out = protocol.parse_messages(&mut residual, 8);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(ProtocolError::FrameTooLarge { .. })));
    }
}
