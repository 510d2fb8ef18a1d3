//! The handshake is always JSON-framed with the record separator, regardless
//! of which protocol variant is negotiated for the rest of the session.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::json::RECORD_SEPARATOR;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HandshakeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "minorVersion", skip_serializing_if = "Option::is_none")]
    pub minor_version: Option<i32>,
}

impl HandshakeResponse {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

pub fn write_request(request: &HandshakeRequest, sink: &mut Vec<u8>) -> Result<(), ProtocolError> {
    serde_json::to_writer(&mut *sink, request)?;
    sink.push(RECORD_SEPARATOR);
    Ok(())
}

pub fn write_response(response: &HandshakeResponse, sink: &mut Vec<u8>) -> Result<(), ProtocolError> {
    serde_json::to_writer(&mut *sink, response)?;
    sink.push(RECORD_SEPARATOR);
    Ok(())
}

/// Parse a handshake message out of `residual`, returning `None` if it
/// doesn't yet contain a full `<json>\x1e` frame.
pub fn parse_framed<T: for<'de> Deserialize<'de>>(
    residual: &mut Vec<u8>,
) -> Result<Option<T>, ProtocolError> {
    let Some(pos) = residual.iter().position(|&b| b == RECORD_SEPARATOR) else {
        return Ok(None);
    };
    let frame = residual[..pos].to_vec();
    residual.drain(0..=pos);
    let value = serde_json::from_slice(&frame)?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let req = HandshakeRequest {
            protocol: "json".into(),
            version: 1,
        };
        let mut buf = Vec::new();
        write_request(&req, &mut buf).unwrap();
        assert_eq!(buf, b"{\"protocol\":\"json\",\"version\":1}\x1e");
        let parsed: HandshakeRequest = parse_framed(&mut buf).unwrap().unwrap();
        assert_eq!(parsed, req);
        assert!(buf.is_empty());
    }

    #[test]
    fn success_response_serializes_to_empty_object() {
        let resp = HandshakeResponse::default();
        let mut buf = Vec::new();
        write_response(&resp, &mut buf).unwrap();
        assert_eq!(buf, b"{}\x1e");
        assert!(resp.is_success());
    }

    #[test]
    fn error_response_round_trip() {
        let resp = HandshakeResponse {
            error: Some("unsupported protocol".into()),
            minor_version: None,
        };
        let mut buf = Vec::new();
        write_response(&resp, &mut buf).unwrap();
        let parsed: HandshakeResponse = parse_framed(&mut buf).unwrap().unwrap();
        assert!(!parsed.is_success());
        assert_eq!(parsed.error.as_deref(), Some("unsupported protocol"));
    }

    #[test]
    fn partial_frame_returns_none() {
        let mut buf = b"{\"protocol\":\"json\"".to_vec();
        let parsed: Option<HandshakeRequest> = parse_framed(&mut buf).unwrap();
        assert!(parsed.is_none());
        assert_eq!(buf, b"{\"protocol\":\"json\"");
    }
}
