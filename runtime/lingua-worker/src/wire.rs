//! Framing and envelopes for the stdio protocol.
//!
//! A frame is a little-endian `u32` length followed by that many bytes of
//! MessagePack or JSON. The response uses the same codec as the request; JSON
//! envelopes carry the payload base64-encoded.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::time::Instant;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use thiserror::Error;

pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireCodec {
    Json,
    Msgpack,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("Invalid request: {0}")]
    Envelope(#[from] serde_json::Error),
    #[error("Invalid payload base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Unsupported payload codec '{0}'")]
    Codec(String),
    #[error("{0}")]
    Payload(String),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RequestEnvelope {
    pub request_id: u64,
    pub entry: String,
    #[serde(default)]
    pub timeout_ms: u32,
    pub codec: String,
    #[serde(default)]
    pub payload: Option<ByteBuf>,
    #[serde(default)]
    pub payload_b64: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub request_id: u64,
    pub status: String,
    pub codec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<HashMap<String, u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
}

#[derive(Serialize)]
struct ResponseEnvelopeJson<'a> {
    request_id: u64,
    status: &'a str,
    codec: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_b64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metrics: Option<&'a HashMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entry: Option<&'a str>,
}

impl ResponseEnvelope {
    /// Response without payload or metrics.
    pub fn status_only(request_id: u64, status: &str, error: Option<String>) -> Self {
        Self {
            request_id,
            status: status.to_string(),
            codec: "raw".to_string(),
            payload: None,
            metrics: None,
            error,
            entry: None,
        }
    }
}

pub struct DecodedRequest {
    pub envelope: RequestEnvelope,
    pub wire: WireCodec,
    pub queued_at: Instant,
}

pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut header) {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(err);
    }
    let size = u32::from_le_bytes(header) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Frame exceeds max size",
        ));
    }
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf)?;
    Ok(Some(buf))
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let size = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Frame exceeds max size"))?;
    writer.write_all(&size.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// MessagePack is tried first; anything else must be a JSON envelope.
pub fn decode_request(bytes: &[u8]) -> Result<DecodedRequest, WireError> {
    let (envelope, wire) = match rmp_serde::from_slice::<RequestEnvelope>(bytes) {
        Ok(envelope) => (envelope, WireCodec::Msgpack),
        Err(_) => (
            serde_json::from_slice::<RequestEnvelope>(bytes)?,
            WireCodec::Json,
        ),
    };
    Ok(DecodedRequest {
        envelope,
        wire,
        queued_at: Instant::now(),
    })
}

pub fn extract_payload(envelope: &RequestEnvelope) -> Result<Vec<u8>, WireError> {
    if let Some(payload) = &envelope.payload {
        return Ok(payload.to_vec());
    }
    if let Some(encoded) = &envelope.payload_b64 {
        return Ok(BASE64.decode(encoded)?);
    }
    Ok(Vec::new())
}

pub fn encode_response(response: &ResponseEnvelope, wire: WireCodec) -> Result<Vec<u8>, WireError> {
    match wire {
        WireCodec::Msgpack => {
            rmp_serde::to_vec_named(response).map_err(|err| WireError::Payload(err.to_string()))
        }
        WireCodec::Json => {
            let json = ResponseEnvelopeJson {
                request_id: response.request_id,
                status: &response.status,
                codec: &response.codec,
                payload_b64: response
                    .payload
                    .as_ref()
                    .map(|payload| BASE64.encode(payload.as_slice())),
                metrics: response.metrics.as_ref(),
                error: response.error.as_deref(),
                entry: response.entry.as_deref(),
            };
            Ok(serde_json::to_vec(&json)?)
        }
    }
}

pub fn decode_payload<T: for<'de> Deserialize<'de>>(
    payload: &[u8],
    codec: &str,
) -> Result<T, WireError> {
    match codec {
        "msgpack" => rmp_serde::from_slice(payload).map_err(|err| WireError::Payload(err.to_string())),
        "json" => serde_json::from_slice(payload).map_err(|err| WireError::Payload(err.to_string())),
        _ => Err(WireError::Codec(codec.to_string())),
    }
}

pub fn encode_payload<T: Serialize>(payload: &T, codec: &str) -> Result<Vec<u8>, WireError> {
    match codec {
        "msgpack" => {
            rmp_serde::to_vec_named(payload).map_err(|err| WireError::Payload(err.to_string()))
        }
        "json" => Ok(serde_json::to_vec(payload)?),
        "raw" => Ok(Vec::new()),
        _ => Err(WireError::Codec(codec.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frames_round_trip_and_stop_at_eof() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").expect("write");
        write_frame(&mut buf, b"").expect("write empty");
        assert_eq!(&buf[..4], &5u32.to_le_bytes());

        let mut reader = Cursor::new(buf);
        assert_eq!(read_frame(&mut reader).expect("first"), Some(b"hello".to_vec()));
        assert_eq!(read_frame(&mut reader).expect("second"), Some(Vec::new()));
        assert_eq!(read_frame(&mut reader).expect("eof"), None);
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let header = ((MAX_FRAME_SIZE + 1) as u32).to_le_bytes();
        let err = read_frame(&mut Cursor::new(header.to_vec())).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn json_envelopes_carry_base64_payloads() {
        let raw = br#"{"request_id":7,"entry":"get_dataset","codec":"json","payload_b64":"eyJpZCI6IjMifQ=="}"#;
        let decoded = decode_request(raw).expect("decode");
        assert_eq!(decoded.wire, WireCodec::Json);
        assert_eq!(decoded.envelope.timeout_ms, 0);
        assert_eq!(
            extract_payload(&decoded.envelope).expect("payload"),
            br#"{"id":"3"}"#.to_vec()
        );

        let response = ResponseEnvelope {
            payload: Some(ByteBuf::from(b"{}".to_vec())),
            ..ResponseEnvelope::status_only(7, "Ok", None)
        };
        let encoded = encode_response(&response, WireCodec::Json).expect("encode");
        let json: serde_json::Value = serde_json::from_slice(&encoded).expect("json");
        assert_eq!(json["payload_b64"], "e30=");
        assert_eq!(json["status"], "Ok");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn msgpack_envelopes_are_detected() {
        let envelope = RequestEnvelope {
            request_id: 9,
            entry: "__ping__".into(),
            timeout_ms: 10,
            codec: "msgpack".into(),
            payload: Some(ByteBuf::from(vec![0x80])),
            payload_b64: None,
        };
        let bytes = rmp_serde::to_vec_named(&envelope).expect("encode");
        let decoded = decode_request(&bytes).expect("decode");
        assert_eq!(decoded.wire, WireCodec::Msgpack);
        assert_eq!(decoded.envelope.request_id, 9);
        assert_eq!(extract_payload(&decoded.envelope).expect("payload"), vec![0x80]);
    }

    #[test]
    fn unknown_codecs_are_rejected() {
        assert!(matches!(
            decode_payload::<serde_json::Value>(b"{}", "xml"),
            Err(WireError::Codec(_))
        ));
        assert!(encode_payload(&1, "raw").expect("raw").is_empty());
    }
}
