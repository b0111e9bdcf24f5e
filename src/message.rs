// Copyright 2024 corerpc contributors
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The message codec (spec §4.1): pure, allocation-light encode/decode of RPC envelopes.
//!
//! An envelope is an ordered sequence of immutable parts. Part 0 is a 4-byte little-endian magic
//! tag identifying the [`MessageKind`] followed by a `bincode`-encoded header. Part 1, when
//! present, is the body; parts 2.. are user attachments (spec §3, §6).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;
use crate::ids::{MutationId, RealmId, RequestId};

/// Maximum number of parts in one envelope (spec §3: "total parts ≤ 2^16").
pub const MAX_PARTS: usize = 1 << 16;
/// Maximum size of a single part in bytes (spec §3: "each part ≤ 2^31−1 bytes").
pub const MAX_PART_SIZE: usize = i32::MAX as usize;

/// The 4-byte little-endian magic tags from spec.md §6, extended per SPEC_FULL.md §6 with the
/// two streaming kinds using the same ASCII-tag convention.
const MAGIC_REQUEST: u32 = 0x69637072; // "rpci"
const MAGIC_CANCEL: u32 = 0x63637072; // "rpcc"
const MAGIC_RESPONSE: u32 = 0x6f637072; // "rpco"
const MAGIC_STREAM_PAYLOAD: u32 = 0x70637072; // "rpcp"
const MAGIC_STREAM_FEEDBACK: u32 = 0x66637072; // "rpcf"

const MAGIC_LEN: usize = 4;

/// The kind of one envelope, decoded from part 0's prelude.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MessageKind {
    Request,
    Cancellation,
    Response,
    StreamPayload,
    StreamFeedback,
}

impl MessageKind {
    fn magic(self) -> u32 {
        match self {
            MessageKind::Request => MAGIC_REQUEST,
            MessageKind::Cancellation => MAGIC_CANCEL,
            MessageKind::Response => MAGIC_RESPONSE,
            MessageKind::StreamPayload => MAGIC_STREAM_PAYLOAD,
            MessageKind::StreamFeedback => MAGIC_STREAM_FEEDBACK,
        }
    }

    fn from_magic(magic: u32) -> Result<Self, RpcError> {
        Ok(match magic {
            MAGIC_REQUEST => MessageKind::Request,
            MAGIC_CANCEL => MessageKind::Cancellation,
            MAGIC_RESPONSE => MessageKind::Response,
            MAGIC_STREAM_PAYLOAD => MessageKind::StreamPayload,
            MAGIC_STREAM_FEEDBACK => MessageKind::StreamFeedback,
            other => {
                return Err(RpcError::protocol(format!("unrecognized message kind magic 0x{other:08x}")))
            }
        })
    }
}

/// An ordered sequence of immutable byte buffers forming one RPC unit (spec §3).
#[derive(Clone, Debug)]
pub struct Message {
    parts: Vec<Bytes>,
}

impl Message {
    fn new(parts: Vec<Bytes>) -> Self {
        Message { parts }
    }

    pub fn parts(&self) -> &[Bytes] {
        &self.parts
    }

    pub fn kind(&self) -> Result<MessageKind, RpcError> {
        get_message_kind(self)
    }

    /// Part 1, the body, if present.
    pub fn body(&self) -> Option<&Bytes> {
        self.parts.get(1)
    }

    /// Parts 2.., the user attachments.
    pub fn attachments(&self) -> &[Bytes] {
        if self.parts.len() > 2 {
            &self.parts[2..]
        } else {
            &[]
        }
    }
}

/// Request header fields (spec §3).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestHeader {
    pub request_id: RequestId,
    pub realm_id: RealmId,
    pub service: String,
    pub method: String,
    pub protocol_version: u32,
    pub mutation_id: Option<MutationId>,
    pub retry: bool,
    pub timeout_ms: Option<u64>,
    pub start_time_unix_ms: Option<u64>,
    pub user: Option<String>,
    pub trace_context: Option<Bytes>,
    pub request_format: Option<String>,
    pub response_format: Option<String>,
    pub response_codec: Option<String>,
}

/// Response header fields (spec §3). A response whose `error` is set carries no body/attachments.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub request_id: RequestId,
    pub error: Option<WireError>,
    pub body_format: Option<String>,
    pub memory_zone: Option<String>,
    pub codec: Option<String>,
}

/// Cancellation header fields (spec §4.1/§6).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CancellationHeader {
    pub request_id: RequestId,
    pub trace_context: Option<Bytes>,
}

/// Streaming payload header (spec §4.7): carries a monotonic sequence number, optional codec and
/// memory-zone tags, and whether this payload is the null attachment that ends the stream. Parts
/// 1.. are the attachment buffers it carries; an end-of-stream payload carries none.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StreamPayloadHeader {
    pub request_id: RequestId,
    pub sequence_number: u64,
    pub codec: Option<String>,
    pub memory_zone: Option<String>,
    pub end_of_stream: bool,
}

/// Streaming feedback header (spec §4.7): "carries a single field, the peer's current
/// `ReadPosition`".
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StreamFeedbackHeader {
    pub request_id: RequestId,
    pub read_position: u64,
}

/// The wire projection of [`RpcError`]; kept distinct so the codec stays decoupled from the
/// in-process error type's `thiserror` plumbing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireError {
    pub code: i32,
    pub message: String,
    pub attributes: Vec<(String, String)>,
}

impl From<&RpcError> for WireError {
    fn from(e: &RpcError) -> Self {
        WireError {
            code: e.code.numeric(),
            message: e.message.clone(),
            attributes: e.attributes.clone(),
        }
    }
}

impl From<&WireError> for RpcError {
    fn from(e: &WireError) -> Self {
        let mut error = RpcError::new(crate::error::ErrorCode::from_numeric(e.code), e.message.clone());
        error.attributes = e.attributes.clone();
        error
    }
}

fn encode_header(magic: u32, header: &impl Serialize) -> Result<Bytes, RpcError> {
    let body = bincode::serialize(header)
        .map_err(|e| RpcError::protocol(format!("failed to encode header: {e}")))?;
    let mut buf = Vec::with_capacity(MAGIC_LEN + body.len());
    buf.extend_from_slice(&magic.to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(Bytes::from(buf))
}

fn decode_header<T: for<'de> Deserialize<'de>>(part: &Bytes, expected: MessageKind) -> Result<T, RpcError> {
    if part.len() < MAGIC_LEN {
        return Err(RpcError::protocol("header part shorter than magic tag"));
    }
    let magic = u32::from_le_bytes(part[..MAGIC_LEN].try_into().unwrap());
    let kind = MessageKind::from_magic(magic)?;
    if kind != expected {
        return Err(RpcError::protocol(format!("expected {expected:?} envelope, got {kind:?}")));
    }
    bincode::deserialize(&part[MAGIC_LEN..])
        .map_err(|e| RpcError::protocol(format!("failed to decode header: {e}")))
}

/// `BuildRequest(header, body, attachments) -> Message` (spec §4.1).
pub fn build_request(
    header: &RequestHeader,
    body: Option<Bytes>,
    attachments: Vec<Bytes>,
) -> Result<Message, RpcError> {
    let part0 = encode_header(MAGIC_REQUEST, header)?;
    let mut parts = Vec::with_capacity(2 + attachments.len());
    parts.push(part0);
    if let Some(body) = body {
        parts.push(body);
    } else if !attachments.is_empty() {
        // Keep attachment indices stable: part 1 is always the body slot, even if empty.
        parts.push(Bytes::new());
    }
    parts.extend(attachments);
    let message = Message::new(parts);
    check_limits(&message)?;
    Ok(message)
}

/// `BuildCancellation(header) -> Message` (spec §4.1).
pub fn build_cancellation(header: &CancellationHeader) -> Result<Message, RpcError> {
    let part0 = encode_header(MAGIC_CANCEL, header)?;
    let message = Message::new(vec![part0]);
    check_limits(&message)?;
    Ok(message)
}

/// `BuildResponse(header, body, attachments) -> Message` (spec §4.1).
///
/// A response header with `error` set carries no body or attachments (spec §6).
pub fn build_response(
    header: &ResponseHeader,
    body: Option<Bytes>,
    attachments: Vec<Bytes>,
) -> Result<Message, RpcError> {
    let part0 = encode_header(MAGIC_RESPONSE, header)?;
    let mut parts = vec![part0];
    if header.error.is_none() {
        if let Some(body) = body {
            parts.push(body);
        } else if !attachments.is_empty() {
            parts.push(Bytes::new());
        }
        parts.extend(attachments);
    }
    let message = Message::new(parts);
    check_limits(&message)?;
    Ok(message)
}

/// `BuildErrorResponse(header) -> Message` (spec §4.1). `header.error` must already be set.
pub fn build_error_response(header: &ResponseHeader) -> Result<Message, RpcError> {
    if header.error.is_none() {
        return Err(RpcError::protocol("build_error_response called without an error set"));
    }
    build_response(header, None, Vec::new())
}

/// `BuildStreamPayload(header, attachments) -> Message` (SPEC_FULL.md §4.7).
pub fn build_stream_payload(header: &StreamPayloadHeader, attachments: Vec<Bytes>) -> Result<Message, RpcError> {
    let part0 = encode_header(MAGIC_STREAM_PAYLOAD, header)?;
    let mut parts = Vec::with_capacity(1 + attachments.len());
    parts.push(part0);
    parts.extend(attachments);
    let message = Message::new(parts);
    check_limits(&message)?;
    Ok(message)
}

/// `BuildStreamFeedback(header) -> Message` (SPEC_FULL.md §4.7).
pub fn build_stream_feedback(header: &StreamFeedbackHeader) -> Result<Message, RpcError> {
    let part0 = encode_header(MAGIC_STREAM_FEEDBACK, header)?;
    Ok(Message::new(vec![part0]))
}

pub fn parse_stream_payload_header(message: &Message) -> Result<StreamPayloadHeader, RpcError> {
    decode_header(&message.parts[0], MessageKind::StreamPayload)
}

pub fn parse_stream_feedback_header(message: &Message) -> Result<StreamFeedbackHeader, RpcError> {
    decode_header(&message.parts[0], MessageKind::StreamFeedback)
}

pub fn parse_request_header(message: &Message) -> Result<RequestHeader, RpcError> {
    decode_header(&message.parts[0], MessageKind::Request)
}

pub fn parse_response_header(message: &Message) -> Result<ResponseHeader, RpcError> {
    decode_header(&message.parts[0], MessageKind::Response)
}

pub fn parse_cancellation_header(message: &Message) -> Result<CancellationHeader, RpcError> {
    decode_header(&message.parts[0], MessageKind::Cancellation)
}

/// `GetMessageKind(Message) -> Kind` (spec §4.1).
pub fn get_message_kind(message: &Message) -> Result<MessageKind, RpcError> {
    let part0 = message.parts.first().ok_or_else(|| RpcError::protocol("empty envelope"))?;
    if part0.len() < MAGIC_LEN {
        return Err(RpcError::protocol("header part shorter than magic tag"));
    }
    let magic = u32::from_le_bytes(part0[..MAGIC_LEN].try_into().unwrap());
    MessageKind::from_magic(magic)
}

/// `CheckLimits(Message) -> ok | transport-error` (spec §3/§4.1).
pub fn check_limits(message: &Message) -> Result<(), RpcError> {
    if message.parts.len() > MAX_PARTS {
        return Err(RpcError::transport(format!(
            "message has {} parts, exceeding the limit of {MAX_PARTS}",
            message.parts.len()
        )));
    }
    for (i, part) in message.parts.iter().enumerate() {
        if part.len() > MAX_PART_SIZE {
            return Err(RpcError::transport(format!(
                "part {i} is {} bytes, exceeding the per-part limit of {MAX_PART_SIZE}",
                part.len()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request_header() -> RequestHeader {
        RequestHeader {
            request_id: RequestId::generate(),
            realm_id: RealmId::generate(),
            service: "Echo".into(),
            method: "echo".into(),
            protocol_version: 1,
            mutation_id: None,
            retry: false,
            timeout_ms: Some(1000),
            start_time_unix_ms: None,
            user: Some("alice".into()),
            trace_context: None,
            request_format: None,
            response_format: None,
            response_codec: None,
        }
    }

    #[test]
    fn request_round_trips_header_fields() {
        let header = sample_request_header();
        let msg = build_request(&header, Some(Bytes::from_static(b"hi")), vec![]).unwrap();
        assert_eq!(get_message_kind(&msg).unwrap(), MessageKind::Request);
        let parsed = parse_request_header(&msg).unwrap();
        assert_eq!(parsed.request_id, header.request_id);
        assert_eq!(parsed.service, header.service);
        assert_eq!(parsed.method, header.method);
        assert_eq!(msg.body().unwrap(), &Bytes::from_static(b"hi"));
    }

    #[test]
    fn attachments_preserved_by_reference_in_order() {
        let header = sample_request_header();
        let a = Bytes::from_static(b"a");
        let b = Bytes::from_static(b"b");
        let msg = build_request(&header, Some(Bytes::from_static(b"body")), vec![a.clone(), b.clone()]).unwrap();
        assert_eq!(msg.attachments(), &[a, b]);
    }

    #[test]
    fn error_response_has_no_body_or_attachments() {
        let mut header = ResponseHeader {
            request_id: RequestId::generate(),
            ..Default::default()
        };
        header.error = Some(WireError {
            code: crate::error::ErrorCode::NoSuchMethod.numeric(),
            message: "nope".into(),
            attributes: vec![],
        });
        let msg = build_error_response(&header).unwrap();
        assert!(msg.body().is_none());
        assert!(msg.attachments().is_empty());
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let header = sample_request_header();
        let msg = build_request(&header, None, vec![]).unwrap();
        let err = parse_response_header(&msg).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ProtocolError);
    }

    #[test]
    fn stream_payload_round_trips_sequence_number_and_attachments() {
        let header = StreamPayloadHeader {
            request_id: RequestId::generate(),
            sequence_number: 7,
            codec: Some("lz4".into()),
            memory_zone: None,
            end_of_stream: false,
        };
        let msg = build_stream_payload(&header, vec![Bytes::from_static(b"chunk")]).unwrap();
        assert_eq!(get_message_kind(&msg).unwrap(), MessageKind::StreamPayload);
        let parsed = parse_stream_payload_header(&msg).unwrap();
        assert_eq!(parsed.sequence_number, 7);
        assert_eq!(&msg.parts()[1..], &[Bytes::from_static(b"chunk")]);
    }

    #[test]
    fn stream_feedback_round_trips_read_position() {
        let header = StreamFeedbackHeader {
            request_id: RequestId::generate(),
            read_position: 16384,
        };
        let msg = build_stream_feedback(&header).unwrap();
        let parsed = parse_stream_feedback_header(&msg).unwrap();
        assert_eq!(parsed.read_position, 16384);
    }

    #[test]
    fn part_count_limit_is_enforced() {
        let header = sample_request_header();
        let attachments = vec![Bytes::new(); MAX_PARTS + 1];
        let err = build_request(&header, Some(Bytes::new()), attachments).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Transport);
    }
}
