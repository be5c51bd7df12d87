use std::{collections::HashMap, fmt, sync::Arc};

use bytes::BytesMut;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

/// Upper bound for a single newline-terminated control record.
pub const MAX_FRAME_BYTES: usize = 64 * 1024; // 64 KiB

const TYPE_DELIMITER: u8 = b'|';

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message format: missing type delimiter '|'")]
    MissingDelimiter,
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("malformed {tag} payload: {source}")]
    MalformedPayload {
        tag: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("message type {0:?} is not registered")]
    UnregisteredType(&'static str),
    #[error("frame exceeds {MAX_FRAME_BYTES} bytes")]
    FrameTooLong,
    #[error("serialize payload: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LinesCodecError> for ProtocolError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::MaxLineLengthExceeded => ProtocolError::FrameTooLong,
            LinesCodecError::Io(err) => ProtocolError::Io(err),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitResponse {
    pub name: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireTo {
    pub addr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportError {
    pub error: String,
}

/// Payload of the kinds that carry no fields; always encoded as `{}`.
#[derive(Debug, Serialize, Deserialize)]
struct Empty {}

/// A control message exchanged between broker and client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    InitRequest,
    InitResponse(InitResponse),
    WireTo(WireTo),
    ReportError(ReportError),
    Ack,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::InitRequest => MessageKind::InitRequest,
            Message::InitResponse(_) => MessageKind::InitResponse,
            Message::WireTo(_) => MessageKind::WireTo,
            Message::ReportError(_) => MessageKind::ReportError,
            Message::Ack => MessageKind::Ack,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    InitRequest,
    InitResponse,
    WireTo,
    ReportError,
    Ack,
}

impl MessageKind {
    pub const ALL: [MessageKind; 5] = [
        MessageKind::InitRequest,
        MessageKind::InitResponse,
        MessageKind::WireTo,
        MessageKind::ReportError,
        MessageKind::Ack,
    ];

    /// Wire tag written in front of the `|` delimiter.
    pub fn tag(self) -> &'static str {
        match self {
            MessageKind::InitRequest => "init-request",
            MessageKind::InitResponse => "init-response",
            MessageKind::WireTo => "wire-to",
            MessageKind::ReportError => "report-error",
            MessageKind::Ack => "ack",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Immutable tag table used to encode and decode control messages.
///
/// Built once at startup and shared by every connection; there is no
/// registration after construction.
#[derive(Debug, Clone)]
pub struct MessageRegistry {
    by_tag: HashMap<&'static str, MessageKind>,
}

impl MessageRegistry {
    pub fn new(kinds: impl IntoIterator<Item = MessageKind>) -> Self {
        let by_tag = kinds.into_iter().map(|k| (k.tag(), k)).collect();
        Self { by_tag }
    }

    /// Registry with every message kind of the tunnel protocol.
    pub fn standard() -> Self {
        Self::new(MessageKind::ALL)
    }

    pub fn contains(&self, kind: MessageKind) -> bool {
        self.by_tag.contains_key(kind.tag())
    }

    /// Encodes `<tag>|<json>` without the record terminator.
    pub fn encode(&self, m: &Message) -> Result<Vec<u8>, ProtocolError> {
        let kind = m.kind();
        if !self.contains(kind) {
            return Err(ProtocolError::UnregisteredType(kind.tag()));
        }

        let payload = match m {
            Message::InitRequest | Message::Ack => serde_json::to_vec(&Empty {}),
            Message::InitResponse(r) => serde_json::to_vec(r),
            Message::WireTo(w) => serde_json::to_vec(w),
            Message::ReportError(e) => serde_json::to_vec(e),
        }
        .map_err(ProtocolError::Serialize)?;

        let tag = kind.tag().as_bytes();
        let mut out = Vec::with_capacity(tag.len() + 1 + payload.len() + 1);
        out.extend_from_slice(tag);
        out.push(TYPE_DELIMITER);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Encodes a newline-terminated record ready to be written to the control connection.
    pub fn encode_frame(&self, m: &Message) -> Result<Vec<u8>, ProtocolError> {
        let mut b = self.encode(m)?;
        b.push(b'\n');
        Ok(b)
    }

    pub fn decode(&self, frame: &[u8]) -> Result<Message, ProtocolError> {
        let i = frame
            .iter()
            .position(|&b| b == TYPE_DELIMITER)
            .ok_or(ProtocolError::MissingDelimiter)?;
        let tag = String::from_utf8_lossy(&frame[..i]);
        let kind = *self
            .by_tag
            .get(tag.as_ref())
            .ok_or_else(|| ProtocolError::UnknownType(tag.into_owned()))?;

        let payload = &frame[i + 1..];
        let malformed = |source| ProtocolError::MalformedPayload {
            tag: kind.tag(),
            source,
        };

        let m = match kind {
            MessageKind::InitRequest => {
                from_object::<Empty>(payload).map_err(malformed)?;
                Message::InitRequest
            }
            MessageKind::Ack => {
                from_object::<Empty>(payload).map_err(malformed)?;
                Message::Ack
            }
            MessageKind::InitResponse => Message::InitResponse(from_object(payload).map_err(malformed)?),
            MessageKind::WireTo => Message::WireTo(from_object(payload).map_err(malformed)?),
            MessageKind::ReportError => Message::ReportError(from_object(payload).map_err(malformed)?),
        };
        Ok(m)
    }
}

/// Payloads are JSON objects; serde would otherwise also accept the array form of a struct.
fn from_object<T: DeserializeOwned>(payload: &[u8]) -> Result<T, serde_json::Error> {
    let map: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(payload)?;
    serde_json::from_value(serde_json::Value::Object(map))
}

/// Line-oriented decoder for the control connection.
///
/// Each record is a single line; records longer than [`MAX_FRAME_BYTES`] are rejected.
#[derive(Debug)]
pub struct MessageCodec {
    lines: LinesCodec,
    registry: Arc<MessageRegistry>,
}

impl MessageCodec {
    pub fn new(registry: Arc<MessageRegistry>) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_FRAME_BYTES),
            registry,
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        match self.lines.decode(src)? {
            Some(line) => self.registry.decode(line.as_bytes()).map(Some),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        match self.lines.decode_eof(src)? {
            Some(line) => self.registry.decode(line.as_bytes()).map(Some),
            None => Ok(None),
        }
    }
}
