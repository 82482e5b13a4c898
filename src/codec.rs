//! Wire frame encoding and decoding.
//!
//! Outbound frames serialize to JSON text, or to a length-prefixed
//! zlib-compressed binary blob when compression is requested. Inbound
//! decoding accepts both encodings and tells them apart by the WebSocket
//! message kind, so a server may switch encodings mid-stream.

use std::io::{Read as _, Write as _};

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

use crate::Result;
use crate::error::ChannelError;

/// Number of bytes reserved for the uncompressed-length prefix.
const LENGTH_PREFIX_BYTES: usize = 4;

/// An application frame headed for the wire.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    /// Event type name, e.g. `stats_update`
    #[serde(rename = "type")]
    pub kind: String,
    /// Application payload
    pub payload: Value,
    /// Time the frame was created, RFC 3339
    pub timestamp: DateTime<Utc>,
}

impl OutboundFrame {
    /// Create a frame stamped with the current time.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// The heartbeat ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Self::new("ping", Value::Object(serde_json::Map::new()))
    }

    /// A topic subscribe frame.
    #[must_use]
    pub fn subscribe(topic: &str) -> Self {
        Self::new("subscribe", serde_json::json!({ "topic": topic }))
    }

    /// A topic unsubscribe frame.
    #[must_use]
    pub fn unsubscribe(topic: &str) -> Self {
        Self::new("unsubscribe", serde_json::json!({ "topic": topic }))
    }
}

/// An inbound frame before event classification.
#[non_exhaustive]
#[derive(Debug, Clone, Deserialize)]
pub struct RawFrame {
    /// Declared event type name
    #[serde(rename = "type")]
    pub kind: String,
    /// Application payload; absent payloads decode as `null`
    #[serde(default)]
    pub payload: Value,
}

/// Encode a frame as a JSON text message.
pub fn encode_text(frame: &OutboundFrame) -> Result<Message> {
    let json = serde_json::to_string(frame)?;
    Ok(Message::Text(json.into()))
}

/// Encode a frame as a length-prefixed zlib-compressed binary message.
///
/// Layout: 4-byte big-endian uncompressed length, then the deflated JSON
/// body.
pub fn encode_compressed(frame: &OutboundFrame) -> Result<Message> {
    let json = serde_json::to_vec(frame)?;
    let uncompressed_len =
        u32::try_from(json.len()).map_err(|_| crate::error::Error::validation("frame too large"))?;

    let mut out = Vec::with_capacity(LENGTH_PREFIX_BYTES + json.len() / 2);
    out.extend_from_slice(&uncompressed_len.to_be_bytes());

    let mut encoder = ZlibEncoder::new(out, Compression::default());
    encoder
        .write_all(&json)
        .map_err(ChannelError::Compression)?;
    let out = encoder.finish().map_err(ChannelError::Compression)?;

    Ok(Message::Binary(out.into()))
}

/// Encode a frame, choosing the encoding by the `compressed` flag.
pub fn encode(frame: &OutboundFrame, compressed: bool) -> Result<Message> {
    if compressed {
        encode_compressed(frame)
    } else {
        encode_text(frame)
    }
}

/// Decode an inbound WebSocket message into a raw frame.
///
/// Text messages are parsed as JSON directly; binary messages are
/// expected to carry the length-prefixed compressed layout produced by
/// [`encode_compressed`]. Failures are codec errors and never close the
/// transport.
pub fn decode(message: &Message) -> Result<RawFrame> {
    match message {
        Message::Text(text) => {
            let frame = serde_json::from_str(text.as_str()).map_err(ChannelError::Decode)?;
            Ok(frame)
        }
        Message::Binary(bytes) => {
            if bytes.len() < LENGTH_PREFIX_BYTES {
                return Err(ChannelError::MalformedBinaryFrame.into());
            }
            let (prefix, body) = bytes.split_at(LENGTH_PREFIX_BYTES);
            let declared_len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);

            // Cap the preallocation so a hostile prefix cannot force a huge alloc
            let mut json = Vec::with_capacity((declared_len as usize).min(1 << 20));
            let mut decoder = ZlibDecoder::new(body);
            decoder
                .read_to_end(&mut json)
                .map_err(ChannelError::Compression)?;

            if json.len() != declared_len as usize {
                return Err(ChannelError::MalformedBinaryFrame.into());
            }

            let frame = serde_json::from_slice(&json).map_err(ChannelError::Decode)?;
            Ok(frame)
        }
        _ => Err(ChannelError::MalformedBinaryFrame.into()),
    }
}
