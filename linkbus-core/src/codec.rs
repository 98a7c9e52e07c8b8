//! Wire codec: newline framing plus frame encode/decode.
//!
//! ## Wire format
//!
//! Each wire frame is one UTF-8 line terminated by `\n`. JSON escapes all
//! control characters, so neither a payload nor a topic can contain a raw
//! newline.
//!
//! **Inbound** (controller → client):
//! ```text
//! <topic> NUL <json payload>
//! ```
//! The NUL byte separates the topic from the payload; a frame without it
//! is malformed and gets dropped without touching any state. The reserved
//! topic `command` carries command replies, everything else is broadcast.
//!
//! **Outbound** (client → controller):
//! ```text
//! {"type":"command","command":<name>, ...payload fields}
//! ```
//! No topic prefix — there is only one logical outbound channel.

use bytes::{BufMut, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::BusError;
use crate::message::{Payload, TOPIC_DELIMITER, command_object};

/// Upper bound on a single wire line.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

// ── Frame ────────────────────────────────────────────────────────

/// One decoded unit of inbound data.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Broadcast topic, or [`COMMAND_TOPIC`](crate::message::COMMAND_TOPIC)
    /// for a command reply.
    pub topic: String,
    /// The decoded payload.
    pub payload: Payload,
}

/// Decode one inbound line into a topic and payload.
pub fn decode_frame(line: &str) -> Result<Frame, BusError> {
    let Some((topic, raw)) = line.split_once(TOPIC_DELIMITER) else {
        return Err(BusError::MissingDelimiter);
    };
    let value: Value = serde_json::from_str(raw)?;
    Ok(Frame {
        topic: topic.to_string(),
        payload: Payload::new(value),
    })
}

/// Encode an outbound command message to one wire line (without the
/// trailing newline — the codec adds it).
pub fn encode_command(name: &str, payload: Value) -> Result<String, BusError> {
    let message = command_object(name, payload)?;
    Ok(serde_json::to_string(&message)?)
}

// ── BusCodec ─────────────────────────────────────────────────────

/// Newline framing for `tokio_util::codec::Framed`.
///
/// Splits the inbound byte stream into lines and appends `\n` to outbound
/// ones. Topic extraction and JSON parsing happen later in
/// [`decode_frame`], so one malformed frame never poisons the stream.
#[derive(Debug, Default)]
pub struct BusCodec {}

impl Decoder for BusCodec {
    type Item = String;
    type Error = BusError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(pos) = src.iter().position(|&b| b == b'\n') {
            let line = src.split_to(pos + 1);
            return Ok(Some(String::from_utf8(line[..pos].to_vec())?));
        }
        if src.len() > MAX_FRAME_SIZE {
            return Err(BusError::FrameTooLarge {
                size: src.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(None)
    }
}

impl Encoder<String> for BusCodec {
    type Error = BusError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 1);
        dst.put(item.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
