//! Wire encoding for relayed batches.
//!
//! Out-of-process backing stores exchange a little-endian envelope:
//!
//! ```text
//! +-----------------+-------------------+-------------------+
//! | sequence_id i64 | payload_len i32   | payload           |
//! +-----------------+-------------------+-------------------+
//! ```
//!
//! The payload is the serialized message list:
//!
//! ```text
//! count i32, then per message:
//!   key_len i32 | key utf-8 | value_len i32 | value | flags u8
//! ```
//!
//! Flag bit 0 marks a command message. Any transport must carry the envelope
//! untouched so relays stay decodable independent of the technology.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::message::Message;

/// Size of the `sequence_id` + `payload_len` header.
pub const ENVELOPE_HEADER_LEN: usize = 12;

const FLAG_COMMAND: u8 = 0b0000_0001;

/// Errors produced while encoding or decoding relayed batches.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Truncated {field}: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("Negative {0} in payload")]
    NegativeLength(&'static str),

    #[error("Envelope declares {declared} payload bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Message key is not valid UTF-8")]
    InvalidKey,

    #[error("Sequence id {0} does not fit the wire format")]
    SequenceOutOfRange(u64),

    #[error("Negative sequence id {0} in envelope")]
    NegativeSequence(i64),

    #[error("{0} exceeds the wire format limit")]
    TooLarge(&'static str),
}

/// Serialize a message list into the payload form.
pub fn encode_payload(messages: &[Message]) -> Result<Bytes, CodecError> {
    let size = 4 + messages
        .iter()
        .map(|m| 4 + m.key().len() + 4 + m.value().len() + 1)
        .sum::<usize>();
    let mut buf = BytesMut::with_capacity(size);

    buf.put_i32_le(wire_len(messages.len(), "message count")?);
    for message in messages {
        buf.put_i32_le(wire_len(message.key().len(), "key")?);
        buf.put_slice(message.key().as_bytes());
        buf.put_i32_le(wire_len(message.value().len(), "value")?);
        buf.put_slice(message.value());
        buf.put_u8(if message.is_command() { FLAG_COMMAND } else { 0 });
    }

    Ok(buf.freeze())
}

/// Parse a payload produced by [`encode_payload`].
pub fn decode_payload(mut buf: &[u8]) -> Result<Vec<Message>, CodecError> {
    let count = read_len(&mut buf, "message count")?;
    // Every message needs at least 9 bytes; cap the preallocation accordingly
    let mut messages = Vec::with_capacity(count.min(buf.len() / 9));

    for _ in 0..count {
        let key_len = read_len(&mut buf, "key length")?;
        let key = take(&mut buf, key_len, "key")?;
        let key = std::str::from_utf8(&key)
            .map_err(|_| CodecError::InvalidKey)?
            .to_string();

        let value_len = read_len(&mut buf, "value length")?;
        let value = take(&mut buf, value_len, "value")?;

        ensure_remaining(buf, 1, "flags")?;
        let flags = buf.get_u8();

        messages.push(Message::with_flag(key, value, flags & FLAG_COMMAND != 0));
    }

    Ok(messages)
}

/// Wrap a message list in the sequenced envelope.
pub fn encode_envelope(sequence_id: u64, messages: &[Message]) -> Result<Bytes, CodecError> {
    let sequence =
        i64::try_from(sequence_id).map_err(|_| CodecError::SequenceOutOfRange(sequence_id))?;
    let payload = encode_payload(messages)?;

    let mut buf = BytesMut::with_capacity(ENVELOPE_HEADER_LEN + payload.len());
    buf.put_i64_le(sequence);
    buf.put_i32_le(wire_len(payload.len(), "payload")?);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Unwrap an envelope into its sequence id and messages.
pub fn decode_envelope(mut buf: &[u8]) -> Result<(u64, Vec<Message>), CodecError> {
    ensure_remaining(buf, 8, "sequence id")?;
    let sequence = buf.get_i64_le();
    let sequence_id = u64::try_from(sequence).map_err(|_| CodecError::NegativeSequence(sequence))?;

    let declared = read_len(&mut buf, "payload length")?;
    if declared != buf.len() {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: buf.len(),
        });
    }

    Ok((sequence_id, decode_payload(buf)?))
}

fn wire_len(len: usize, field: &'static str) -> Result<i32, CodecError> {
    i32::try_from(len).map_err(|_| CodecError::TooLarge(field))
}

fn ensure_remaining(buf: &[u8], needed: usize, field: &'static str) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated {
            field,
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn read_len(buf: &mut &[u8], field: &'static str) -> Result<usize, CodecError> {
    ensure_remaining(buf, 4, field)?;
    let len = buf.get_i32_le();
    usize::try_from(len).map_err(|_| CodecError::NegativeLength(field))
}

fn take(buf: &mut &[u8], len: usize, field: &'static str) -> Result<Bytes, CodecError> {
    ensure_remaining(buf, len, field)?;
    Ok(buf.copy_to_bytes(len))
}
