//! Codec for encoding/decoding protocol messages

use crate::messages::Message;
use crate::MAX_FRAME_SIZE;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Incomplete length header: {0} bytes")]
    IncompleteHeader(usize),
}

/// Length-prefixed message codec
pub struct MessageCodec;

impl MessageCodec {
    /// Size of the big-endian length header
    pub const HEADER_LEN: usize = 4;

    /// Encode a message to bytes
    ///
    /// Format: [length: u32][payload: bincode serialized message]
    pub fn encode(msg: &Message) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a message from bytes
    ///
    /// Returns Ok(Some(message)) if a complete message was decoded,
    /// Ok(None) if more data is needed,
    /// Err on error
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        if buf.len() < Self::HEADER_LEN {
            return Ok(None);
        }

        let length = Self::frame_len(&buf[..Self::HEADER_LEN])?;

        if buf.len() < Self::HEADER_LEN + length {
            return Ok(None);
        }

        let _ = buf.split_to(Self::HEADER_LEN);
        let msg_bytes = buf.split_to(length);

        Self::decode_payload(&msg_bytes).map(Some)
    }

    /// Parse and bound-check a length header
    pub fn frame_len(header: &[u8]) -> Result<usize, CodecError> {
        let length_bytes: [u8; Self::HEADER_LEN] = header
            .get(..Self::HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or(CodecError::IncompleteHeader(header.len()))?;
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }
        Ok(length)
    }

    /// Deserialize a payload whose length header was already consumed
    pub fn decode_payload(payload: &[u8]) -> Result<Message, CodecError> {
        Ok(bincode::deserialize(payload)?)
    }
}
