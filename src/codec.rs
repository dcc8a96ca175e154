//! Length-prefixed framing for the log server protocol.
//!
//! A frame is a 4-byte network-byte-order payload length followed by that
//! many bytes of serialized message. The decoder yields the raw payload so
//! that the relay and journal strategies can re-emit byte-identical frames;
//! callers that need a typed message parse the payload themselves.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::{ClientMessage, ServerMessage};

/// Bytes of length prefix preceding every payload.
pub const PREFIX_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum CodecError {
    /// A peer announced a payload larger than the configured maximum.
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("message serialization failed: {0}")]
    Serialize(#[from] bincode::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Codec enforcing the configured `max_message_size` in both directions.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_size: usize,
}

impl MessageCodec {
    pub fn new(max_size: usize) -> Self {
        MessageCodec { max_size }
    }
}

impl Decoder for MessageCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        if src.len() < PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; PREFIX_LEN];
        prefix.copy_from_slice(&src[..PREFIX_LEN]);
        let len = u32::from_be_bytes(prefix) as usize;

        // Reject before buffering: a hostile peer must not make us allocate.
        if len > self.max_size {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_size,
            });
        }

        if src.len() < PREFIX_LEN + len {
            src.reserve(PREFIX_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(PREFIX_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }
}

fn encode_payload(
    payload: &[u8],
    max_size: usize,
    dst: &mut BytesMut,
) -> Result<(), CodecError> {
    if payload.len() > max_size {
        return Err(CodecError::FrameTooLarge {
            len: payload.len(),
            max: max_size,
        });
    }
    dst.reserve(PREFIX_LEN + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

impl Encoder<&ServerMessage> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: &ServerMessage, dst: &mut BytesMut) -> Result<(), CodecError> {
        encode_payload(&msg.encode()?, self.max_size, dst)
    }
}

impl Encoder<&ClientMessage> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: &ClientMessage, dst: &mut BytesMut) -> Result<(), CodecError> {
        encode_payload(&msg.encode()?, self.max_size, dst)
    }
}

/// Raw payload passthrough used when forwarding frames unmodified.
impl Encoder<Bytes> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), CodecError> {
        encode_payload(&payload, self.max_size, dst)
    }
}
