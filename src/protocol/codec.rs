//! Length-prefixed binary framing used on every TCP connection.
//!
//! A frame is a 4-byte little-endian magic constant, a 4-byte little-endian
//! payload length, and the payload itself. Payloads are bincode-serialized
//! serde values; [`send`] and [`recv`] do the typed encode/decode so the
//! codec itself only deals in raw byte payloads.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};

pub const FRAME_MAGIC: u32 = 0xDEAD_BEEF;

const HEADER_LEN: usize = 8;

/// Sanity cap on payload size. A peer announcing more than this is treated
/// as corrupt rather than honored with an allocation.
const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("bad frame magic {found:#010x}")]
    BadMagic { found: u32 },

    #[error("stream ended mid-frame")]
    Truncated,

    #[error("frame payload of {0} bytes exceeds limit")]
    Oversize(usize),

    #[error("payload decode failed: {0}")]
    Decode(#[from] bincode::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frames a byte stream into magic-tagged, length-prefixed payloads.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let magic = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        if magic != FRAME_MAGIC {
            return Err(FrameError::BadMagic { found: magic });
        }

        let len = u32::from_le_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(FrameError::Oversize(len));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::Truncated),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(FrameError::Oversize(payload.len()));
        }
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u32_le(FRAME_MAGIC);
        dst.put_u32_le(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

/// Serializes `msg` and writes it as one frame.
pub async fn send<S, T>(framed: &mut Framed<S, FrameCodec>, msg: &T) -> Result<(), FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(msg)?;
    framed.send(Bytes::from(payload)).await
}

/// Reads one frame and deserializes it. `Ok(None)` means the peer closed
/// the stream cleanly between frames.
///
/// Cancel-safe: the underlying read buffers partial frames internally, so a
/// dropped `recv` future never loses data.
pub async fn recv<S, T>(framed: &mut Framed<S, FrameCodec>) -> Result<Option<T>, FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: DeserializeOwned,
{
    match framed.next().await {
        None => Ok(None),
        Some(frame) => Ok(Some(bincode::deserialize(&frame?)?)),
    }
}
