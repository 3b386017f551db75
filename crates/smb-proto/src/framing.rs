//! Transport framing
//!
//! Every message travels in a direct-TCP frame: a zero byte followed by a
//! 24-bit big-endian length and exactly that many message bytes. A frame with
//! length zero is a keepalive.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::{SmbError, SmbResult};
use crate::protocol::{Message, Packet, Response};

/// Frame prefix size
pub const FRAME_HEADER_SIZE: usize = 4;

/// Largest length the 24-bit field can carry
pub const MAX_FRAME_LENGTH: usize = 0x00FF_FFFF;

/// Default inbound limit: 8 MiB of payload plus header slack
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024 * 1024 + 64 * 1024;

/// A decoded message together with the bytes it was decoded from
///
/// The raw bytes are kept for signature verification.
#[derive(Debug)]
pub struct Decoded<T> {
    /// Decoded message
    pub message: T,
    /// Message bytes without the frame prefix
    pub raw: Bytes,
}

/// Message codec for one side of a connection
pub trait Codec {
    /// Messages this side sends
    type Outbound;
    /// Messages this side receives
    type Inbound;

    /// Inbound frames longer than this are fatal
    fn max_frame_size(&self) -> usize;

    /// Serialise one message (without frame prefix)
    fn encode_message(&self, message: &Self::Outbound, buf: &mut BytesMut) -> SmbResult<()>;

    /// Parse one message from exactly the bytes of a frame
    ///
    /// Returns the message and the number of bytes the parser consumed.
    fn decode_message(&self, frame: &[u8]) -> SmbResult<(Self::Inbound, usize)>;

    /// Frame and append a message to `dst`
    ///
    /// Returns the offset of the message bytes inside `dst` so the caller can
    /// sign them in place. On error `dst` is left as it was.
    fn encode(&self, message: &Self::Outbound, dst: &mut BytesMut) -> SmbResult<usize> {
        let start = dst.len();
        dst.put_u32(0);
        if let Err(e) = self.encode_message(message, dst) {
            dst.truncate(start);
            return Err(e);
        }
        patch_length(dst, start)?;
        Ok(start + FRAME_HEADER_SIZE)
    }

    /// Decode the next message from a streaming buffer
    ///
    /// `Ok(None)` means more bytes are needed. Once a frame is complete its
    /// bytes are removed from `src` even if the message inside fails to parse,
    /// so only [`SmbError::Framing`] leaves the stream unusable.
    fn decode(&self, src: &mut BytesMut) -> SmbResult<Option<Decoded<Self::Inbound>>> {
        loop {
            let Some(length) = peek_frame(src, self.max_frame_size())? else {
                return Ok(None);
            };
            src.advance(FRAME_HEADER_SIZE);
            if length == 0 {
                trace!("Skipping keepalive frame");
                continue;
            }

            let raw = src.split_to(length).freeze();
            let (message, consumed) = self.decode_message(&raw)?;
            if consumed > length {
                return Err(SmbError::Framing(format!(
                    "Decoder consumed {consumed} bytes of a {length}-byte frame"
                )));
            }
            trace!(length, "Decoded frame");
            return Ok(Some(Decoded { message, raw }));
        }
    }
}

/// Append a frame around already-encoded message bytes
pub fn write_frame(payload: &[u8], dst: &mut BytesMut) -> SmbResult<()> {
    if payload.len() > MAX_FRAME_LENGTH {
        return Err(SmbError::Framing(format!(
            "Message too large for frame: {} bytes",
            payload.len()
        )));
    }
    dst.reserve(FRAME_HEADER_SIZE + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Length of the next complete frame, if `src` holds one
fn peek_frame(src: &BytesMut, max_frame_size: usize) -> SmbResult<Option<usize>> {
    if src.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    if src[0] != 0 {
        return Err(SmbError::Framing(format!(
            "Invalid frame lead byte 0x{:02X}",
            src[0]
        )));
    }

    let length = u32::from_be_bytes([0, src[1], src[2], src[3]]) as usize;
    if length > max_frame_size {
        return Err(SmbError::Framing(format!(
            "Frame length {length} exceeds limit {max_frame_size}"
        )));
    }
    if src.len() < FRAME_HEADER_SIZE + length {
        return Ok(None);
    }
    Ok(Some(length))
}

fn patch_length(dst: &mut BytesMut, start: usize) -> SmbResult<()> {
    let length = dst.len() - start - FRAME_HEADER_SIZE;
    if length > MAX_FRAME_LENGTH {
        dst.truncate(start);
        return Err(SmbError::Framing(format!(
            "Message too large for frame: {length} bytes"
        )));
    }
    dst[start..start + FRAME_HEADER_SIZE].copy_from_slice(&(length as u32).to_be_bytes());
    Ok(())
}

/// Initiator codec: requests out, responses in
///
/// A response whose header parses but whose body does not still decodes,
/// as [`Response::Undecodable`], so its credits and message id are not lost.
#[derive(Debug, Clone)]
pub struct ClientCodec {
    max_frame_size: usize,
}

impl ClientCodec {
    /// Create a codec with an inbound frame limit
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for ClientCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Codec for ClientCodec {
    type Outbound = Message;
    type Inbound = Response;

    fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn encode_message(&self, message: &Message, buf: &mut BytesMut) -> SmbResult<()> {
        message.encode(buf)
    }

    fn decode_message(&self, frame: &[u8]) -> SmbResult<(Response, usize)> {
        let mut cursor = frame;
        let response = Response::parse(&mut cursor)?;
        Ok((response, frame.len() - cursor.len()))
    }
}

/// Responder codec: responses out, current or legacy packets in
#[derive(Debug, Clone)]
pub struct ServerCodec {
    max_frame_size: usize,
}

impl ServerCodec {
    /// Create a codec with an inbound frame limit
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for ServerCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Codec for ServerCodec {
    type Outbound = Message;
    type Inbound = Packet;

    fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn encode_message(&self, message: &Message, buf: &mut BytesMut) -> SmbResult<()> {
        message.encode(buf)
    }

    fn decode_message(&self, frame: &[u8]) -> SmbResult<(Packet, usize)> {
        let mut cursor = frame;
        let packet = Packet::parse(&mut cursor)?;
        Ok((packet, frame.len() - cursor.len()))
    }
}
