//! Length-prefixed packet framing for the remoting transport.
//!
//! Packets are framed with a 4-byte big-endian length prefix followed by
//! the JSON payload:
//!
//! ```text
//! +----------------+------------------+
//! | length (4 BE)  |  JSON payload    |
//! +----------------+------------------+
//! ```
//!
//! [`PacketCodec`] is the async form used by the server; [`FrameReader`] and
//! [`FrameWriter`] serve blocking clients and tests.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::codec::{Decoder, Encoder};

use crate::MAX_PACKET_SIZE;
use crate::error::{ProtocolError, ProtocolResult};
use crate::packet::Packet;

const LENGTH_PREFIX: usize = 4;

/// Encodes a message to bytes with length prefix.
///
/// # Example
///
/// ```rust
/// use relaymq_protocol::{encode_message, Packet, PacketKind};
///
/// let packet = Packet::new("conn-1", PacketKind::Ping);
/// let bytes = encode_message(&packet).unwrap();
/// assert!(bytes.len() > 4);
/// ```
pub fn encode_message<T: Serialize>(message: &T) -> ProtocolResult<Vec<u8>> {
    let json = serde_json::to_vec(message)?;
    check_size(json.len())?;

    let mut buffer = Vec::with_capacity(LENGTH_PREFIX + json.len());
    buffer.extend_from_slice(&(json.len() as u32).to_be_bytes());
    buffer.extend_from_slice(&json);
    Ok(buffer)
}

/// Decodes a message from bytes with length prefix.
///
/// The input should be a complete framed message (length prefix + payload).
pub fn decode_message<T: DeserializeOwned>(data: &[u8]) -> ProtocolResult<T> {
    if data.len() < LENGTH_PREFIX {
        return Err(ProtocolError::IncompleteMessage {
            expected: LENGTH_PREFIX,
            received: data.len(),
        });
    }

    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    check_size(len)?;

    if data.len() < LENGTH_PREFIX + len {
        return Err(ProtocolError::IncompleteMessage {
            expected: LENGTH_PREFIX + len,
            received: data.len(),
        });
    }

    let message = serde_json::from_slice(&data[LENGTH_PREFIX..LENGTH_PREFIX + len])?;
    Ok(message)
}

fn check_size(len: usize) -> ProtocolResult<()> {
    if len > MAX_PACKET_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_PACKET_SIZE,
        });
    }
    Ok(())
}

/// Async codec for [`Packet`]s, for use with `tokio_util::codec::Framed`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> ProtocolResult<Option<Packet>> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        check_size(len)?;
        if len == 0 {
            return Err(ProtocolError::EmptyMessage);
        }

        if src.len() < LENGTH_PREFIX + len {
            src.reserve(LENGTH_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let payload = src.split_to(len);
        let packet = serde_json::from_slice(&payload)?;
        Ok(Some(packet))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> ProtocolResult<()> {
        let json = serde_json::to_vec(&item)?;
        check_size(json.len())?;
        dst.reserve(LENGTH_PREFIX + json.len());
        dst.put_u32(json.len() as u32);
        dst.extend_from_slice(&json);
        Ok(())
    }
}

/// Reads framed messages from a blocking byte stream.
pub struct FrameReader<R> {
    reader: R,
}

impl<R: Read> FrameReader<R> {
    /// Creates a new FrameReader wrapping the given reader.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads a single framed message.
    ///
    /// Returns `Ok(None)` if the stream is empty (EOF before any bytes).
    pub fn read_message<T: DeserializeOwned>(&mut self) -> ProtocolResult<Option<T>> {
        let mut len_buf = [0u8; LENGTH_PREFIX];
        match self.reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        check_size(len)?;
        if len == 0 {
            return Err(ProtocolError::EmptyMessage);
        }

        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload)?;

        let message = serde_json::from_slice(&payload)?;
        Ok(Some(message))
    }

    /// Unwraps this FrameReader, returning the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Writes framed messages to a blocking byte stream.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: Write> FrameWriter<W> {
    /// Creates a new FrameWriter wrapping the given writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes a single framed message.
    pub fn write_message<T: Serialize>(&mut self, message: &T) -> ProtocolResult<()> {
        let data = encode_message(message)?;
        self.writer.write_all(&data)?;
        Ok(())
    }

    /// Flushes the underlying writer.
    pub fn flush(&mut self) -> ProtocolResult<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Unwraps this FrameWriter, returning the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}
