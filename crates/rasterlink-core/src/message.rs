//! Message types and their payload codecs.
//!
//! [`Message`] is the sum type over the four registered payload kinds.
//! Encoding dispatches on the variant, decoding on the wire id; there is
//! one function per direction and no other dispatch path.
//!
//! Payload layouts (all integers little-endian):
//!
//! | Kind          | Layout                                   |
//! |---------------|------------------------------------------|
//! | Metadata      | `width:u32, height:u32` (8 bytes)        |
//! | Chunk         | `index:u32` + raw pixels (≤ 512 bytes)   |
//! | LossRequest   | `index:u32` repeated, in supplied order  |
//! | EndOfTransfer | empty                                    |

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::wire::{
    Envelope, MessageType, WireError, CHUNK_INDEX_LEN, CHUNK_SIZE, METADATA_LEN,
};

/// Raster dimensions in pixels. Total payload size is `width * height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterMetadata {
    pub width: u32,
    pub height: u32,
}

impl RasterMetadata {
    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Number of chunks a raster of these dimensions splits into.
    pub fn chunk_count(&self) -> u64 {
        chunk_count(self.pixel_count())
    }
}

/// On-wire layout of a metadata payload.
#[derive(AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
struct MetadataPayload {
    width: U32<LittleEndian>,
    height: U32<LittleEndian>,
}

assert_eq_size!(MetadataPayload, [u8; METADATA_LEN]);

/// `ceil(len / CHUNK_SIZE)`.
pub fn chunk_count(len: u64) -> u64 {
    len.div_ceil(CHUNK_SIZE as u64)
}

/// One slice of the raster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based chunk number in transfer order.
    pub index: u32,
    /// At most [`CHUNK_SIZE`] bytes.
    pub pixels: Vec<u8>,
}

/// Indices the receiver has not yet seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LossRequest {
    pub indices: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Metadata(RasterMetadata),
    Chunk(Chunk),
    LossRequest(LossRequest),
    EndOfTransfer,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Metadata(_) => MessageType::Metadata,
            Message::Chunk(_) => MessageType::Chunk,
            Message::LossRequest(_) => MessageType::LossRequest,
            Message::EndOfTransfer => MessageType::EndOfTransfer,
        }
    }

    /// Encode-by-variant.
    pub fn to_envelope(&self) -> Result<Envelope, WireError> {
        let payload = match self {
            Message::Metadata(meta) => {
                let layout = MetadataPayload {
                    width: U32::new(meta.width),
                    height: U32::new(meta.height),
                };
                Bytes::copy_from_slice(layout.as_bytes())
            }
            Message::Chunk(chunk) => {
                if chunk.pixels.len() > CHUNK_SIZE {
                    return Err(WireError::malformed(
                        MessageType::Chunk,
                        format!("{} pixel bytes exceeds {CHUNK_SIZE}", chunk.pixels.len()),
                    ));
                }
                let mut buf = BytesMut::with_capacity(CHUNK_INDEX_LEN + chunk.pixels.len());
                buf.put_u32_le(chunk.index);
                buf.put_slice(&chunk.pixels);
                buf.freeze()
            }
            Message::LossRequest(req) => {
                let mut buf = BytesMut::with_capacity(req.indices.len() * 4);
                for &index in &req.indices {
                    buf.put_u32_le(index);
                }
                buf.freeze()
            }
            Message::EndOfTransfer => Bytes::new(),
        };
        Envelope::new(self.message_type(), payload)
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, WireError> {
        Self::decode(envelope.type_id, &envelope.payload)
    }

    /// Decode-by-id.
    pub fn decode(type_id: u8, payload: &[u8]) -> Result<Self, WireError> {
        let kind = MessageType::try_from(type_id)?;

        if let Some(expected) = kind.fixed_payload_len() {
            if payload.len() != expected {
                return Err(WireError::malformed(
                    kind,
                    format!("expected {expected} bytes, got {}", payload.len()),
                ));
            }
        }

        match kind {
            MessageType::Metadata => {
                let layout = MetadataPayload::read_from(payload)
                    .ok_or_else(|| WireError::malformed(kind, "unreadable layout"))?;
                Ok(Message::Metadata(RasterMetadata {
                    width: layout.width.get(),
                    height: layout.height.get(),
                }))
            }
            MessageType::Chunk => {
                if payload.len() < CHUNK_INDEX_LEN {
                    return Err(WireError::malformed(
                        kind,
                        format!("{} bytes is shorter than the index", payload.len()),
                    ));
                }
                let pixels = payload.len() - CHUNK_INDEX_LEN;
                if pixels > CHUNK_SIZE {
                    return Err(WireError::malformed(
                        kind,
                        format!("{pixels} pixel bytes exceeds {CHUNK_SIZE}"),
                    ));
                }
                let mut buf = payload;
                let index = buf.get_u32_le();
                Ok(Message::Chunk(Chunk {
                    index,
                    pixels: buf.to_vec(),
                }))
            }
            MessageType::LossRequest => {
                if payload.len() % 4 != 0 {
                    return Err(WireError::malformed(
                        kind,
                        format!("{} bytes is not a multiple of 4", payload.len()),
                    ));
                }
                let mut buf = payload;
                let mut indices = Vec::with_capacity(payload.len() / 4);
                while buf.has_remaining() {
                    indices.push(buf.get_u32_le());
                }
                Ok(Message::LossRequest(LossRequest { indices }))
            }
            MessageType::EndOfTransfer => Ok(Message::EndOfTransfer),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Metadata(m) => write!(f, "metadata {}x{}", m.width, m.height),
            Message::Chunk(c) => write!(f, "chunk #{} ({} bytes)", c.index, c.pixels.len()),
            Message::LossRequest(r) => write!(f, "loss request ({} indices)", r.indices.len()),
            Message::EndOfTransfer => f.write_str("end of transfer"),
        }
    }
}
