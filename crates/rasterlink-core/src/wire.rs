//! rasterlink wire format: the envelope every message travels in.
//!
//! Sender, relay and receiver agree on every byte defined here. Changing
//! a size or an id breaks interoperability with existing peers.
//!
//! ```text
//! +---------+------------------+---------------------------+
//! | type_id | length (u32, LE) | payload (`length` bytes)  |
//! +---------+------------------+---------------------------+
//!   1 byte        4 bytes              variable
//! ```
//!
//! All integers on the wire are little-endian. The header is a zerocopy
//! struct so reading and writing it needs no offset arithmetic and no
//! unsafe code. Payload layouts live next to the message types in
//! [`crate::message`].

use std::fmt;

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Envelope Header ──────────────────────────────────────────────────────────

/// Fixed prefix of every envelope.
///
/// `length` is redundant with the payload's own encoding but is always
/// present, and always equals the byte length of the payload that follows.
///
/// Wire size: 5 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct EnvelopeHeader {
    /// Registry id selecting the payload codec. See [`MessageType`].
    pub type_id: u8,

    /// Payload length in bytes, not including this header.
    pub length: U32<LittleEndian>,
}

// Fails to compile if the header layout drifts.
assert_eq_size!(EnvelopeHeader, [u8; 5]);

impl EnvelopeHeader {
    pub fn new(type_id: u8, length: u32) -> Self {
        Self {
            type_id,
            length: U32::new(length),
        }
    }

    pub fn payload_len(&self) -> u32 {
        self.length.get()
    }
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// A type tag plus its encoded payload, exactly as it crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub type_id: u8,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(message_type: MessageType, payload: Bytes) -> Result<Self, WireError> {
        if payload.len() > MAX_ENVELOPE_PAYLOAD as usize {
            return Err(WireError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            type_id: message_type.into(),
            payload,
        })
    }

    /// Payload length as carried in the header.
    ///
    /// `Envelope::new` bounds the payload, so the cast cannot truncate.
    pub fn length(&self) -> u32 {
        self.payload.len() as u32
    }

    pub fn header(&self) -> EnvelopeHeader {
        EnvelopeHeader::new(self.type_id, self.length())
    }

    /// Header followed by payload, ready for a single `write_all`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENVELOPE_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(self.header().as_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

// ── Type Registry ────────────────────────────────────────────────────────────

/// Closed registry of payload kinds. The discriminant is the on-wire id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Raster dimensions. Sent exactly once, before any chunk.
    Metadata = 0x01,

    /// One slice of the raster, addressed by zero-based index.
    Chunk = 0x02,

    /// Receiver → sender: indices still missing.
    LossRequest = 0x03,

    /// Control marker with an empty payload. Ends a burst of chunks, or
    /// acknowledges a completed transfer.
    EndOfTransfer = 0x04,
}

impl MessageType {
    pub const ALL: [MessageType; 4] = [
        MessageType::Metadata,
        MessageType::Chunk,
        MessageType::LossRequest,
        MessageType::EndOfTransfer,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MessageType::Metadata => "metadata",
            MessageType::Chunk => "chunk",
            MessageType::LossRequest => "loss_request",
            MessageType::EndOfTransfer => "end_of_transfer",
        }
    }

    /// Payload length for fixed-size formats, `None` for variable ones.
    pub fn fixed_payload_len(self) -> Option<usize> {
        match self {
            MessageType::Metadata => Some(METADATA_LEN),
            MessageType::EndOfTransfer => Some(0),
            MessageType::Chunk | MessageType::LossRequest => None,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageType::Metadata),
            0x02 => Ok(MessageType::Chunk),
            0x03 => Ok(MessageType::LossRequest),
            0x04 => Ok(MessageType::EndOfTransfer),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t as u8
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Size of [`EnvelopeHeader`] on the wire.
pub const ENVELOPE_HEADER_LEN: usize = std::mem::size_of::<EnvelopeHeader>();

/// Pixel bytes per chunk. Only the final chunk of a transfer may be shorter.
pub const CHUNK_SIZE: usize = 512;

/// Bytes taken by the index prefix of a chunk payload.
pub const CHUNK_INDEX_LEN: usize = 4;

/// Largest legal chunk payload: index plus a full slice of pixels.
pub const MAX_CHUNK_PAYLOAD: usize = CHUNK_INDEX_LEN + CHUNK_SIZE;

/// Metadata payload: width then height, both u32.
pub const METADATA_LEN: usize = 8;

/// Maximum indices the receiver names in one loss request.
/// Bounds request size; the remainder is requested in later rounds.
pub const MAX_LOSS_REQUEST_INDICES: usize = 100;

/// Upper bound on any envelope payload (16 MiB).
/// A header announcing more is rejected before the payload is read.
pub const MAX_ENVELOPE_PAYLOAD: u32 = 16 * 1024 * 1024;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
///
/// All of them are fatal to the stream they occur on: once framing or a
/// codec invariant is broken, nothing after it can be trusted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown message type id: 0x{0:02x}")]
    UnknownMessageType(u8),

    #[error("malformed {kind} payload: {reason}")]
    MalformedPayload { kind: MessageType, reason: String },

    #[error("payload length {0} exceeds maximum {}", MAX_ENVELOPE_PAYLOAD)]
    PayloadTooLarge(usize),
}

impl WireError {
    pub(crate) fn malformed(kind: MessageType, reason: impl Into<String>) -> Self {
        WireError::MalformedPayload {
            kind,
            reason: reason.into(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
