//! The FastEvent packet: a fixed 2-byte datagram.
//!
//! ```text
//! ┌──────────┬────────────┐
//! │ Index(1) │ Payload(1) │
//! └──────────┴────────────┘
//! ```
//!
//! The index is an unsigned byte assigned by the sending [`Writer`] from its
//! [`SeqIndex`]; the payload is a single ASCII command or data byte.
//!
//! [`Writer`]: crate::session::Writer

use std::fmt;

use thiserror::Error;

/// Size of every packet on the wire.
pub const PACKET_LEN: usize = 2;

/// Largest sequence index before wraparound.
pub const MAX_PACKET_INDEX: u8 = u8::MAX;

/// Errors while building or decoding a packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Datagram is not exactly [`PACKET_LEN`] bytes.
    #[error("invalid packet length: expected 2 bytes, got {len}")]
    InvalidLength { len: usize },
    /// Index does not fit in one unsigned byte.
    #[error("packet index {0} out of range 0..=255")]
    IndexOutOfRange(usize),
    /// Payload is not exactly one byte.
    #[error("packet payload must be exactly 1 byte, got {len}")]
    InvalidPayload { len: usize },
}

/// A decoded `(index, payload)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Packet {
    /// Sequence index assigned by the sender.
    pub index: u8,
    /// Command or data byte.
    pub payload: u8,
}

impl Packet {
    /// Creates a packet from already-validated parts.
    #[inline]
    #[must_use]
    pub const fn new(index: u8, payload: u8) -> Self {
        Self { index, payload }
    }

    /// Creates a packet from unchecked parts.
    ///
    /// Fails when `index` is above 255 or `payload` is not a single byte.
    pub fn from_parts(index: usize, payload: &[u8]) -> Result<Self, PacketError> {
        let index = u8::try_from(index).map_err(|_| PacketError::IndexOutOfRange(index))?;
        match payload {
            [byte] => Ok(Self::new(index, *byte)),
            _ => Err(PacketError::InvalidPayload { len: payload.len() }),
        }
    }

    /// Encodes the packet into its wire form.
    #[inline]
    #[must_use]
    pub const fn encode(&self) -> [u8; PACKET_LEN] {
        [self.index, self.payload]
    }

    /// Decodes a datagram; it must be exactly [`PACKET_LEN`] bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        match buf {
            &[index, payload] => Ok(Self::new(index, payload)),
            _ => Err(PacketError::InvalidLength { len: buf.len() }),
        }
    }
}

impl From<Packet> for (u8, u8) {
    fn from(p: Packet) -> Self {
        (p.index, p.payload)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_ascii_graphic() {
            write!(f, "#{:03}:'{}'", self.index, char::from(self.payload))
        } else {
            write!(f, "#{:03}:0x{:02x}", self.index, self.payload)
        }
    }
}

/// Per-writer sequence index over `0..=255`, wrapping to 0 after 255.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SeqIndex(u8);

impl SeqIndex {
    /// Index of the first packet a writer sends.
    pub const ZERO: Self = Self(0);

    /// Creates an index at an arbitrary position.
    #[inline]
    #[must_use]
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    /// Raw index value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Next index, wrapping 255 back to 0.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl From<SeqIndex> for u8 {
    fn from(s: SeqIndex) -> Self {
        s.0
    }
}

impl fmt::Display for SeqIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
