//! Unit codec errors

use thiserror::Error;

use crate::Capability;

/// Errors that can occur while writing or reading a serialized unit
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnitError {
    /// Invalid magic bytes at the start of the blob
    #[error("Invalid magic bytes")]
    InvalidMagic,

    /// Unsupported format version
    #[error("Unsupported unit version: {0}")]
    UnsupportedVersion(u8),

    /// Byte-order marker is neither little nor big endian
    #[error("Invalid byte order marker: {0}")]
    InvalidByteOrder(u8),

    /// The blob ended before a field could be read
    #[error("Unexpected end of unit at offset {offset} (needed {needed} more bytes)")]
    UnexpectedEnd {
        /// Offset of the truncated field
        offset: usize,
        /// Bytes missing to complete it
        needed: usize,
    },

    /// Unknown value tag
    #[error("Invalid tag 0x{tag:02x} at offset {offset}")]
    InvalidTag {
        /// Tag byte found
        tag: u8,
        /// Offset of the tag byte
        offset: usize,
    },

    /// A string field does not hold valid UTF-8
    #[error("Invalid UTF-8 string at offset {0}")]
    InvalidUtf8(usize),

    /// The unit uses a construct the caller did not allow
    #[error("{0} is not allowed in this unit")]
    NotAllowed(Capability),

    /// Back-reference to an object that was not emitted before it
    #[error("Invalid object reference {index} ({available} objects available)")]
    InvalidReference {
        /// Referenced object index
        index: u32,
        /// Number of objects emitted so far
        available: u32,
    },

    /// Shared buffer index outside the attached buffer table
    #[error("Invalid shared buffer index {index} ({available} buffers attached)")]
    InvalidSharedBuffer {
        /// Buffer index
        index: u32,
        /// Size of the attached table
        available: u32,
    },

    /// Nesting exceeds the reader/writer depth limit
    #[error("Unit nesting exceeds depth limit of {0}")]
    TooDeep(usize),

    /// A length does not fit the 32-bit wire field
    #[error("Length {0} does not fit in a unit length field")]
    LengthOverflow(usize),

    /// Bytes left after the root value
    #[error("{0} trailing bytes after unit")]
    TrailingBytes(usize),
}

/// Result type for unit codec operations
pub type UnitResult<T> = std::result::Result<T, UnitError>;
