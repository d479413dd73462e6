//! # Kelp Unit
//!
//! Portable binary format for compiled script and module units, and for the
//! structured values exchanged between worker runtimes.
//!
//! ## Layout
//!
//! ```text
//! [magic: "KELP"][version: u8][byte order: u8][capabilities: u8][reserved: u8]
//! [root value]
//! ```
//!
//! Every value starts with a one-byte tag. Multi-byte fields (lengths, integers,
//! floats) are written in the byte order named in the header, so a blob written
//! with `byte_swap` for an opposite-endian target is still readable anywhere.
//! Lengths and indices are unsigned 32-bit. The reader validates every length
//! against the remaining input before allocating.

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
mod reader;
pub mod value;
mod writer;

use std::fmt;

pub use error::{UnitError, UnitResult};
pub use reader::{deserialize, read_header};
pub use value::{FunctionUnit, ModuleUnit, UnitValue};
pub use writer::serialize;

/// Unit format version
pub const UNIT_VERSION: u8 = 1;

/// Magic bytes for serialized units
pub const UNIT_MAGIC: [u8; 4] = *b"KELP";

/// Size of the fixed header in bytes
pub const HEADER_LEN: usize = 8;

/// Maximum nesting of arrays, objects and function constants
pub const MAX_DEPTH: usize = 512;

/// Byte order of the multi-byte fields in a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Least significant byte first
    Little,
    /// Most significant byte first
    Big,
}

impl ByteOrder {
    /// Byte order of the running host
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    /// The other byte order
    pub const fn swapped(self) -> Self {
        match self {
            ByteOrder::Little => ByteOrder::Big,
            ByteOrder::Big => ByteOrder::Little,
        }
    }

    pub(crate) fn marker(self) -> u8 {
        match self {
            ByteOrder::Little => 0,
            ByteOrder::Big => 1,
        }
    }

    pub(crate) fn from_marker(marker: u8) -> UnitResult<Self> {
        match marker {
            0 => Ok(ByteOrder::Little),
            1 => Ok(ByteOrder::Big),
            other => Err(UnitError::InvalidByteOrder(other)),
        }
    }
}

/// Constructs that must be explicitly allowed to appear in a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Compiled functions and modules
    Bytecode,
    /// Back-references forming an object graph
    Reference,
    /// Shared buffers carried next to the blob
    SharedBuffer,
}

impl Capability {
    pub(crate) const fn bit(self) -> u8 {
        match self {
            Capability::Bytecode => 0b001,
            Capability::Reference => 0b010,
            Capability::SharedBuffer => 0b100,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Bytecode => f.write_str("function/module bytecode"),
            Capability::Reference => f.write_str("object reference"),
            Capability::SharedBuffer => f.write_str("shared buffer"),
        }
    }
}

/// Set of allowed capabilities
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities(u8);

impl Capabilities {
    /// No optional constructs
    pub const NONE: Capabilities = Capabilities(0);

    /// Every optional construct
    pub const ALL: Capabilities = Capabilities(0b111);

    /// Add a capability
    pub const fn with(self, capability: Capability) -> Self {
        Capabilities(self.0 | capability.bit())
    }

    /// Check whether a capability is present
    pub const fn contains(self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub(crate) const fn bits(self) -> u8 {
        self.0
    }

    pub(crate) const fn from_bits(bits: u8) -> Self {
        Capabilities(bits & Self::ALL.0)
    }
}

/// Options for [`serialize`]
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Write multi-byte fields in the opposite order of the host
    pub byte_swap: bool,
    /// Constructs the writer accepts
    pub allow: Capabilities,
}

impl WriteOptions {
    /// Options for compiled units: bytecode allowed, host byte order
    pub fn bytecode() -> Self {
        Self {
            byte_swap: false,
            allow: Capabilities::NONE.with(Capability::Bytecode),
        }
    }

    /// Options for worker messages: references and shared buffers allowed
    pub fn message() -> Self {
        Self {
            byte_swap: false,
            allow: Capabilities::NONE
                .with(Capability::Reference)
                .with(Capability::SharedBuffer),
        }
    }

    /// Set the byte-swap flag
    pub fn byte_swap(mut self, swap: bool) -> Self {
        self.byte_swap = swap;
        self
    }

    /// Allow an additional capability
    pub fn allow(mut self, capability: Capability) -> Self {
        self.allow = self.allow.with(capability);
        self
    }

    pub(crate) fn byte_order(&self) -> ByteOrder {
        if self.byte_swap {
            ByteOrder::native().swapped()
        } else {
            ByteOrder::native()
        }
    }
}

/// Options for [`deserialize`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Constructs the reader accepts
    pub allow: Capabilities,
    /// Number of shared buffers attached to the blob
    pub shared_buffers: u32,
}

impl ReadOptions {
    /// Options for compiled units
    pub fn bytecode() -> Self {
        Self {
            allow: Capabilities::NONE.with(Capability::Bytecode),
            shared_buffers: 0,
        }
    }

    /// Options for worker messages carrying `shared_buffers` buffers
    pub fn message(shared_buffers: u32) -> Self {
        Self {
            allow: Capabilities::NONE
                .with(Capability::Reference)
                .with(Capability::SharedBuffer),
            shared_buffers,
        }
    }

    /// Allow an additional capability
    pub fn allow(mut self, capability: Capability) -> Self {
        self.allow = self.allow.with(capability);
        self
    }
}

/// Decoded fixed header of a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitHeader {
    /// Format version
    pub version: u8,
    /// Byte order of multi-byte fields
    pub byte_order: ByteOrder,
    /// Capabilities the blob makes use of
    pub uses: Capabilities,
}
