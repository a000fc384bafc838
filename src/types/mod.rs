//! Core types.
//!
//! Keys are binary-safe byte strings; values are either bloom objects or
//! opaque strings.

pub mod bloom;
mod value;

pub use value::ViatorValue;

use bytes::Bytes;

/// Binary-safe key.
pub type Key = Bytes;

/// Type of a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    /// String type
    String = 0,
    /// Scalable bloom filter
    Bloom = 1,
}

impl ValueType {
    /// Returns the type name as used in the TYPE command.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Bloom => "bloomfltr",
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
