//! Keyspace value type.
//!
//! Bloom commands need to tell a bloom object apart from any other value so
//! they can reply WRONGTYPE; plain strings stand in for every foreign type.

use super::ValueType;
use super::bloom::BloomObject;
use bytes::Bytes;

/// A value held under a key.
#[derive(Debug)]
pub enum ViatorValue {
    /// String value (binary-safe bytes)
    String(Bytes),

    /// Scalable bloom filter
    Bloom(BloomObject),
}

impl ViatorValue {
    /// Create a new string value.
    #[inline]
    pub fn string(data: impl Into<Bytes>) -> Self {
        Self::String(data.into())
    }

    /// Returns the type of this value.
    #[inline]
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::String(_) => ValueType::String,
            Self::Bloom(_) => ValueType::Bloom,
        }
    }

    #[inline]
    pub fn is_bloom(&self) -> bool {
        matches!(self, Self::Bloom(_))
    }

    /// Get as bloom object reference.
    #[inline]
    pub fn as_bloom(&self) -> Option<&BloomObject> {
        match self {
            Self::Bloom(b) => Some(b),
            Self::String(_) => None,
        }
    }

    /// Get as mutable bloom object reference.
    #[inline]
    pub fn as_bloom_mut(&mut self) -> Option<&mut BloomObject> {
        match self {
            Self::Bloom(b) => Some(b),
            Self::String(_) => None,
        }
    }

    /// Deep copy; bloom objects get independent bit arrays.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::String(s) => Self::String(s.clone()),
            Self::Bloom(b) => Self::Bloom(b.duplicate()),
        }
    }

    /// Approximate memory usage in bytes.
    pub fn memory_usage(&self) -> u64 {
        match self {
            Self::String(s) => s.len() as u64,
            Self::Bloom(b) => b.memory_usage(),
        }
    }

    /// Work needed to free this value.
    pub fn free_effort(&self) -> usize {
        match self {
            Self::String(_) => 1,
            Self::Bloom(b) => b.free_effort(),
        }
    }
}

impl From<Bytes> for ViatorValue {
    fn from(b: Bytes) -> Self {
        Self::String(b)
    }
}

impl From<BloomObject> for ViatorValue {
    fn from(b: BloomObject) -> Self {
        Self::Bloom(b)
    }
}
