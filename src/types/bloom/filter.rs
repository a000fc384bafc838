//! Filter unit: one fixed-capacity bit array in a scaling chain.

use super::seed::HashKeys;
use super::sizing::{FilterSizing, optimal_sizing, words_for_bits};
use crate::error::BloomError;
use std::mem;
use xxhash_rust::xxh3::{Xxh3, xxh3_64_with_seed};

/// A single Bloom filter with a counted capacity.
///
/// Bit positions come from double hashing: two xxh3 hashes keyed by the
/// unit's [`HashKeys`] are combined as `h1 + i * h2 (mod m)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterUnit {
    /// Bit array, `ceil(m / 64)` words
    bits: Box<[u64]>,
    /// Number of bits `m`
    num_bits: u64,
    /// Number of hash functions `k`
    num_hashes: u32,
    /// Hash keys derived from the object's seed strategy
    keys: HashKeys,
    /// Items this unit is sized for
    capacity: i64,
    /// Items inserted into this unit
    num_items: i64,
}

impl FilterUnit {
    /// Create an empty unit sized for `capacity` items at `fp_rate`.
    pub fn new(capacity: i64, fp_rate: f64, keys: HashKeys) -> Result<Self, BloomError> {
        let sizing = optimal_sizing(capacity, fp_rate)?;
        Self::with_sizing(sizing, capacity, keys)
    }

    /// Create an empty unit with precomputed sizing.
    pub fn with_sizing(
        sizing: FilterSizing,
        capacity: i64,
        keys: HashKeys,
    ) -> Result<Self, BloomError> {
        let words = usize::try_from(words_for_bits(sizing.num_bits))
            .map_err(|_| BloomError::ExceedsMemoryLimit)?;
        Ok(Self {
            bits: vec![0u64; words].into_boxed_slice(),
            num_bits: sizing.num_bits,
            num_hashes: sizing.num_hashes,
            keys,
            capacity,
            num_items: 0,
        })
    }

    /// Rebuild a unit from decoded parts. The caller validates consistency.
    pub(crate) fn from_parts(
        bits: Box<[u64]>,
        num_bits: u64,
        num_hashes: u32,
        keys: HashKeys,
        capacity: i64,
        num_items: i64,
    ) -> Self {
        Self {
            bits,
            num_bits,
            num_hashes,
            keys,
            capacity,
            num_items,
        }
    }

    /// Bytes accounted for a unit with `num_bits` bits.
    #[inline]
    #[must_use]
    pub fn projected_memory(num_bits: u64) -> u64 {
        mem::size_of::<Self>() as u64 + words_for_bits(num_bits) * 8
    }

    /// Bytes accounted for this unit.
    #[inline]
    pub fn memory_usage(&self) -> u64 {
        Self::projected_memory(self.num_bits)
    }

    /// Returns true if the item may have been inserted.
    pub fn may_contain(&self, item: &[u8]) -> bool {
        let (h1, h2) = self.hash_pair(item);
        let mut hash = h1;
        for _ in 0..self.num_hashes {
            if !self.test_bit(hash % self.num_bits) {
                return false;
            }
            hash = hash.wrapping_add(h2);
        }
        true
    }

    /// Set the item's bits and count it.
    ///
    /// Returns false without touching the bits when the unit is already at
    /// capacity. Membership across the chain is checked by the caller.
    pub fn insert(&mut self, item: &[u8]) -> bool {
        if self.is_full() {
            return false;
        }
        let (h1, h2) = self.hash_pair(item);
        let mut hash = h1;
        for _ in 0..self.num_hashes {
            self.set_bit(hash % self.num_bits);
            hash = hash.wrapping_add(h2);
        }
        self.num_items += 1;
        true
    }

    /// Whether the counted capacity is used up.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.num_items >= self.capacity
    }

    #[inline]
    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    #[inline]
    pub fn num_items(&self) -> i64 {
        self.num_items
    }

    #[inline]
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    #[inline]
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    #[inline]
    pub fn keys(&self) -> HashKeys {
        self.keys
    }

    /// Raw bit words.
    #[inline]
    pub fn words(&self) -> &[u64] {
        &self.bits
    }

    /// Substitute the backing allocation in one assignment, returning the old one.
    ///
    /// `fresh` must hold the same words.
    pub(crate) fn swap_storage(&mut self, fresh: Box<[u64]>) -> Box<[u64]> {
        debug_assert_eq!(*fresh, *self.bits);
        mem::replace(&mut self.bits, fresh)
    }

    pub(crate) fn feed(&self, hasher: &mut Xxh3) {
        hasher.update(&self.num_bits.to_le_bytes());
        hasher.update(&self.num_hashes.to_le_bytes());
        hasher.update(&self.capacity.to_le_bytes());
        hasher.update(&self.num_items.to_le_bytes());
        hasher.update(&self.keys.primary.to_le_bytes());
        hasher.update(&self.keys.secondary.to_le_bytes());
        for word in self.bits.iter() {
            hasher.update(&word.to_le_bytes());
        }
    }

    #[inline]
    fn hash_pair(&self, item: &[u8]) -> (u64, u64) {
        let h1 = xxh3_64_with_seed(item, self.keys.primary);
        // Odd step so the k positions never collapse onto one
        let h2 = xxh3_64_with_seed(item, self.keys.secondary) | 1;
        (h1, h2)
    }

    #[inline]
    fn test_bit(&self, pos: u64) -> bool {
        let word = (pos / 64) as usize;
        self.bits[word] & (1u64 << (pos % 64)) != 0
    }

    #[inline]
    fn set_bit(&mut self, pos: u64) {
        let word = (pos / 64) as usize;
        self.bits[word] |= 1u64 << (pos % 64);
    }
}
