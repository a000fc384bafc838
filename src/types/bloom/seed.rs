//! Hash seed strategies.
//!
//! Each filter unit hashes items with a pair of 64-bit keys. Where those keys
//! come from is fixed when the object is created:
//!
//! - [`SeedStrategy::Deterministic`] derives them from a constant seed, a hash
//!   of the object's creation parameters, and the unit's chain index. Two
//!   objects created with the same parameters produce bit-identical units
//!   for the same item sequence.
//! - [`SeedStrategy::Random`] derives them from 32 bytes drawn at creation,
//!   so independently created objects never share bit patterns.

use crate::error::BloomError;
use rand::RngCore;
use xxhash_rust::xxh3::{Xxh3, xxh3_64_with_seed};

/// Length of the drawn seed material.
pub const SEED_LEN: usize = 32;

/// Seed material used by deterministic objects.
pub const FIXED_SEED: [u8; SEED_LEN] = [
    0x56, 0x49, 0x41, 0x54, 0x4f, 0x52, 0x2d, 0x42, 0x4c, 0x4f, 0x4f, 0x4d, 0x9e, 0x37, 0x79,
    0xb9, 0x7f, 0x4a, 0x7c, 0x15, 0xbf, 0x58, 0x47, 0x6d, 0x1c, 0xe4, 0xe5, 0xb9, 0x94, 0xd0,
    0x49, 0xbb,
];

const CHAIN_MIX: u64 = 0x9e37_79b9_7f4a_7c15;
const SECONDARY_SALT: u64 = 0xc2b2_ae3d_27d4_eb4f;

/// Pair of hash keys used by one filter unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashKeys {
    /// Seed of the first hash
    pub primary: u64,
    /// Seed of the step hash
    pub secondary: u64,
}

/// Where a bloom object's per-unit hash keys come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedStrategy {
    /// Keys derived from [`FIXED_SEED`], the creation-parameter hash and chain index.
    Deterministic {
        /// Hash of the creation parameters
        config_hash: u64,
    },
    /// Keys derived from bytes drawn at creation.
    Random {
        /// Drawn seed material
        drawn: [u8; SEED_LEN],
    },
}

impl SeedStrategy {
    /// Deterministic strategy for the given parameter hash.
    #[inline]
    pub fn deterministic(config_hash: u64) -> Self {
        Self::Deterministic { config_hash }
    }

    /// Random strategy with freshly drawn seed bytes.
    pub fn random() -> Self {
        let mut drawn = [0u8; SEED_LEN];
        rand::thread_rng().fill_bytes(&mut drawn);
        Self::Random { drawn }
    }

    /// Random strategy from caller-provided seed bytes.
    pub fn from_drawn(bytes: &[u8]) -> Result<Self, BloomError> {
        let drawn: [u8; SEED_LEN] = bytes.try_into().map_err(|_| BloomError::InvalidSeed)?;
        Ok(Self::Random { drawn })
    }

    /// Whether seed material was drawn at random.
    #[inline]
    pub fn is_random(&self) -> bool {
        matches!(self, Self::Random { .. })
    }

    /// Drawn bytes, if any.
    #[inline]
    pub fn drawn(&self) -> Option<&[u8; SEED_LEN]> {
        match self {
            Self::Random { drawn } => Some(drawn),
            Self::Deterministic { .. } => None,
        }
    }

    /// Hash keys of the unit at `chain_index`.
    pub fn unit_keys(&self, chain_index: usize) -> HashKeys {
        match self {
            Self::Deterministic { config_hash } => derive(&FIXED_SEED, *config_hash, chain_index),
            Self::Random { drawn } => derive(drawn, 0, chain_index),
        }
    }

    pub(crate) fn feed(&self, hasher: &mut Xxh3) {
        match self {
            Self::Deterministic { config_hash } => {
                hasher.update(&[0]);
                hasher.update(&config_hash.to_le_bytes());
            }
            Self::Random { drawn } => {
                hasher.update(&[1]);
                hasher.update(drawn);
            }
        }
    }
}

fn derive(material: &[u8], salt: u64, chain_index: usize) -> HashKeys {
    let base = salt ^ (chain_index as u64).wrapping_add(1).wrapping_mul(CHAIN_MIX);
    HashKeys {
        primary: xxh3_64_with_seed(material, base),
        secondary: xxh3_64_with_seed(material, base.rotate_left(29) ^ SECONDARY_SALT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_is_reproducible() {
        let a = SeedStrategy::deterministic(42);
        let b = SeedStrategy::deterministic(42);
        assert_eq!(a.unit_keys(0), b.unit_keys(0));
        assert_eq!(a.unit_keys(7), b.unit_keys(7));
        assert_ne!(a.unit_keys(0), a.unit_keys(1));
        assert_ne!(a.unit_keys(0), SeedStrategy::deterministic(43).unit_keys(0));
    }

    #[test]
    fn test_random_draws_differ() {
        let a = SeedStrategy::random();
        let b = SeedStrategy::random();
        assert!(a.is_random());
        assert_ne!(a.drawn(), b.drawn());
        assert_ne!(a.unit_keys(0), b.unit_keys(0));
    }

    #[test]
    fn test_from_drawn() {
        let original = SeedStrategy::random();
        let drawn = original.drawn().copied().unwrap();
        let restored = SeedStrategy::from_drawn(&drawn).unwrap();
        assert_eq!(original, restored);
        assert_eq!(original.unit_keys(3), restored.unit_keys(3));

        assert_eq!(
            SeedStrategy::from_drawn(&[1, 2, 3]),
            Err(BloomError::InvalidSeed)
        );
    }
}
