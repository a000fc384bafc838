//! Content digest of a bloom object.
//!
//! Covers the configuration and the final state of every unit, never the
//! order of operations that produced it.

use super::object::BloomObject;
use std::fmt;
use xxhash_rust::xxh3::Xxh3;

/// 128-bit xxh3 fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectDigest(pub u128);

impl ObjectDigest {
    /// Lowercase hex, 32 characters.
    pub fn to_hex(&self) -> String {
        format!("{:032x}", self.0)
    }
}

impl fmt::Display for ObjectDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl BloomObject {
    /// Deterministic digest over configuration and per-unit bits.
    pub fn digest(&self) -> ObjectDigest {
        let mut hasher = Xxh3::new();
        hasher.update(&self.scaling().expansion().to_le_bytes());
        hasher.update(&self.fp_rate().to_bits().to_le_bytes());
        hasher.update(&self.tightening_ratio().to_bits().to_le_bytes());
        self.seed().feed(&mut hasher);
        hasher.update(&(self.num_filters() as u64).to_le_bytes());
        for unit in self.filters() {
            unit.feed(&mut hasher);
        }
        ObjectDigest(hasher.digest128())
    }
}

#[cfg(test)]
mod tests {
    use crate::server::metrics::BloomMetrics;
    use crate::types::bloom::{BloomObject, BloomOptions, Scaling, SeedChoice, SizeLimit};
    use std::sync::Arc;

    fn object(seed: SeedChoice, metrics: &Arc<BloomMetrics>) -> BloomObject {
        let options = BloomOptions {
            capacity: 1000,
            fp_rate: 0.01,
            tightening_ratio: 0.5,
            scaling: Scaling::Expansion(2),
            seed,
        };
        BloomObject::new(options, None, SizeLimit::enforced(u64::MAX), metrics).unwrap()
    }

    #[test]
    fn test_digest_ignores_insert_order() {
        let metrics = Arc::new(BloomMetrics::new());
        let limit = SizeLimit::enforced(u64::MAX);
        let mut a = object(SeedChoice::Fixed, &metrics);
        let mut b = object(SeedChoice::Fixed, &metrics);
        for item in ["x", "y", "z"] {
            a.add_item(item.as_bytes(), limit).unwrap();
        }
        for item in ["z", "x", "y", "x"] {
            b.add_item(item.as_bytes(), limit).unwrap();
        }
        assert_eq!(a.digest(), b.digest());

        b.add_item(b"w", limit).unwrap();
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_random_seed_digests_differ() {
        let metrics = Arc::new(BloomMetrics::new());
        let a = object(SeedChoice::Random, &metrics);
        let b = object(SeedChoice::Random, &metrics);
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_copy_digest_matches() {
        let metrics = Arc::new(BloomMetrics::new());
        let mut a = object(SeedChoice::Random, &metrics);
        a.add_item(b"item", SizeLimit::enforced(u64::MAX)).unwrap();
        let copy = a.duplicate();
        assert_eq!(a.digest(), copy.digest());
        assert_eq!(a.digest().to_hex().len(), 32);
    }
}
