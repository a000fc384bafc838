//! Filter sizing.
//!
//! Maps a target capacity and error rate to a bit-array length and hash
//! count, and computes the per-unit error rate after tightening.

use crate::error::BloomError;
use std::f64::consts::LN_2;

/// Largest capacity accepted for a single unit.
pub const BLOOM_CAPACITY_MAX: i64 = i64::MAX;

/// Largest bit-array length a unit may be sized to.
pub const MAX_NUM_BITS: u64 = u64::MAX >> 3;

/// Bit-array length and hash count for one filter unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterSizing {
    /// Number of bits `m`
    pub num_bits: u64,
    /// Number of hash functions `k`
    pub num_hashes: u32,
}

impl FilterSizing {
    /// Bytes needed to store the bit array, rounded up to whole 64-bit words.
    #[inline]
    #[must_use]
    pub fn num_bytes(&self) -> u64 {
        words_for_bits(self.num_bits) * 8
    }
}

/// Number of 64-bit words that hold `num_bits` bits.
#[inline]
#[must_use]
pub fn words_for_bits(num_bits: u64) -> u64 {
    num_bits.div_ceil(64)
}

/// Compute `m = ceil(-n ln p / ln2^2)` and `k = round(m/n ln2)`, both at least 1.
pub fn optimal_sizing(capacity: i64, fp_rate: f64) -> Result<FilterSizing, BloomError> {
    if capacity <= 0 || capacity > BLOOM_CAPACITY_MAX {
        return Err(BloomError::BadCapacity);
    }
    if !(fp_rate > 0.0 && fp_rate < 1.0) {
        return Err(BloomError::BadErrorRate);
    }

    let n = capacity as f64;
    let m = (-n * fp_rate.ln() / (LN_2 * LN_2)).ceil();
    if !m.is_finite() || m > MAX_NUM_BITS as f64 {
        return Err(BloomError::BadCapacity);
    }
    let num_bits = (m as u64).max(1);

    let k = ((num_bits as f64 / n) * LN_2).round();
    let num_hashes = if k < 1.0 {
        1
    } else if k > u32::MAX as f64 {
        u32::MAX
    } else {
        k as u32
    };

    Ok(FilterSizing {
        num_bits,
        num_hashes,
    })
}

/// Error rate of the unit at `chain_index`: `fp_rate * tightening^chain_index`.
///
/// Fails once the product is no longer a positive normal float.
pub fn unit_fp_rate(
    fp_rate: f64,
    tightening_ratio: f64,
    chain_index: usize,
) -> Result<f64, BloomError> {
    let exponent = i32::try_from(chain_index).unwrap_or(i32::MAX);
    let rate = fp_rate * tightening_ratio.powi(exponent);
    if rate <= f64::MIN_POSITIVE {
        return Err(BloomError::FalsePositiveReachesZero);
    }
    Ok(rate)
}

/// Total capacity after `num_units` units, each `expansion` times the previous.
///
/// Returns `None` on overflow.
#[must_use]
pub fn expected_capacity(initial: i64, expansion: u32, num_units: usize) -> Option<i64> {
    let mut total: i64 = 0;
    let mut unit = initial;
    for i in 0..num_units {
        total = total.checked_add(unit)?;
        if i + 1 < num_units {
            unit = unit.checked_mul(i64::from(expansion))?;
        }
    }
    Some(total)
}
