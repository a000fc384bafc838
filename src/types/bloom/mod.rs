//! Scalable Bloom filter value type.
//!
//! A [`BloomObject`] is a chain of [`FilterUnit`]s that grows by appending
//! larger units as the newest one fills:
//!
//! ```text
//! unit 0: capacity c,      error p
//! unit 1: capacity c*e,    error p*t
//! unit 2: capacity c*e^2,  error p*t^2
//! ```
//!
//! where `e` is the expansion and `t` the tightening ratio. Membership is
//! the OR of all units; the item count is exact.

mod defrag;
mod digest;
mod filter;
mod object;
mod seed;
pub mod sizing;

pub use defrag::{CopyRelocator, DefragBudget, DefragProgress, Relocator};
pub use digest::ObjectDigest;
pub use filter::FilterUnit;
pub use object::{
    BloomObject, BloomOptions, MAX_FILTERS_PER_OBJECT, ObjectState, Scaling, SeedChoice,
    SizeLimit, config_hash, simulate_scale_out,
};
pub use seed::{FIXED_SEED, HashKeys, SEED_LEN, SeedStrategy};
pub use sizing::{FilterSizing, expected_capacity, optimal_sizing, unit_fp_rate};
