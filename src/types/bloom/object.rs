//! Scalable bloom object.
//!
//! A chain of [`FilterUnit`]s plus the configuration captured at creation.
//! New units are appended when the newest one fills up; units are never
//! removed individually, so the chain is a plain `Vec` indexed by creation
//! order.

use super::filter::FilterUnit;
use super::seed::{SEED_LEN, SeedStrategy};
use super::sizing::{optimal_sizing, unit_fp_rate};
use crate::error::BloomError;
use crate::server::metrics::BloomMetrics;
use std::mem;
use std::sync::Arc;
use tracing::debug;
use xxhash_rust::xxh3::Xxh3;

/// Most units a single object may hold.
pub const MAX_FILTERS_PER_OBJECT: usize = i32::MAX as usize;

/// Growth policy of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scaling {
    /// A single unit; inserts fail once it is full
    NonScaling,
    /// Each new unit holds `n` times the previous unit's capacity
    Expansion(u32),
}

impl Scaling {
    /// Build from a raw expansion value, where 0 means non-scaling.
    #[inline]
    pub fn from_expansion(expansion: u32) -> Self {
        if expansion == 0 {
            Self::NonScaling
        } else {
            Self::Expansion(expansion)
        }
    }

    /// Raw expansion value, 0 for non-scaling.
    #[inline]
    pub fn expansion(&self) -> u32 {
        match self {
            Self::NonScaling => 0,
            Self::Expansion(n) => *n,
        }
    }

    #[inline]
    pub fn is_scaling(&self) -> bool {
        matches!(self, Self::Expansion(_))
    }
}

/// How a new object picks its hash seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedChoice {
    /// Derive from the creation parameters
    Fixed,
    /// Draw fresh random bytes
    Random,
    /// Use these previously drawn bytes
    Drawn([u8; SEED_LEN]),
}

/// Creation parameters, resolved from command arguments and config defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BloomOptions {
    /// Capacity of the first unit
    pub capacity: i64,
    /// Target error rate of the first unit
    pub fp_rate: f64,
    /// Multiplier applied to the error rate of each new unit
    pub tightening_ratio: f64,
    /// Growth policy
    pub scaling: Scaling,
    /// Seed selection
    pub seed: SeedChoice,
}

/// Memory ceiling applied to creation and scale-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeLimit {
    /// Per-object byte limit
    pub memory_limit: u64,
    /// Whether to enforce it; replicated commands skip the check
    pub enforce: bool,
}

impl SizeLimit {
    /// Enforce `memory_limit`.
    #[inline]
    pub fn enforced(memory_limit: u64) -> Self {
        Self {
            memory_limit,
            enforce: true,
        }
    }

    /// Record `memory_limit` but do not enforce it.
    #[inline]
    pub fn unchecked(memory_limit: u64) -> Self {
        Self {
            memory_limit,
            enforce: false,
        }
    }

    #[inline]
    fn allows(&self, bytes: u64) -> bool {
        !self.enforce || bytes <= self.memory_limit
    }
}

/// Whether an object can accept another new item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Newest unit has room, or a scale-out would succeed
    Active,
    /// Scaling disabled and the only unit is full
    SaturatedNonScaling,
    /// Newest unit full and a scale-out would break a limit
    SaturatedLimit,
}

/// A scalable bloom filter bound to one key.
#[derive(Debug)]
pub struct BloomObject {
    filters: Vec<FilterUnit>,
    fp_rate: f64,
    tightening_ratio: f64,
    scaling: Scaling,
    seed: SeedStrategy,
    /// Exact count of items added across all units
    num_items: i64,
    /// Bytes accounted for this object
    memory: u64,
    /// Ceiling on total capacity, fixed at creation
    max_scaled_capacity: i64,
    metrics: Arc<BloomMetrics>,
}

impl BloomObject {
    /// Create an empty object with one unit.
    ///
    /// With `validate_scale_to`, also checks that the object could scale up to
    /// that total capacity within the memory limit.
    pub fn new(
        options: BloomOptions,
        validate_scale_to: Option<i64>,
        limit: SizeLimit,
        metrics: &Arc<BloomMetrics>,
    ) -> Result<Self, BloomError> {
        if !(options.tightening_ratio > 0.0 && options.tightening_ratio < 1.0) {
            return Err(BloomError::BadTighteningRatio);
        }
        if validate_scale_to.is_some() && !options.scaling.is_scaling() {
            return Err(BloomError::NonScalingWithValidateScaleTo);
        }

        let sizing = optimal_sizing(options.capacity, options.fp_rate)?;
        let projected = Self::base_memory() + FilterUnit::projected_memory(sizing.num_bits);
        if !limit.allows(projected) {
            return Err(BloomError::ExceedsMemoryLimit);
        }

        if let Some(target) = validate_scale_to {
            if limit.enforce {
                simulate_scale_out(&options, limit.memory_limit, Some(target))?;
            }
        }
        let max_scaled_capacity = simulate_scale_out(&options, limit.memory_limit, None)?
            .max(options.capacity);

        let seed = match options.seed {
            SeedChoice::Fixed => SeedStrategy::deterministic(config_hash(
                options.capacity,
                options.fp_rate,
                options.tightening_ratio,
                options.scaling.expansion(),
            )),
            SeedChoice::Random => SeedStrategy::random(),
            SeedChoice::Drawn(drawn) => SeedStrategy::Random { drawn },
        };

        let first = FilterUnit::with_sizing(sizing, options.capacity, seed.unit_keys(0))?;
        Ok(Self::register(
            vec![first],
            options.fp_rate,
            options.tightening_ratio,
            options.scaling,
            seed,
            max_scaled_capacity,
            metrics,
        ))
    }

    /// Assemble an object from already-validated units and register it.
    pub(crate) fn register(
        filters: Vec<FilterUnit>,
        fp_rate: f64,
        tightening_ratio: f64,
        scaling: Scaling,
        seed: SeedStrategy,
        max_scaled_capacity: i64,
        metrics: &Arc<BloomMetrics>,
    ) -> Self {
        let num_items = filters.iter().map(FilterUnit::num_items).sum();
        let memory = Self::base_memory() + filters.iter().map(FilterUnit::memory_usage).sum::<u64>();
        let object = Self {
            filters,
            fp_rate,
            tightening_ratio,
            scaling,
            seed,
            num_items,
            memory,
            max_scaled_capacity,
            metrics: Arc::clone(metrics),
        };
        object.metrics.object_created(
            object.memory,
            object.filters.len() as u64,
            object.num_items as u64,
            object.capacity() as u64,
        );
        object
    }

    /// Deep copy with independent bit arrays, registered as a new object.
    pub fn duplicate(&self) -> Self {
        Self::register(
            self.filters.clone(),
            self.fp_rate,
            self.tightening_ratio,
            self.scaling,
            self.seed.clone(),
            self.max_scaled_capacity,
            &self.metrics,
        )
    }

    /// Returns true if any unit may contain the item.
    pub fn item_exists(&self, item: &[u8]) -> bool {
        self.filters.iter().rev().any(|unit| unit.may_contain(item))
    }

    /// Add an item, scaling out if the newest unit is full.
    ///
    /// Returns `Ok(false)` if the item is already present. On error the
    /// object is left unchanged.
    pub fn add_item(&mut self, item: &[u8], limit: SizeLimit) -> Result<bool, BloomError> {
        if self.item_exists(item) {
            return Ok(false);
        }

        if self.newest().is_full() {
            match self.scaling {
                Scaling::NonScaling => return Err(BloomError::NonScalingFilterFull),
                Scaling::Expansion(expansion) => self.scale_out(expansion, limit)?,
            }
        }

        let newest = self.filters.len() - 1;
        if self.filters[newest].insert(item) {
            self.num_items += 1;
            self.metrics.items_added(1);
        }
        Ok(true)
    }

    fn scale_out(&mut self, expansion: u32, limit: SizeLimit) -> Result<(), BloomError> {
        let index = self.filters.len();
        if index >= MAX_FILTERS_PER_OBJECT {
            return Err(BloomError::MaxNumScalingFilters);
        }
        let capacity = self
            .newest()
            .capacity()
            .checked_mul(i64::from(expansion))
            .ok_or(BloomError::BadCapacity)?;
        let fp_rate = unit_fp_rate(self.fp_rate, self.tightening_ratio, index)?;
        let sizing = optimal_sizing(capacity, fp_rate)?;

        let unit_memory = FilterUnit::projected_memory(sizing.num_bits);
        if !limit.allows(self.memory.saturating_add(unit_memory)) {
            debug!(
                filters = index,
                memory = self.memory,
                limit = limit.memory_limit,
                "scale out rejected"
            );
            return Err(BloomError::ExceedsMemoryLimit);
        }

        let unit = FilterUnit::with_sizing(sizing, capacity, self.seed.unit_keys(index))?;
        self.filters.push(unit);
        self.memory += unit_memory;
        self.metrics.filter_added(unit_memory, capacity as u64);
        debug!(filters = index + 1, capacity, fp_rate, "bloom object scaled out");
        Ok(())
    }

    /// Whether another new item can currently be accepted.
    pub fn state(&self, limit: SizeLimit) -> ObjectState {
        let newest = self.newest();
        if !newest.is_full() {
            return ObjectState::Active;
        }
        let Scaling::Expansion(expansion) = self.scaling else {
            return ObjectState::SaturatedNonScaling;
        };
        let index = self.filters.len();
        let next = newest
            .capacity()
            .checked_mul(i64::from(expansion))
            .ok_or(BloomError::BadCapacity)
            .and_then(|capacity| {
                let fp_rate = unit_fp_rate(self.fp_rate, self.tightening_ratio, index)?;
                optimal_sizing(capacity, fp_rate)
            });
        match next {
            Ok(sizing)
                if index < MAX_FILTERS_PER_OBJECT
                    && limit.allows(
                        self.memory
                            .saturating_add(FilterUnit::projected_memory(sizing.num_bits)),
                    ) =>
            {
                ObjectState::Active
            }
            _ => ObjectState::SaturatedLimit,
        }
    }

    /// Sum of unit capacities.
    pub fn capacity(&self) -> i64 {
        self.filters
            .iter()
            .fold(0i64, |acc, unit| acc.saturating_add(unit.capacity()))
    }

    /// Exact number of items added.
    #[inline]
    pub fn cardinality(&self) -> i64 {
        self.num_items
    }

    #[inline]
    pub fn num_filters(&self) -> usize {
        self.filters.len()
    }

    /// Bytes accounted for this object.
    #[inline]
    pub fn memory_usage(&self) -> u64 {
        self.memory
    }

    /// Work needed to free this object, one unit per filter.
    #[inline]
    pub fn free_effort(&self) -> usize {
        self.filters.len()
    }

    #[inline]
    pub fn fp_rate(&self) -> f64 {
        self.fp_rate
    }

    #[inline]
    pub fn tightening_ratio(&self) -> f64 {
        self.tightening_ratio
    }

    #[inline]
    pub fn scaling(&self) -> Scaling {
        self.scaling
    }

    #[inline]
    pub fn seed(&self) -> &SeedStrategy {
        &self.seed
    }

    /// Capacity of the first unit.
    #[inline]
    pub fn initial_capacity(&self) -> i64 {
        self.filters[0].capacity()
    }

    /// Ceiling on total capacity computed when the object was created.
    #[inline]
    pub fn max_scaled_capacity(&self) -> i64 {
        self.max_scaled_capacity
    }

    #[inline]
    pub fn filters(&self) -> &[FilterUnit] {
        &self.filters
    }

    #[inline]
    pub(crate) fn filters_mut(&mut self) -> &mut [FilterUnit] {
        &mut self.filters
    }

    #[inline]
    pub(crate) fn metrics(&self) -> &Arc<BloomMetrics> {
        &self.metrics
    }

    #[inline]
    fn newest(&self) -> &FilterUnit {
        // The chain is created with one unit and only ever grows.
        &self.filters[self.filters.len() - 1]
    }

    /// Bytes accounted for the object header, excluding units.
    #[inline]
    pub(crate) fn base_memory() -> u64 {
        mem::size_of::<Self>() as u64
    }
}

impl Drop for BloomObject {
    fn drop(&mut self) {
        self.metrics.object_dropped(
            self.memory,
            self.filters.len() as u64,
            self.num_items as u64,
            self.capacity() as u64,
        );
    }
}

/// Hash of the creation parameters used by deterministic seeding.
pub fn config_hash(capacity: i64, fp_rate: f64, tightening_ratio: f64, expansion: u32) -> u64 {
    let mut hasher = Xxh3::new();
    hasher.update(&capacity.to_le_bytes());
    hasher.update(&fp_rate.to_bits().to_le_bytes());
    hasher.update(&tightening_ratio.to_bits().to_le_bytes());
    hasher.update(&expansion.to_le_bytes());
    hasher.digest()
}

/// Walk the scale chain without allocating.
///
/// Without a target, returns the total capacity of every unit that fits
/// before the memory limit, the error-rate floor, or the filter cap is hit.
/// With a target, returns the total capacity once it reaches the target, or
/// fails with the VALIDATESCALETO error for whichever limit stops it first.
pub fn simulate_scale_out(
    options: &BloomOptions,
    memory_limit: u64,
    target: Option<i64>,
) -> Result<i64, BloomError> {
    let Scaling::Expansion(expansion) = options.scaling else {
        return match target {
            Some(_) => Err(BloomError::NonScalingWithValidateScaleTo),
            None => Ok(options.capacity),
        };
    };

    let mut memory = BloomObject::base_memory();
    let mut total: i64 = 0;
    let mut capacity = options.capacity;
    let mut index = 0usize;

    loop {
        let fp_rate = match unit_fp_rate(options.fp_rate, options.tightening_ratio, index) {
            Ok(rate) => rate,
            Err(_) if target.is_some() => {
                return Err(BloomError::ValidateScaleToFalsePositiveInvalid);
            }
            Err(_) => break,
        };
        let unit_memory = match optimal_sizing(capacity, fp_rate) {
            Ok(sizing) => FilterUnit::projected_memory(sizing.num_bits),
            Err(_) if target.is_some() => {
                return Err(BloomError::ValidateScaleToExceedsMemoryLimit);
            }
            Err(_) => break,
        };
        if memory.saturating_add(unit_memory) > memory_limit {
            if target.is_some() {
                return Err(BloomError::ValidateScaleToExceedsMemoryLimit);
            }
            break;
        }
        memory += unit_memory;
        total = total.saturating_add(capacity);

        if let Some(target) = target {
            if total >= target {
                return Ok(total);
            }
        }

        index += 1;
        let next = capacity.checked_mul(i64::from(expansion));
        match next {
            Some(next) if index < MAX_FILTERS_PER_OBJECT => capacity = next,
            _ if target.is_some() => {
                return Err(BloomError::ValidateScaleToExceedsMemoryLimit);
            }
            _ => break,
        }
    }
    Ok(total)
}
