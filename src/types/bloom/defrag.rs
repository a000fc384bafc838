//! Incremental defragmentation of bloom objects.
//!
//! Work is done one unit at a time. Each relocation swaps the unit's storage
//! handle in a single assignment, and a step stops as soon as its budget is
//! spent so the caller can resume from the returned cursor.

use super::object::BloomObject;

/// Source of fresh allocations for relocated bit arrays.
pub trait Relocator {
    /// Return a new allocation holding `words`, or `None` if moving it would
    /// not help.
    fn relocate(&mut self, words: &[u64]) -> Option<Box<[u64]>>;
}

/// Relocator that always copies into a fresh allocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyRelocator;

impl Relocator for CopyRelocator {
    fn relocate(&mut self, words: &[u64]) -> Option<Box<[u64]>> {
        Some(words.to_vec().into_boxed_slice())
    }
}

/// Bounded amount of work for one defrag step.
#[derive(Debug, Clone, Copy)]
pub struct DefragBudget {
    remaining_units: usize,
}

impl DefragBudget {
    /// Allow at most `units` relocations.
    pub fn new(units: usize) -> Self {
        Self {
            remaining_units: units,
        }
    }

    #[inline]
    pub fn should_stop(&self) -> bool {
        self.remaining_units == 0
    }

    #[inline]
    fn spend(&mut self) {
        self.remaining_units = self.remaining_units.saturating_sub(1);
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.remaining_units
    }
}

/// Result of one defrag step on an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefragProgress {
    /// Every unit was visited
    Complete,
    /// Budget ran out; resume at this unit index
    Paused(usize),
}

impl BloomObject {
    /// Relocate unit bit arrays starting at `cursor` until done or out of budget.
    pub fn defrag_step(
        &mut self,
        cursor: usize,
        budget: &mut DefragBudget,
        relocator: &mut impl Relocator,
    ) -> DefragProgress {
        let metrics = self.metrics().clone();
        let units = self.filters_mut();
        let mut index = cursor;
        while index < units.len() {
            if budget.should_stop() {
                return DefragProgress::Paused(index);
            }
            let unit = &mut units[index];
            match relocator.relocate(unit.words()) {
                Some(fresh) => {
                    drop(unit.swap_storage(fresh));
                    metrics.defrag_hit();
                }
                None => metrics.defrag_miss(),
            }
            budget.spend();
            index += 1;
        }
        DefragProgress::Complete
    }
}
