//! Cache usage counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics about the effectiveness of the stackwalk cache.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats
{
    /// Lookups that matched the query IP.
    pub hit_count: u64,
    /// Lookups that found the empty sentinel.
    pub miss_empty_slot_count: u64,
    /// Lookups that found another IP in the slot.
    pub miss_wrong_address_count: u64,
    /// Entries written into the table.
    pub insert_count: u64,
    /// Hits the walker could not consume because the entry was unsafe.
    pub unsafe_bypass_count: u64,
    /// Decoded frames whose facts did not fit the layout.
    pub uncacheable_count: u64,
    /// Invalidation passes run.
    pub invalidation_count: u64,
    /// Slots emptied by invalidation.
    pub slots_cleared_count: u64,
}

impl CacheStats
{
    /// The number of total lookups.
    pub fn lookups(&self) -> u64
    {
        self.hit_count + self.misses()
    }

    /// The number of total misses.
    pub fn misses(&self) -> u64
    {
        self.miss_empty_slot_count + self.miss_wrong_address_count
    }

    /// Fraction of lookups that hit, or 0 when nothing was looked up.
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64
    {
        match self.lookups() {
            0 => 0.0,
            total => self.hit_count as f64 / total as f64,
        }
    }
}

/// Live counters behind [`CacheStats`]. Relaxed: they are advisory only.
#[derive(Default, Debug)]
pub(crate) struct StatCounters
{
    pub(crate) hits: AtomicU64,
    pub(crate) empty_misses: AtomicU64,
    pub(crate) wrong_address_misses: AtomicU64,
    pub(crate) inserts: AtomicU64,
    pub(crate) unsafe_bypasses: AtomicU64,
    pub(crate) uncacheable: AtomicU64,
    pub(crate) invalidations: AtomicU64,
    pub(crate) slots_cleared: AtomicU64,
}

impl StatCounters
{
    pub(crate) fn bump(counter: &AtomicU64)
    {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, value: u64)
    {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats
    {
        CacheStats {
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_empty_slot_count: self.empty_misses.load(Ordering::Relaxed),
            miss_wrong_address_count: self.wrong_address_misses.load(Ordering::Relaxed),
            insert_count: self.inserts.load(Ordering::Relaxed),
            unsafe_bypass_count: self.unsafe_bypasses.load(Ordering::Relaxed),
            uncacheable_count: self.uncacheable.load(Ordering::Relaxed),
            invalidation_count: self.invalidations.load(Ordering::Relaxed),
            slots_cleared_count: self.slots_cleared.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_totals()
    {
        let stats = CacheStats {
            hit_count: 3,
            miss_empty_slot_count: 1,
            miss_wrong_address_count: 0,
            ..CacheStats::default()
        };
        assert_eq!(stats.lookups(), 4);
        assert_eq!(stats.misses(), 1);
        assert!((stats.hit_ratio() - 0.75).abs() < f64::EPSILON);
        assert!(CacheStats::default().hit_ratio().abs() < f64::EPSILON);
    }
}
