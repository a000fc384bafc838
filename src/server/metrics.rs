//! Process-wide bloom metrics.
//!
//! Gauges are the running sums over every live bloom object and are only
//! touched from object lifecycle hooks (create, grow, insert, drop), so they
//! always equal the sum over the keyspace. Defrag counters are plain
//! monotonic counters that `reset_stats` clears.

use std::sync::atomic::{AtomicU64, Ordering};

/// Format bytes in human readable form.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}G", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}M", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}K", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Running totals across all bloom objects.
#[derive(Debug)]
pub struct BloomMetrics {
    // Gauges
    total_memory_bytes: AtomicU64,
    num_objects: AtomicU64,
    num_filters: AtomicU64,
    num_items: AtomicU64,
    capacity: AtomicU64,

    // Defrag counters
    defrag_hits: AtomicU64,
    defrag_misses: AtomicU64,
}

/// Point-in-time copy of the gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub total_memory_bytes: u64,
    pub num_objects: u64,
    pub num_filters: u64,
    pub num_items: u64,
    pub capacity: u64,
}

impl BloomMetrics {
    pub fn new() -> Self {
        Self {
            total_memory_bytes: AtomicU64::new(0),
            num_objects: AtomicU64::new(0),
            num_filters: AtomicU64::new(0),
            num_items: AtomicU64::new(0),
            capacity: AtomicU64::new(0),
            defrag_hits: AtomicU64::new(0),
            defrag_misses: AtomicU64::new(0),
        }
    }

    /// Add a newly created, copied or loaded object.
    #[inline]
    pub fn object_created(&self, memory: u64, filters: u64, items: u64, capacity: u64) {
        self.total_memory_bytes.fetch_add(memory, Ordering::Relaxed);
        self.num_objects.fetch_add(1, Ordering::Relaxed);
        self.num_filters.fetch_add(filters, Ordering::Relaxed);
        self.num_items.fetch_add(items, Ordering::Relaxed);
        self.capacity.fetch_add(capacity, Ordering::Relaxed);
    }

    /// Remove a freed object's contribution.
    #[inline]
    pub fn object_dropped(&self, memory: u64, filters: u64, items: u64, capacity: u64) {
        self.total_memory_bytes.fetch_sub(memory, Ordering::Relaxed);
        self.num_objects.fetch_sub(1, Ordering::Relaxed);
        self.num_filters.fetch_sub(filters, Ordering::Relaxed);
        self.num_items.fetch_sub(items, Ordering::Relaxed);
        self.capacity.fetch_sub(capacity, Ordering::Relaxed);
    }

    /// Record a scale-out.
    #[inline]
    pub fn filter_added(&self, memory: u64, capacity: u64) {
        self.total_memory_bytes.fetch_add(memory, Ordering::Relaxed);
        self.num_filters.fetch_add(1, Ordering::Relaxed);
        self.capacity.fetch_add(capacity, Ordering::Relaxed);
    }

    #[inline]
    pub fn items_added(&self, count: u64) {
        self.num_items.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn defrag_hit(&self) {
        self.defrag_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn defrag_miss(&self) {
        self.defrag_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_memory_bytes(&self) -> u64 {
        self.total_memory_bytes.load(Ordering::Relaxed)
    }

    pub fn num_objects(&self) -> u64 {
        self.num_objects.load(Ordering::Relaxed)
    }

    pub fn num_filters(&self) -> u64 {
        self.num_filters.load(Ordering::Relaxed)
    }

    pub fn num_items(&self) -> u64 {
        self.num_items.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn defrag_hits(&self) -> u64 {
        self.defrag_hits.load(Ordering::Relaxed)
    }

    pub fn defrag_misses(&self) -> u64 {
        self.defrag_misses.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_memory_bytes: self.total_memory_bytes(),
            num_objects: self.num_objects(),
            num_filters: self.num_filters(),
            num_items: self.num_items(),
            capacity: self.capacity(),
        }
    }

    /// Generate INFO-style sections.
    pub fn to_info_string(&self) -> String {
        let memory = self.total_memory_bytes();
        format!(
            "# bloom_core_metrics\n\
             bloom_total_memory_bytes:{}\n\
             bloom_total_memory_human:{}\n\
             bloom_num_objects:{}\n\
             bloom_num_filters_across_objects:{}\n\
             bloom_num_items_across_objects:{}\n\
             bloom_capacity_across_objects:{}\n\
             \n\
             # bloom_defrag_metrics\n\
             bloom_defrag_hits:{}\n\
             bloom_defrag_misses:{}\n",
            memory,
            format_bytes(memory),
            self.num_objects(),
            self.num_filters(),
            self.num_items(),
            self.capacity(),
            self.defrag_hits(),
            self.defrag_misses(),
        )
    }

    /// Clear the defrag counters. Gauges track live objects and are untouched.
    pub fn reset_stats(&self) {
        self.defrag_hits.store(0, Ordering::Relaxed);
        self.defrag_misses.store(0, Ordering::Relaxed);
    }
}

impl Default for BloomMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_round_trip() {
        let metrics = BloomMetrics::new();
        metrics.object_created(1000, 1, 0, 100);
        metrics.items_added(5);
        metrics.filter_added(2000, 200);
        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                total_memory_bytes: 3000,
                num_objects: 1,
                num_filters: 2,
                num_items: 5,
                capacity: 300,
            }
        );

        metrics.object_dropped(3000, 2, 5, 300);
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_reset_stats_keeps_gauges() {
        let metrics = BloomMetrics::new();
        metrics.object_created(64, 1, 0, 10);
        metrics.defrag_hit();
        metrics.defrag_miss();
        metrics.reset_stats();
        assert_eq!(metrics.defrag_hits(), 0);
        assert_eq!(metrics.defrag_misses(), 0);
        assert_eq!(metrics.num_objects(), 1);
    }

    #[test]
    fn test_info_string() {
        let metrics = BloomMetrics::new();
        metrics.object_created(2048, 1, 3, 100);
        metrics.defrag_hit();

        let info = metrics.to_info_string();
        assert!(info.contains("# bloom_core_metrics"));
        assert!(info.contains("bloom_total_memory_bytes:2048"));
        assert!(info.contains("bloom_total_memory_human:2.00K"));
        assert!(info.contains("bloom_num_items_across_objects:3"));
        assert!(info.contains("bloom_defrag_hits:1"));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1536), "1.50K");
        assert_eq!(format_bytes(128 * 1024 * 1024), "128.00M");
    }
}
