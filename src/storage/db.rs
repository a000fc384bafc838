//! Keyspace implementation.
//!
//! The keyspace provides thread-safe access to stored values with O(1) key
//! lookup. Bloom commands go through closure-based accessors so a lookup,
//! type check and mutation happen under one shard lock.

use crate::error::CommandError;
use crate::server::metrics::BloomMetrics;
use crate::types::bloom::{BloomObject, DefragBudget, DefragProgress, Relocator};
use crate::types::{Key, ValueType, ViatorValue};
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// The keyspace.
///
/// # Performance Characteristics
///
/// - `DashMap` shards the map so unrelated keys never contend
/// - Bloom objects are stored inline and mutated in place
/// - Defragmentation resumes from a saved key and unit cursor
#[derive(Debug)]
pub struct Db {
    /// Main key-value store
    data: DashMap<Key, ViatorValue>,

    /// Metrics every bloom object in this keyspace reports to
    metrics: Arc<BloomMetrics>,

    /// Resumable defrag position
    defrag: Mutex<DefragCursor>,

    /// Statistics
    stats: DbStats,
}

/// Keyspace statistics.
#[derive(Debug, Default)]
pub struct DbStats {
    /// Number of lookups that found the key
    pub hits: AtomicU64,
    /// Number of lookups that missed (key not found)
    pub misses: AtomicU64,
}

#[derive(Debug, Default)]
struct DefragCursor {
    /// Keys still to visit in the current pass
    pending: VecDeque<Key>,
    /// Unit index to resume at within the front key
    unit: usize,
}

/// An entry exported from the keyspace for persistence.
#[derive(Debug, Clone)]
pub struct DbEntry {
    /// Key bytes
    pub key: Bytes,
    /// Encoded value
    pub value: ExportedValue,
}

/// Serialized form of a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportedValue {
    /// Raw string bytes
    String(Bytes),
    /// Bloom object codec bytes
    Bloom(Bytes),
}

impl Db {
    /// Create an empty keyspace reporting to `metrics`.
    pub fn new(metrics: Arc<BloomMetrics>) -> Self {
        Self {
            data: DashMap::new(),
            metrics,
            defrag: Mutex::new(DefragCursor::default()),
            stats: DbStats::default(),
        }
    }

    /// Metrics shared by every bloom object in this keyspace.
    #[inline]
    pub fn metrics(&self) -> &Arc<BloomMetrics> {
        &self.metrics
    }

    /// Get the number of keys.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the keyspace is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Lookup statistics.
    #[inline]
    pub fn stats(&self) -> &DbStats {
        &self.stats
    }

    /// Check if a key exists.
    pub fn exists(&self, key: &[u8]) -> bool {
        self.data.contains_key(key)
    }

    /// Get the type of a key.
    pub fn key_type(&self, key: &[u8]) -> Option<ValueType> {
        self.data.get(key).map(|v| v.value_type())
    }

    /// Set a value, replacing whatever was there.
    pub fn set(&self, key: Key, value: ViatorValue) {
        self.data.insert(key, value);
    }

    /// Set a value only if the key is absent. Returns true if inserted.
    pub fn set_nx(&self, key: Key, value: ViatorValue) -> bool {
        match self.data.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(value);
                true
            }
        }
    }

    /// Delete a key.
    pub fn delete(&self, key: &[u8]) -> bool {
        self.data.remove(key).is_some()
    }

    /// Copy a key to a new key. Bloom objects are deep-copied.
    ///
    /// Returns false if the source is missing, or the destination exists and
    /// `replace` is not set.
    pub fn copy(&self, source: &[u8], dest: Key, replace: bool) -> bool {
        if source == dest.as_ref() {
            return false;
        }
        let Some(copied) = self.data.get(source).map(|v| v.duplicate()) else {
            return false;
        };
        if replace {
            self.data.insert(dest, copied);
            true
        } else {
            self.set_nx(dest, copied)
        }
    }

    /// Delete every key.
    pub fn flush(&self) {
        self.data.clear();
        let mut cursor = self.defrag.lock();
        cursor.pending.clear();
        cursor.unit = 0;
    }

    /// All keys, in no particular order.
    pub fn keys(&self) -> Vec<Key> {
        self.data.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Bytes accounted for the value under `key`.
    pub fn memory_usage(&self, key: &[u8]) -> Option<u64> {
        self.data.get(key).map(|v| v.memory_usage())
    }

    /// Work needed to free the value under `key`.
    pub fn free_effort(&self, key: &[u8]) -> Option<usize> {
        self.data.get(key).map(|v| v.free_effort())
    }

    /// Run `f` against the bloom object under `key`.
    ///
    /// Returns `Ok(None)` if the key is absent and `WrongType` if it holds
    /// something else.
    pub fn with_bloom<R>(
        &self,
        key: &[u8],
        f: impl FnOnce(&BloomObject) -> R,
    ) -> Result<Option<R>, CommandError> {
        let Some(entry) = self.data.get(key) else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        match entry.value() {
            ViatorValue::Bloom(bloom) => Ok(Some(f(bloom))),
            _ => Err(CommandError::WrongType),
        }
    }

    /// Run `f` against the bloom object under `key`, creating it first with
    /// `create` if the key is absent.
    ///
    /// `f` receives `true` when the object was just created. If `create`
    /// fails nothing is stored.
    pub fn with_bloom_or_create<R, E>(
        &self,
        key: Key,
        create: impl FnOnce() -> Result<BloomObject, E>,
        f: impl FnOnce(&mut BloomObject, bool) -> R,
    ) -> Result<R, E>
    where
        E: From<CommandError>,
    {
        match self.data.entry(key) {
            Entry::Occupied(mut entry) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                match entry.get_mut() {
                    ViatorValue::Bloom(bloom) => Ok(f(bloom, false)),
                    _ => Err(CommandError::WrongType.into()),
                }
            }
            Entry::Vacant(entry) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                let bloom = create()?;
                let mut inserted = entry.insert(ViatorValue::Bloom(bloom));
                match inserted.value_mut() {
                    ViatorValue::Bloom(bloom) => Ok(f(bloom, true)),
                    _ => Err(CommandError::WrongType.into()),
                }
            }
        }
    }

    /// Export every value for persistence.
    ///
    /// Bloom objects are encoded under their shard lock, so each record is a
    /// consistent image of its object.
    pub fn export_entries(&self) -> Vec<DbEntry> {
        self.data
            .iter()
            .map(|entry| DbEntry {
                key: entry.key().clone(),
                value: match entry.value() {
                    ViatorValue::String(s) => ExportedValue::String(s.clone()),
                    ViatorValue::Bloom(b) => {
                        ExportedValue::Bloom(crate::persistence::codec::encode(b))
                    }
                },
            })
            .collect()
    }

    /// Replace the whole keyspace with `entries`.
    pub fn replace_all(&self, entries: Vec<(Key, ViatorValue)>) {
        self.flush();
        for (key, value) in entries {
            self.data.insert(key, value);
        }
    }

    /// Relocate bloom bit arrays, spending at most `budget` unit moves.
    ///
    /// Resumes where the previous cycle stopped. Returns true when the cycle
    /// finished a full pass over the keyspace.
    pub fn defrag_cycle(&self, budget: usize, relocator: &mut impl Relocator) -> bool {
        let mut cursor = self.defrag.lock();
        if cursor.pending.is_empty() {
            cursor.pending = self
                .data
                .iter()
                .filter(|entry| entry.value().is_bloom())
                .map(|entry| entry.key().clone())
                .collect();
            cursor.unit = 0;
        }

        let mut budget = DefragBudget::new(budget);
        while let Some(key) = cursor.pending.front().cloned() {
            let progress = match self.data.get_mut(&key) {
                Some(mut entry) => match entry.value_mut() {
                    ViatorValue::Bloom(bloom) => {
                        bloom.defrag_step(cursor.unit, &mut budget, relocator)
                    }
                    _ => DefragProgress::Complete,
                },
                // Deleted since the pass started
                None => DefragProgress::Complete,
            };
            match progress {
                DefragProgress::Complete => {
                    cursor.pending.pop_front();
                    cursor.unit = 0;
                }
                DefragProgress::Paused(unit) => {
                    cursor.unit = unit;
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::bloom::{BloomOptions, CopyRelocator, Scaling, SeedChoice, SizeLimit};

    const LIMIT: SizeLimit = SizeLimit {
        memory_limit: 1 << 24,
        enforce: true,
    };

    fn options(capacity: i64) -> BloomOptions {
        BloomOptions {
            capacity,
            fp_rate: 0.01,
            tightening_ratio: 0.5,
            scaling: Scaling::Expansion(2),
            seed: SeedChoice::Fixed,
        }
    }

    fn db() -> Db {
        Db::new(Arc::new(BloomMetrics::new()))
    }

    fn create(db: &Db, key: &'static str, capacity: i64) {
        let metrics = db.metrics().clone();
        db.with_bloom_or_create(
            Key::from(key),
            || BloomObject::new(options(capacity), None, LIMIT, &metrics).map_err(CommandError::from),
            |_, created| assert!(created),
        )
        .unwrap();
    }

    #[test]
    fn test_create_then_reuse() {
        let db = db();
        create(&db, "bf", 100);
        let metrics = db.metrics().clone();
        let created = db
            .with_bloom_or_create(
                Key::from("bf"),
                || -> Result<BloomObject, CommandError> { unreachable!() },
                |bloom, created| {
                    bloom.add_item(b"x", LIMIT).unwrap();
                    created
                },
            )
            .unwrap();
        assert!(!created);
        assert_eq!(db.with_bloom(b"bf", |b| b.cardinality()).unwrap(), Some(1));
        assert_eq!(metrics.num_objects(), 1);
    }

    #[test]
    fn test_failed_create_stores_nothing() {
        let db = db();
        let result: Result<(), CommandError> =
            db.with_bloom_or_create(Key::from("bf"), || Err(CommandError::CapacityZero), |_, _| ());
        assert_eq!(result, Err(CommandError::CapacityZero));
        assert!(!db.exists(b"bf"));
    }

    #[test]
    fn test_wrong_type() {
        let db = db();
        db.set(Key::from("s"), ViatorValue::string("v"));
        assert_eq!(db.with_bloom(b"s", |_| ()), Err(CommandError::WrongType));
        assert_eq!(db.with_bloom(b"missing", |_| ()), Ok(None));
    }

    #[test]
    fn test_copy_and_delete_track_metrics() {
        let db = db();
        create(&db, "a", 100);
        assert!(db.copy(b"a", Key::from("b"), false));
        assert!(!db.copy(b"a", Key::from("b"), false));
        assert_eq!(db.metrics().num_objects(), 2);
        assert_eq!(db.key_type(b"b"), Some(ValueType::Bloom));

        assert!(db.delete(b"a"));
        assert_eq!(db.metrics().num_objects(), 1);
        db.flush();
        assert_eq!(db.metrics().num_objects(), 0);
        assert_eq!(db.metrics().total_memory_bytes(), 0);
    }

    #[test]
    fn test_defrag_cycle_resumes() {
        let db = db();
        for key in ["a", "b", "c"] {
            create(&db, key, 10);
        }
        let digests: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|k| db.with_bloom(k.as_bytes(), |b| b.digest()).unwrap())
            .collect();

        let mut relocator = CopyRelocator;
        assert!(!db.defrag_cycle(1, &mut relocator));
        assert!(!db.defrag_cycle(1, &mut relocator));
        assert!(db.defrag_cycle(1, &mut relocator));
        assert_eq!(db.metrics().defrag_hits(), 3);

        let after: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|k| db.with_bloom(k.as_bytes(), |b| b.digest()).unwrap())
            .collect();
        assert_eq!(digests, after);
    }
}
