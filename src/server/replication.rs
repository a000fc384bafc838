//! Replication rewriting and the propagation backlog.
//!
//! Every successful write decides what replicas and the AOF see:
//!
//! - A write that creates an object is replaced by one canonical
//!   `BF.INSERT` carrying the resolved creation parameters and only the
//!   items that were actually new, so a replica rebuilds the same object no
//!   matter which command created it or what its own defaults are.
//! - A write to an existing object is forwarded as sent, and only if it
//!   added at least one new item.
//! - Failed and read-only commands are never forwarded.
//!
//! Forwarded commands are RESP-encoded into a bounded backlog that replicas
//! read from by offset.

use crate::persistence::encode_command;
use crate::types::Key;
use crate::types::bloom::{BloomObject, Scaling};
use bytes::Bytes;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// What a command forwards to replicas and the AOF.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Propagation {
    /// Nothing is forwarded
    #[default]
    None,
    /// The command is forwarded as received
    Verbatim(Vec<Bytes>),
    /// A replacement command is forwarded instead
    Rewritten(Vec<Bytes>),
}

impl Propagation {
    /// The argument vector to forward, if any.
    pub fn args(&self) -> Option<&[Bytes]> {
        match self {
            Self::None => None,
            Self::Verbatim(args) | Self::Rewritten(args) => Some(args),
        }
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Canonical command that recreates `bloom` under `key` and inserts `items`.
///
/// Error rate and tightening are written with Rust's shortest round-trip
/// float formatting, so the replica parses back the exact same `f64`s and
/// derives the same deterministic seed.
pub fn creation_command(key: &Key, bloom: &BloomObject, items: &[Bytes]) -> Vec<Bytes> {
    let mut args = Vec::with_capacity(12 + items.len());
    args.push(Bytes::from_static(b"BF.INSERT"));
    args.push(key.clone());
    args.push(Bytes::from_static(b"CAPACITY"));
    args.push(Bytes::from(bloom.initial_capacity().to_string()));
    args.push(Bytes::from_static(b"ERROR"));
    args.push(Bytes::from(bloom.fp_rate().to_string()));
    args.push(Bytes::from_static(b"TIGHTENING"));
    args.push(Bytes::from(bloom.tightening_ratio().to_string()));
    match bloom.scaling() {
        Scaling::NonScaling => args.push(Bytes::from_static(b"NONSCALING")),
        Scaling::Expansion(n) => {
            args.push(Bytes::from_static(b"EXPANSION"));
            args.push(Bytes::from(n.to_string()));
        }
    }
    if let Some(drawn) = bloom.seed().drawn() {
        args.push(Bytes::from_static(b"SEED"));
        args.push(Bytes::copy_from_slice(drawn));
    }
    if !items.is_empty() {
        args.push(Bytes::from_static(b"ITEMS"));
        args.extend(items.iter().cloned());
    }
    args
}

/// Replication backlog for partial resync.
#[derive(Debug)]
pub struct ReplicationBacklog {
    /// Encoded commands, oldest first
    buffer: RwLock<VecDeque<BacklogEntry>>,
    /// Maximum backlog size in bytes
    max_size: usize,
    /// Current size in bytes
    current_size: AtomicU64,
    /// First offset still held
    first_offset: AtomicI64,
    /// Offset of the next byte to be written
    current_offset: AtomicI64,
    /// Replication ID
    repl_id: RwLock<String>,
}

/// Entry in the replication backlog.
#[derive(Debug, Clone)]
struct BacklogEntry {
    /// Command data
    data: Bytes,
    /// Offset of this entry
    offset: i64,
}

impl ReplicationBacklog {
    /// Create a new backlog.
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: RwLock::new(VecDeque::with_capacity(1024)),
            max_size,
            current_size: AtomicU64::new(0),
            first_offset: AtomicI64::new(0),
            current_offset: AtomicI64::new(0),
            repl_id: RwLock::new(generate_repl_id()),
        }
    }

    /// Encode and append a forwarded command.
    pub fn feed(&self, args: &[Bytes]) {
        let refs: Vec<&[u8]> = args.iter().map(|a| a.as_ref()).collect();
        self.add(encode_command(&refs));
    }

    /// Add encoded command bytes to the backlog.
    pub fn add(&self, data: Bytes) {
        let size = data.len() as u64;
        let mut buffer = self.buffer.write();
        let offset = self
            .current_offset
            .fetch_add(data.len() as i64, Ordering::SeqCst);
        buffer.push_back(BacklogEntry { data, offset });

        let mut current = self.current_size.fetch_add(size, Ordering::Relaxed) + size;

        // Keep at least the newest entry even if it alone exceeds the limit
        while current > self.max_size as u64 && buffer.len() > 1 {
            if let Some(entry) = buffer.pop_front() {
                let len = entry.data.len() as u64;
                current -= len;
                self.current_size.fetch_sub(len, Ordering::Relaxed);
                self.first_offset
                    .store(entry.offset + len as i64, Ordering::Relaxed);
            }
        }
    }

    /// Entries starting at or after `offset`.
    ///
    /// Returns None if the offset has been trimmed or lies in the future.
    pub fn get_from_offset(&self, offset: i64) -> Option<Vec<Bytes>> {
        let buffer = self.buffer.read();
        let first = self.first_offset.load(Ordering::Relaxed);
        let current = self.current_offset.load(Ordering::Relaxed);

        if offset < first || offset > current {
            return None;
        }

        Some(
            buffer
                .iter()
                .filter(|entry| entry.offset >= offset)
                .map(|entry| entry.data.clone())
                .collect(),
        )
    }

    /// Whether a replica at `offset` under `repl_id` can continue from the backlog.
    pub fn can_partial_resync(&self, repl_id: &str, offset: i64) -> bool {
        if *self.repl_id.read() != repl_id {
            return false;
        }
        let first = self.first_offset.load(Ordering::Relaxed);
        let current = self.current_offset.load(Ordering::Relaxed);
        offset >= first && offset <= current
    }

    /// Get current replication ID.
    pub fn repl_id(&self) -> String {
        self.repl_id.read().clone()
    }

    /// Get current offset.
    pub fn current_offset(&self) -> i64 {
        self.current_offset.load(Ordering::Relaxed)
    }

    /// Number of commands held.
    pub fn len(&self) -> usize {
        self.buffer.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.read().is_empty()
    }

    /// Reset the backlog (generate new ID).
    pub fn reset(&self) {
        let mut buffer = self.buffer.write();
        buffer.clear();
        *self.repl_id.write() = generate_repl_id();
        self.current_size.store(0, Ordering::Relaxed);
        self.first_offset.store(0, Ordering::Relaxed);
        self.current_offset.store(0, Ordering::Relaxed);
    }
}

impl Default for ReplicationBacklog {
    fn default() -> Self {
        // Default 1MB backlog
        Self::new(1024 * 1024)
    }
}

/// Random 40-character hex replication ID.
fn generate_repl_id() -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..40)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::metrics::BloomMetrics;
    use crate::types::bloom::{BloomOptions, SeedChoice, SizeLimit};
    use std::sync::Arc;

    fn object(scaling: Scaling, seed: SeedChoice) -> BloomObject {
        let metrics = Arc::new(BloomMetrics::new());
        BloomObject::new(
            BloomOptions {
                capacity: 500,
                fp_rate: 0.001,
                tightening_ratio: 0.5,
                scaling,
                seed,
            },
            None,
            SizeLimit::enforced(128 * 1024 * 1024),
            &metrics,
        )
        .unwrap()
    }

    #[test]
    fn test_backlog_add_and_get() {
        let backlog = ReplicationBacklog::new(1024);

        for item in ["a", "b"] {
            backlog.feed(&[
                Bytes::from_static(b"BF.ADD"),
                Bytes::from_static(b"k"),
                Bytes::from(item),
            ]);
        }

        let data = backlog.get_from_offset(0).unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(backlog.len(), 2);
        assert!(backlog.get_from_offset(backlog.current_offset() + 1).is_none());
    }

    #[test]
    fn test_backlog_trims_oldest() {
        let backlog = ReplicationBacklog::new(16);
        backlog.add(Bytes::from_static(b"0123456789"));
        backlog.add(Bytes::from_static(b"abcdefghij"));

        assert_eq!(backlog.len(), 1);
        assert!(backlog.get_from_offset(0).is_none());
        assert_eq!(backlog.get_from_offset(10).unwrap().len(), 1);
    }

    #[test]
    fn test_backlog_partial_resync() {
        let backlog = ReplicationBacklog::new(1024);
        let id = backlog.repl_id();
        assert_eq!(id.len(), 40);

        backlog.add(Bytes::from_static(b"*1\r\n$4\r\nPING\r\n"));

        assert!(backlog.can_partial_resync(&id, 0));
        assert!(!backlog.can_partial_resync("wrong-id", 0));

        backlog.reset();
        assert!(!backlog.can_partial_resync(&id, 0));
        assert!(backlog.is_empty());
    }

    #[test]
    fn test_creation_command_scaling_fixed_seed() {
        let bloom = object(Scaling::Expansion(4), SeedChoice::Fixed);
        let args = creation_command(
            &Bytes::from_static(b"key"),
            &bloom,
            &[Bytes::from_static(b"a")],
        );
        let text: Vec<&[u8]> = args.iter().map(|a| a.as_ref()).collect();
        assert_eq!(
            text,
            vec![
                &b"BF.INSERT"[..],
                b"key",
                b"CAPACITY",
                b"500",
                b"ERROR",
                b"0.001",
                b"TIGHTENING",
                b"0.5",
                b"EXPANSION",
                b"4",
                b"ITEMS",
                b"a",
            ]
        );
    }

    #[test]
    fn test_creation_command_nonscaling_random_seed() {
        let bloom = object(Scaling::NonScaling, SeedChoice::Random);
        let args = creation_command(&Bytes::from_static(b"key"), &bloom, &[]);
        assert!(args.iter().any(|a| a.as_ref() == b"NONSCALING"));
        assert!(!args.iter().any(|a| a.as_ref() == b"ITEMS"));

        let seed_pos = args.iter().position(|a| a.as_ref() == b"SEED").unwrap();
        assert_eq!(args[seed_pos + 1].len(), 32);
    }

    #[test]
    fn test_propagation_args() {
        assert!(Propagation::None.args().is_none());
        let verbatim = Propagation::Verbatim(vec![Bytes::from_static(b"BF.ADD")]);
        assert_eq!(verbatim.args().unwrap().len(), 1);
    }
}
