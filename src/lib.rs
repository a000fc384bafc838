//! # Viator Bloom
//!
//! A scalable Bloom filter value type for the Viator key-value server.
//!
//! A bloom object is a chain of fixed-size filter units. When the newest
//! unit fills up a larger one is appended, with a tighter error rate, until
//! the per-object memory limit or the error-rate floor stops growth. The
//! engine provides:
//! - `BF.*` commands with exact item counts and per-item replies
//! - Deterministic or random hash seeding, chosen per object at creation
//! - Snapshot (VDB) and AOF persistence with fail-fast validation on load
//! - Replication that rebuilds objects from their resolved parameters
//! - Process-wide metrics and incremental defragmentation
//!
//! ## Example
//!
//! ```no_run
//! use viator_bloom::{Config, Engine, Result};
//! use bytes::Bytes;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let engine = Engine::open(Config::default()).await?;
//!     let argv = vec![Bytes::from("BF.ADD"), Bytes::from("visitors"), Bytes::from("alice")];
//!     let outcome = engine.execute(argv).await?;
//!     println!("{:?}", outcome.frame);
//!     engine.save().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unused_lifetimes,
    unused_qualifications
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::type_complexity,            // Boxed futures in command handler signatures
    clippy::should_implement_trait,     // from_str naming on config enums
    clippy::len_without_is_empty,
    missing_docs // Public API docs needed - future enhancement
)]

// ─────────────────────────────────────────────────────────────────────────────
// Modules
// ─────────────────────────────────────────────────────────────────────────────

/// Command parsing and execution layer.
pub mod commands;
/// Error types and result aliases.
pub mod error;
/// Snapshot and AOF persistence.
pub mod persistence;
/// RESP replies.
pub mod protocol;
/// Engine, configuration, metrics and replication.
pub mod server;
/// In-memory keyspace.
pub mod storage;
/// Value types.
pub mod types;

// ─────────────────────────────────────────────────────────────────────────────
// Common Re-exports
// ─────────────────────────────────────────────────────────────────────────────

// Error handling
pub use error::{Error, ErrorKind, Result};

// Protocol
pub use protocol::Frame;

// Commands
pub use commands::{KeyspaceEvent, Outcome};

// Server
pub use server::{BloomMetrics, Config, Engine, Propagation};

// Storage
pub use storage::Db;

// Types
pub use types::bloom::{BloomObject, BloomOptions, ObjectDigest, Scaling, SeedChoice, SizeLimit};
pub use types::{Key, ViatorValue};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Crate version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
