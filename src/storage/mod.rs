//! Storage engine.
//!
//! This module provides the in-memory keyspace holding bloom objects and the
//! foreign values bloom commands must reject.

mod db;

pub use db::{Db, DbEntry, DbStats, ExportedValue};
