//! Persistence layer for bloom objects.
//!
//! This module implements:
//! - **Codec**: the versioned byte layout of a single bloom object
//! - **VDB**: point-in-time snapshots of the keyspace
//! - **AOF**: append-only log of propagated writes, rewritten as `BF.LOAD`
//!
//! # Architecture
//!
//! Snapshot saves run on the blocking pool so the async runtime keeps
//! serving commands. Snapshot loads decode into a staging list
//! and swap it into the keyspace only when every record is valid.

mod aof;
pub mod codec;
mod vdb;

pub use aof::{AofFsync, AofReader, AofWriter, encode_command};
pub use vdb::{VdbAux, VdbContents, VdbLoader, VdbSaver, decode_entries};

use crate::error::StorageError;
use crate::server::config::Config;
use crate::storage::Db;
use crate::types::bloom::SizeLimit;
use bytes::Bytes;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

/// Configuration for persistence.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Snapshot file path
    pub vdb_path: PathBuf,
    /// AOF file path, if AOF is enabled
    pub aof_path: Option<PathBuf>,
    /// AOF fsync policy
    pub aof_fsync: AofFsync,
}

impl PersistenceConfig {
    /// Derive paths and policy from the engine configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            vdb_path: config.snapshot_path(),
            aof_path: config.appendonly.then(|| config.aof_path()),
            aof_fsync: config.appendfsync,
        }
    }
}

/// Persistence manager that coordinates snapshot and AOF operations.
#[derive(Debug)]
pub struct PersistenceManager {
    config: PersistenceConfig,
    database: Arc<Db>,
    aof_writer: Mutex<Option<AofWriter>>,
}

impl PersistenceManager {
    /// Create a new persistence manager.
    pub fn new(config: PersistenceConfig, database: Arc<Db>) -> Self {
        Self {
            config,
            database,
            aof_writer: Mutex::new(None),
        }
    }

    #[inline]
    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    /// Load the snapshot, if one exists, replacing the keyspace.
    ///
    /// Returns the number of keys loaded. On any invalid record the keyspace
    /// is left untouched and the error is returned.
    pub fn load_snapshot(&self, limit: SizeLimit) -> Result<usize, StorageError> {
        let path = &self.config.vdb_path;
        if !path.exists() {
            return Ok(0);
        }

        tracing::info!(path = %path.display(), "loading snapshot");
        let staged = VdbLoader::new(path)?.load(limit, self.database.metrics())?;
        let keys = staged.len();
        self.database.replace_all(staged);
        tracing::info!(path = %path.display(), keys, "snapshot loaded");
        Ok(keys)
    }

    /// Open the AOF for appending, if enabled.
    pub fn open_aof(&self) -> Result<(), StorageError> {
        if let Some(ref path) = self.config.aof_path {
            let writer = AofWriter::new(path, self.config.aof_fsync)?;
            *self.aof_writer.lock() = Some(writer);
            tracing::info!(path = %path.display(), "AOF enabled");
        }
        Ok(())
    }

    /// Whether appended commands are being logged.
    pub fn aof_enabled(&self) -> bool {
        self.aof_writer.lock().is_some()
    }

    /// Append a propagated command to the AOF.
    pub fn aof_append(&self, command: &[Bytes]) -> Result<(), StorageError> {
        if let Some(ref mut writer) = *self.aof_writer.lock() {
            writer.append_command(command)?;
        }
        Ok(())
    }

    /// Force AOF fsync.
    pub fn aof_fsync(&self) -> Result<(), StorageError> {
        if let Some(ref mut writer) = *self.aof_writer.lock() {
            writer.fsync()?;
        }
        Ok(())
    }

    /// Write a snapshot of the keyspace.
    ///
    /// The file is written next to the target and renamed into place. Uses
    /// spawn_blocking to avoid blocking the async runtime.
    pub async fn save_snapshot(&self) -> Result<usize, StorageError> {
        let path = self.config.vdb_path.clone();
        let database = Arc::clone(&self.database);

        tokio::task::spawn_blocking(move || -> Result<usize, StorageError> {
            let temp_path = path.with_extension(format!("vdb.temp.{}", std::process::id()));
            let keys = match VdbSaver::new(&temp_path).and_then(|saver| saver.save(&database)) {
                Ok(keys) => keys,
                Err(e) => {
                    let _ = std::fs::remove_file(&temp_path);
                    return Err(e);
                }
            };
            std::fs::rename(&temp_path, &path).map_err(StorageError::Io)?;
            tracing::info!(path = %path.display(), keys, "snapshot saved");
            Ok(keys)
        })
        .await
        .map_err(|e| StorageError::Persistence(format!("spawn_blocking panicked: {e}")))?
    }

    /// Rewrite the AOF from the keyspace and reopen it for appending.
    ///
    /// Appends block until the rewrite finishes, so none land in the file
    /// being replaced.
    pub fn rewrite_aof(&self) -> Result<usize, StorageError> {
        let Some(ref path) = self.config.aof_path else {
            return Ok(0);
        };

        let mut writer = self.aof_writer.lock();
        if let Some(ref mut current) = *writer {
            current.fsync()?;
        }

        let commands = AofWriter::rewrite_from_db(path, &self.database)?;
        *writer = Some(AofWriter::new(path, self.config.aof_fsync)?);
        tracing::info!(path = %path.display(), commands, "AOF rewritten");
        Ok(commands)
    }
}
