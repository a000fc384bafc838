//! Bloom engine host.
//!
//! [`Engine`] ties the keyspace, configuration, metrics, propagation backlog
//! and persistence together. The network layer is the host's concern: it
//! hands the engine argument vectors and gets back replies, propagated
//! commands and keyspace events.
//!
//! Startup follows the usual rule: if AOF is enabled and its file exists the
//! AOF is replayed, otherwise the snapshot is loaded. A snapshot record that
//! fails validation aborts startup.

pub mod config;
pub mod metrics;
pub mod replication;

pub use config::{Config, ConfigError};
pub use metrics::{BloomMetrics, MetricsSnapshot};
pub use replication::{Propagation, ReplicationBacklog};

use crate::Result;
use crate::commands::{CallContext, CommandExecutor, Origin, Outcome, ParsedCommand};
use crate::error::ErrorKind;
use crate::persistence::{AofReader, PersistenceConfig, PersistenceManager};
use crate::protocol::Frame;
use crate::storage::Db;
use crate::types::ViatorValue;
use crate::types::bloom::{CopyRelocator, SizeLimit};
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Units relocated per background defrag tick.
const DEFRAG_BUDGET_PER_TICK: usize = 64;

/// The bloom engine.
#[derive(Debug)]
pub struct Engine {
    /// Current configuration; calls take a snapshot
    config: RwLock<Arc<Config>>,
    /// Keyspace
    database: Arc<Db>,
    /// Command executor
    executor: CommandExecutor,
    /// Forwarded commands for replicas
    backlog: ReplicationBacklog,
    /// Snapshot and AOF
    persistence: PersistenceManager,
    /// Background task flag
    running: AtomicBool,
    /// Shutdown notification
    shutdown: Arc<Notify>,
}

impl Engine {
    /// Create an engine with an empty keyspace. Nothing is read from disk.
    pub fn new(config: Config) -> Self {
        let metrics = Arc::new(BloomMetrics::new());
        let database = Arc::new(Db::new(metrics));
        let executor = CommandExecutor::new(Arc::clone(&database));
        let backlog = ReplicationBacklog::new(config.repl_backlog_size);
        let persistence = PersistenceManager::new(
            PersistenceConfig::from_config(&config),
            Arc::clone(&database),
        );

        Self {
            config: RwLock::new(Arc::new(config)),
            database,
            executor,
            backlog,
            persistence,
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Create an engine and restore its keyspace from disk.
    ///
    /// Fails if the snapshot or AOF is corrupt; the engine must not start
    /// with partial state.
    pub async fn open(config: Config) -> Result<Self> {
        let engine = Self::new(config);
        let load_start = Instant::now();

        let aof_path = engine.persistence.config().aof_path.clone();
        match aof_path {
            Some(path) if path.exists() => {
                let commands = engine.replay_aof(AofReader::new(&path)?).await?;
                info!(
                    path = %path.display(),
                    commands,
                    "DB loaded from append only file: {:.3} seconds",
                    load_start.elapsed().as_secs_f64()
                );
            }
            _ => {
                let limit = SizeLimit::enforced(engine.config().bloom_memory_limit);
                if let Err(e) = engine.persistence.load_snapshot(limit) {
                    error!("Failed to load snapshot: {}", e);
                    return Err(e.into());
                }
                debug!(
                    "DB loaded from disk: {:.3} seconds",
                    load_start.elapsed().as_secs_f64()
                );
            }
        }

        engine.persistence.open_aof()?;
        Ok(engine)
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.read())
    }

    /// Change one configuration parameter at runtime.
    ///
    /// Existing objects keep the parameters they were created with.
    pub fn config_set(&self, name: &str, value: &str) -> std::result::Result<(), ConfigError> {
        let mut current = self.config.write();
        let mut next = Config::clone(&current);
        next.set(name, value)?;
        info!(name, value, "config updated");
        *current = Arc::new(next);
        Ok(())
    }

    /// Read one configuration parameter.
    pub fn config_get(&self, name: &str) -> Option<String> {
        self.config.read().get(name)
    }

    /// Get the keyspace.
    pub fn database(&self) -> &Arc<Db> {
        &self.database
    }

    /// Get the metrics aggregator.
    pub fn metrics(&self) -> &Arc<BloomMetrics> {
        self.database.metrics()
    }

    /// Get the propagation backlog.
    pub fn backlog(&self) -> &ReplicationBacklog {
        &self.backlog
    }

    /// Get the persistence manager.
    pub fn persistence(&self) -> &PersistenceManager {
        &self.persistence
    }

    /// Execute a client command and propagate its effects.
    pub async fn execute(&self, argv: Vec<Bytes>) -> Result<Outcome> {
        self.dispatch(argv, Origin::Client, true).await
    }

    /// Execute a command received from the primary.
    ///
    /// Memory limits are not enforced; the primary already did.
    pub async fn execute_replicated(&self, argv: Vec<Bytes>) -> Result<Outcome> {
        self.dispatch(argv, Origin::Replication, true).await
    }

    /// Execute a client command and render the reply, errors included.
    pub async fn call(&self, argv: Vec<Bytes>) -> Frame {
        match self.execute(argv).await {
            Ok(outcome) => outcome.frame,
            Err(e) => Frame::error(e.to_reply_string()),
        }
    }

    async fn dispatch(&self, argv: Vec<Bytes>, origin: Origin, propagate: bool) -> Result<Outcome> {
        let cmd = ParsedCommand::from_argv(argv)?;
        let ctx = CallContext::new(self.config(), origin);
        let outcome = self.executor.execute(cmd, ctx).await?;

        if propagate {
            if let Some(args) = outcome.propagation.args() {
                self.propagate(args)?;
            }
        }
        for event in &outcome.events {
            debug!(event = event.event, key = ?event.key, "keyspace event");
        }
        Ok(outcome)
    }

    /// Append a forwarded command to the AOF and the backlog.
    fn propagate(&self, args: &[Bytes]) -> Result<()> {
        self.persistence.aof_append(args)?;
        self.backlog.feed(args);
        Ok(())
    }

    /// Feed every command in an AOF back through the executor.
    ///
    /// Commands are applied as [`Origin::AofLoad`] and not propagated again.
    /// A command that fails is logged and skipped. A malformed log or a
    /// `BF.LOAD` payload that fails validation is fatal.
    pub async fn replay_aof(&self, mut reader: AofReader) -> Result<usize> {
        let mut applied = 0;
        while let Some(argv) = reader.next_command()? {
            if argv
                .first()
                .is_some_and(|name| name.eq_ignore_ascii_case(b"SET"))
                && argv.len() == 3
            {
                self.database
                    .set(argv[1].clone(), ViatorValue::string(argv[2].clone()));
                applied += 1;
                continue;
            }

            match self.dispatch(argv, Origin::AofLoad, false).await {
                Ok(_) => applied += 1,
                Err(e) if e.kind() == Some(ErrorKind::CorruptPersistedState) => {
                    error!("Aborting AOF load after {} commands: {}", applied, e);
                    return Err(e);
                }
                Err(e) => warn!("Skipping AOF command: {}", e.to_reply_string()),
            }
        }
        Ok(applied)
    }

    /// Write a snapshot of the keyspace.
    pub async fn save(&self) -> Result<usize> {
        Ok(self.persistence.save_snapshot().await?)
    }

    /// Rewrite the AOF from the current keyspace.
    pub fn rewrite_aof(&self) -> Result<usize> {
        Ok(self.persistence.rewrite_aof()?)
    }

    /// Run one bounded defragmentation step.
    ///
    /// Returns None when defragmentation is disabled, otherwise whether a
    /// full pass over the keyspace completed.
    pub fn defrag_cycle(&self, budget: usize) -> Option<bool> {
        if !self.config.read().bloom_defrag_enabled {
            return None;
        }
        Some(self.database.defrag_cycle(budget, &mut CopyRelocator))
    }

    /// Delete every key. Metrics gauges fall to zero as objects are freed.
    pub fn flush(&self) {
        self.database.flush();
    }

    /// Clear resettable statistics.
    pub fn reset_stats(&self) {
        self.database.metrics().reset_stats();
    }

    /// INFO-style report of bloom metrics and the keyspace.
    pub fn info(&self) -> String {
        let stats = self.database.stats();
        format!(
            "{}\n# keyspace\nkeys:{}\nkeyspace_hits:{}\nkeyspace_misses:{}\n",
            self.database.metrics().to_info_string(),
            self.database.len(),
            stats.hits.load(Ordering::Relaxed),
            stats.misses.load(Ordering::Relaxed),
        )
    }

    /// Spawn the background tick: AOF fsync and incremental defrag.
    ///
    /// Runs until [`Engine::shutdown`] is called.
    pub fn spawn_background(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let engine = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.notified() => break,
                }
                if !engine.running.load(Ordering::Relaxed) {
                    break;
                }

                if let Err(e) = engine.persistence.aof_fsync() {
                    error!("AOF fsync failed: {}", e);
                }
                engine.defrag_cycle(DEFRAG_BUDGET_PER_TICK);
            }
            debug!("background task stopped");
        })
    }

    /// Stop background work and flush the AOF.
    pub fn shutdown(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        self.persistence.aof_fsync()?;
        info!("engine shut down");
        Ok(())
    }
}
