//! Command executor - the main entry point for command processing.

use super::registry::CommandRegistry;
use super::{CallContext, Origin, Outcome, ParsedCommand};
use crate::Result;
use crate::error::CommandError;
use crate::storage::Db;
use std::sync::Arc;
use tracing::{debug, trace};

/// Command executor responsible for routing and executing bloom commands.
#[derive(Debug)]
pub struct CommandExecutor {
    /// Command registry
    registry: CommandRegistry,
    /// Keyspace
    database: Arc<Db>,
}

impl CommandExecutor {
    /// Create a new command executor.
    pub fn new(database: Arc<Db>) -> Self {
        Self {
            registry: CommandRegistry::new(),
            database,
        }
    }

    /// Execute a command.
    ///
    /// Checks arity and, for client writes that may allocate, the server-wide
    /// `maxmemory` ceiling before dispatching.
    pub async fn execute(&self, cmd: ParsedCommand, ctx: CallContext) -> Result<Outcome> {
        trace!(
            "Executing command: {} with {} args",
            cmd.name,
            cmd.arg_count()
        );

        let command = self
            .registry
            .get(&cmd.name)
            .ok_or_else(|| CommandError::UnknownCommand(cmd.name.clone()))?;

        if !command.accepts(cmd.arg_count()) {
            return Err(CommandError::WrongArity {
                command: cmd.name.clone(),
            }
            .into());
        }

        if command.flags.deny_oom() && ctx.origin == Origin::Client {
            let maxmemory = ctx.config.maxmemory;
            let used = self.database.metrics().total_memory_bytes();
            if maxmemory > 0 && used > maxmemory {
                debug!(used, maxmemory, "write refused over maxmemory");
                return Err(CommandError::OutOfMemory.into());
            }
        }

        let result = (command.handler)(cmd, Arc::clone(&self.database), ctx).await;

        match &result {
            Ok(_) => trace!("Command executed successfully"),
            Err(e) => debug!("Command failed: {}", e),
        }

        result
    }

    /// Get the command registry.
    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Get the database.
    pub fn database(&self) -> &Arc<Db> {
        &self.database
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::config::Config;
    use crate::server::metrics::BloomMetrics;
    use bytes::Bytes;

    fn executor() -> CommandExecutor {
        CommandExecutor::new(Arc::new(Db::new(Arc::new(BloomMetrics::new()))))
    }

    fn parsed(args: &[&str]) -> ParsedCommand {
        ParsedCommand::from_argv(args.iter().map(|a| Bytes::copy_from_slice(a.as_bytes())).collect())
            .unwrap()
    }

    fn client(config: Config) -> CallContext {
        CallContext::new(Arc::new(config), Origin::Client)
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let err = executor()
            .execute(parsed(&["GET", "k"]), client(Config::new()))
            .await
            .unwrap_err();
        assert_eq!(err.to_reply_string(), "ERR unknown command 'GET'");
    }

    #[tokio::test]
    async fn test_arity_is_checked_before_dispatch() {
        let exec = executor();
        for args in [
            vec!["BF.ADD", "k"],
            vec!["BF.ADD", "k", "a", "b"],
            vec!["BF.MADD", "k"],
            vec!["BF.CARD"],
            vec!["BF.INFO", "k", "CAPACITY", "extra"],
            vec!["BF.RESERVE", "k", "0.01"],
            vec!["BF.INSERT"],
            vec!["BF.LOAD", "k"],
        ] {
            let err = exec
                .execute(parsed(&args), client(Config::new()))
                .await
                .unwrap_err();
            assert!(
                err.to_reply_string().starts_with("ERR wrong number of arguments"),
                "{args:?}"
            );
        }
        assert!(exec.database().is_empty());
    }

    #[tokio::test]
    async fn test_maxmemory_blocks_client_writes_only() {
        let exec = executor();
        exec.execute(parsed(&["BF.ADD", "k", "a"]), client(Config::new()))
            .await
            .unwrap();

        let tight = Config::new().maxmemory(1);
        let err = exec
            .execute(parsed(&["BF.ADD", "k", "b"]), client(tight.clone()))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_reply_string(),
            "OOM command not allowed when used memory > 'maxmemory'"
        );

        // Reads still work
        exec.execute(parsed(&["BF.EXISTS", "k", "a"]), client(tight.clone()))
            .await
            .unwrap();

        let replicated = CallContext::new(Arc::new(tight), Origin::Replication);
        exec.execute(parsed(&["BF.ADD", "k", "b"]), replicated)
            .await
            .unwrap();
    }
}
