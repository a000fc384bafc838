//! Command registry for looking up bloom commands.

use super::{CallContext, CommandFlags, Outcome, ParsedCommand};
use crate::Result;
use crate::storage::Db;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Type alias for async command handler.
pub type CommandHandler =
    fn(ParsedCommand, Arc<Db>, CallContext) -> Pin<Box<dyn Future<Output = Result<Outcome>> + Send>>;

/// Command definition.
#[derive(Clone)]
pub struct Command {
    /// Command name
    pub name: &'static str,
    /// Minimum argument count, excluding the name
    pub min_args: i32,
    /// Maximum argument count (-1 for unlimited)
    pub max_args: i32,
    /// Command flags
    pub flags: CommandFlags,
    /// Handler function
    pub handler: CommandHandler,
    /// Help text
    pub summary: &'static str,
}

impl Command {
    /// Create a new command definition.
    pub const fn new(
        name: &'static str,
        min_args: i32,
        max_args: i32,
        flags: CommandFlags,
        handler: CommandHandler,
        summary: &'static str,
    ) -> Self {
        Self {
            name,
            min_args,
            max_args,
            flags,
            handler,
            summary,
        }
    }

    /// Whether `argc` arguments (excluding the name) are acceptable.
    #[inline]
    pub fn accepts(&self, argc: usize) -> bool {
        let argc = i32::try_from(argc).unwrap_or(i32::MAX);
        argc >= self.min_args && (self.max_args < 0 || argc <= self.max_args)
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("min_args", &self.min_args)
            .field("max_args", &self.max_args)
            .field("flags", &self.flags)
            .field("summary", &self.summary)
            .finish()
    }
}

/// Registry of all available commands.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Command>,
}

impl CommandRegistry {
    /// Create a new command registry with all bloom commands.
    pub fn new() -> Self {
        let mut registry = Self {
            commands: HashMap::new(),
        };
        registry.register_bloom_commands();
        registry
    }

    /// Register a command.
    pub fn register(&mut self, cmd: Command) {
        self.commands.insert(cmd.name.to_uppercase(), cmd);
    }

    /// Look up a command by name.
    pub fn get(&self, name: &str) -> Option<&Command> {
        self.commands.get(&name.to_uppercase())
    }

    /// Get all registered commands.
    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.commands.values()
    }

    /// Get command count.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    fn register_bloom_commands(&mut self) {
        use super::bloom_cmds::*;

        self.register(Command::new(
            "BF.ADD",
            2,
            2,
            CommandFlags::write(),
            cmd_bf_add,
            "Add an item to a Bloom filter",
        ));
        self.register(Command::new(
            "BF.MADD",
            2,
            -1,
            CommandFlags::write(),
            cmd_bf_madd,
            "Add multiple items to a Bloom filter",
        ));
        self.register(Command::new(
            "BF.EXISTS",
            2,
            2,
            CommandFlags::readonly(),
            cmd_bf_exists,
            "Check if an item exists in a Bloom filter",
        ));
        self.register(Command::new(
            "BF.MEXISTS",
            2,
            -1,
            CommandFlags::readonly(),
            cmd_bf_mexists,
            "Check if multiple items exist in a Bloom filter",
        ));
        self.register(Command::new(
            "BF.RESERVE",
            3,
            5,
            CommandFlags::write(),
            cmd_bf_reserve,
            "Create a Bloom filter with capacity and error rate",
        ));
        self.register(Command::new(
            "BF.INFO",
            1,
            2,
            CommandFlags::readonly(),
            cmd_bf_info,
            "Get information about a Bloom filter",
        ));
        self.register(Command::new(
            "BF.CARD",
            1,
            1,
            CommandFlags::readonly(),
            cmd_bf_card,
            "Get the number of items added to a Bloom filter",
        ));
        self.register(Command::new(
            "BF.INSERT",
            1,
            -1,
            CommandFlags::write(),
            cmd_bf_insert,
            "Insert items into a Bloom filter with options",
        ));
        self.register(Command::new(
            "BF.LOAD",
            2,
            2,
            CommandFlags::write(),
            cmd_bf_load,
            "Restore a Bloom filter from its serialized form",
        ));
    }
}
