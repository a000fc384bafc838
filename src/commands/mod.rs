//! Bloom command implementation.
//!
//! This module provides the command parsing, routing, and execution layer.
//! Handlers return an [`Outcome`]: the reply plus what the caller must
//! propagate to the AOF and replicas and which keyspace events fired.

mod bloom_cmds;
mod executor;
mod registry;

pub use executor::CommandExecutor;
pub use registry::{Command, CommandHandler, CommandRegistry};

use crate::error::{CommandError, Result};
use crate::protocol::Frame;
use crate::server::config::Config;
use crate::server::replication::Propagation;
use crate::types::Key;
use bytes::Bytes;
use std::sync::Arc;

/// Parsed command with name and arguments.
#[derive(Debug, Clone)]
pub struct ParsedCommand {
    /// Command name (uppercase)
    pub name: String,
    /// Command arguments
    pub args: Vec<Bytes>,
}

impl ParsedCommand {
    /// Split a full argument vector into name and arguments.
    pub fn from_argv(argv: Vec<Bytes>) -> Result<Self> {
        let mut iter = argv.into_iter();
        let name_bytes = iter
            .next()
            .ok_or_else(|| CommandError::UnknownCommand(String::new()))?;
        let name = String::from_utf8_lossy(&name_bytes).to_uppercase();
        Ok(Self {
            name,
            args: iter.collect(),
        })
    }

    /// Get the number of arguments (excluding command name).
    #[inline]
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Get an argument as bytes.
    #[inline]
    pub fn get_arg(&self, index: usize) -> Option<&Bytes> {
        self.args.get(index)
    }

    /// Get an argument as a string, lossily.
    ///
    /// Numeric and option arguments are ASCII; anything else fails to parse
    /// further down with the argument's own error.
    pub fn get_str(&self, index: usize) -> Result<std::borrow::Cow<'_, str>> {
        let bytes = self.args.get(index).ok_or_else(|| CommandError::WrongArity {
            command: self.name.clone(),
        })?;
        Ok(String::from_utf8_lossy(bytes))
    }

    /// Full argument vector including the command name.
    pub fn to_argv(&self) -> Vec<Bytes> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(Bytes::from(self.name.clone()));
        argv.extend(self.args.iter().cloned());
        argv
    }

    fn wrong_arity(&self) -> CommandError {
        CommandError::WrongArity {
            command: self.name.clone(),
        }
    }
}

bitflags::bitflags! {
    /// Command flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CommandFlags: u8 {
        /// Command is read-only
        const READONLY = 1 << 0;
        /// Command modifies data
        const WRITE    = 1 << 1;
        /// Command may grow memory; refused over `maxmemory`
        const DENYOOM  = 1 << 2;
        /// Command is fast (O(1))
        const FAST     = 1 << 3;
    }
}

impl CommandFlags {
    /// Flags for read-only commands (readonly + fast).
    #[inline]
    pub const fn readonly() -> Self {
        Self::READONLY.union(Self::FAST)
    }

    /// Flags for write commands that may allocate.
    #[inline]
    pub const fn write() -> Self {
        Self::WRITE.union(Self::DENYOOM)
    }

    #[inline]
    pub const fn is_write(self) -> bool {
        self.contains(Self::WRITE)
    }

    #[inline]
    pub const fn deny_oom(self) -> bool {
        self.contains(Self::DENYOOM)
    }
}

/// Where a command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A client connection
    Client,
    /// The replication stream
    Replication,
    /// AOF replay at startup
    AofLoad,
}

/// Per-call state handed to command handlers.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Configuration snapshot taken when the call started
    pub config: Arc<Config>,
    /// Who issued the command
    pub origin: Origin,
}

impl CallContext {
    pub fn new(config: Arc<Config>, origin: Origin) -> Self {
        Self { config, origin }
    }

    /// Whether the command was already accepted once, by a primary or
    /// before it reached the AOF.
    #[inline]
    pub fn is_replicated(&self) -> bool {
        matches!(self.origin, Origin::Replication | Origin::AofLoad)
    }
}

/// A keyspace notification raised by a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyspaceEvent {
    /// Event name, e.g. `bloom.add`
    pub event: &'static str,
    /// Key the event refers to
    pub key: Key,
}

/// Event raised when a write creates a bloom object.
pub const RESERVE_EVENT: &str = "bloom.reserve";
/// Event raised when a write adds at least one new item.
pub const ADD_EVENT: &str = "bloom.add";

/// Result of executing one command.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// Reply to send to the caller
    pub frame: Frame,
    /// What to forward to the AOF and replicas
    pub propagation: Propagation,
    /// Keyspace events raised by the call
    pub events: Vec<KeyspaceEvent>,
}

impl Outcome {
    /// A reply with no side effects to propagate.
    pub fn reply(frame: Frame) -> Self {
        Self {
            frame,
            propagation: Propagation::None,
            events: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_argv_uppercases_name() {
        let cmd = ParsedCommand::from_argv(vec![
            Bytes::from_static(b"bf.add"),
            Bytes::from_static(b"key"),
            Bytes::from_static(b"item"),
        ])
        .unwrap();
        assert_eq!(cmd.name, "BF.ADD");
        assert_eq!(cmd.arg_count(), 2);
        assert_eq!(cmd.to_argv()[0].as_ref(), b"BF.ADD");
    }

    #[test]
    fn test_from_argv_rejects_empty() {
        assert!(ParsedCommand::from_argv(Vec::new()).is_err());
    }

    #[test]
    fn test_flags() {
        assert!(CommandFlags::write().deny_oom());
        assert!(CommandFlags::write().is_write());
        assert!(!CommandFlags::readonly().is_write());
    }
}
