//! Engine configuration.
//!
//! Bloom defaults are read once per object at creation time; changing them
//! never affects objects that already exist.

use crate::error::CommandError;
use crate::persistence::AofFsync;
use std::fs;
use std::path::{Path, PathBuf};

/// Default capacity of a new object's first unit.
pub const BLOOM_CAPACITY_DEFAULT: i64 = 100;
/// Default expansion.
pub const BLOOM_EXPANSION_DEFAULT: u32 = 2;
/// Default error rate.
pub const BLOOM_FP_RATE_DEFAULT: f64 = 0.01;
/// Default tightening ratio.
pub const BLOOM_TIGHTENING_DEFAULT: f64 = 0.5;
/// Default per-object memory limit (128 MiB).
pub const BLOOM_MEMORY_LIMIT_DEFAULT: u64 = 128 * 1024 * 1024;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    // === Bloom defaults ===
    /// Capacity of the first unit when not given
    pub bloom_capacity: i64,
    /// Expansion when not given
    pub bloom_expansion: u32,
    /// Error rate when not given, in (0, 1)
    pub bloom_fp_rate: f64,
    /// Tightening ratio when not given, in (0, 1)
    pub bloom_tightening_ratio: f64,
    /// Per-object memory limit in bytes
    pub bloom_memory_limit: u64,
    /// Draw a random seed for new objects instead of the fixed one
    pub bloom_use_random_seed: bool,
    /// Allow background defragmentation of bloom objects
    pub bloom_defrag_enabled: bool,

    // === Limits ===
    /// Server-wide memory ceiling for bloom objects (bytes, 0 for no limit)
    pub maxmemory: u64,

    // === Persistence ===
    /// Working directory
    pub dir: PathBuf,
    /// Snapshot filename
    pub dbfilename: String,
    /// Enable AOF persistence
    pub appendonly: bool,
    /// AOF filename
    pub appendfilename: String,
    /// AOF fsync policy
    pub appendfsync: AofFsync,

    // === Replication ===
    /// Propagation backlog size in bytes
    pub repl_backlog_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bloom_capacity: BLOOM_CAPACITY_DEFAULT,
            bloom_expansion: BLOOM_EXPANSION_DEFAULT,
            bloom_fp_rate: BLOOM_FP_RATE_DEFAULT,
            bloom_tightening_ratio: BLOOM_TIGHTENING_DEFAULT,
            bloom_memory_limit: BLOOM_MEMORY_LIMIT_DEFAULT,
            bloom_use_random_seed: true,
            bloom_defrag_enabled: true,
            maxmemory: 0,
            dir: PathBuf::from("."),
            dbfilename: "dump.vdb".to_string(),
            appendonly: false,
            appendfilename: "appendonly.aof".to_string(),
            appendfsync: AofFsync::EverySec,
            repl_backlog_size: 1024 * 1024,
        }
    }
}

impl Config {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-object memory limit.
    pub fn bloom_memory_limit(mut self, bytes: u64) -> Self {
        self.bloom_memory_limit = bytes;
        self
    }

    /// Choose between random and fixed seeding for new objects.
    pub fn bloom_use_random_seed(mut self, random: bool) -> Self {
        self.bloom_use_random_seed = random;
        self
    }

    /// Set the working directory.
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Enable AOF persistence.
    pub fn appendonly(mut self, enabled: bool) -> Self {
        self.appendonly = enabled;
        self
    }

    /// Set the server-wide memory ceiling.
    pub fn maxmemory(mut self, bytes: u64) -> Self {
        self.maxmemory = bytes;
        self
    }

    /// Full path of the snapshot file.
    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(&self.dbfilename)
    }

    /// Full path of the AOF file.
    pub fn aof_path(&self) -> PathBuf {
        self.dir.join(&self.appendfilename)
    }

    /// Load configuration from a file.
    ///
    /// The file uses one `directive value` pair per line; `#` starts a comment.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (directive, value) =
                Self::parse_line(line).ok_or_else(|| ConfigError::ParseError {
                    line: line_num + 1,
                    message: "Invalid directive format".to_string(),
                })?;

            match config.apply_directive(&directive.to_lowercase(), value) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(line = line_num + 1, directive, "unknown config directive");
                }
                Err(message) => {
                    return Err(ConfigError::ParseError {
                        line: line_num + 1,
                        message,
                    });
                }
            }
        }

        Ok(config)
    }

    /// Change a setting at runtime (`CONFIG SET`).
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        let name = name.to_lowercase();
        let mut updated = self.clone();
        match updated.apply_directive(&name, value) {
            Ok(true) => {
                *self = updated;
                Ok(())
            }
            Ok(false) => Err(ConfigError::UnknownParameter(name)),
            Err(message) => Err(ConfigError::InvalidValue { name, message }),
        }
    }

    /// Read a setting (`CONFIG GET`).
    pub fn get(&self, name: &str) -> Option<String> {
        let value = match name.to_lowercase().as_str() {
            "bf.bloom-capacity" => self.bloom_capacity.to_string(),
            "bf.bloom-expansion" => self.bloom_expansion.to_string(),
            "bf.bloom-fp-rate" => self.bloom_fp_rate.to_string(),
            "bf.bloom-tightening-ratio" => self.bloom_tightening_ratio.to_string(),
            "bf.bloom-memory-usage-limit" => self.bloom_memory_limit.to_string(),
            "bf.bloom-use-random-seed" => yes_no(self.bloom_use_random_seed),
            "bf.bloom-defrag-enabled" => yes_no(self.bloom_defrag_enabled),
            "maxmemory" => self.maxmemory.to_string(),
            "dir" => self.dir.display().to_string(),
            "dbfilename" => self.dbfilename.clone(),
            "appendonly" => yes_no(self.appendonly),
            "appendfilename" => self.appendfilename.clone(),
            "repl-backlog-size" => self.repl_backlog_size.to_string(),
            _ => return None,
        };
        Some(value)
    }

    /// Parse a single config line into directive and value.
    fn parse_line(line: &str) -> Option<(&str, &str)> {
        let mut parts = line.splitn(2, |c: char| c.is_whitespace());
        let directive = parts.next()?.trim();
        let value = parts.next().map(|v| v.trim()).unwrap_or("");

        let value = if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            &value[1..value.len() - 1]
        } else {
            value
        };

        Some((directive, value))
    }

    /// Apply one directive. Returns `Ok(false)` for unknown directives.
    fn apply_directive(&mut self, directive: &str, value: &str) -> Result<bool, String> {
        match directive {
            // Bloom defaults
            "bf.bloom-capacity" => {
                let capacity: i64 = parse_number(value)?;
                if capacity < 1 {
                    return Err(format!("bf.bloom-capacity must be between 1 and {}", i64::MAX));
                }
                self.bloom_capacity = capacity;
            }
            "bf.bloom-expansion" => {
                let expansion: u32 = parse_number(value)?;
                if expansion < 1 {
                    return Err(format!("bf.bloom-expansion must be between 1 and {}", u32::MAX));
                }
                self.bloom_expansion = expansion;
            }
            "bf.bloom-fp-rate" => {
                self.bloom_fp_rate = parse_open_unit(value, CommandError::ErrorRateRange)?;
            }
            "bf.bloom-tightening-ratio" => {
                self.bloom_tightening_ratio =
                    parse_open_unit(value, CommandError::TighteningRatioRange)?;
            }
            "bf.bloom-memory-usage-limit" => {
                let limit = parse_memory(value)?;
                if limit == 0 || limit > i64::MAX as u64 {
                    return Err(format!(
                        "bf.bloom-memory-usage-limit must be between 1 and {}",
                        i64::MAX
                    ));
                }
                self.bloom_memory_limit = limit;
            }
            "bf.bloom-use-random-seed" => self.bloom_use_random_seed = parse_bool(value)?,
            "bf.bloom-defrag-enabled" => self.bloom_defrag_enabled = parse_bool(value)?,

            // Limits
            "maxmemory" => self.maxmemory = parse_memory(value)?,

            // Persistence
            "dir" => self.dir = PathBuf::from(value),
            "dbfilename" => self.dbfilename = value.to_string(),
            "appendonly" => self.appendonly = parse_bool(value)?,
            "appendfilename" => self.appendfilename = value.to_string(),
            "appendfsync" => {
                self.appendfsync = AofFsync::from_str(value)
                    .ok_or_else(|| format!("Invalid appendfsync: {value}"))?;
            }

            // Replication
            "repl-backlog-size" => self.repl_backlog_size = parse_memory(value)? as usize,

            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    /// I/O error reading config file.
    IoError(String),
    /// Parse error in config file.
    ParseError { line: usize, message: String },
    /// Runtime set of an unknown parameter.
    UnknownParameter(String),
    /// Runtime set with a value outside the parameter's bounds.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(msg) => write!(f, "Config I/O error: {msg}"),
            ConfigError::ParseError { line, message } => {
                write!(f, "Config error at line {line}: {message}")
            }
            ConfigError::UnknownParameter(name) => {
                write!(f, "ERR Unknown option or number of arguments for CONFIG SET - '{name}'")
            }
            ConfigError::InvalidValue { message, .. } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for crate::Error {
    fn from(e: ConfigError) -> Self {
        crate::Error::Config(e.to_string())
    }
}

// Helper functions for parsing

fn yes_no(flag: bool) -> String {
    if flag { "yes" } else { "no" }.to_string()
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_lowercase().as_str() {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        _ => Err(format!("Invalid boolean: {value}")),
    }
}

fn parse_number<T: std::str::FromStr>(value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid number: {value}"))
}

/// Parse a float that must lie strictly between 0 and 1.
fn parse_open_unit(value: &str, range_error: CommandError) -> Result<f64, String> {
    let parsed: f64 = value
        .parse()
        .map_err(|_| format!("Invalid number: {value}"))?;
    if parsed > 0.0 && parsed < 1.0 {
        Ok(parsed)
    } else {
        Err(range_error.to_string())
    }
}

fn parse_memory(value: &str) -> Result<u64, String> {
    let value = value.trim().to_lowercase();

    if value == "0" {
        return Ok(0);
    }

    let (num_str, multiplier): (&str, u64) = if let Some(n) = value.strip_suffix("gb") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = value.strip_suffix("mb") {
        (n, 1024 * 1024)
    } else if let Some(n) = value.strip_suffix("kb") {
        (n, 1024)
    } else if let Some(n) = value.strip_suffix('g') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = value.strip_suffix('m') {
        (n, 1024 * 1024)
    } else if let Some(n) = value.strip_suffix('k') {
        (n, 1024)
    } else {
        (value.as_str(), 1)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid memory value: {value}"))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| format!("Memory value out of range: {value}"))
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bloom_capacity, 100);
        assert_eq!(config.bloom_expansion, 2);
        assert_eq!(config.bloom_fp_rate, 0.01);
        assert_eq!(config.bloom_tightening_ratio, 0.5);
        assert_eq!(config.bloom_memory_limit, 128 * 1024 * 1024);
        assert!(config.bloom_use_random_seed);
        assert!(config.bloom_defrag_enabled);
    }

    #[test]
    fn test_parse_config() {
        let config_str = r#"
# Bloom defaults
bf.bloom-capacity 1000
bf.bloom-expansion 4
bf.bloom-fp-rate 0.001
bf.bloom-tightening-ratio 0.8
bf.bloom-memory-usage-limit 64mb
bf.bloom-use-random-seed no
maxmemory 1gb
dbfilename "bloom.vdb"
appendonly yes
"#;

        let config = Config::parse(config_str).unwrap();
        assert_eq!(config.bloom_capacity, 1000);
        assert_eq!(config.bloom_expansion, 4);
        assert_eq!(config.bloom_fp_rate, 0.001);
        assert_eq!(config.bloom_tightening_ratio, 0.8);
        assert_eq!(config.bloom_memory_limit, 64 * 1024 * 1024);
        assert!(!config.bloom_use_random_seed);
        assert_eq!(config.maxmemory, 1024 * 1024 * 1024);
        assert_eq!(config.dbfilename, "bloom.vdb");
        assert!(config.appendonly);
    }

    #[test]
    fn test_parse_rejects_out_of_range() {
        let err = Config::parse("bf.bloom-fp-rate 1.5").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Config error at line 1: ERR (0 < error rate range < 1)"
        );
        assert!(Config::parse("bf.bloom-capacity 0").is_err());
        assert!(Config::parse("bf.bloom-expansion 0").is_err());
    }

    #[test]
    fn test_runtime_set() {
        let mut config = Config::default();
        config.set("BF.BLOOM-CAPACITY", "500").unwrap();
        assert_eq!(config.bloom_capacity, 500);
        assert_eq!(config.get("bf.bloom-capacity").as_deref(), Some("500"));

        let err = config.set("bf.bloom-tightening-ratio", "0").unwrap_err();
        assert_eq!(err.to_string(), "ERR (0 < tightening ratio range < 1)");
        let err = config.set("bf.bloom-fp-rate", "1").unwrap_err();
        assert_eq!(err.to_string(), "ERR (0 < error rate range < 1)");
        assert_eq!(config.bloom_tightening_ratio, 0.5);

        assert!(matches!(
            config.set("no-such-option", "1"),
            Err(ConfigError::UnknownParameter(_))
        ));
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("1024").unwrap(), 1024);
        assert_eq!(parse_memory("1kb").unwrap(), 1024);
        assert_eq!(parse_memory("1mb").unwrap(), 1024 * 1024);
        assert_eq!(parse_memory("1gb").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory("512m").unwrap(), 512 * 1024 * 1024);
        assert!(parse_memory("lots").is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("yes").unwrap());
        assert!(parse_bool("true").unwrap());
        assert!(!parse_bool("no").unwrap());
        assert!(!parse_bool("0").unwrap());
        assert!(parse_bool("maybe").is_err());
    }
}
