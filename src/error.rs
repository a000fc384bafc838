//! Error types for viator-bloom.
//!
//! Client-facing variants render the exact reply text sent back to callers,
//! so `to_string()` on a `CommandError` or `BloomError` is the wire error.
//! Every error can also be classified into an [`ErrorKind`] for callers that
//! branch on the failure class rather than the message.

use std::io;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Command execution errors
    #[error("command error: {0}")]
    Command(#[from] CommandError),

    /// Snapshot / AOF errors
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Failure class of an error, independent of its reply text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed argument values or wrong arity
    BadArgument,
    /// Operation on an absent key that requires existence
    NotFound,
    /// Creation on a key that already holds a value
    AlreadyExists,
    /// Key holds a value of another type
    WrongType,
    /// Non-scaling filter is full
    CapacityExhausted,
    /// Projected size over the per-object or server-wide ceiling
    ResourceLimitExceeded,
    /// Scaling would drive the error rate to zero
    ScaleDegradation,
    /// Mutually exclusive creation options
    ConflictingOptions,
    /// Persisted bytes failed validation
    CorruptPersistedState,
}

/// Errors raised by the bloom object itself (creation, scaling, decoding).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloomError {
    #[error("ERR non scaling filter is full")]
    NonScalingFilterFull,

    #[error("ERR bloom object reached max number of filters")]
    MaxNumScalingFilters,

    #[error("ERR operation exceeds bloom object memory limit")]
    ExceedsMemoryLimit,

    #[error("ERR false positive degrades to 0 on scale out")]
    FalsePositiveReachesZero,

    #[error("ERR bad capacity")]
    BadCapacity,

    #[error("ERR bad error rate")]
    BadErrorRate,

    #[error("ERR bad expansion")]
    BadExpansion,

    #[error("ERR bad tightening ratio")]
    BadTighteningRatio,

    #[error("ERR provided VALIDATESCALETO causes bloom object to exceed memory limit")]
    ValidateScaleToExceedsMemoryLimit,

    #[error("ERR provided VALIDATESCALETO causes false positive to degrade to 0")]
    ValidateScaleToFalsePositiveInvalid,

    #[error("ERR cannot use NONSCALING and VALIDATESCALETO options together")]
    NonScalingWithValidateScaleTo,

    #[error("ERR invalid seed")]
    InvalidSeed,

    #[error("ERR bloom object decoding failed")]
    DecodeFailed,

    #[error("ERR bloom object decoding failed. Unsupported version")]
    DecodeUnsupportedVersion,
}

impl BloomError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NonScalingFilterFull => ErrorKind::CapacityExhausted,
            Self::MaxNumScalingFilters
            | Self::ExceedsMemoryLimit
            | Self::ValidateScaleToExceedsMemoryLimit => ErrorKind::ResourceLimitExceeded,
            Self::FalsePositiveReachesZero | Self::ValidateScaleToFalsePositiveInvalid => {
                ErrorKind::ScaleDegradation
            }
            Self::BadCapacity
            | Self::BadErrorRate
            | Self::BadExpansion
            | Self::BadTighteningRatio
            | Self::InvalidSeed => ErrorKind::BadArgument,
            Self::NonScalingWithValidateScaleTo => ErrorKind::ConflictingOptions,
            Self::DecodeFailed | Self::DecodeUnsupportedVersion => {
                ErrorKind::CorruptPersistedState
            }
        }
    }
}

/// Command execution errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Unknown command
    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    /// Wrong number of arguments
    #[error("ERR wrong number of arguments for '{command}' command")]
    WrongArity {
        /// Command name that received wrong arity
        command: String,
    },

    /// Wrong type for operation
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    /// Key required by the command does not exist
    #[error("ERR not found")]
    NotFound,

    /// BF.RESERVE on a key that already holds an object
    #[error("ERR item exists")]
    ItemExists,

    /// BF.LOAD on a key that already exists
    #[error("BUSYKEY Target key name already exists.")]
    BusyKey,

    #[error("ERR invalid information value")]
    InvalidInfoValue,

    #[error("ERR (0 < error rate range < 1)")]
    ErrorRateRange,

    #[error("ERR (0 < tightening ratio range < 1)")]
    TighteningRatioRange,

    #[error("ERR (capacity should be larger than 0)")]
    CapacityZero,

    #[error("ERR unknown argument received")]
    UnknownArgument,

    /// Server-wide memory ceiling reached
    #[error("OOM command not allowed when used memory > 'maxmemory'")]
    OutOfMemory,

    /// Engine-level failure
    #[error(transparent)]
    Bloom(#[from] BloomError),
}

impl CommandError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownCommand(_)
            | Self::WrongArity { .. }
            | Self::InvalidInfoValue
            | Self::ErrorRateRange
            | Self::TighteningRatioRange
            | Self::CapacityZero
            | Self::UnknownArgument => ErrorKind::BadArgument,
            Self::WrongType => ErrorKind::WrongType,
            Self::NotFound => ErrorKind::NotFound,
            Self::ItemExists | Self::BusyKey => ErrorKind::AlreadyExists,
            Self::OutOfMemory => ErrorKind::ResourceLimitExceeded,
            Self::Bloom(e) => e.kind(),
        }
    }
}

/// Snapshot and AOF errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Persistence error
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Corrupted file framing
    #[error("corrupted data: {0}")]
    Corrupted(String),

    /// Checksum mismatch
    #[error("checksum mismatch: expected {expected:#018x}, got {actual:#018x}")]
    ChecksumMismatch {
        /// Checksum computed over the file contents
        expected: u64,
        /// Checksum stored in the file
        actual: u64,
    },

    /// Version mismatch
    #[error("unsupported VDB version: {0}")]
    UnsupportedVersion(u32),

    /// A stored object failed validation
    #[error("bloom object '{key}' failed to load: {reason}")]
    CorruptPersistedState {
        /// Key of the offending object
        key: String,
        /// Validation failure
        reason: String,
    },

    /// I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<BloomError> for Error {
    fn from(e: BloomError) -> Self {
        Error::Command(CommandError::Bloom(e))
    }
}

impl Error {
    /// Failure class, if the error belongs to the engine taxonomy.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Command(e) => Some(e.kind()),
            Error::Storage(StorageError::CorruptPersistedState { .. }) => {
                Some(ErrorKind::CorruptPersistedState)
            }
            _ => None,
        }
    }

    /// Returns true if this is a client error.
    #[inline]
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::Command(_))
    }

    /// Converts the error to a reply error string.
    #[must_use]
    pub fn to_reply_string(&self) -> String {
        match self {
            Error::Command(e) => e.to_string(),
            Error::Storage(e) => format!("ERR {e}"),
            Error::Io(e) => format!("ERR I/O error: {e}"),
            Error::Config(e) => format!("ERR configuration error: {e}"),
            Error::Internal(e) => format!("ERR internal error: {e}"),
        }
    }
}
