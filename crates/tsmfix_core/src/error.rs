//! Error types for the tsmfix core.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur while loading rules or rewriting shards.
#[derive(Debug, Error)]
pub enum CoreError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Codec error from the segment, WAL or index layer.
    #[error("codec error: {0}")]
    Codec(#[from] tsmfix_codec::CodecError),

    /// The configuration file could not be parsed.
    #[error("config parse failed: {}: {}", .path.display(), .message)]
    ConfigParse {
        /// Path of the offending file.
        path: PathBuf,
        /// Description of the problem.
        message: String,
    },

    /// A rule name is not registered.
    #[error("no registered rule '{name}'")]
    UnknownRule {
        /// The unregistered name.
        name: String,
    },

    /// A filter name is not registered.
    #[error("no registered filter '{name}'")]
    UnknownFilter {
        /// The unregistered name.
        name: String,
    },

    /// A filter sub-table is malformed.
    #[error("invalid filter configuration '{name}': {message}")]
    InvalidFilter {
        /// The filter field or name concerned.
        name: String,
        /// Description of the problem.
        message: String,
    },

    /// A configuration value has the wrong shape or type.
    #[error("invalid configuration value '{key}': {message}")]
    InvalidValue {
        /// The offending key.
        key: String,
        /// Description of the problem.
        message: String,
    },

    /// A rule config is missing its measurement filter.
    #[error("missing measurement filter")]
    MissingMeasurementFilter,

    /// A rule config is missing its tag filter.
    #[error("missing tag filter")]
    MissingTagFilter,

    /// A rule config is missing its tag key filter.
    #[error("missing tag key filter")]
    MissingTagKeyFilter,

    /// A rule config is missing its tag value filter.
    #[error("missing tag value filter")]
    MissingTagValueFilter,

    /// A rule config is missing its field filter.
    #[error("missing field filter")]
    MissingFieldFilter,

    /// A rename rule config is missing its 'to' template.
    #[error("missing rename 'to'")]
    MissingRenameTo,

    /// A rename rule config is missing its 'from' filter.
    #[error("missing from filter")]
    MissingFromFilter,

    /// A regular expression failed to compile.
    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// An unknown field type name was configured.
    #[error("unknown field type '{name}'")]
    UnknownFieldType {
        /// The unparsable name.
        name: String,
    },

    /// A value could not be cast to the requested type.
    #[error("type cast failed: {message}")]
    TypeCast {
        /// Description of the failure.
        message: String,
    },

    /// A write would overflow the rewrite cache.
    #[error("cache full: writing {requested} bytes would exceed the {max} byte cap")]
    CacheFull {
        /// Bytes the cache would have reached.
        requested: u64,
        /// The configured hard cap.
        max: u64,
    },

    /// Full compaction yielded more than one segment.
    #[error("full compaction produced {} files, expected one", .files.len())]
    FullCompaction {
        /// The files that were produced.
        files: Vec<PathBuf>,
    },

    /// The field index could not be persisted.
    #[error("field index persist failed: {}: {}", .path.display(), .message)]
    IndexPersist {
        /// Path of the index file.
        path: PathBuf,
        /// Description of the failure.
        message: String,
    },

    /// A rewritten file could not be moved into place.
    #[error("rename failed: {} -> {}: {}", .from.display(), .to.display(), .source)]
    Rename {
        /// Source path.
        from: PathBuf,
        /// Destination path.
        to: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// A shard directory has a non-numeric name.
    #[error("invalid shard ID found at path '{}'", .path.display())]
    InvalidShardId {
        /// Path of the shard directory.
        path: PathBuf,
    },

    /// The user declined the root-safety prompt.
    #[error("aborted by user")]
    Aborted,
}

impl CoreError {
    /// Creates a config parse error.
    pub fn config_parse(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::ConfigParse {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Creates an unknown rule error.
    pub fn unknown_rule(name: impl Into<String>) -> Self {
        Self::UnknownRule { name: name.into() }
    }

    /// Creates an unknown filter error.
    pub fn unknown_filter(name: impl Into<String>) -> Self {
        Self::UnknownFilter { name: name.into() }
    }

    /// Creates an invalid filter configuration error.
    pub fn invalid_filter(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidFilter {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid configuration value error.
    pub fn invalid_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Creates an unknown field type error.
    pub fn unknown_field_type(name: impl Into<String>) -> Self {
        Self::UnknownFieldType { name: name.into() }
    }

    /// Creates a type cast error.
    pub fn type_cast(message: impl Into<String>) -> Self {
        Self::TypeCast {
            message: message.into(),
        }
    }

    /// Creates an index persist error.
    pub fn index_persist(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::IndexPersist {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Creates a rename error.
    pub fn rename(from: impl Into<PathBuf>, to: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Rename {
            from: from.into(),
            to: to.into(),
            source,
        }
    }
}
