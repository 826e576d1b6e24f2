//! Error types for the tsmfix codecs.

use std::io;
use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding on-disk state.
#[derive(Debug, Error)]
pub enum CodecError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// File does not start (or end) with the expected magic bytes.
    #[error("invalid magic bytes: {actual:02x?}")]
    InvalidMagic {
        /// The bytes that were found instead.
        actual: [u8; 4],
    },

    /// File was written by a newer format version.
    #[error("unsupported format version: {version}")]
    UnsupportedVersion {
        /// The version found in the header.
        version: u16,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// File structure is corrupted or truncated.
    #[error("corrupt file: {message}")]
    Corrupt {
        /// Description of the corruption.
        message: String,
    },

    /// A value block could not be decoded.
    #[error("value decode failed: {message}")]
    ValueDecode {
        /// Description of the failure.
        message: String,
    },

    /// A value batch mixes payload variants.
    #[error("mixed value types in batch: {first} and {second}")]
    MixedTypes {
        /// Type of the first value.
        first: &'static str,
        /// Type of the offending value.
        second: &'static str,
    },

    /// Keys were written out of order.
    #[error("key written out of sorted order: {key:?}")]
    UnsortedKey {
        /// The offending key, lossily decoded.
        key: String,
    },

    /// Snappy compression or decompression failed.
    #[error("snappy error: {0}")]
    Snappy(#[from] snap::Error),
}

impl CodecError {
    /// Creates a corruption error.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }

    /// Creates a value decode error.
    pub fn value_decode(message: impl Into<String>) -> Self {
        Self::ValueDecode {
            message: message.into(),
        }
    }
}
