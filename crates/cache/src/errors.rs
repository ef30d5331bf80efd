//! Error types for the cache engine
//!
//! Corruption is always fatal to the entry it was detected on: the file layer
//! dooms the entry's files and the error carries diagnostic detail only.
//! Callers of the backend distinguish three outcomes: success, a clean
//! `NotFound`, and failure.

use crate::hashing::EntryHash;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Error type for cache operations
#[derive(Debug)]
pub enum CacheError {
    /// I/O error during a cache operation
    Io {
        path: PathBuf,
        operation: &'static str,
        source: io::Error,
    },

    /// On-disk state for an entry failed validation; the entry's files have
    /// been doomed by the time this is returned
    Corruption {
        hash: EntryHash,
        violation: FormatViolation,
    },

    /// Entry does not exist (cache miss); a normal outcome, not a failure
    NotFound,

    /// Create attempted while the entry's files already exist on disk
    AlreadyExists,

    /// Invalid configuration or misuse of the API
    Config { message: String },

    /// The backend was dropped while the operation was queued or running
    ShutDown,
}

/// The specific way an on-disk record failed validation
///
/// Diagnostic only: every violation is handled identically (doom the entry),
/// but logs need to tell truncation apart from corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatViolation {
    /// A record read returned fewer bytes than the format requires
    TruncatedRead,
    /// Magic number mismatch in a header or EOF record
    BadMagic,
    /// Format version is not one this build understands
    BadVersion,
    /// Key bytes stored in the file do not match their recorded hash
    KeyMismatch,
    /// Payload CRC32 did not match the recorded checksum
    CrcMismatch,
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, operation: &'static str, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            operation,
            source,
        }
    }

    pub(crate) fn corrupt(hash: EntryHash, violation: FormatViolation) -> Self {
        Self::Corruption { hash, violation }
    }

    /// True if this error is the non-exceptional cache-miss outcome
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

impl fmt::Display for FormatViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TruncatedRead => "truncated record",
            Self::BadMagic => "magic number mismatch",
            Self::BadVersion => "unsupported format version",
            Self::KeyMismatch => "stored key does not match its hash",
            Self::CrcMismatch => "CRC32 mismatch",
        };
        f.write_str(s)
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io {
                path,
                operation,
                source,
            } => write!(
                f,
                "I/O error during {} on '{}': {}",
                operation,
                path.display(),
                source
            ),
            Self::Corruption { hash, violation } => {
                write!(f, "corruption detected for entry {hash}: {violation}")
            }
            Self::NotFound => write!(f, "entry not found"),
            Self::AlreadyExists => write!(f, "entry already exists"),
            Self::Config { message } => write!(f, "configuration error: {message}"),
            Self::ShutDown => write!(f, "cache is shut down"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
