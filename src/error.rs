//! Error types for paildb

use std::io;
use thiserror::Error;

/// The main error type for paildb operations
#[derive(Error, Debug)]
pub enum Error {
    /// Open was called on a database that is already open
    #[error("database already open")]
    DatabaseOpen,

    /// An operation was attempted on a closed database
    #[error("database not open")]
    DatabaseNotOpen,

    /// Both meta pages failed validation (magic, version or checksum)
    #[error("invalid database")]
    Invalid,

    /// The file was written by an incompatible engine version
    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Version this engine writes
        expected: u32,
        /// Version found in the meta page
        found: u32,
    },

    /// An existing, non-empty file is shorter than four pages
    #[error("file size too small")]
    FileTooSmall,

    /// The serialized freelist no longer fits the page count field
    #[error("freelist overflow")]
    FreelistOverflow,

    /// The named bucket does not exist
    #[error("bucket not found")]
    BucketNotFound,

    /// A bucket with that name already exists
    #[error("bucket already exists")]
    BucketExists,

    /// An empty key (or bucket name) was supplied
    #[error("key required")]
    KeyRequired,

    /// I/O error surfaced verbatim from the OS
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Stat failed while sizing the file
    #[error("stat error: {0}")]
    Stat(#[source] io::Error),

    /// Memory-mapping the file failed
    #[error("mmap error: {0}")]
    Mmap(#[source] io::Error),

    /// Truncating the file to the mapped size failed
    #[error("truncate error: {0}")]
    Truncate(#[source] io::Error),

    /// Neither meta page could be used on open
    #[error("meta error: {0}")]
    Meta(#[source] Box<Error>),
}

/// Result type alias for paildb operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error (possibly wrapped) is the invalid-database kind.
    pub fn is_invalid(&self) -> bool {
        match self {
            Error::Invalid => true,
            Error::Meta(inner) => inner.is_invalid(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_contexts() {
        let err = Error::Meta(Box::new(Error::Invalid));
        assert_eq!(err.to_string(), "meta error: invalid database");
        assert!(err.is_invalid());

        let err = Error::Stat(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(err.to_string().starts_with("stat error"));
    }
}
