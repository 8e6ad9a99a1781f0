//! Application error types.
//!
//! Defines `Error` variants for the failure modes of the ingest core:
//! NNTP protocol and connection errors, embedded-database errors,
//! migration failures, validation failures, and shutdown observation.
//! Transient lock errors never reach callers; they are absorbed by the
//! retry wrapper in `storage::retry`.

use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A store was used before it was configured.
    #[error("store is not configured: {0}")]
    ConfigMissing(&'static str),

    /// Configuration file or flag validation errors.
    #[error("configuration error: {0}")]
    Config(String),

    /// File system or socket I/O errors.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Embedded database errors that survived the retry wrapper.
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// Schema migration failures.
    #[error("migration failed: {0}")]
    Migration(String),

    /// The remote server does not carry the requested group.
    #[error("no such newsgroup: {0}")]
    NewsgroupNotFound(String),

    /// A requested row does not exist.
    #[error("not found")]
    NotFound,

    /// NNTP status line outside the expected range.
    #[error("nntp protocol error {code}: {message}")]
    Protocol { code: u16, message: String },

    /// Malformed or unexpected NNTP response data.
    #[error("invalid nntp response: {0}")]
    InvalidResponse(String),

    /// Connection establishment or teardown errors.
    #[error("connection error: {0}")]
    Connection(String),

    /// Rejected input, e.g. an out-of-range or locked setting.
    #[error("validation error: {0}")]
    Validation(String),

    /// The operation observed the process-wide shutdown signal.
    #[error("shutting down")]
    Shutdown,
}

impl Error {
    /// True for errors that mean "the row/group simply isn't there",
    /// which long-running fetch loops skip rather than abort on.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound | Error::NewsgroupNotFound(_))
            || matches!(self, Error::Db(rusqlite::Error::QueryReturnedNoRows))
    }
}
