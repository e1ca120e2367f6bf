//! Store Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};

/// A store error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong
/// internally. Individual statement failures inside a batch are logged and
/// skipped rather than surfaced here; these kinds cover the failures the
/// sync engine has to react to.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// Failed an integrity check, or the expected tables/stamps are absent.
    /// Recovered by rebuilding the database from scratch.
    #[display("database corrupt or unreadable")]
    Corrupt,
    /// The on-disk schema was written by a newer release. The database is
    /// left untouched and must not be written to.
    #[display("database schema version {_0} is newer than supported")]
    VersionTooNew(#[error(not(source))] i64),
    /// A value read from the database failed to convert.
    #[display("invalid stored data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database)
    }

    /// Returns `true` if the database should be wiped and recreated.
    pub fn is_rebuildable(&self) -> bool {
        matches!(self, Self::Corrupt | Self::Migration)
    }
}
