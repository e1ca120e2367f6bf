//! Cache Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.
//!
//! Only [`IconCache::open`](crate::IconCache::open) can fail; every query
//! and mutation is designed to answer "unknown yet" or no-op instead of
//! erroring. Failures inside the sync engine are logged and recovered
//! internally (rebuild on corruption, skip on statement failure), with one
//! exception: a database written by a newer schema shuts the engine down
//! and the cache stays memory-only.

use derive_more::{Display, Error};

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The cache is already open; close it first.
    #[display("icon cache is already open")]
    AlreadyOpen,
    /// The database directory could not be created.
    #[display("could not create cache directory")]
    Directory,
    /// The persistent store could not be created or opened.
    #[display("could not open the icon store")]
    Store,
}
