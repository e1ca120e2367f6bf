//! SQLite persistence for the favicache icon cache.
//!
//! This crate owns the durable half of the cache: the connection pool and
//! schema lifecycle ([`Database`]) and the prepared operations the sync
//! engine issues against it ([`Repository`]). It knows nothing about retain
//! counts, pending sets, or notifications — it consumes immutable
//! [`IconSnapshot`]/[`PageSnapshot`] values and answers URL-keyed queries.
//!
//! # Schema
//! Four tables: `pages` maps page URLs onto icon ids, `icons` holds each
//! icon's URL and last-retrieved timestamp, `icon_data` holds the raw image
//! blob (NULL = fetched but empty), and `metadata` stores the schema
//! version stamp plus one-shot flags. Blob rows are kept out of `icons` so
//! the startup URL import never pages image data into memory.

mod db;
pub mod error;
mod models;
mod repo;

pub use crate::db::{CURRENT_SCHEMA_VERSION, Database};
pub use crate::models::{IconSnapshot, ImportedRow, PageRow, PageSnapshot};
pub use crate::repo::{Repository, StoreTransaction};
