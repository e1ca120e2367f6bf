//! Persistent, retain-counted favicon cache.
//!
//! Maps page URLs to icon URLs and cached icon image bytes, durably backed
//! by SQLite through [`favicache-store`](favicache_store). The design is a
//! deliberate split between two worlds:
//!
//! - **Client threads** call into [`IconCache`] — retain/release page URLs,
//!   set mappings and fetched bytes, ask non-blocking questions. These
//!   calls mutate in-memory records under a single lock and never touch
//!   the disk.
//! - **One background sync engine** owns all store I/O. On startup it
//!   validates the schema, runs the one-time legacy import, and streams
//!   the persisted URL mappings into memory; afterwards it drains
//!   coalesced write batches and pending icon reads whenever it is woken,
//!   and prunes rows nobody retains once per run.
//!
//! Answers flow back asynchronously through a [`CacheObserver`]: "icon URL
//! known", "icon data known", "all icons removed" and "import finished"
//! callbacks delivered by a dispatcher task with no locks held.
//!
//! # Example
//!
//! ```no_run
//! use favicache::IconCache;
//!
//! # async fn example() -> favicache::error::Result<()> {
//! let cache = IconCache::new();
//! cache.open("/var/cache/browser", favicache::DEFAULT_DATABASE_FILENAME).await?;
//!
//! cache.retain_page_url("http://example.com/");
//! cache.set_icon_url_for_page_url("http://example.com/favicon.ico", "http://example.com/");
//! // A loader would now consult load_decision_for_icon_url, fetch, and:
//! cache.set_icon_data_for_icon_url(vec![/* bytes */], "http://example.com/favicon.ico");
//!
//! cache.close().await;
//! # Ok(())
//! # }
//! ```

mod cache;
mod config;
pub mod error;
mod legacy;
mod notify;
mod record;
mod state;
mod sync;
#[cfg(test)]
mod testutil;

pub use crate::cache::{IconCache, LoadDecision};
pub use crate::config::{CacheConfig, DEFAULT_DATABASE_FILENAME};
pub use crate::legacy::{LegacyImportSession, LegacyImporter};
pub use crate::notify::CacheObserver;
pub use crate::record::{CachedIcon, IconSize};
pub use favicache_store as store;
