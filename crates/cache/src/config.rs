//! Cache configuration.

use serde::Deserialize;
use std::time::Duration;

/// Default database filename, used when the embedder has no opinion.
pub const DEFAULT_DATABASE_FILENAME: &str = "PageIcons.db";

/// Icons older than this are considered stale and worth re-fetching.
const DEFAULT_ICON_EXPIRY: Duration = Duration::from_secs(60 * 60 * 24 * 4);

/// How long scheduled writes are debounced before the engine flushes them.
/// Re-armed by every new write so a burst of sets commits as one
/// transaction.
const DEFAULT_WRITE_DELAY: Duration = Duration::from_secs(5);

/// Tunables for an [`IconCache`](crate::IconCache).
///
/// The defaults match browsing workloads; tests typically shrink
/// `write_delay` so flushes happen promptly.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Age at which [`load_decision_for_icon_url`](crate::IconCache::load_decision_for_icon_url)
    /// starts answering `Yes` for a known icon.
    #[serde(with = "duration_seconds")]
    pub icon_expiry: Duration,
    /// Debounce interval between a scheduled write and its flush.
    #[serde(with = "duration_seconds")]
    pub write_delay: Duration,
    /// Run `PRAGMA integrity_check` on the next open even without crash
    /// evidence (a leftover journal always triggers the check).
    pub check_integrity_on_open: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            icon_expiry: DEFAULT_ICON_EXPIRY,
            write_delay: DEFAULT_WRITE_DELAY,
            check_integrity_on_open: false,
        }
    }
}

mod duration_seconds {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs_f64(f64::deserialize(de)?))
    }
}
