//! One-time legacy import.
//!
//! Embedders migrating from an earlier icon store can supply a
//! [`LegacyImporter`]. It runs exactly once per database lifetime, guarded
//! by a persisted flag, after the schema check and before the URL import.
//! The whole import is one transaction: if the importer reports failure
//! (or the cache is shutting down) everything rolls back and the flag
//! stays unset, so a later open retries it.

use crate::record::unix_now;
use async_trait::async_trait;
use favicache_store::error::Result as StoreResult;
use favicache_store::{IconSnapshot, StoreTransaction};
use tokio_util::sync::CancellationToken;

/// Write access to the store, scoped to the legacy-import transaction.
pub struct LegacyImportSession<'a> {
    tx: &'a mut StoreTransaction,
    cancel: CancellationToken,
}

impl<'a> LegacyImportSession<'a> {
    pub(crate) fn new(tx: &'a mut StoreTransaction, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// Whether the cache is shutting down. Long imports should poll this
    /// between rows and bail out with `false`; the rolled-back import runs
    /// again on the next open.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record a page → icon mapping from the legacy store.
    pub async fn import_icon_url_for_page_url(
        &mut self,
        icon_url: &str,
        page_url: &str,
    ) -> StoreResult<()> {
        self.tx.set_icon_url_for_page_url(icon_url, page_url).await
    }

    /// Record an icon's image bytes from the legacy store. The data is
    /// stamped with the current time; legacy stores predate timestamps.
    pub async fn import_icon_data_for_icon_url(
        &mut self,
        data: Vec<u8>,
        icon_url: &str,
    ) -> StoreResult<()> {
        self.tx.write_icon(&IconSnapshot::new(icon_url, unix_now(), Some(data))).await
    }
}

/// Embedder-supplied migration from a previous icon store.
#[async_trait]
pub trait LegacyImporter: Send + Sync + 'static {
    /// Copy whatever the legacy store holds into the session. Return `false`
    /// to roll the import back and retry it on a future open.
    async fn perform_import(&self, session: &mut LegacyImportSession<'_>) -> bool;
}
