//! The background sync engine.
//!
//! One engine task per open cache. It is the only code that touches the
//! store, which keeps transaction ordering trivial: startup runs schema
//! validation, the one-time legacy import, and the URL import in sequence,
//! then the steady-state loop alternates write and read passes until there
//! is no work, waits to be woken, and repeats. Termination is cooperative —
//! the cancellation token is polled after every imported row, every read,
//! and every pass — and always ends with a best-effort final flush.

use crate::cache::Shared;
use crate::legacy::{LegacyImportSession, LegacyImporter};
use crate::notify::CacheEvent;
use crate::record::ImageData;
use favicache_store::error::Result as StoreResult;
use favicache_store::{CURRENT_SCHEMA_VERSION, Database, Repository};
use futures::TryStreamExt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How many doomed page rows are deleted per pruning transaction. Between
/// chunks the engine re-checks for cancellation, so shutdown during a large
/// prune commits what is done so far and leaves the rest for a later run.
const PRUNE_CHUNK: usize = 64;

enum Waiting {
    /// There is work to do right now.
    Ready,
    /// Nothing queued; sleep until woken.
    Idle,
    /// Only debounced writes are queued; flush when the deadline passes.
    FlushAt(Instant),
}

pub(crate) struct SyncEngine {
    shared: Arc<Shared>,
    db: Database,
    repo: Repository,
    check_integrity: bool,
    legacy_importer: Option<Arc<dyn LegacyImporter>>,
    /// Pruning runs at most once per engine lifetime.
    pruned: bool,
    /// Dangling-row damage is reported once, not on every write pass.
    danglers_reported: bool,
}

impl SyncEngine {
    pub(crate) fn new(
        shared: Arc<Shared>,
        db: Database,
        check_integrity: bool,
        legacy_importer: Option<Arc<dyn LegacyImporter>>,
    ) -> Self {
        let repo = Repository::from(&db);
        Self { shared, db, repo, check_integrity, legacy_importer, pruned: false, danglers_reported: false }
    }

    fn cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    fn send(&self, event: CacheEvent) {
        // The dispatcher only goes away after the engine does; a send on a
        // closed channel means we are already shutting down.
        _ = self.shared.events.send(event);
    }

    pub(crate) async fn run(mut self) {
        debug!("sync engine started");
        match self.open_initialization().await {
            Ok(true) => {}
            Ok(false) => {
                // Newer schema on disk. Leave it alone entirely: no final
                // write, no migration. The cache stays memory-only.
                self.db.close().await;
                return;
            }
            Err(err) => {
                error!(error = %err, "could not initialize the icon database");
                self.db.close().await;
                return;
            }
        }
        if !self.cancelled() {
            self.legacy_import().await;
        }
        if !self.cancelled() {
            self.url_import().await;
        }
        self.main_loop().await;
        self.drain().await;
    }

    // =========================================================================
    // Startup: schema check
    // =========================================================================

    /// Validate (and if necessary rebuild) the schema. `Ok(false)` means the
    /// database belongs to a newer release and must not be touched.
    async fn open_initialization(&mut self) -> StoreResult<bool> {
        if self.check_integrity {
            let intact = self.db.check_integrity().await.unwrap_or(false);
            if !intact {
                info!("integrity check failed, rebuilding the icon database");
                self.rebuild().await?;
                return Ok(true);
            }
        }
        match self.db.schema_version().await {
            Ok(Some(version)) if version > CURRENT_SCHEMA_VERSION => {
                error!(
                    found = version,
                    supported = CURRENT_SCHEMA_VERSION,
                    "icon database was written by a newer version, refusing to touch it",
                );
                return Ok(false);
            }
            Ok(Some(version)) if version < CURRENT_SCHEMA_VERSION => {
                // There is no in-place upgrade path for old generations;
                // the cache is rebuilt from future fetches instead.
                info!(found = version, "outdated icon database schema, rebuilding");
                self.rebuild().await?;
            }
            Ok(Some(_)) => {
                // Stamp matches; still run the migrator so a half-created
                // schema gets filled in. Failure here means corruption.
                if let Err(err) = self.db.migrate().await {
                    warn!(error = %err, "migration failed on a stamped database, rebuilding");
                    self.rebuild().await?;
                }
            }
            Ok(None) => {
                // Brand new file (or something unrecognizable): migrating
                // creates the schema, and a failure gets one rebuild.
                if let Err(err) = self.db.migrate().await {
                    warn!(error = %err, "could not create schema, rebuilding");
                    self.rebuild().await?;
                }
            }
            Err(err) => {
                warn!(error = %err, "could not read schema version, rebuilding");
                self.rebuild().await?;
            }
        }
        Ok(true)
    }

    async fn rebuild(&mut self) -> StoreResult<()> {
        let db = self.db.clone().rebuild().await?;
        self.repo = Repository::from(&db);
        self.db = db;
        Ok(())
    }

    // =========================================================================
    // Startup: one-time legacy import
    // =========================================================================

    async fn legacy_import(&mut self) {
        match self.repo.legacy_imported().await {
            Ok(true) => return,
            Ok(false) => {}
            Err(err) => {
                warn!(error = %err, "could not read the legacy import flag");
                return;
            }
        }
        let mut tx = match self.repo.begin().await {
            Ok(tx) => tx,
            Err(err) => {
                warn!(error = %err, "could not begin the legacy import");
                return;
            }
        };
        let imported = match &self.legacy_importer {
            Some(importer) => {
                debug!("performing one-time legacy import");
                let mut session =
                    LegacyImportSession::new(&mut tx, self.shared.cancel.clone());
                importer.perform_import(&mut session).await
            }
            // No importer configured: mark the work done so it is never
            // attempted again for this database.
            None => true,
        };
        // The import is atomic: it commits (and latches the flag) only when
        // it ran to completion on a cache that is not shutting down.
        let result = if imported && !self.cancelled() {
            match tx.set_legacy_imported(true).await {
                Ok(()) => tx.commit().await,
                Err(err) => {
                    warn!(error = %err, "could not set the legacy import flag");
                    return;
                }
            }
        } else {
            info!("legacy import cancelled, rolling back");
            tx.rollback().await
        };
        if let Err(err) = result {
            warn!(error = %err, "legacy import failed");
        }
    }

    // =========================================================================
    // Startup: URL import
    // =========================================================================

    /// Stream every persisted page/icon mapping into memory.
    ///
    /// Only mappings for pages someone retains are loaded (unless cleanup
    /// is suppressed); the rest stay on disk for the pruning pass to judge.
    /// Interrupted imports are safe: the import-complete flag stays unset,
    /// so lookups keep answering "not yet known".
    async fn url_import(&mut self) {
        debug!("starting URL import");
        let repo = self.repo.clone();
        let mut rows = repo.import_rows();
        loop {
            match rows.try_next().await {
                Ok(Some(row)) => {
                    let notify = {
                        let mut state = self.shared.state.lock().unwrap();
                        state.apply_imported_row(&row, self.shared.flags.cleanup_suppressed())
                    };
                    if notify {
                        self.send(CacheEvent::IconUrlKnown(row.page_url));
                    }
                    if self.cancelled() {
                        debug!("asked to terminate during the URL import");
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "error reading page/icon mappings from the store");
                    break;
                }
            }
        }
        drop(rows);

        // Every row has been seen. Pages that queried during the import but
        // never showed up now get their authoritative "no icon" answer.
        let to_notify = {
            let mut state = self.shared.state.lock().unwrap();
            state.finish_import(!self.shared.flags.cleanup_suppressed())
        };
        let notified = to_notify.len();
        for page_url in to_notify {
            self.send(CacheEvent::IconUrlKnown(page_url));
            if self.cancelled() {
                return;
            }
        }
        debug!(notified, "URL import complete");
        self.send(CacheEvent::ImportFinished);
    }

    // =========================================================================
    // Steady state
    // =========================================================================

    async fn main_loop(&mut self) {
        while !self.cancelled() {
            if self.take_remove_all_request() {
                self.remove_all_on_thread().await;
            }
            if self.cancelled() {
                break;
            }
            let mut did_any_work = true;
            while did_any_work && !self.cancelled() {
                let wrote = self.write_pass().await;
                if self.cancelled() {
                    break;
                }
                let read = self.read_pass().await;
                if self.cancelled() {
                    break;
                }
                // Prune unretained rows once, after the first write pass has
                // something real on disk to compare memory against.
                if wrote
                    && !self.pruned
                    && !self.shared.flags.cleanup_suppressed()
                    && !self.shared.flags.private_browsing()
                {
                    self.prune_unretained().await;
                    self.pruned = true;
                }
                did_any_work = wrote || read;
            }
            if self.cancelled() {
                break;
            }
            self.wait_for_work().await;
        }
    }

    /// Drain the coalesced pending writes and apply them in one transaction.
    async fn write_pass(&mut self) -> bool {
        let (icons, pages) = {
            let mut state = self.shared.state.lock().unwrap();
            state.drain_writes()
        };
        if icons.is_empty() && pages.is_empty() {
            return false;
        }
        debug!(icons = icons.len(), pages = pages.len(), "flushing pending writes");
        if let Err(err) = self.repo.apply_batch(&icons, &pages).await {
            warn!(error = %err, "write pass failed");
        }
        self.check_dangling_pages(false).await;
        true
    }

    /// Service the pending icon-data reads one by one, re-validating under
    /// the lock before installing each result (a client set newer data in
    /// the meantime if the icon is no longer marked pending).
    async fn read_pass(&mut self) -> bool {
        let pending: Vec<String> = {
            let state = self.shared.state.lock().unwrap();
            state.pending_read.iter().cloned().collect()
        };
        if pending.is_empty() {
            return false;
        }
        for icon_url in pending {
            let bytes = match self.repo.image_data_for_icon_url(&icon_url).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(icon_url, error = %err, "could not read icon data");
                    None
                }
            };
            // Decode outside the lock; installs are pointer swaps.
            let image = ImageData::from_bytes(bytes);
            let to_notify = {
                let mut state = self.shared.state.lock().unwrap();
                state.install_read_result(&icon_url, image)
            };
            for page_url in to_notify {
                self.send(CacheEvent::IconDataKnown(page_url));
            }
            if self.cancelled() {
                return true;
            }
        }
        true
    }

    /// Delete every page row not present in memory, then every icon row no
    /// page references. Runs once per engine lifetime.
    async fn prune_unretained(&mut self) {
        debug!("pruning unretained pages and icons");
        let rows = match self.repo.page_rows().await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "could not list page rows for pruning");
                return;
            }
        };
        let doomed: Vec<i64> = {
            let state = self.shared.state.lock().unwrap();
            rows.into_iter()
                .filter(|row| !state.pages.contains_key(&row.url))
                .map(|row| row.rowid)
                .collect()
        };
        for chunk in doomed.chunks(PRUNE_CHUNK) {
            if let Err(err) = self.repo.delete_pages(chunk).await {
                warn!(error = %err, "could not prune page rows");
            }
            if self.cancelled() {
                return;
            }
        }
        if let Err(err) = self.repo.prune_unreferenced_icons().await {
            warn!(error = %err, "could not prune unreferenced icons");
        }
        self.check_dangling_pages(true).await;
    }

    /// Watch for page rows referencing icons that no longer exist. Reported
    /// once per engine to avoid spamming the log; the pruning pass also
    /// repairs the damage.
    async fn check_dangling_pages(&mut self, repair: bool) {
        if self.danglers_reported && !repair {
            return;
        }
        match self.repo.has_dangling_pages().await {
            Ok(false) | Err(_) => {}
            Ok(true) => {
                self.danglers_reported = true;
                warn!("found page rows referencing missing icons");
                if repair
                    && let Err(err) = self.repo.delete_dangling_pages().await
                {
                    warn!(error = %err, "could not remove dangling page rows");
                }
            }
        }
    }

    fn take_remove_all_request(&self) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        std::mem::take(&mut state.remove_all_requested)
    }

    /// Wipe the on-disk tables. The in-memory half was already cleared by
    /// the client call that requested this.
    async fn remove_all_on_thread(&mut self) {
        info!("removing all icons");
        if let Err(err) = self.db.wipe().await {
            warn!(error = %err, "could not wipe the icon database");
        }
        self.send(CacheEvent::AllIconsRemoved);
    }

    /// Sleep until there is something to do.
    ///
    /// Reads and remove-all requests wake the engine immediately. Writes
    /// are debounced: the flush deadline is re-armed by every scheduled
    /// write, so the engine sleeps to the deadline and re-evaluates on
    /// every wake in between.
    async fn wait_for_work(&self) {
        loop {
            let waiting = {
                let state = self.shared.state.lock().unwrap();
                if state.remove_all_requested || state.has_read_work() {
                    Waiting::Ready
                } else if state.has_write_work() {
                    match state.flush_deadline {
                        Some(deadline) if deadline > Instant::now() => Waiting::FlushAt(deadline),
                        _ => Waiting::Ready,
                    }
                } else {
                    Waiting::Idle
                }
            };
            match waiting {
                Waiting::Ready => return,
                Waiting::Idle => {
                    tokio::select! {
                        _ = self.shared.wake.notified() => {}
                        _ = self.shared.cancel.cancelled() => return,
                    }
                }
                Waiting::FlushAt(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => return,
                        _ = self.shared.wake.notified() => {}
                        _ = self.shared.cancel.cancelled() => return,
                    }
                }
            }
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Best-effort final flush, then close the store.
    async fn drain(&mut self) {
        if self.take_remove_all_request() {
            self.remove_all_on_thread().await;
        }
        debug!("final write-out before closing");
        self.write_pass().await;
        self.db.close().await;
        debug!("sync engine terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{IconCache, LoadDecision};
    use crate::legacy::{LegacyImportSession, LegacyImporter};
    use crate::testutil::{EventLog, png_bytes, test_config};
    use async_trait::async_trait;
    use favicache_store::{IconSnapshot, PageSnapshot};
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const PAGE: &str = "http://a/";
    const ICON: &str = "http://a/icon.png";

    fn new_cache() -> (IconCache, Arc<EventLog>) {
        let cache = IconCache::with_config(test_config());
        let log = Arc::new(EventLog::default());
        cache.set_observer(log.clone());
        (cache, log)
    }

    async fn store_page_urls(path: &Path) -> Vec<String> {
        let db = Database::connect(path).await.unwrap();
        let repo = Repository::from(&db);
        let rows = repo.page_rows().await.unwrap();
        db.close().await;
        rows.into_iter().map(|row| row.url).collect()
    }

    // =========================================================================
    // Schema check
    // =========================================================================

    #[tokio::test]
    async fn test_newer_database_is_left_completely_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("icons.db");
        {
            let db = Database::connect(&path).await.unwrap();
            db.migrate().await.unwrap();
            let repo = Repository::from(&db);
            repo.apply_batch(&[], &[PageSnapshot::new(PAGE, Some(ICON.into()))]).await.unwrap();
            repo.set_metadata("schema_version", "99").await.unwrap();
            db.close().await;
        }

        let (cache, log) = new_cache();
        cache.delay_cleanup();
        cache.open(dir.path(), "icons.db").await.unwrap();
        // The engine shuts down without importing; the cache is memory-only.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!log.contains(&CacheEvent::ImportFinished));
        assert_eq!(cache.icon_url_for_page_url(PAGE), None);
        assert_eq!(cache.load_decision_for_icon_url(ICON), LoadDecision::Unknown);

        // Mutations go nowhere but must not crash.
        cache.set_icon_data_for_icon_url(png_bytes(0), ICON);
        cache.close().await;
        cache.allow_cleanup();

        // Stamp and contents survive for the newer release to find.
        let db = Database::connect(&path).await.unwrap();
        let repo = Repository::from(&db);
        assert_eq!(repo.metadata("schema_version").await.unwrap().as_deref(), Some("99"));
        assert_eq!(repo.page_rows().await.unwrap().len(), 1);
        db.close().await;
    }

    #[tokio::test]
    async fn test_unmigratable_database_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("icons.db");
        {
            // A table squatting on a migrator-owned name, with no version
            // stamp: migration fails and the engine must rebuild.
            let db = Database::connect(&path).await.unwrap();
            sqlx::query("CREATE TABLE pages (bogus TEXT)").execute(db.pool()).await.unwrap();
            db.close().await;
        }

        let (cache, log) = new_cache();
        cache.open(dir.path(), "icons.db").await.unwrap();
        log.wait_for(CacheEvent::ImportFinished).await;

        // The rebuilt database works end to end.
        cache.retain_page_url(PAGE);
        cache.set_icon_url_for_page_url(ICON, PAGE);
        cache.close().await;
        assert_eq!(store_page_urls(&path).await, vec![PAGE.to_string()]);
    }

    // =========================================================================
    // Legacy import
    // =========================================================================

    struct CountingImporter {
        runs: AtomicU32,
    }

    #[async_trait]
    impl LegacyImporter for CountingImporter {
        async fn perform_import(&self, session: &mut LegacyImportSession<'_>) -> bool {
            self.runs.fetch_add(1, Ordering::SeqCst);
            session.import_icon_url_for_page_url(ICON, PAGE).await.unwrap();
            session.import_icon_data_for_icon_url(png_bytes(5), ICON).await.unwrap();
            true
        }
    }

    #[tokio::test]
    async fn test_legacy_import_runs_exactly_once_per_database() {
        let dir = tempfile::tempdir().unwrap();
        let importer = Arc::new(CountingImporter { runs: AtomicU32::new(0) });

        let (cache, log) = new_cache();
        cache.set_legacy_importer(importer.clone());
        cache.delay_cleanup();
        cache.open(dir.path(), "icons.db").await.unwrap();
        log.wait_for(CacheEvent::ImportFinished).await;
        // The legacy rows were committed before the URL import streamed
        // them back in, so the mapping is already visible.
        assert_eq!(cache.icon_url_for_page_url(PAGE).as_deref(), Some(ICON));
        cache.close().await;

        let (cache, log) = new_cache();
        cache.set_legacy_importer(importer.clone());
        cache.delay_cleanup();
        cache.open(dir.path(), "icons.db").await.unwrap();
        log.wait_for(CacheEvent::ImportFinished).await;
        cache.close().await;

        assert_eq!(importer.runs.load(Ordering::SeqCst), 1);
    }

    struct FlakyImporter {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl LegacyImporter for FlakyImporter {
        async fn perform_import(&self, session: &mut LegacyImportSession<'_>) -> bool {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            session.import_icon_url_for_page_url(ICON, PAGE).await.unwrap();
            attempt > 1
        }
    }

    #[tokio::test]
    async fn test_failed_legacy_import_rolls_back_and_retries() {
        let dir = tempfile::tempdir().unwrap();
        let importer = Arc::new(FlakyImporter { attempts: AtomicU32::new(0) });

        let (cache, log) = new_cache();
        cache.set_legacy_importer(importer.clone());
        cache.delay_cleanup();
        cache.open(dir.path(), "icons.db").await.unwrap();
        log.wait_for(CacheEvent::ImportFinished).await;
        // First attempt reported failure: its writes rolled back.
        assert_eq!(cache.icon_url_for_page_url(PAGE), None);
        cache.close().await;

        let (cache, log) = new_cache();
        cache.set_legacy_importer(importer.clone());
        cache.delay_cleanup();
        cache.open(dir.path(), "icons.db").await.unwrap();
        log.wait_for(CacheEvent::ImportFinished).await;
        // Second attempt committed.
        assert_eq!(cache.icon_url_for_page_url(PAGE).as_deref(), Some(ICON));
        assert_eq!(importer.attempts.load(Ordering::SeqCst), 2);
        cache.close().await;
    }

    struct GatedImporter {
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl LegacyImporter for GatedImporter {
        async fn perform_import(&self, _session: &mut LegacyImportSession<'_>) -> bool {
            let _permit = self.gate.acquire().await;
            true
        }
    }

    #[tokio::test]
    async fn test_queries_stay_unknown_until_the_import_finishes() {
        let dir = tempfile::tempdir().unwrap();
        // Stall startup inside the legacy import so the URL import (and the
        // import-complete flag) cannot happen until we say so.
        let importer = Arc::new(GatedImporter { gate: tokio::sync::Semaphore::new(0) });

        let (cache, log) = new_cache();
        cache.set_legacy_importer(importer.clone());
        cache.open(dir.path(), "icons.db").await.unwrap();
        cache.retain_page_url(PAGE);

        tokio::time::sleep(Duration::from_millis(50)).await;
        // While the import runs nothing is answered authoritatively.
        assert_eq!(cache.load_decision_for_icon_url(ICON), LoadDecision::Unknown);
        assert_eq!(cache.icon_url_for_page_url(PAGE), None);
        assert!(!log.contains(&CacheEvent::ImportFinished));

        importer.gate.add_permits(1);
        log.wait_for(CacheEvent::ImportFinished).await;
        // Now every answer is definitive: fetch the unknown icon, and the
        // page that queried mid-import hears that its answer arrived.
        assert_eq!(cache.load_decision_for_icon_url(ICON), LoadDecision::Yes);
        assert!(log.contains(&CacheEvent::IconUrlKnown(PAGE.into())));
        assert_eq!(cache.icon_url_for_page_url(PAGE), None);
        cache.close().await;
    }

    // =========================================================================
    // Steady state
    // =========================================================================

    #[tokio::test]
    async fn test_remove_all_icons_clears_memory_and_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("icons.db");
        let (cache, log) = new_cache();
        cache.open(dir.path(), "icons.db").await.unwrap();
        log.wait_for(CacheEvent::ImportFinished).await;

        cache.retain_page_url(PAGE);
        cache.set_icon_url_for_page_url(ICON, PAGE);
        cache.set_icon_data_for_icon_url(png_bytes(0), ICON);
        // Let the debounced flush put the rows on disk first, so the wipe
        // has something real to remove.
        tokio::time::timeout(Duration::from_secs(10), async {
            while store_page_urls(&path).await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        cache.remove_all_icons();
        log.wait_for(CacheEvent::AllIconsRemoved).await;
        // Mappings are gone; the page records (and retain counts) are not.
        assert_eq!(cache.icon_url_for_page_url(PAGE), None);
        assert_eq!(cache.icon_record_count(), 0);
        assert_eq!(cache.retained_page_url_count(), 1);
        cache.close().await;

        assert!(store_page_urls(&path).await.is_empty());
    }

    #[tokio::test]
    async fn test_pruning_keeps_exactly_the_live_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("icons.db");
        {
            let db = Database::connect(&path).await.unwrap();
            db.migrate().await.unwrap();
            let repo = Repository::from(&db);
            repo.apply_batch(
                &[
                    IconSnapshot::new("http://one/icon.png", 1, Some(png_bytes(1))),
                    IconSnapshot::new("http://two/icon.png", 1, Some(png_bytes(2))),
                ],
                &[
                    PageSnapshot::new("http://one/", Some("http://one/icon.png".into())),
                    PageSnapshot::new("http://two/", Some("http://two/icon.png".into())),
                ],
            )
            .await
            .unwrap();
            db.close().await;
        }

        let (cache, log) = new_cache();
        cache.open(dir.path(), "icons.db").await.unwrap();
        log.wait_for(CacheEvent::ImportFinished).await;
        // Nothing was retained during the import, so neither row was
        // loaded. Bring one page back to life, then trigger a write so the
        // one-shot pruning pass runs.
        cache.retain_page_url("http://one/");
        cache.set_icon_url_for_page_url("http://one/icon.png", "http://one/");

        tokio::time::timeout(Duration::from_secs(10), async {
            while store_page_urls(&path).await != vec!["http://one/".to_string()] {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pruning never converged");
        cache.close().await;

        // Exactly the live page and its icon survive.
        let db = Database::connect(&path).await.unwrap();
        let repo = Repository::from(&db);
        assert_eq!(
            repo.image_data_for_icon_url("http://one/icon.png").await.unwrap(),
            Some(png_bytes(1)),
        );
        assert_eq!(repo.image_data_for_icon_url("http://two/icon.png").await.unwrap(), None);
        db.close().await;
    }

    #[tokio::test]
    async fn test_delayed_cleanup_suppresses_pruning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("icons.db");
        {
            let db = Database::connect(&path).await.unwrap();
            db.migrate().await.unwrap();
            let repo = Repository::from(&db);
            repo.apply_batch(
                &[],
                &[PageSnapshot::new("http://unretained/", Some(ICON.into()))],
            )
            .await
            .unwrap();
            db.close().await;
        }

        let (cache, log) = new_cache();
        cache.open(dir.path(), "icons.db").await.unwrap();
        log.wait_for(CacheEvent::ImportFinished).await;
        // The unretained row was skipped by the import, so only the
        // suppression below keeps pruning from deleting it.
        cache.delay_cleanup();
        cache.retain_page_url(PAGE);
        cache.set_icon_url_for_page_url(ICON, PAGE);
        tokio::time::sleep(Duration::from_millis(100)).await;
        cache.close().await;
        cache.allow_cleanup();

        let mut urls = store_page_urls(&path).await;
        urls.sort();
        assert_eq!(urls, vec![PAGE.to_string(), "http://unretained/".to_string()]);
    }
}
