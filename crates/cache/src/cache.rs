//! The client-facing icon cache.
//!
//! [`IconCache`] is the process-wide facade: clients retain and release
//! page URLs, point pages at icons, hand in fetched icon bytes, and ask
//! non-blocking questions. Every call either answers straight from memory
//! or queues work for the background sync engine and answers "not yet".
//! The one intentional blocking call is [`close`](IconCache::close), which
//! waits for the engine's final flush.

use crate::config::CacheConfig;
use crate::error::{ErrorKind, Result};
use crate::legacy::LegacyImporter;
use crate::notify::{CacheEvent, CacheObserver, EventSender, NoopObserver, dispatch, event_channel};
use crate::record::{
    CachedIcon, IconRecord, IconSize, ImageData, PageUrlRecord, page_can_have_icon, unix_now,
};
use crate::state::{CacheState, Flags, PageLookup};
use crate::sync::SyncEngine;
use exn::ResultExt;
use favicache_store::{Database, IconSnapshot};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Answer to "should the caller fetch this icon over the network?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadDecision {
    /// The icon is unknown or stale; fetch it.
    Yes,
    /// The cached icon is fresh enough; do not fetch.
    No,
    /// The startup import has not finished, so the answer is not known
    /// yet. Park the request and retry after
    /// [`on_import_finished`](CacheObserver::on_import_finished).
    Unknown,
}

/// Everything the facade and the sync engine share for one open/close
/// cycle. The state mutex is the single lock guarding all mutable cache
/// state; it is only ever held for map mutation, never across I/O.
pub(crate) struct Shared {
    pub(crate) state: Mutex<CacheState>,
    /// Wakes the engine out of its idle wait.
    pub(crate) wake: Notify,
    /// Cooperative shutdown signal, polled by the engine per row/pass.
    pub(crate) cancel: CancellationToken,
    pub(crate) events: EventSender,
    pub(crate) flags: Arc<Flags>,
    pub(crate) config: CacheConfig,
}

/// Runtime half of an open cache.
struct Session {
    shared: Arc<Shared>,
    path: PathBuf,
    engine: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

struct CacheInner {
    config: CacheConfig,
    flags: Arc<Flags>,
    observer: Mutex<Arc<dyn CacheObserver>>,
    legacy_importer: Mutex<Option<Arc<dyn LegacyImporter>>>,
    session: Mutex<Option<Session>>,
}

/// A persistent, retain-counted favicon cache.
///
/// Cheap to clone; clones share the same cache. All methods are safe to
/// call from any thread. Until [`open`](Self::open) succeeds (and after
/// [`close`](Self::close)) every query answers empty and every mutation is
/// a no-op — nothing errors.
#[derive(Clone)]
pub struct IconCache {
    inner: Arc<CacheInner>,
}

impl Default for IconCache {
    fn default() -> Self {
        Self::new()
    }
}

impl IconCache {
    /// Create a cache with default configuration and no observer.
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                flags: Arc::new(Flags::default()),
                observer: Mutex::new(Arc::new(NoopObserver)),
                legacy_importer: Mutex::new(None),
                session: Mutex::new(None),
            }),
        }
    }

    /// Set the notification sink. Must happen before [`open`](Self::open);
    /// once the dispatcher is running the observer cannot be swapped.
    pub fn set_observer(&self, observer: Arc<dyn CacheObserver>) {
        if self.is_open() {
            warn!("observer must be set before the cache is opened, ignoring");
            return;
        }
        *self.inner.observer.lock().unwrap() = observer;
    }

    /// Supply the one-time legacy importer. Must happen before
    /// [`open`](Self::open).
    pub fn set_legacy_importer(&self, importer: Arc<dyn LegacyImporter>) {
        if self.is_open() {
            warn!("legacy importer must be set before the cache is opened, ignoring");
            return;
        }
        *self.inner.legacy_importer.lock().unwrap() = Some(importer);
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the cache backed by `directory/filename`, spawning the sync
    /// engine and the notification dispatcher.
    ///
    /// Returns once the store file exists and the engine task is running —
    /// *not* once startup work (schema check, imports) has finished; that
    /// completes in the background and is announced via
    /// [`on_import_finished`](CacheObserver::on_import_finished).
    pub async fn open(&self, directory: impl AsRef<Path>, filename: &str) -> Result<()> {
        if self.is_open() {
            exn::bail!(ErrorKind::AlreadyOpen);
        }
        let directory = directory.as_ref();
        tokio::fs::create_dir_all(directory).await.or_raise(|| ErrorKind::Directory)?;
        let path = directory.join(filename);
        // A leftover journal is evidence of a crash and earns the database
        // an integrity check even when the config does not ask for one.
        let check_integrity =
            self.inner.config.check_integrity_on_open || Database::has_leftover_journal(&path);
        let db = Database::connect(&path).await.or_raise(|| ErrorKind::Store)?;
        info!(path = %path.display(), "opening icon cache");

        let (events, receiver) = event_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(CacheState::new()),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            events,
            flags: Arc::clone(&self.inner.flags),
            config: self.inner.config.clone(),
        });
        let observer = Arc::clone(&*self.inner.observer.lock().unwrap());
        let importer = self.inner.legacy_importer.lock().unwrap().clone();
        let engine = SyncEngine::new(Arc::clone(&shared), db, check_integrity, importer);
        let session = Session {
            shared,
            path,
            engine: tokio::spawn(engine.run()),
            dispatcher: tokio::spawn(dispatch(receiver, observer)),
        };
        {
            let mut slot = self.inner.session.lock().unwrap();
            if slot.is_none() {
                *slot = Some(session);
                return Ok(());
            }
        }
        // Lost a race with a concurrent open; tear down what was built.
        Self::teardown(session).await;
        exn::bail!(ErrorKind::AlreadyOpen)
    }

    /// Close the cache: signal the engine, wait for its final flush and
    /// store close, then drain the notification dispatcher.
    ///
    /// Idempotent, and a no-op on a cache that was never opened.
    pub async fn close(&self) {
        let session = self.inner.session.lock().unwrap().take();
        let Some(session) = session else {
            return;
        };
        debug!("closing icon cache");
        Self::teardown(session).await;
    }

    async fn teardown(session: Session) {
        let Session { shared, path: _, engine, dispatcher } = session;
        shared.cancel.cancel();
        shared.wake.notify_one();
        if engine.await.is_err() {
            error!("sync engine task failed");
        }
        // Dropping our half releases the event sender; the dispatcher
        // drains whatever is queued and exits.
        drop(shared);
        if dispatcher.await.is_err() {
            error!("notification dispatcher task failed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.session.lock().unwrap().is_some()
    }

    /// Full path of the database file, while open.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.inner.session.lock().unwrap().as_ref().map(|session| session.path.clone())
    }

    fn shared(&self) -> Option<Arc<Shared>> {
        self.inner.session.lock().unwrap().as_ref().map(|session| Arc::clone(&session.shared))
    }

    /// Arm (or push back) the debounced flush. Every call re-arms the
    /// deadline so a burst of mutations commits as one transaction.
    fn schedule_flush(shared: &Shared, state: &mut CacheState) {
        state.flush_deadline = Some(Instant::now() + shared.config.write_delay);
    }

    // =========================================================================
    // Retain / release
    // =========================================================================

    /// Register interest in a page URL's icon, creating the record if this
    /// is the first retainer.
    pub fn retain_page_url(&self, page_url: &str) {
        if !page_can_have_icon(page_url) {
            return;
        }
        let Some(shared) = self.shared() else {
            return;
        };
        let mut state = shared.state.lock().unwrap();
        let first_retain = !state
            .pages
            .entry(page_url.to_owned())
            .or_insert_with(|| PageUrlRecord::new(page_url))
            .retain();
        if !first_retain {
            return;
        }
        state.retained.insert(page_url.to_owned());
        // Until the import has run nothing can be queued for this page, so
        // there is no tombstone to worry about.
        if !state.import_complete {
            return;
        }
        // The page may have been released to zero moments ago with its
        // deletion still pending; re-queueing the live snapshot supersedes
        // the tombstone instead of deleting and recreating the row.
        if !shared.flags.private_browsing() && state.has_pending_page_write(page_url) {
            debug!(page_url, "superseding a pending deletion");
            let snapshot = state.pages[page_url].snapshot(false);
            state.schedule_page_write(snapshot);
        }
    }

    /// Drop one retention of a page URL. At zero the in-memory record goes
    /// away and a deletion is scheduled for the store, along with any icon
    /// that just lost its last referencing page.
    ///
    /// Releasing a URL that was never retained is a caller bug: logged,
    /// ignored, never fatal.
    pub fn release_page_url(&self, page_url: &str) {
        if !page_can_have_icon(page_url) {
            return;
        }
        let Some(shared) = self.shared() else {
            return;
        };
        let mut state = shared.state.lock().unwrap();
        if !state.retained.contains(page_url) {
            error!(page_url, "releasing an icon for a page URL that is not retained");
            return;
        }
        let still_retained = match state.pages.get_mut(page_url) {
            Some(record) => {
                let still_retained = record.release();
                debug!(page_url, remaining = record.retain_count(), "released page URL");
                still_retained
            }
            None => {
                error!(page_url, "retained page URL has no record");
                return;
            }
        };
        if still_retained {
            return;
        }

        debug!(page_url, "no more retainers for page URL");
        let Some(record) = state.pages.remove(page_url) else {
            return;
        };
        state.retained.remove(page_url);
        if !state.import_complete {
            state.pending_import.remove(page_url);
        }
        // Nobody will ever want this page's read results.
        state.interested_in_icon_data.remove(page_url);

        let mut orphaned_icon = None;
        if let Some(icon_url) = record.icon_url.as_deref()
            && let Some(icon) = state.icons.get_mut(icon_url)
        {
            icon.released_by(page_url);
            if icon.is_unreferenced() {
                orphaned_icon = Some(icon.snapshot(true));
                state.icons.remove(icon_url);
                state.pending_read.remove(icon_url);
            }
        }

        if shared.flags.private_browsing() {
            return;
        }
        state.schedule_page_write(record.snapshot(true));
        if let Some(snapshot) = orphaned_icon {
            state.schedule_icon_write(snapshot);
        }
        Self::schedule_flush(&shared, &mut state);
        drop(state);
        shared.wake.notify_one();
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// The icon for a page, if its bytes are already resident and decoded.
    ///
    /// Never blocks. When the data has not been read from the store yet
    /// this returns `None` and queues the read; the caller hears about the
    /// arrival via [`on_icon_data_known`](CacheObserver::on_icon_data_known).
    /// Passing `None` for `size` means "prefetch only": the read is still
    /// queued but no image is returned.
    pub fn icon_for_page_url(
        &self,
        page_url: &str,
        size: Option<IconSize>,
    ) -> Option<Arc<CachedIcon>> {
        let Some(shared) = self.shared() else {
            return None;
        };
        let mut state = shared.state.lock().unwrap();
        let icon_url = match state.lookup_page_for_query(page_url) {
            PageLookup::Unknown => return None,
            PageLookup::PendingImport => {
                // The import may yet map this page to an icon; remember
                // that the caller wants the image once it does.
                state.interested_in_icon_data.insert(page_url.to_owned());
                return None;
            }
            PageLookup::Known(icon_url) => icon_url?,
        };
        let image = state.icons.get(&icon_url)?.image.clone();
        if !image.is_known() {
            // First time anyone asked for this icon's bytes: have the
            // engine read them from the store.
            state.interested_in_icon_data.insert(page_url.to_owned());
            state.pending_read.insert(icon_url);
            drop(state);
            shared.wake.notify_one();
            return None;
        }
        match (image, size) {
            (ImageData::Present(cached), Some(_)) => Some(cached),
            _ => None,
        }
    }

    /// Queue the icon read for a page without caring about the result yet.
    pub fn prefetch_icon_for_page_url(&self, page_url: &str) {
        let _ = self.icon_for_page_url(page_url, None);
    }

    /// The icon URL a page maps to. Answered purely from memory — URL
    /// mappings are imported eagerly at startup, so no read is queued.
    pub fn icon_url_for_page_url(&self, page_url: &str) -> Option<String> {
        let shared = self.shared()?;
        let mut state = shared.state.lock().unwrap();
        match state.lookup_page_for_query(page_url) {
            PageLookup::Known(icon_url) => icon_url,
            PageLookup::PendingImport | PageLookup::Unknown => None,
        }
    }

    /// Whether this icon's data has been resolved (present *or* known to
    /// be missing) in memory.
    pub fn icon_data_known_for_icon_url(&self, icon_url: &str) -> bool {
        let Some(shared) = self.shared() else {
            return false;
        };
        let state = shared.state.lock().unwrap();
        state.icons.get(icon_url).is_some_and(|icon| icon.image.is_known())
    }

    /// Should the caller fetch this icon over the network?
    pub fn load_decision_for_icon_url(&self, icon_url: &str) -> LoadDecision {
        let Some(shared) = self.shared() else {
            return LoadDecision::No;
        };
        if icon_url.is_empty() {
            return LoadDecision::No;
        }
        let state = shared.state.lock().unwrap();
        if let Some(icon) = state.icons.get(icon_url) {
            // A record always carries a meaningful timestamp: it was either
            // imported from disk (stamp read with it) or set by a client
            // (stamped then). Fetch again only once it has gone stale.
            let expiry = shared.config.icon_expiry.as_secs() as i64;
            return if unix_now() - icon.timestamp > expiry {
                LoadDecision::Yes
            } else {
                LoadDecision::No
            };
        }
        if state.import_complete {
            // Authoritatively never heard of it.
            LoadDecision::Yes
        } else {
            LoadDecision::Unknown
        }
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Install freshly fetched image bytes for an icon, stamping it with
    /// the current time, and notify every page currently mapped to it.
    /// Undecodable or empty bytes record the icon's data as missing.
    pub fn set_icon_data_for_icon_url(&self, data: Vec<u8>, icon_url: &str) {
        if icon_url.is_empty() {
            return;
        }
        let Some(shared) = self.shared() else {
            return;
        };
        // Decode before taking the lock.
        let image = ImageData::from_bytes(Some(data));

        let mut state = shared.state.lock().unwrap();
        // Memory is now newer than disk: a queued read of this icon would
        // install stale bytes over these, so withdraw it.
        state.pending_read.remove(icon_url);
        let icon =
            state.icons.entry(icon_url.to_owned()).or_insert_with(|| IconRecord::new(icon_url));
        icon.image = image;
        icon.timestamp = unix_now();
        let retaining: Vec<String> = icon.retaining_page_urls().iter().cloned().collect();
        let snapshot = icon.snapshot(false);
        let unreferenced = icon.is_unreferenced();
        if !shared.flags.private_browsing() {
            state.schedule_icon_write(snapshot);
        }
        if unreferenced {
            // No page maps to it; keep the bytes on disk for pruning to
            // judge but drop the record (nothing would ever look it up).
            state.icons.remove(icon_url);
        }
        Self::schedule_flush(&shared, &mut state);
        drop(state);
        shared.wake.notify_one();
        for page_url in retaining {
            _ = shared.events.send(CacheEvent::IconDataKnown(page_url));
        }
    }

    /// Establish (or repoint) the page → icon mapping. An old icon that
    /// just lost its last referencing page is scheduled for deletion.
    pub fn set_icon_url_for_page_url(&self, icon_url: &str, page_url: &str) {
        if icon_url.is_empty() || !page_can_have_icon(page_url) {
            return;
        }
        let Some(shared) = self.shared() else {
            return;
        };
        let mut state = shared.state.lock().unwrap();
        // Happens surprisingly often; skip the write and the notification.
        if let Some(record) = state.pages.get(page_url)
            && record.icon_url.as_deref() == Some(icon_url)
        {
            return;
        }
        state.pages.entry(page_url.to_owned()).or_insert_with(|| PageUrlRecord::new(page_url));
        let orphaned = state.attach_icon(page_url, icon_url);
        if !shared.flags.private_browsing() {
            let snapshot = state.pages[page_url].snapshot(false);
            state.schedule_page_write(snapshot);
            if let Some(old_icon_url) = orphaned {
                state.schedule_icon_write(IconSnapshot::deletion(old_icon_url));
            }
        }
        Self::schedule_flush(&shared, &mut state);
        drop(state);
        shared.wake.notify_one();
        _ = shared.events.send(CacheEvent::IconUrlKnown(page_url.to_owned()));
    }

    /// Drop every icon, in memory and on disk. Page records and their
    /// retain counts survive; their mappings are re-established by future
    /// [`set_icon_url_for_page_url`](Self::set_icon_url_for_page_url)
    /// calls. Announced via
    /// [`on_all_icons_removed`](CacheObserver::on_all_icons_removed) once
    /// the on-disk wipe is done.
    pub fn remove_all_icons(&self) {
        let Some(shared) = self.shared() else {
            return;
        };
        debug!("requesting removal of all icons");
        let mut state = shared.state.lock().unwrap();
        state.clear_for_remove_all();
        drop(state);
        shared.wake.notify_one();
    }

    // =========================================================================
    // Cleanup and modes
    // =========================================================================

    /// Suspend pruning (nestable). While suspended the URL import also
    /// loads rows nobody retains, so tools that walk the whole cache see
    /// everything.
    pub fn delay_cleanup(&self) {
        self.inner.flags.delay_cleanup();
    }

    /// Re-allow pruning after a matching [`delay_cleanup`](Self::delay_cleanup).
    pub fn allow_cleanup(&self) {
        self.inner.flags.allow_cleanup();
    }

    /// While enabled, nothing new is written to the store: mappings and
    /// icon data live in memory only and vanish with the process.
    pub fn set_private_browsing(&self, enabled: bool) {
        self.inner.flags.set_private_browsing(enabled);
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub fn page_url_mapping_count(&self) -> usize {
        self.shared().map_or(0, |shared| shared.state.lock().unwrap().pages.len())
    }

    pub fn retained_page_url_count(&self) -> usize {
        self.shared().map_or(0, |shared| shared.state.lock().unwrap().retained.len())
    }

    pub fn icon_record_count(&self) -> usize {
        self.shared().map_or(0, |shared| shared.state.lock().unwrap().icons.len())
    }

    pub fn icon_record_count_with_data(&self) -> usize {
        self.shared().map_or(0, |shared| shared.state.lock().unwrap().icon_count_with_data())
    }
}
