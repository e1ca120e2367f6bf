//! The cache's shared mutable state.
//!
//! Everything mutable lives here, behind one mutex: the page/icon record
//! maps, the retained-URL set, the pending work sets consumed by the sync
//! engine, and the startup/cleanup flags. Collapsing it into a single owner
//! means there is no lock ordering to get wrong; the rule is simply that
//! the lock is held for map mutation only, never across I/O or callbacks.

use crate::record::{IconRecord, ImageData, PageUrlRecord, page_can_have_icon};
use favicache_store::{IconSnapshot, ImportedRow, PageSnapshot};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::time::Instant;

/// Outcome of a page lookup on the query paths. Carries owned copies so
/// callers can keep mutating the state they looked the page up in.
pub(crate) enum PageLookup {
    /// The page is known; this is its current icon URL, if any.
    Known(Option<String>),
    /// The initial URL import has not resolved this page yet; the caller
    /// has been registered for notification once it does.
    PendingImport,
    /// Authoritatively unknown (import finished and no such page), or the
    /// URL cannot carry an icon at all.
    Unknown,
}

#[derive(Default)]
pub(crate) struct CacheState {
    pub(crate) pages: HashMap<String, PageUrlRecord>,
    pub(crate) icons: HashMap<String, IconRecord>,
    /// Page URLs with a positive retain count.
    pub(crate) retained: HashSet<String>,

    /// Page URLs whose mapping is unknown until the URL import completes.
    pub(crate) pending_import: HashSet<String>,
    /// Page URLs waiting for an icon-data read to finish.
    pub(crate) interested_in_icon_data: HashSet<String>,
    /// Icon URLs whose bytes must be fetched from the store.
    pub(crate) pending_read: HashSet<String>,
    /// Coalesced pending writes: a newer snapshot for the same URL replaces
    /// the older one (last write wins).
    pending_page_writes: HashMap<String, PageSnapshot>,
    pending_icon_writes: HashMap<String, IconSnapshot>,

    pub(crate) import_complete: bool,
    pub(crate) remove_all_requested: bool,
    /// When the debounced write flush is due. Re-armed by every scheduled
    /// write so rapid bursts coalesce into one transaction.
    pub(crate) flush_deadline: Option<Instant>,
}

impl CacheState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Record maintenance
    // =========================================================================

    /// Point `page_url` at `icon_url`, maintaining both icons' back-reference
    /// sets. Returns the icon URL of a previous icon that just lost its last
    /// referencing page, so the caller can tombstone it.
    ///
    /// No-op (returns `None`) when the mapping is already current or the
    /// page record does not exist.
    pub(crate) fn attach_icon(&mut self, page_url: &str, icon_url: &str) -> Option<String> {
        let Some(page) = self.pages.get_mut(page_url) else {
            return None;
        };
        if page.icon_url.as_deref() == Some(icon_url) {
            return None;
        }
        let previous = page.icon_url.replace(icon_url.to_owned());
        self.icons
            .entry(icon_url.to_owned())
            .or_insert_with(|| IconRecord::new(icon_url))
            .retained_by(page_url);

        let previous = previous?;
        let old_icon = self.icons.get_mut(&previous)?;
        old_icon.released_by(page_url);
        if old_icon.is_unreferenced() {
            // Nothing maps to it: drop it from memory and stop caring
            // about any outstanding read.
            self.icons.remove(&previous);
            self.pending_read.remove(&previous);
            Some(previous)
        } else {
            None
        }
    }

    /// Look up (or, while the import runs, provisionally create) the record
    /// for a page on the query paths.
    pub(crate) fn lookup_page_for_query(&mut self, page_url: &str) -> PageLookup {
        if !page_can_have_icon(page_url) {
            return PageLookup::Unknown;
        }
        if !self.import_complete {
            // The import may still find a mapping for this page: create a
            // placeholder record and register it for notification.
            let has_icon = self
                .pages
                .entry(page_url.to_owned())
                .or_insert_with(|| PageUrlRecord::new(page_url))
                .icon_url
                .is_some();
            if !has_icon {
                self.pending_import.insert(page_url.to_owned());
                return PageLookup::PendingImport;
            }
        }
        match self.pages.get(page_url) {
            Some(record) => PageLookup::Known(record.icon_url.clone()),
            None => PageLookup::Unknown,
        }
    }

    // =========================================================================
    // Pending writes
    // =========================================================================

    /// Queue a page snapshot, superseding any older one for the same URL.
    /// Callers gate on private browsing; the state itself does not care.
    pub(crate) fn schedule_page_write(&mut self, snapshot: PageSnapshot) {
        self.pending_page_writes.insert(snapshot.page_url.clone(), snapshot);
    }

    /// Queue an icon snapshot, superseding any older one for the same URL.
    pub(crate) fn schedule_icon_write(&mut self, snapshot: IconSnapshot) {
        self.pending_icon_writes.insert(snapshot.icon_url.clone(), snapshot);
    }

    /// Whether a write for this page is already queued (used to supersede a
    /// tombstone when the page is re-retained before the flush).
    pub(crate) fn has_pending_page_write(&self, page_url: &str) -> bool {
        self.pending_page_writes.contains_key(page_url)
    }

    /// Atomically hand every queued write to the engine.
    pub(crate) fn drain_writes(&mut self) -> (Vec<IconSnapshot>, Vec<PageSnapshot>) {
        self.flush_deadline = None;
        let icons = self.pending_icon_writes.drain().map(|(_, snapshot)| snapshot).collect();
        let pages = self.pending_page_writes.drain().map(|(_, snapshot)| snapshot).collect();
        (icons, pages)
    }

    pub(crate) fn has_write_work(&self) -> bool {
        !self.pending_icon_writes.is_empty() || !self.pending_page_writes.is_empty()
    }

    pub(crate) fn has_read_work(&self) -> bool {
        !self.pending_read.is_empty()
    }

    // =========================================================================
    // Engine-side transitions
    // =========================================================================

    /// Fold one imported row into memory. Returns whether the page was
    /// waiting on the import and should be notified now.
    ///
    /// `load_unretained` is set while cleanup is suppressed: rows nobody
    /// retains are normally left on disk for the pruning pass to judge, but
    /// with cleanup delayed they are loaded instead.
    pub(crate) fn apply_imported_row(&mut self, row: &ImportedRow, load_unretained: bool) -> bool {
        if !self.pages.contains_key(&row.page_url)
            && load_unretained
            && page_can_have_icon(&row.page_url)
        {
            self.pages.insert(row.page_url.clone(), PageUrlRecord::new(&row.page_url));
        }
        if self.pages.contains_key(&row.page_url) {
            self.attach_icon(&row.page_url, &row.icon_url);
            // The on-disk stamp wins: until this row was read the icon
            // looked brand new, but it is really much older.
            if let Some(icon) = self.icons.get_mut(&row.icon_url) {
                icon.timestamp = row.retrieved_at;
            }
        }
        self.pending_import.remove(&row.page_url)
    }

    /// Flip the import-complete flag and resolve the pages the import never
    /// found. Retained leftovers are returned for notification (their
    /// authoritative answer is "no icon"); unretained ones are discarded
    /// unless cleanup is suppressed.
    pub(crate) fn finish_import(&mut self, discard_unretained: bool) -> Vec<String> {
        self.import_complete = true;
        let leftovers = std::mem::take(&mut self.pending_import);
        let mut to_notify = Vec::new();
        for page_url in leftovers {
            if self.retained.contains(&page_url) {
                to_notify.push(page_url);
            } else if discard_unretained
                && let Some(record) = self.pages.remove(&page_url)
            {
                self.interested_in_icon_data.remove(&page_url);
                if let Some(icon_url) = record.icon_url
                    && let Some(icon) = self.icons.get_mut(&icon_url)
                {
                    icon.released_by(&page_url);
                    if icon.is_unreferenced() {
                        let snapshot = icon.snapshot(true);
                        self.icons.remove(&icon_url);
                        self.pending_read.remove(&icon_url);
                        self.schedule_icon_write(snapshot);
                    }
                }
            }
        }
        to_notify
    }

    /// Install the result of a disk read, if the icon still wants it (a
    /// client set newer data in the meantime if it does not). Returns the
    /// pages to notify: the intersection of the pages retaining this icon
    /// and the pages waiting on icon data, which are consumed.
    pub(crate) fn install_read_result(&mut self, icon_url: &str, data: ImageData) -> Vec<String> {
        if !self.pending_read.remove(icon_url) {
            return Vec::new();
        }
        let Some(icon) = self.icons.get_mut(icon_url) else {
            return Vec::new();
        };
        icon.image = data;
        let targets: Vec<String> = icon
            .retaining_page_urls()
            .intersection(&self.interested_in_icon_data)
            .cloned()
            .collect();
        for page_url in &targets {
            self.interested_in_icon_data.remove(page_url);
        }
        targets
    }

    /// Strip every icon out of memory ahead of the on-disk wipe. Page
    /// records and retain counts survive; only their icon mappings go.
    pub(crate) fn clear_for_remove_all(&mut self) {
        for page in self.pages.values_mut() {
            page.icon_url = None;
        }
        self.icons.clear();
        self.pending_import.clear();
        self.interested_in_icon_data.clear();
        self.pending_read.clear();
        self.pending_page_writes.clear();
        self.pending_icon_writes.clear();
        self.remove_all_requested = true;
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub(crate) fn icon_count_with_data(&self) -> usize {
        self.icons.values().filter(|icon| matches!(icon.image, ImageData::Present(_))).count()
    }
}

/// Settings that outlive a single open/close cycle and are shared between
/// the client-facing facade and the sync engine. These are advisory
/// cross-thread toggles, so relaxed atomics are all they need.
#[derive(Debug, Default)]
pub(crate) struct Flags {
    cleanup_suppressions: AtomicU32,
    private_browsing: AtomicBool,
}

impl Flags {
    pub(crate) fn delay_cleanup(&self) {
        if self.cleanup_suppressions.fetch_add(1, Ordering::Relaxed) == 0 {
            tracing::debug!("database cleanup is now disabled");
        }
    }

    pub(crate) fn allow_cleanup(&self) {
        let mut suppressions = self.cleanup_suppressions.load(Ordering::Relaxed);
        // Decrement without going below zero; an unbalanced allow is a
        // caller bug but must not wedge cleanup off forever.
        while suppressions > 0 {
            match self.cleanup_suppressions.compare_exchange_weak(
                suppressions,
                suppressions - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(1) => {
                    tracing::debug!("database cleanup is now enabled");
                    break;
                }
                Ok(_) => break,
                Err(current) => suppressions = current,
            }
        }
    }

    pub(crate) fn cleanup_suppressed(&self) -> bool {
        self.cleanup_suppressions.load(Ordering::Relaxed) > 0
    }

    pub(crate) fn set_private_browsing(&self, enabled: bool) {
        self.private_browsing.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn private_browsing(&self) -> bool {
        self.private_browsing.load(Ordering::Relaxed)
    }
}
