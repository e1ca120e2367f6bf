//! In-memory record types for pages and icons.
//!
//! Records are mutable and live inside the cache state map, always behind
//! its lock. Anything that leaves the lock is either a deep-copied
//! [`IconSnapshot`]/[`PageSnapshot`] or a shared [`CachedIcon`], both of
//! which are immutable.

use favicache_store::{IconSnapshot, PageSnapshot};
use std::collections::HashSet;
use std::sync::Arc;
use time::UtcDateTime;
use tracing::debug;

/// Current time as unix seconds, the unit used for icon timestamps.
pub(crate) fn unix_now() -> i64 {
    UtcDateTime::now().unix_timestamp()
}

/// Only pages in the HTTP family carry favicons; every other scheme
/// (file, data, about, ...) is refused up front so it can never be stored.
pub(crate) fn page_can_have_icon(url: &str) -> bool {
    match url.split_once("://") {
        Some((scheme, rest)) if !rest.is_empty() => {
            scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https")
        }
        _ => false,
    }
}

/// Pixel dimensions of a decoded icon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IconSize {
    pub width: u32,
    pub height: u32,
}

/// A decoded icon, shared out to clients as `Arc<CachedIcon>`.
///
/// Holding the `Arc` keeps both the raw bytes and the decoded image alive
/// independently of the cache, so a client can keep using an icon even
/// after the cache replaces or removes it.
#[derive(Debug)]
pub struct CachedIcon {
    bytes: Vec<u8>,
    image: image::DynamicImage,
}

impl CachedIcon {
    /// Decode raw image bytes. `None` when the decoder rejects them, which
    /// the caller records as "data missing" rather than an error.
    pub(crate) fn decode(bytes: Vec<u8>) -> Option<Arc<Self>> {
        match image::load_from_memory(&bytes) {
            Ok(image) => Some(Arc::new(Self { bytes, image })),
            Err(err) => {
                debug!(error = %err, "icon bytes failed to decode");
                None
            }
        }
    }

    /// The raw bytes exactly as they were handed to the cache.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The decoded image, at its native size.
    pub fn image(&self) -> &image::DynamicImage {
        &self.image
    }

    pub fn size(&self) -> IconSize {
        IconSize { width: self.image.width(), height: self.image.height() }
    }
}

/// What the cache knows about an icon's image data.
#[derive(Debug, Clone, Default)]
pub(crate) enum ImageData {
    /// Never read from the store and never set by a client.
    #[default]
    Unknown,
    /// Read or set, but there is no usable image (no bytes, or undecodable).
    Missing,
    Present(Arc<CachedIcon>),
}

impl ImageData {
    /// Classify bytes coming in from a client or from the store.
    pub(crate) fn from_bytes(bytes: Option<Vec<u8>>) -> Self {
        match bytes {
            Some(bytes) if !bytes.is_empty() => {
                CachedIcon::decode(bytes).map_or(Self::Missing, Self::Present)
            }
            _ => Self::Missing,
        }
    }

    /// Whether a read/set has ever resolved this icon's data.
    pub(crate) fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// One icon: its URL, the time its data was last fetched or verified, the
/// data itself, and the set of page URLs currently mapped to it.
///
/// The page set is a weak back-reference used only for notification
/// fan-out; ownership runs the other way (pages keep icons alive, and an
/// icon with no referencing pages is eligible for deletion).
#[derive(Debug)]
pub(crate) struct IconRecord {
    icon_url: String,
    pub(crate) timestamp: i64,
    pub(crate) image: ImageData,
    retaining_page_urls: HashSet<String>,
}

impl IconRecord {
    pub(crate) fn new(icon_url: impl Into<String>) -> Self {
        Self {
            icon_url: icon_url.into(),
            timestamp: 0,
            image: ImageData::Unknown,
            retaining_page_urls: HashSet::new(),
        }
    }

    pub(crate) fn retained_by(&mut self, page_url: &str) {
        self.retaining_page_urls.insert(page_url.to_owned());
    }

    pub(crate) fn released_by(&mut self, page_url: &str) {
        self.retaining_page_urls.remove(page_url);
    }

    pub(crate) fn retaining_page_urls(&self) -> &HashSet<String> {
        &self.retaining_page_urls
    }

    /// No page maps to this icon any more: it can be dropped from memory
    /// and tombstoned on disk.
    pub(crate) fn is_unreferenced(&self) -> bool {
        self.retaining_page_urls.is_empty()
    }

    /// Deep-copied value for the sync engine. With `for_deletion` the
    /// snapshot is a tombstone regardless of current state.
    pub(crate) fn snapshot(&self, for_deletion: bool) -> IconSnapshot {
        if for_deletion {
            return IconSnapshot::deletion(self.icon_url.clone());
        }
        let data = match &self.image {
            ImageData::Present(icon) => Some(icon.bytes().to_vec()),
            ImageData::Unknown | ImageData::Missing => None,
        };
        IconSnapshot::new(self.icon_url.clone(), self.timestamp, data)
    }
}

/// One page URL: its client-managed retain count and (at most one) icon.
#[derive(Debug)]
pub(crate) struct PageUrlRecord {
    page_url: String,
    pub(crate) icon_url: Option<String>,
    retain_count: u32,
}

impl PageUrlRecord {
    pub(crate) fn new(page_url: impl Into<String>) -> Self {
        Self { page_url: page_url.into(), icon_url: None, retain_count: 0 }
    }

    pub(crate) fn retain_count(&self) -> u32 {
        self.retain_count
    }

    /// Bump the retain count. Returns whether the page was already retained
    /// (callers do first-retain bookkeeping when this is `false`).
    pub(crate) fn retain(&mut self) -> bool {
        let was_retained = self.retain_count > 0;
        self.retain_count += 1;
        was_retained
    }

    /// Drop one retention. Returns whether the page is still retained.
    pub(crate) fn release(&mut self) -> bool {
        self.retain_count = self.retain_count.saturating_sub(1);
        self.retain_count > 0
    }

    pub(crate) fn snapshot(&self, for_deletion: bool) -> PageSnapshot {
        if for_deletion {
            return PageSnapshot::deletion(self.page_url.clone());
        }
        PageSnapshot::new(self.page_url.clone(), self.icon_url.clone())
    }
}
