//! Cross-thread notification protocol.
//!
//! Every user-visible event is a small owned value queued on an unbounded
//! channel and delivered by a dedicated dispatcher task. Callbacks run with
//! no cache locks held, so an observer is free to call straight back into
//! the cache. Events for a single page keep their queue order, which is
//! what guarantees "icon URL known" is deliverable before "icon data
//! known" for that page.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Client-side notification sink.
///
/// All methods default to no-ops so observers only implement what they
/// care about. Implementations must be cheap or hand off to their own
/// executor: the dispatcher delivers events one at a time.
pub trait CacheObserver: Send + Sync + 'static {
    /// The icon URL mapping for this page is now known (set by a client,
    /// imported at startup, or repointed).
    fn on_icon_url_known(&self, page_url: &str) {
        let _ = page_url;
    }

    /// Image data for this page's icon is now resident in memory.
    fn on_icon_data_known(&self, page_url: &str) {
        let _ = page_url;
    }

    /// Every cached icon was removed, in memory and on disk.
    fn on_all_icons_removed(&self) {}

    /// The startup URL import finished; every mapping lookup is now
    /// answered authoritatively and parked load decisions can be retried.
    fn on_import_finished(&self) {}
}

/// Observer used until a real one is set.
pub(crate) struct NoopObserver;

impl CacheObserver for NoopObserver {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CacheEvent {
    IconUrlKnown(String),
    IconDataKnown(String),
    AllIconsRemoved,
    ImportFinished,
}

pub(crate) type EventSender = mpsc::UnboundedSender<CacheEvent>;
pub(crate) type EventReceiver = mpsc::UnboundedReceiver<CacheEvent>;

pub(crate) fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Deliver events to the observer until every sender is gone.
///
/// Runs as its own task so no notification is ever delivered from inside a
/// locked section or from the sync engine's loop.
pub(crate) async fn dispatch(mut events: EventReceiver, observer: Arc<dyn CacheObserver>) {
    while let Some(event) = events.recv().await {
        match event {
            CacheEvent::IconUrlKnown(page_url) => observer.on_icon_url_known(&page_url),
            CacheEvent::IconDataKnown(page_url) => observer.on_icon_data_known(&page_url),
            CacheEvent::AllIconsRemoved => observer.on_all_icons_removed(),
            CacheEvent::ImportFinished => observer.on_import_finished(),
        }
    }
    debug!("notification dispatcher drained");
}
