//! Shared helpers for the async test suites.

use crate::config::CacheConfig;
use crate::notify::{CacheEvent, CacheObserver};
use std::sync::Mutex;
use std::time::Duration;

/// Observer that records every delivered event for later inspection.
#[derive(Default)]
pub(crate) struct EventLog {
    events: Mutex<Vec<CacheEvent>>,
}

impl EventLog {
    pub(crate) fn events(&self) -> Vec<CacheEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn contains(&self, event: &CacheEvent) -> bool {
        self.events.lock().unwrap().contains(event)
    }

    /// Poll until the log satisfies `predicate`, failing the test after a
    /// generous timeout.
    pub(crate) async fn wait_until(&self, predicate: impl Fn(&[CacheEvent]) -> bool) {
        eventually(|| predicate(&self.events.lock().unwrap())).await;
    }

    pub(crate) async fn wait_for(&self, event: CacheEvent) {
        self.wait_until(|events| events.contains(&event)).await;
    }
}

impl CacheObserver for EventLog {
    fn on_icon_url_known(&self, page_url: &str) {
        self.events.lock().unwrap().push(CacheEvent::IconUrlKnown(page_url.to_owned()));
    }
    fn on_icon_data_known(&self, page_url: &str) {
        self.events.lock().unwrap().push(CacheEvent::IconDataKnown(page_url.to_owned()));
    }
    fn on_all_icons_removed(&self) {
        self.events.lock().unwrap().push(CacheEvent::AllIconsRemoved);
    }
    fn on_import_finished(&self) {
        self.events.lock().unwrap().push(CacheEvent::ImportFinished);
    }
}

/// Poll `condition` until it holds, failing the test after ten seconds.
pub(crate) async fn eventually(condition: impl Fn() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    result.expect("condition did not become true in time");
}

/// Config with a short write debounce so flushes happen promptly in tests.
pub(crate) fn test_config() -> CacheConfig {
    CacheConfig { write_delay: Duration::from_millis(20), ..CacheConfig::default() }
}

/// A real (tiny) PNG so decoding succeeds wherever tests install data.
/// Different seeds produce different bytes, for telling writes apart.
pub(crate) fn png_bytes(seed: u8) -> Vec<u8> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    image::RgbaImage::from_pixel(4, 4, image::Rgba([seed, 128, 255, 255]))
        .write_to(&mut buffer, image::ImageFormat::Png)
        .expect("encoding a test PNG cannot fail");
    buffer.into_inner()
}
