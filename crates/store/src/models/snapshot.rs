//! Immutable write units handed to the persistence layer.
//!
//! Snapshots are deep copies taken from the live in-memory records while
//! their lock is held; once produced they share nothing with the records
//! they came from, so they can cross thread boundaries freely. A snapshot
//! with its fields zeroed out is a tombstone: it means "delete this row"
//! rather than "write these values".

/// One icon's persistent state: its URL, the timestamp of the last data
/// fetch, and the raw image bytes (if any are known).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IconSnapshot {
    pub icon_url: String,
    pub timestamp: i64,
    /// `None` both for "never read" and "known to have no data"; the
    /// distinction only exists in memory.
    pub data: Option<Vec<u8>>,
}

impl IconSnapshot {
    pub fn new(icon_url: impl Into<String>, timestamp: i64, data: Option<Vec<u8>>) -> Self {
        Self { icon_url: icon_url.into(), timestamp, data }
    }

    /// A tombstone marking the icon's rows for deletion.
    pub fn deletion(icon_url: impl Into<String>) -> Self {
        Self { icon_url: icon_url.into(), timestamp: 0, data: None }
    }

    /// A zeroed timestamp with no data means this icon is destined to be
    /// deleted rather than written.
    pub fn is_tombstone(&self) -> bool {
        self.timestamp == 0 && self.data.is_none()
    }
}

/// One page's persistent state: the mapping from its URL to its icon URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSnapshot {
    pub page_url: String,
    pub icon_url: Option<String>,
}

impl PageSnapshot {
    pub fn new(page_url: impl Into<String>, icon_url: Option<String>) -> Self {
        Self { page_url: page_url.into(), icon_url }
    }

    /// A tombstone marking the page row for deletion.
    pub fn deletion(page_url: impl Into<String>) -> Self {
        Self { page_url: page_url.into(), icon_url: None }
    }

    /// A page without an icon URL is meant to be deleted, not upserted.
    pub fn is_tombstone(&self) -> bool {
        self.icon_url.as_deref().is_none_or(str::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icon_tombstone() {
        assert!(IconSnapshot::deletion("http://a/icon.png").is_tombstone());
        assert!(!IconSnapshot::new("http://a/icon.png", 12, None).is_tombstone());
        assert!(!IconSnapshot::new("http://a/icon.png", 0, Some(vec![1])).is_tombstone());
    }

    #[test]
    fn test_page_tombstone() {
        assert!(PageSnapshot::deletion("http://a/").is_tombstone());
        assert!(PageSnapshot::new("http://a/", Some(String::new())).is_tombstone());
        assert!(!PageSnapshot::new("http://a/", Some("http://a/icon.png".into())).is_tombstone());
    }
}
