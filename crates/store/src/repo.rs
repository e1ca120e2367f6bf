//! Repository of prepared operations against the icon database.
//!
//! Writes arrive as [`IconSnapshot`]/[`PageSnapshot`] values and are applied
//! in batches, one transaction per batch. A failing statement inside a batch
//! is logged and its snapshot skipped; the rest of the batch still commits.
//! This mirrors the engine's recovery policy: individual row failures are
//! never fatal to the sync loop.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{IconSnapshot, ImportedRow, PageRow, PageSnapshot};
use exn::ResultExt;
use futures::StreamExt;
use futures::stream::BoxStream;
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::{debug, warn};

/// Metadata key recording that the one-time legacy import has run.
const LEGACY_IMPORTED_KEY: &str = "legacy_imported";

/// Repository for page/icon rows in the icon database.
///
/// The table layout splits icons across two tables — `icons` for the URL
/// and timestamp, `icon_data` for the blob — joined by a generated
/// `icon_id`, with `pages` mapping page URLs onto those ids. The id is an
/// internal detail: every public operation is keyed by URL.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl From<&Database> for Repository {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}

impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Read a metadata value by key.
    pub async fn metadata(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT value FROM metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    /// Write a metadata value (insert or replace).
    pub async fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT INTO metadata (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Whether the one-time legacy import has already run for this database.
    pub async fn legacy_imported(&self) -> Result<bool> {
        Ok(self.metadata(LEGACY_IMPORTED_KEY).await?.as_deref() == Some("1"))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Stream every persisted page/icon mapping for the startup import.
    pub fn import_rows(&self) -> BoxStream<'_, Result<ImportedRow>> {
        sqlx::query_as::<_, ImportedRow>(include_str!("../queries/import_rows.sql"))
            .fetch(&self.pool)
            .map(|row| row.or_raise(|| ErrorKind::Database))
            .boxed()
    }

    /// Fetch the stored image bytes for an icon URL.
    ///
    /// Returns `None` both when the icon is unknown and when its data blob
    /// is NULL (fetched before, nothing usable found).
    pub async fn image_data_for_icon_url(&self, icon_url: &str) -> Result<Option<Vec<u8>>> {
        let data: Option<Option<Vec<u8>>> =
            sqlx::query_scalar(include_str!("../queries/image_data_for_icon_url.sql"))
                .bind(icon_url)
                .fetch_optional(&self.pool)
                .await
                .or_raise(|| ErrorKind::Database)?;
        Ok(data.flatten())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Begin a transaction for grouped writes.
    pub async fn begin(&self) -> Result<StoreTransaction> {
        let tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        Ok(StoreTransaction { tx })
    }

    /// Apply a drained batch of pending writes in one transaction.
    ///
    /// Tombstones delete, everything else upserts. A snapshot that fails is
    /// logged and skipped so one bad row cannot wedge the sync loop.
    pub async fn apply_batch(&self, icons: &[IconSnapshot], pages: &[PageSnapshot]) -> Result<()> {
        let mut tx = self.begin().await?;
        for snapshot in icons {
            if let Err(err) = tx.write_icon(snapshot).await {
                warn!(icon_url = %snapshot.icon_url, error = %err, "skipping failed icon write");
            }
        }
        for snapshot in pages {
            if let Err(err) = tx.write_page(snapshot).await {
                warn!(page_url = %snapshot.page_url, error = %err, "skipping failed page write");
            }
        }
        tx.commit().await
    }

    // =========================================================================
    // Pruning
    // =========================================================================

    /// Every page row's identity, for the prune pass to compare against the
    /// set of pages still alive in memory.
    pub async fn page_rows(&self) -> Result<Vec<PageRow>> {
        sqlx::query_as::<_, PageRow>("SELECT rowid, url FROM pages")
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    /// Delete the given page rows in one transaction.
    pub async fn delete_pages(&self, rowids: &[i64]) -> Result<()> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        for rowid in rowids {
            debug!(rowid, "pruning page row");
            sqlx::query("DELETE FROM pages WHERE rowid = ?")
                .bind(rowid)
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Delete every icon row (and its data) that no page references.
    /// Atomic: runs both deletes in one transaction.
    pub async fn prune_unreferenced_icons(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        sqlx::query(include_str!("../queries/prune_unreferenced_icon_data.sql"))
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        sqlx::query(include_str!("../queries/prune_unreferenced_icons.sql"))
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Whether any page row references an icon that no longer exists.
    pub async fn has_dangling_pages(&self) -> Result<bool> {
        let row: Option<String> = sqlx::query_scalar(
            "SELECT url FROM pages WHERE icon_id NOT IN (SELECT icon_id FROM icons) LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(row.is_some())
    }

    /// Delete page rows whose icon no longer exists.
    pub async fn delete_dangling_pages(&self) -> Result<()> {
        sqlx::query(include_str!("../queries/prune_dangling_pages.sql"))
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }
}

/// An open write transaction.
///
/// Exists so callers outside this crate (the sync engine's legacy import)
/// can group several writes atomically without seeing any sqlx types.
pub struct StoreTransaction {
    tx: Transaction<'static, Sqlite>,
}

impl StoreTransaction {
    /// Upsert (or, for a tombstone, delete) one icon's rows.
    pub async fn write_icon(&mut self, snapshot: &IconSnapshot) -> Result<()> {
        write_icon_snapshot(&mut self.tx, snapshot).await
    }

    /// Upsert (or, for a tombstone, delete) one page mapping.
    pub async fn write_page(&mut self, snapshot: &PageSnapshot) -> Result<()> {
        write_page_snapshot(&mut self.tx, snapshot).await
    }

    /// Map a page URL onto an icon URL, creating the icon row if needed.
    pub async fn set_icon_url_for_page_url(&mut self, icon_url: &str, page_url: &str) -> Result<()> {
        set_icon_url_for_page_url(&mut self.tx, icon_url, page_url).await
    }

    /// Record that the one-time legacy import has run.
    pub async fn set_legacy_imported(&mut self, imported: bool) -> Result<()> {
        sqlx::query("INSERT INTO metadata (key, value) VALUES (?, ?)")
            .bind(LEGACY_IMPORTED_KEY)
            .bind(if imported { "1" } else { "0" })
            .execute(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Commit the transaction.
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await.or_raise(|| ErrorKind::Database)
    }

    /// Roll the transaction back, discarding its writes.
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.or_raise(|| ErrorKind::Database)
    }
}

// =========================================================================
// Statement helpers
// =========================================================================

async fn icon_id_for_icon_url(conn: &mut SqliteConnection, icon_url: &str) -> Result<Option<i64>> {
    sqlx::query_scalar("SELECT icon_id FROM icons WHERE url = ?")
        .bind(icon_url)
        .fetch_optional(conn)
        .await
        .or_raise(|| ErrorKind::Database)
}

/// Insert a new icon row (with an empty data row) and return its id.
async fn add_icon(conn: &mut SqliteConnection, icon_url: &str) -> Result<i64> {
    let result = sqlx::query("INSERT INTO icons (url, retrieved_at) VALUES (?, 0)")
        .bind(icon_url)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    let icon_id = result.last_insert_rowid();
    sqlx::query("INSERT INTO icon_data (icon_id, data) VALUES (?, NULL)")
        .bind(icon_id)
        .execute(conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(icon_id)
}

async fn set_icon_url_for_page_url(
    conn: &mut SqliteConnection,
    icon_url: &str,
    page_url: &str,
) -> Result<()> {
    let icon_id = match icon_id_for_icon_url(conn, icon_url).await? {
        Some(id) => id,
        None => add_icon(conn, icon_url).await?,
    };
    // The REPLACE conflict clause on pages.url makes this an upsert.
    sqlx::query("INSERT INTO pages (url, icon_id) VALUES (?, ?)")
        .bind(page_url)
        .bind(icon_id)
        .execute(conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(())
}

async fn remove_page(conn: &mut SqliteConnection, page_url: &str) -> Result<()> {
    sqlx::query("DELETE FROM pages WHERE url = ?")
        .bind(page_url)
        .execute(conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(())
}

/// Delete an icon's rows and every page mapping that references it.
async fn remove_icon(conn: &mut SqliteConnection, icon_url: &str) -> Result<()> {
    // Rapid browsing patterns can mark an icon for addition and then for
    // removal before it was ever written. Not finding it is fine.
    let Some(icon_id) = icon_id_for_icon_url(conn, icon_url).await? else {
        return Ok(());
    };
    for statement in [
        "DELETE FROM pages WHERE icon_id = ?",
        "DELETE FROM icons WHERE icon_id = ?",
        "DELETE FROM icon_data WHERE icon_id = ?",
    ] {
        sqlx::query(statement)
            .bind(icon_id)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
    }
    Ok(())
}

async fn write_icon_snapshot(conn: &mut SqliteConnection, snapshot: &IconSnapshot) -> Result<()> {
    if snapshot.icon_url.is_empty() {
        return Ok(());
    }
    if snapshot.is_tombstone() {
        debug!(icon_url = %snapshot.icon_url, "removing icon from database");
        return remove_icon(conn, &snapshot.icon_url).await;
    }
    match icon_id_for_icon_url(conn, &snapshot.icon_url).await? {
        Some(icon_id) => {
            sqlx::query("UPDATE icons SET retrieved_at = ?, url = ? WHERE icon_id = ?")
                .bind(snapshot.timestamp)
                .bind(&snapshot.icon_url)
                .bind(icon_id)
                .execute(&mut *conn)
                .await
                .or_raise(|| ErrorKind::Database)?;
            sqlx::query("UPDATE icon_data SET data = ? WHERE icon_id = ?")
                .bind(&snapshot.data)
                .bind(icon_id)
                .execute(conn)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
        None => {
            let result = sqlx::query("INSERT INTO icons (url, retrieved_at) VALUES (?, ?)")
                .bind(&snapshot.icon_url)
                .bind(snapshot.timestamp)
                .execute(&mut *conn)
                .await
                .or_raise(|| ErrorKind::Database)?;
            let icon_id = result.last_insert_rowid();
            sqlx::query("INSERT INTO icon_data (icon_id, data) VALUES (?, ?)")
                .bind(icon_id)
                .bind(&snapshot.data)
                .execute(conn)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
    }
    Ok(())
}

async fn write_page_snapshot(conn: &mut SqliteConnection, snapshot: &PageSnapshot) -> Result<()> {
    match snapshot.icon_url.as_deref().filter(|url| !url.is_empty()) {
        None => {
            debug!(page_url = %snapshot.page_url, "removing page from database");
            remove_page(conn, &snapshot.page_url).await
        }
        Some(icon_url) => set_icon_url_for_page_url(conn, icon_url, &snapshot.page_url).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn repo() -> (Database, Repository) {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = Repository::from(&db);
        (db, repo)
    }

    #[tokio::test]
    async fn test_page_mapping_round_trip() {
        let (db, repo) = repo().await;
        let pages = [PageSnapshot::new("http://a/", Some("http://a/icon.png".into()))];
        repo.apply_batch(&[], &pages).await.unwrap();

        let rows: Vec<ImportedRow> = repo.import_rows().try_collect().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].page_url, "http://a/");
        assert_eq!(rows[0].icon_url, "http://a/icon.png");
        assert_eq!(rows[0].retrieved_at, 0);
        db.close().await;
    }

    #[tokio::test]
    async fn test_repointing_a_page_keeps_a_single_row() {
        let (db, repo) = repo().await;
        repo.apply_batch(&[], &[PageSnapshot::new("http://a/", Some("http://a/one.png".into()))])
            .await
            .unwrap();
        repo.apply_batch(&[], &[PageSnapshot::new("http://a/", Some("http://a/two.png".into()))])
            .await
            .unwrap();

        let rows: Vec<ImportedRow> = repo.import_rows().try_collect().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].icon_url, "http://a/two.png");
        db.close().await;
    }

    #[tokio::test]
    async fn test_icon_data_round_trip() {
        let (db, repo) = repo().await;
        let bytes = vec![0x89, 0x50, 0x4E, 0x47];
        let icons = [IconSnapshot::new("http://a/icon.png", 42, Some(bytes.clone()))];
        repo.apply_batch(&icons, &[]).await.unwrap();

        let stored = repo.image_data_for_icon_url("http://a/icon.png").await.unwrap();
        assert_eq!(stored, Some(bytes));
        db.close().await;
    }

    #[tokio::test]
    async fn test_icon_without_data_reads_back_as_none() {
        let (db, repo) = repo().await;
        repo.apply_batch(&[IconSnapshot::new("http://a/icon.png", 42, None)], &[]).await.unwrap();
        assert_eq!(repo.image_data_for_icon_url("http://a/icon.png").await.unwrap(), None);
        // An icon that was never written at all answers the same way.
        assert_eq!(repo.image_data_for_icon_url("http://b/icon.png").await.unwrap(), None);
        db.close().await;
    }

    #[tokio::test]
    async fn test_updating_icon_data_replaces_previous_blob() {
        let (db, repo) = repo().await;
        repo.apply_batch(&[IconSnapshot::new("http://a/icon.png", 1, Some(vec![1]))], &[])
            .await
            .unwrap();
        repo.apply_batch(&[IconSnapshot::new("http://a/icon.png", 2, Some(vec![2, 3]))], &[])
            .await
            .unwrap();
        assert_eq!(
            repo.image_data_for_icon_url("http://a/icon.png").await.unwrap(),
            Some(vec![2, 3]),
        );
        db.close().await;
    }

    #[tokio::test]
    async fn test_page_tombstone_deletes_the_row() {
        let (db, repo) = repo().await;
        repo.apply_batch(&[], &[PageSnapshot::new("http://a/", Some("http://a/icon.png".into()))])
            .await
            .unwrap();
        repo.apply_batch(&[], &[PageSnapshot::deletion("http://a/")]).await.unwrap();

        let rows: Vec<ImportedRow> = repo.import_rows().try_collect().await.unwrap();
        assert!(rows.is_empty());
        // Applying the tombstone again is a no-op, not an error.
        repo.apply_batch(&[], &[PageSnapshot::deletion("http://a/")]).await.unwrap();
        db.close().await;
    }

    #[tokio::test]
    async fn test_icon_tombstone_deletes_icon_and_referencing_pages() {
        let (db, repo) = repo().await;
        repo.apply_batch(
            &[IconSnapshot::new("http://a/icon.png", 42, Some(vec![1, 2]))],
            &[PageSnapshot::new("http://a/", Some("http://a/icon.png".into()))],
        )
        .await
        .unwrap();
        repo.apply_batch(&[IconSnapshot::deletion("http://a/icon.png")], &[]).await.unwrap();

        assert_eq!(repo.image_data_for_icon_url("http://a/icon.png").await.unwrap(), None);
        assert!(repo.page_rows().await.unwrap().is_empty());
        db.close().await;
    }

    #[tokio::test]
    async fn test_pruning_removes_exactly_the_unreferenced_rows() {
        let (db, repo) = repo().await;
        repo.apply_batch(
            &[IconSnapshot::new("http://kept/icon.png", 1, Some(vec![1]))],
            &[
                PageSnapshot::new("http://kept/", Some("http://kept/icon.png".into())),
                PageSnapshot::new("http://gone/", Some("http://gone/icon.png".into())),
            ],
        )
        .await
        .unwrap();

        // Simulate the engine pruning "http://gone/": delete its page row,
        // then sweep icons nothing references any more.
        let rowids: Vec<i64> = repo
            .page_rows()
            .await
            .unwrap()
            .into_iter()
            .filter(|row| row.url == "http://gone/")
            .map(|row| row.rowid)
            .collect();
        repo.delete_pages(&rowids).await.unwrap();
        repo.prune_unreferenced_icons().await.unwrap();

        let rows: Vec<ImportedRow> = repo.import_rows().try_collect().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].page_url, "http://kept/");
        assert_eq!(
            repo.image_data_for_icon_url("http://kept/icon.png").await.unwrap(),
            Some(vec![1]),
        );
        assert_eq!(repo.image_data_for_icon_url("http://gone/icon.png").await.unwrap(), None);
        db.close().await;
    }

    #[tokio::test]
    async fn test_dangling_page_detection_and_cleanup() {
        let (db, repo) = repo().await;
        sqlx::query("INSERT INTO pages (url, icon_id) VALUES ('http://a/', 999)")
            .execute(db.pool())
            .await
            .unwrap();
        assert!(repo.has_dangling_pages().await.unwrap());
        repo.delete_dangling_pages().await.unwrap();
        assert!(!repo.has_dangling_pages().await.unwrap());
        db.close().await;
    }

    #[tokio::test]
    async fn test_legacy_import_flag_round_trip() {
        let (db, repo) = repo().await;
        assert!(!repo.legacy_imported().await.unwrap());
        let mut tx = repo.begin().await.unwrap();
        tx.set_legacy_imported(true).await.unwrap();
        tx.commit().await.unwrap();
        assert!(repo.legacy_imported().await.unwrap());
        db.close().await;
    }

    #[tokio::test]
    async fn test_rolled_back_transaction_leaves_no_trace() {
        let (db, repo) = repo().await;
        let mut tx = repo.begin().await.unwrap();
        tx.set_icon_url_for_page_url("http://a/icon.png", "http://a/").await.unwrap();
        tx.rollback().await.unwrap();
        assert!(repo.page_rows().await.unwrap().is_empty());
        db.close().await;
    }

    #[tokio::test]
    async fn test_empty_icon_url_snapshot_is_skipped() {
        let (db, repo) = repo().await;
        repo.apply_batch(&[IconSnapshot::new("", 42, Some(vec![1]))], &[]).await.unwrap();
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM icons").fetch_one(db.pool()).await.unwrap();
        assert_eq!(count, 0);
        db.close().await;
    }
}
