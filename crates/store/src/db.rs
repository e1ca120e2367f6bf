//! Database connection and lifecycle management.

use exn::ResultExt;
use sqlx::SqliteConnection;
use sqlx::pool::PoolConnectionMetadata;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::{Path, PathBuf};
use tracing::{instrument, warn};

use crate::error::{ErrorKind, Result};

/// Embedded migrations. Deliberately *not* run on connect: the sync engine
/// must check the on-disk schema version first, so a database written by a
/// newer release is never modified. See [`Database::schema_version`].
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// The schema generation this build reads and writes.
///
/// A database stamped with a *newer* version is left untouched; an older or
/// missing stamp causes the database to be wiped and recreated.
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

// All I/O is serialized through the single sync engine, so there is never
// more than one writer. A couple of spare connections keep read statements
// off the write connection.
const MAX_CONNECTIONS: u32 = 2;

/// SQLite database holding the icon cache.
///
/// This is the main entry point for persistence. It manages the connection
/// pool and hands out [`Repository`](crate::Repository) instances.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl Database {
    async fn new(options: SqliteConnectOptions, path: Option<PathBuf>, max: Option<u32>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            // Applies the query-based PRAGMAs to EVERY connection created
            // by the pool, not only the first one.
            .after_connect(|conn, meta| Box::pin(async move {
                Self::apply_pragmas(conn, meta).await
            }))
            .max_connections(max.unwrap_or(MAX_CONNECTIONS))
            .connect_with(options)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(Self { pool, path })
    }

    /// Open (creating if necessary) the icon database at the given path.
    ///
    /// Does not run migrations; callers are expected to call
    /// [`schema_version`](Self::schema_version) and then
    /// [`migrate`](Self::migrate) once the version stamp checks out.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let options = Self::base_options().filename(path).create_if_missing(true);
        Self::new(options, Some(path.to_path_buf()), None).await
    }

    /// Connect to an in-memory database (useful for testing).
    ///
    /// Migrations run immediately since a fresh in-memory database cannot
    /// carry a foreign version stamp.
    ///
    /// Note:
    /// - In-memory databases are destroyed when the connection closes.
    /// - Do NOT apply `#[cfg(test)]` so that other crates can also use this in their tests.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = Self::base_options().filename(":memory:");
        // In-memory databases must be limited to one connection, otherwise
        // parallel connections see different (empty) databases.
        let db = Self::new(options, None, Some(1)).await?;
        db.migrate().await?;
        Ok(db)
    }

    /// Base connection options shared between file and in-memory databases.
    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            // WAL keeps client-thread reads from stalling behind the sync
            // engine's write transactions.
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            // PRAGMA synchronous = NORMAL (balance between safety and speed)
            .synchronous(SqliteSynchronous::Normal)
            // PRAGMA busy_timeout = 1500ms
            .busy_timeout(std::time::Duration::from_millis(1500))
    }

    /// Apply additional PRAGMA settings that aren't exposed via SqliteConnectOptions.
    async fn apply_pragmas(conn: &mut SqliteConnection, _meta: PoolConnectionMetadata) -> sqlx::Result<()> {
        // Icon rows are tiny and blob reads are one-shot; the default page
        // cache is far more than this workload needs.
        sqlx::query(
            r#"
                PRAGMA locking_mode = NORMAL;
                PRAGMA cache_size = -512;
                PRAGMA temp_store = MEMORY;
            "#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Read the schema version stamp without touching anything else.
    ///
    /// Returns `None` when the metadata table does not exist yet (a brand
    /// new or foreign database). Must be called *before*
    /// [`migrate`](Self::migrate) so a too-new database is never written to.
    pub async fn schema_version(&self) -> Result<Option<i64>> {
        let table: Option<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'metadata'",
        )
        .fetch_optional(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        if table.is_none() {
            return Ok(None);
        }
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM metadata WHERE key = 'schema_version'")
                .fetch_optional(&self.pool)
                .await
                .or_raise(|| ErrorKind::Database)?;
        value
            .map(|v| v.parse::<i64>().or_raise(|| ErrorKind::InvalidData("schema version")))
            .transpose()
    }

    /// Run database migrations, creating the schema if absent.
    #[instrument("performing database migrations", skip(self))]
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await.or_raise(|| ErrorKind::Migration)
    }

    /// Run `PRAGMA integrity_check` and report whether the database passed.
    pub async fn check_integrity(&self) -> Result<bool> {
        let result: String = sqlx::query_scalar("PRAGMA integrity_check")
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Corrupt)?;
        // A clean check yields exactly one row containing "ok"; anything
        // else is a list of problems.
        if result != "ok" {
            warn!(problems = %result, "database integrity check failed");
        }
        Ok(result == "ok")
    }

    /// Delete every cached row while keeping the schema and version stamp.
    ///
    /// Used when the client asks for all icons to be removed; the freed
    /// space is reclaimed immediately since icon data can be large.
    pub async fn wipe(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        for statement in ["DELETE FROM pages", "DELETE FROM icons", "DELETE FROM icon_data"] {
            sqlx::query(statement).execute(&mut *tx).await.or_raise(|| ErrorKind::Database)?;
        }
        // sqlite_sequence only exists once an AUTOINCREMENT insert has
        // happened, so a failure here is not interesting.
        _ = sqlx::query("DELETE FROM sqlite_sequence WHERE name = 'icons'").execute(&mut *tx).await;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        // VACUUM cannot run inside the transaction.
        sqlx::query("VACUUM").execute(&self.pool).await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Destroy the database files and reconnect from scratch.
    ///
    /// The recovery path for a corrupt or unusably-versioned-below store:
    /// closes the pool, removes the database along with any journal
    /// leftovers, then reopens and migrates a fresh one.
    pub async fn rebuild(self) -> Result<Self> {
        let Some(path) = self.path.clone() else {
            // In-memory databases have no files to destroy.
            exn::bail!(ErrorKind::Corrupt);
        };
        self.close().await;
        for leftover in journal_files(&path) {
            match tokio::fs::remove_file(&leftover).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %leftover.display(), error = %err, "could not remove database file");
                }
            }
        }
        let db = Self::connect(&path).await?;
        db.migrate().await?;
        Ok(db)
    }

    /// Whether a previous session left a journal behind, which is evidence
    /// of a crash or force-quit and grounds for an integrity check.
    pub fn has_leftover_journal(path: impl AsRef<Path>) -> bool {
        journal_files(path.as_ref())
            .into_iter()
            .skip(1) // the database file itself
            .any(|p| p.exists())
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection pool.
    ///
    /// Waits for all connections to be returned to the pool and then closes
    /// them. The Database instance should not be used afterwards.
    pub async fn close(&self) {
        // Let SQLite update query planner statistics
        _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        self.pool.close().await;
    }
}

/// The database file plus every sidecar file SQLite may create next to it.
fn journal_files(path: &Path) -> Vec<PathBuf> {
    let mut files = vec![path.to_path_buf()];
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        for suffix in ["-journal", "-wal", "-shm"] {
            files.push(path.with_file_name(format!("{name}{suffix}")));
        }
    }
    files
}
