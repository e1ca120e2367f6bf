/// One row of the startup URL import: a page URL, the icon URL it maps to,
/// and the icon's last-retrieved timestamp. Produced by the join query in
/// `queries/import_rows.sql`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ImportedRow {
    pub page_url: String,
    pub icon_url: String,
    pub retrieved_at: i64,
}

/// A page row's identity, used by the pruning pass to compare the on-disk
/// table against the in-memory retain set.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PageRow {
    pub rowid: i64,
    pub url: String,
}
