//! Relational state for scans, issues, fixes, verifications and page usage.
//!
//! Backed by an embedded libSQL database. Every query goes through one
//! connection; the schema is applied on open and is safe to re-run.

mod fixes;
mod helpers;
mod issues;
mod scans;
mod usage;
mod verifications;

use libsql::Builder;

use super::error::StoreError;

pub use usage::usage_month;

const MIGRATION_001: &str = include_str!("../../../migrations/001_initial.sql");

pub const PREFIX_SCAN: &str = "scn";
pub const PREFIX_ISSUE: &str = "iss";
pub const PREFIX_FIX: &str = "fix";
pub const PREFIX_VERIFICATION: &str = "ver";

pub struct Store {
    #[allow(dead_code)]
    db: libsql::Database,
    conn: libsql::Connection,
}

impl Store {
    /// Open (or create) the database at `path`; `":memory:"` gives a
    /// throwaway database.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let db = Builder::new_local(path).build().await?;
        let conn = db.connect()?;

        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| StoreError::Migration(format!("PRAGMA foreign_keys: {e}")))?;

        let store = Self { db, conn };
        store.run_migrations().await?;
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:").await
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch(MIGRATION_001)
            .await
            .map_err(|e| StoreError::Migration(format!("001_initial: {e}")))?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> &libsql::Connection {
        &self.conn
    }

    /// Prefixed random id, e.g. `"scn-3fa1c09b12de"`.
    pub(crate) async fn generate_id(&self, prefix: &str) -> Result<String, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT ?1 || '-' || lower(hex(randomblob(6)))",
                [prefix],
            )
            .await?;
        let row = rows.next().await?.ok_or(StoreError::NoResult)?;
        Ok(row.get::<String>(0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_schema() {
        let store = Store::open_in_memory().await.unwrap();
        for table in ["scans", "issues", "fixes", "verifications", "page_usage"] {
            let mut rows = store
                .conn()
                .query(
                    "SELECT name FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                )
                .await
                .unwrap();
            assert!(rows.next().await.unwrap().is_some(), "table '{table}' should exist");
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        store.run_migrations().await.unwrap();
    }

    #[tokio::test]
    async fn generated_ids_are_prefixed_hex() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store.generate_id(PREFIX_SCAN).await.unwrap();
        assert!(id.starts_with("scn-"), "{id}");
        assert_eq!(id.len(), 16);
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, store.generate_id(PREFIX_SCAN).await.unwrap());
    }

    #[tokio::test]
    async fn file_backed_store_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        let path = path.to_string_lossy().to_string();

        let scan_id = {
            let store = Store::open(&path).await.unwrap();
            store
                .create_scan("acct-1", "https://example.com/", "example.com", 5)
                .await
                .unwrap()
                .id
        };

        let store = Store::open(&path).await.unwrap();
        let scan = store.get_scan(&scan_id).await.unwrap().expect("scan survives reopen");
        assert_eq!(scan.domain, "example.com");
    }
}
