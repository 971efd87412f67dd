use chrono::{DateTime, Utc};

use super::Store;
use crate::app::error::StoreError;

/// Usage bucket for a timestamp, e.g. `"2026-10"`.
pub fn usage_month(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

impl Store {
    pub async fn pages_used(&self, account_id: &str, month: &str) -> Result<u64, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT pages FROM page_usage WHERE account_id = ?1 AND month = ?2",
                [account_id, month],
            )
            .await?;
        match rows.next().await? {
            Some(row) => {
                let pages = row.get::<i64>(0)?;
                Ok(u64::try_from(pages).unwrap_or(0))
            }
            None => Ok(0),
        }
    }

    pub async fn add_pages_used(
        &self,
        account_id: &str,
        month: &str,
        pages: u64,
    ) -> Result<u64, StoreError> {
        let pages = i64::try_from(pages)
            .map_err(|_| StoreError::InvalidState(format!("page count {pages} too large")))?;
        self.conn()
            .execute(
                "INSERT INTO page_usage (account_id, month, pages) VALUES (?1, ?2, ?3)
                 ON CONFLICT(account_id, month) DO UPDATE SET pages = pages + excluded.pages",
                libsql::params![account_id, month, pages],
            )
            .await?;
        self.pages_used(account_id, month).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn month_key_is_year_and_month() {
        let at = Utc.with_ymd_and_hms(2026, 3, 9, 23, 59, 0).unwrap();
        assert_eq!(usage_month(at), "2026-03");
    }

    #[tokio::test]
    async fn usage_accumulates_per_account_and_month() {
        let store = Store::open_in_memory().await.unwrap();
        assert_eq!(store.pages_used("acct", "2026-10").await.unwrap(), 0);

        store.add_pages_used("acct", "2026-10", 12).await.unwrap();
        let total = store.add_pages_used("acct", "2026-10", 8).await.unwrap();
        assert_eq!(total, 20);

        store.add_pages_used("acct", "2026-11", 1).await.unwrap();
        store.add_pages_used("other", "2026-10", 3).await.unwrap();
        assert_eq!(store.pages_used("acct", "2026-10").await.unwrap(), 20);
    }
}
