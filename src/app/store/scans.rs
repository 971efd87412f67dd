use chrono::Utc;

use super::helpers::{get_opt_string, get_usize, parse_datetime, parse_label, parse_optional_datetime};
use super::{PREFIX_SCAN, Store};
use crate::app::error::StoreError;
use crate::app::types::{Scan, ScanStatus};

const SELECT_COLS: &str = "id, account_id, target_url, domain, status, max_pages, pages_visited, \
     score, failure_reason, created_at, completed_at";

fn row_to_scan(row: &libsql::Row) -> Result<Scan, StoreError> {
    let score = match row.get::<Option<i64>>(7)? {
        Some(value) => Some(
            u8::try_from(value)
                .map_err(|_| StoreError::Query(format!("score {value} out of range")))?,
        ),
        None => None,
    };
    Ok(Scan {
        id: row.get(0)?,
        account_id: row.get(1)?,
        target_url: row.get(2)?,
        domain: row.get(3)?,
        status: parse_label(&row.get::<String>(4)?, "scan status", ScanStatus::from_label)?,
        max_pages: get_usize(row, 5)?,
        pages_visited: get_usize(row, 6)?,
        score,
        failure_reason: get_opt_string(row, 8)?,
        created_at: parse_datetime(&row.get::<String>(9)?)?,
        completed_at: parse_optional_datetime(get_opt_string(row, 10)?.as_deref())?,
    })
}

impl Store {
    pub async fn create_scan(
        &self,
        account_id: &str,
        target_url: &str,
        domain: &str,
        max_pages: usize,
    ) -> Result<Scan, StoreError> {
        let now = Utc::now();
        let id = self.generate_id(PREFIX_SCAN).await?;

        self.conn()
            .execute(
                "INSERT INTO scans (id, account_id, target_url, domain, status, max_pages, pages_visited, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
                libsql::params![
                    id.as_str(),
                    account_id,
                    target_url,
                    domain,
                    ScanStatus::Queued.label(),
                    max_pages as i64,
                    now.to_rfc3339()
                ],
            )
            .await?;

        Ok(Scan {
            id,
            account_id: account_id.to_string(),
            target_url: target_url.to_string(),
            domain: domain.to_string(),
            status: ScanStatus::Queued,
            max_pages,
            pages_visited: 0,
            score: None,
            failure_reason: None,
            created_at: now,
            completed_at: None,
        })
    }

    pub async fn get_scan(&self, id: &str) -> Result<Option<Scan>, StoreError> {
        let mut rows = self
            .conn()
            .query(&format!("SELECT {SELECT_COLS} FROM scans WHERE id = ?1"), [id])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_scan(&row)?)),
            None => Ok(None),
        }
    }

    /// Compare-and-set status change. Returns `false` when the scan is no
    /// longer in `from` (another writer got there first); the row is left
    /// untouched in that case.
    pub async fn transition_scan(
        &self,
        id: &str,
        from: ScanStatus,
        to: ScanStatus,
        failure_reason: Option<&str>,
    ) -> Result<bool, StoreError> {
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidState(format!(
                "scan {id}: {} -> {} is not a valid transition",
                from.label(),
                to.label()
            )));
        }

        let completed_at = to.is_terminal().then(|| Utc::now().to_rfc3339());
        let changed = self
            .conn()
            .execute(
                "UPDATE scans
                 SET status = ?1,
                     failure_reason = COALESCE(?2, failure_reason),
                     completed_at = COALESCE(?3, completed_at)
                 WHERE id = ?4 AND status = ?5",
                libsql::params![to.label(), failure_reason, completed_at, id, from.label()],
            )
            .await?;
        Ok(changed == 1)
    }

    /// Lower the page budget before crawling starts.
    pub async fn set_page_budget(&self, id: &str, max_pages: usize) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE scans SET max_pages = ?1 WHERE id = ?2 AND pages_visited <= ?1",
                libsql::params![max_pages as i64, id],
            )
            .await?;
        Ok(())
    }

    /// Progress is only written while the scan is still active, so a late
    /// crawler event cannot touch an aborted scan.
    pub async fn record_progress(&self, id: &str, pages_visited: usize) -> Result<bool, StoreError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE scans SET pages_visited = MIN(?1, max_pages)
                 WHERE id = ?2 AND status IN ('crawling', 'scanning')",
                libsql::params![pages_visited as i64, id],
            )
            .await?;
        Ok(changed == 1)
    }

    /// `scanning -> completed` with the final score and page count.
    pub async fn complete_scan(
        &self,
        id: &str,
        score: u8,
        pages_visited: usize,
    ) -> Result<bool, StoreError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE scans
                 SET status = ?1, score = ?2, pages_visited = MIN(?3, max_pages), completed_at = ?4
                 WHERE id = ?5 AND status = ?6",
                libsql::params![
                    ScanStatus::Completed.label(),
                    i64::from(score),
                    pages_visited as i64,
                    Utc::now().to_rfc3339(),
                    id,
                    ScanStatus::Scanning.label()
                ],
            )
            .await?;
        Ok(changed == 1)
    }

    pub async fn list_scans_by_status(
        &self,
        statuses: &[ScanStatus],
    ) -> Result<Vec<Scan>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (1..=statuses.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let params = statuses
            .iter()
            .map(|s| libsql::Value::from(s.label().to_string()))
            .collect::<Vec<_>>();

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SELECT_COLS} FROM scans WHERE status IN ({placeholders})
                     ORDER BY created_at ASC, rowid ASC"
                ),
                libsql::params_from_iter(params),
            )
            .await?;

        let mut scans = Vec::new();
        while let Some(row) = rows.next().await? {
            scans.push(row_to_scan(&row)?);
        }
        Ok(scans)
    }

    pub async fn list_active_scans(&self) -> Result<Vec<Scan>, StoreError> {
        self.list_scans_by_status(&[ScanStatus::Crawling, ScanStatus::Scanning])
            .await
    }
}
