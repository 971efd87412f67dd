use chrono::Utc;

use super::helpers::{get_opt_string, parse_datetime, parse_label};
use super::{PREFIX_ISSUE, Store};
use crate::app::error::StoreError;
use crate::app::types::{DetectedIssue, Issue, IssueType, Severity};

const SELECT_COLS: &str = "id, scan_id, page_url, issue_type, severity, title, description, \
     current_value, fixable, created_at";

/// Most severe first, then detection order.
const ORDER_BY_SEVERITY: &str = "CASE severity WHEN 'critical' THEN 0 WHEN 'high' THEN 1 \
     WHEN 'medium' THEN 2 ELSE 3 END, rowid";

fn row_to_issue(row: &libsql::Row) -> Result<Issue, StoreError> {
    Ok(Issue {
        id: row.get(0)?,
        scan_id: row.get(1)?,
        page_url: row.get(2)?,
        issue_type: parse_label(&row.get::<String>(3)?, "issue type", IssueType::from_label)?,
        severity: parse_label(&row.get::<String>(4)?, "severity", Severity::from_label)?,
        title: row.get(5)?,
        description: row.get(6)?,
        current_value: get_opt_string(row, 7)?,
        fixable: row.get::<i64>(8)? != 0,
        created_at: parse_datetime(&row.get::<String>(9)?)?,
    })
}

impl Store {
    /// Persist one page's detections under `scan_id` in a single
    /// transaction.
    pub async fn insert_issues(
        &self,
        scan_id: &str,
        detected: &[DetectedIssue],
    ) -> Result<Vec<Issue>, StoreError> {
        if detected.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut ids = Vec::with_capacity(detected.len());
        for _ in detected {
            ids.push(self.generate_id(PREFIX_ISSUE).await?);
        }

        let tx = self.conn().transaction().await?;
        for (id, issue) in ids.iter().zip(detected) {
            tx.execute(
                "INSERT INTO issues (id, scan_id, page_url, issue_type, severity, title, description, current_value, fixable, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                libsql::params![
                    id.as_str(),
                    scan_id,
                    issue.page_url.as_str(),
                    issue.issue_type.label(),
                    issue.severity.label(),
                    issue.title.as_str(),
                    issue.description.as_str(),
                    issue.current_value.as_deref(),
                    i64::from(issue.fixable),
                    now.to_rfc3339()
                ],
            )
            .await?;
        }
        tx.commit().await?;

        Ok(ids
            .into_iter()
            .zip(detected)
            .map(|(id, issue)| Issue {
                id,
                scan_id: scan_id.to_string(),
                page_url: issue.page_url.clone(),
                issue_type: issue.issue_type,
                severity: issue.severity,
                title: issue.title.clone(),
                description: issue.description.clone(),
                current_value: issue.current_value.clone(),
                fixable: issue.fixable,
                created_at: now,
            })
            .collect())
    }

    pub async fn list_issues(&self, scan_id: &str) -> Result<Vec<Issue>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SELECT_COLS} FROM issues WHERE scan_id = ?1 ORDER BY {ORDER_BY_SEVERITY}"
                ),
                [scan_id],
            )
            .await?;

        let mut issues = Vec::new();
        while let Some(row) = rows.next().await? {
            issues.push(row_to_issue(&row)?);
        }
        Ok(issues)
    }

    /// Issue lookup scoped to its scan; an issue id from another scan is
    /// reported as missing.
    pub async fn get_issue(&self, scan_id: &str, issue_id: &str) -> Result<Option<Issue>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SELECT_COLS} FROM issues WHERE id = ?1 AND scan_id = ?2"),
                [issue_id, scan_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_issue(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn count_issues(&self, scan_id: &str) -> Result<usize, StoreError> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM issues WHERE scan_id = ?1", [scan_id])
            .await?;
        let row = rows.next().await?.ok_or(StoreError::NoResult)?;
        super::helpers::get_usize(&row, 0)
    }
}
