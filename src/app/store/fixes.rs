use chrono::Utc;

use super::helpers::{get_opt_string, parse_datetime, parse_label, parse_optional_datetime};
use super::{PREFIX_FIX, Store};
use crate::app::error::StoreError;
use crate::app::types::{AppliedFix, Fix, FixStatus, IssueType, Severity};

const SELECT_COLS: &str = "id, issue_id, scan_id, patch, status, created_at, applied_at";

fn row_to_fix(row: &libsql::Row) -> Result<Fix, StoreError> {
    Ok(Fix {
        id: row.get(0)?,
        issue_id: row.get(1)?,
        scan_id: row.get(2)?,
        patch: row.get(3)?,
        status: parse_label(&row.get::<String>(4)?, "fix status", FixStatus::from_label)?,
        created_at: parse_datetime(&row.get::<String>(5)?)?,
        applied_at: parse_optional_datetime(get_opt_string(row, 6)?.as_deref())?,
    })
}

impl Store {
    /// Create or replace the patch for an issue. There is at most one fix
    /// row per issue; an existing row keeps its id and status.
    pub async fn upsert_fix(
        &self,
        scan_id: &str,
        issue_id: &str,
        patch: &str,
    ) -> Result<Fix, StoreError> {
        let id = self.generate_id(PREFIX_FIX).await?;
        self.conn()
            .execute(
                "INSERT INTO fixes (id, issue_id, scan_id, patch, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(issue_id) DO UPDATE SET patch = excluded.patch",
                libsql::params![
                    id.as_str(),
                    issue_id,
                    scan_id,
                    patch,
                    FixStatus::Pending.label(),
                    Utc::now().to_rfc3339()
                ],
            )
            .await?;

        self.get_fix_for_issue(issue_id)
            .await?
            .ok_or(StoreError::NoResult)
    }

    /// Flip a fix to applied. The first application time is kept.
    pub async fn mark_fix_applied(&self, fix_id: &str) -> Result<Fix, StoreError> {
        self.conn()
            .execute(
                "UPDATE fixes SET status = ?1, applied_at = COALESCE(applied_at, ?2) WHERE id = ?3",
                libsql::params![FixStatus::Applied.label(), Utc::now().to_rfc3339(), fix_id],
            )
            .await?;

        let mut rows = self
            .conn()
            .query(&format!("SELECT {SELECT_COLS} FROM fixes WHERE id = ?1"), [fix_id])
            .await?;
        let row = rows.next().await?.ok_or(StoreError::NoResult)?;
        row_to_fix(&row)
    }

    pub async fn get_fix_for_issue(&self, issue_id: &str) -> Result<Option<Fix>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SELECT_COLS} FROM fixes WHERE issue_id = ?1"),
                [issue_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_fix(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_fix_for_issue(&self, issue_id: &str) -> Result<bool, StoreError> {
        let changed = self
            .conn()
            .execute("DELETE FROM fixes WHERE issue_id = ?1", [issue_id])
            .await?;
        Ok(changed > 0)
    }

    pub async fn list_fixes(&self, scan_id: &str) -> Result<Vec<Fix>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SELECT_COLS} FROM fixes WHERE scan_id = ?1 ORDER BY rowid"),
                [scan_id],
            )
            .await?;
        let mut fixes = Vec::new();
        while let Some(row) = rows.next().await? {
            fixes.push(row_to_fix(&row)?);
        }
        Ok(fixes)
    }

    /// Applied fixes for every scan of `domain`, most severe first and
    /// newest first within a severity.
    pub async fn applied_fixes_for_domain(&self, domain: &str) -> Result<Vec<AppliedFix>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT f.id, i.issue_type, i.severity, i.page_url, f.patch, f.applied_at
                 FROM fixes f
                 JOIN issues i ON i.id = f.issue_id
                 JOIN scans s ON s.id = f.scan_id
                 WHERE s.domain = ?1 AND f.status = 'applied' AND f.applied_at IS NOT NULL
                 ORDER BY CASE i.severity WHEN 'critical' THEN 0 WHEN 'high' THEN 1
                          WHEN 'medium' THEN 2 ELSE 3 END,
                          f.applied_at DESC, f.rowid DESC",
                [domain],
            )
            .await?;

        let mut fixes = Vec::new();
        while let Some(row) = rows.next().await? {
            fixes.push(AppliedFix {
                fix_id: row.get(0)?,
                issue_type: parse_label(&row.get::<String>(1)?, "issue type", IssueType::from_label)?,
                severity: parse_label(&row.get::<String>(2)?, "severity", Severity::from_label)?,
                page_url: row.get(3)?,
                patch: row.get(4)?,
                applied_at: parse_datetime(&row.get::<String>(5)?)?,
            });
        }
        Ok(fixes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::types::DetectedIssue;
    use pretty_assertions::assert_eq;

    async fn seeded(domain: &str, kinds: &[IssueType]) -> (Store, String, Vec<String>) {
        let store = Store::open_in_memory().await.unwrap();
        let (scan_id, issue_ids) = add_scan(&store, domain, kinds).await;
        (store, scan_id, issue_ids)
    }

    async fn add_scan(store: &Store, domain: &str, kinds: &[IssueType]) -> (String, Vec<String>) {
        let scan = store
            .create_scan("acct", &format!("https://{domain}/"), domain, 5)
            .await
            .unwrap();
        let detected: Vec<DetectedIssue> = kinds
            .iter()
            .map(|kind| DetectedIssue {
                page_url: format!("https://{domain}/"),
                issue_type: *kind,
                severity: kind.severity(),
                title: kind.title().to_string(),
                description: String::new(),
                current_value: None,
                fixable: kind.fixable(),
            })
            .collect();
        let issues = store.insert_issues(&scan.id, &detected).await.unwrap();
        (scan.id, issues.into_iter().map(|i| i.id).collect())
    }

    #[tokio::test]
    async fn upsert_keeps_one_row_per_issue() {
        let (store, scan_id, issues) = seeded("example.com", &[IssueType::MissingH1]).await;

        let first = store.upsert_fix(&scan_id, &issues[0], "a();").await.unwrap();
        let applied = store.mark_fix_applied(&first.id).await.unwrap();
        let second = store.upsert_fix(&scan_id, &issues[0], "b();").await.unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.patch, "b();");
        assert_eq!(second.status, FixStatus::Applied);
        assert_eq!(second.applied_at, applied.applied_at);
        assert_eq!(store.list_fixes(&scan_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn applying_twice_keeps_first_timestamp() {
        let (store, scan_id, issues) = seeded("example.com", &[IssueType::MissingH1]).await;
        let fix = store.upsert_fix(&scan_id, &issues[0], "a();").await.unwrap();
        assert_eq!(fix.status, FixStatus::Pending);
        assert_eq!(fix.applied_at, None);

        let once = store.mark_fix_applied(&fix.id).await.unwrap();
        let twice = store.mark_fix_applied(&fix.id).await.unwrap();
        assert_eq!(once.applied_at, twice.applied_at);
        assert_eq!(store.list_fixes(&scan_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_then_recreate_starts_pending() {
        let (store, scan_id, issues) = seeded("example.com", &[IssueType::Noindex]).await;
        let fix = store.upsert_fix(&scan_id, &issues[0], "a();").await.unwrap();
        store.mark_fix_applied(&fix.id).await.unwrap();

        assert!(store.delete_fix_for_issue(&issues[0]).await.unwrap());
        assert!(store.get_fix_for_issue(&issues[0]).await.unwrap().is_none());

        let recreated = store.upsert_fix(&scan_id, &issues[0], "a();").await.unwrap();
        assert_ne!(recreated.id, fix.id);
        assert_eq!(recreated.status, FixStatus::Pending);
        assert!(!store.delete_fix_for_issue("iss-missing").await.unwrap());
    }

    #[tokio::test]
    async fn domain_fixes_are_severity_ordered_and_applied_only() {
        let (store, scan_id, issues) = seeded(
            "example.com",
            &[IssueType::MissingCanonical, IssueType::MissingTitle, IssueType::MissingAltText],
        )
        .await;
        for issue_id in &issues {
            let fix = store.upsert_fix(&scan_id, issue_id, "x();").await.unwrap();
            if issue_id != &issues[2] {
                store.mark_fix_applied(&fix.id).await.unwrap();
            }
        }
        let (other_scan, other_issues) = add_scan(&store, "other.test", &[IssueType::Noindex]).await;
        let other = store.upsert_fix(&other_scan, &other_issues[0], "y();").await.unwrap();
        store.mark_fix_applied(&other.id).await.unwrap();

        let kinds: Vec<IssueType> = store
            .applied_fixes_for_domain("example.com")
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.issue_type)
            .collect();
        assert_eq!(kinds, vec![IssueType::MissingTitle, IssueType::MissingCanonical]);
    }
}
