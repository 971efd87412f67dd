use chrono::Utc;

use super::helpers::{get_usize, parse_datetime, parse_json, parse_label, to_json};
use super::{PREFIX_VERIFICATION, Store};
use crate::app::error::StoreError;
use crate::app::types::{DomSnapshot, FieldChange, Verification, VerificationStatus};

const SELECT_COLS: &str =
    "id, scan_id, url, before_state, after_state, changes, change_count, status, created_at";

fn row_to_verification(row: &libsql::Row) -> Result<Verification, StoreError> {
    Ok(Verification {
        id: row.get(0)?,
        scan_id: row.get(1)?,
        url: row.get(2)?,
        before: parse_json(&row.get::<String>(3)?, "before_state")?,
        after: parse_json(&row.get::<String>(4)?, "after_state")?,
        changes: parse_json(&row.get::<String>(5)?, "changes")?,
        change_count: get_usize(row, 6)?,
        status: parse_label(
            &row.get::<String>(7)?,
            "verification status",
            VerificationStatus::from_label,
        )?,
        created_at: parse_datetime(&row.get::<String>(8)?)?,
    })
}

impl Store {
    /// Append a verification record. Records are never updated.
    pub async fn insert_verification(
        &self,
        scan_id: &str,
        url: &str,
        before: &DomSnapshot,
        after: &DomSnapshot,
        changes: &[FieldChange],
    ) -> Result<Verification, StoreError> {
        let now = Utc::now();
        let id = self.generate_id(PREFIX_VERIFICATION).await?;
        let status = if changes.is_empty() {
            VerificationStatus::NoChanges
        } else {
            VerificationStatus::Success
        };

        self.conn()
            .execute(
                "INSERT INTO verifications (id, scan_id, url, before_state, after_state, changes, change_count, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                libsql::params![
                    id.as_str(),
                    scan_id,
                    url,
                    to_json(before, "before_state")?,
                    to_json(after, "after_state")?,
                    to_json(&changes, "changes")?,
                    changes.len() as i64,
                    status.label(),
                    now.to_rfc3339()
                ],
            )
            .await?;

        Ok(Verification {
            id,
            scan_id: scan_id.to_string(),
            url: url.to_string(),
            before: before.clone(),
            after: after.clone(),
            changes: changes.to_vec(),
            change_count: changes.len(),
            status,
            created_at: now,
        })
    }

    pub async fn list_verifications(&self, scan_id: &str) -> Result<Vec<Verification>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SELECT_COLS} FROM verifications WHERE scan_id = ?1 ORDER BY rowid"),
                [scan_id],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_verification(&row)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn verification_round_trips_with_status_from_changes() {
        let store = Store::open_in_memory().await.unwrap();
        let scan = store
            .create_scan("acct", "https://example.com/", "example.com", 5)
            .await
            .unwrap();

        let before = DomSnapshot::default();
        let after = DomSnapshot {
            title: "Welcome".to_string(),
            h1_count: 1,
            ..DomSnapshot::default()
        };
        let changes = vec![
            FieldChange::Text {
                field: "title".to_string(),
                before_length: 0,
                after_length: 7,
            },
            FieldChange::Count {
                field: "h1_count".to_string(),
                before: 0,
                after: 1,
            },
        ];

        let saved = store
            .insert_verification(&scan.id, "https://example.com/", &before, &after, &changes)
            .await
            .unwrap();
        assert_eq!(saved.status, VerificationStatus::Success);

        let unchanged = store
            .insert_verification(&scan.id, "https://example.com/a", &after, &after, &[])
            .await
            .unwrap();
        assert_eq!(unchanged.status, VerificationStatus::NoChanges);
        assert_eq!(unchanged.change_count, 0);

        let listed = store.list_verifications(&scan.id).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].after, after);
        assert_eq!(listed[0].changes, changes);
        assert_eq!(listed[0].change_count, 2);
    }
}
