//! Repository for the `job_status` table.
//!
//! Each record is a JSONB document plus server-side timestamp columns.
//! `merge` overlays the given top-level fields with `||`; `replace`
//! overwrites the whole document. Both are a single
//! `INSERT ... ON CONFLICT DO UPDATE`, so each write is atomic per row.

use async_trait::async_trait;
use lipid_core::status::{StatusDocument, StatusStore, StatusStoreError};
use lipid_core::types::Timestamp;
use serde_json::Value;

use crate::DbPool;

/// Keys owned by the timestamp columns, never stored inside `doc`.
const TIMESTAMP_KEYS: [&str; 2] = ["updated_at", "finished_at"];

/// Status store persisting documents in PostgreSQL.
#[derive(Clone)]
pub struct PgStatusStore {
    pool: DbPool,
}

impl PgStatusStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn execute(
        &self,
        sql: &str,
        job_id: &str,
        fields: &StatusDocument,
        mark_finished: bool,
    ) -> Result<(), StatusStoreError> {
        let doc = document_fields(fields)?;
        sqlx::query(sql)
            .bind(job_id)
            .bind(doc)
            .bind(mark_finished)
            .execute(&self.pool)
            .await
            .map_err(StatusStoreError::backend)?;

        tracing::debug!(job_id, mark_finished, "Status document written");
        Ok(())
    }
}

/// Overlay fields; `finished_at` is never cleared.
const MERGE_SQL: &str = "INSERT INTO job_status (job_id, doc, finished_at) \
     VALUES ($1, $2, CASE WHEN $3::boolean THEN NOW() ELSE NULL END) \
     ON CONFLICT (job_id) DO UPDATE \
     SET doc = job_status.doc || EXCLUDED.doc, \
         updated_at = NOW(), \
         finished_at = COALESCE(EXCLUDED.finished_at, job_status.finished_at)";

/// Overwrite the record; `finished_at` is set only by a success commit.
const REPLACE_SQL: &str = "INSERT INTO job_status (job_id, doc, finished_at) \
     VALUES ($1, $2, CASE WHEN $3::boolean THEN NOW() ELSE NULL END) \
     ON CONFLICT (job_id) DO UPDATE \
     SET doc = EXCLUDED.doc, \
         updated_at = NOW(), \
         finished_at = EXCLUDED.finished_at";

#[async_trait]
impl StatusStore for PgStatusStore {
    async fn merge(&self, job_id: &str, fields: &StatusDocument) -> Result<(), StatusStoreError> {
        self.execute(MERGE_SQL, job_id, fields, false).await
    }

    async fn replace(
        &self,
        job_id: &str,
        fields: &StatusDocument,
    ) -> Result<(), StatusStoreError> {
        self.execute(REPLACE_SQL, job_id, fields, fields.is_success())
            .await
    }

    async fn get(&self, job_id: &str) -> Result<Option<StatusDocument>, StatusStoreError> {
        let row: Option<(Value, Timestamp, Option<Timestamp>)> = sqlx::query_as(
            "SELECT doc, updated_at, finished_at FROM job_status WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StatusStoreError::backend)?;

        let Some((doc, updated_at, finished_at)) = row else {
            return Ok(None);
        };
        let mut document: StatusDocument = serde_json::from_value(doc)?;
        document.updated_at = Some(updated_at);
        document.finished_at = finished_at;
        Ok(Some(document))
    }
}

/// Serialize the caller's fields, dropping any timestamps: those are
/// assigned by the database.
fn document_fields(fields: &StatusDocument) -> Result<Value, StatusStoreError> {
    let mut value = serde_json::to_value(fields)?;
    if let Value::Object(map) = &mut value {
        for key in TIMESTAMP_KEYS {
            map.remove(key);
        }
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use lipid_core::job::Stage;
    use lipid_core::status::StatusUpdate;

    use super::*;

    #[test]
    fn document_fields_strip_client_timestamps() {
        let mut doc = StatusUpdate::Running {
            stage: Stage::Prepare,
            pct: 5,
        }
        .into_document();
        doc.updated_at = Some(chrono::Utc::now());
        doc.finished_at = Some(chrono::Utc::now());

        let value = document_fields(&doc).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "status": "running", "stage": "prepare", "pct": 5 })
        );
    }
}
