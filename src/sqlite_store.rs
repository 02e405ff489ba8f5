//! SQLite-backed [`MetadataStore`].
//!
//! Timestamps are stored as Unix milliseconds. Status transitions are
//! guarded in SQL (`WHERE status = 'processing'`), so two concurrent
//! writers can never reverse a terminal state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::MetadataConfig;
use crate::error::{DocError, Result};
use crate::metadata::MetadataStore;
use crate::models::{DocumentRecord, DocumentStatus, StatusUpdate};
use crate::{db, migrate};

pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    /// Connect to `config.path` and make sure the schema exists.
    pub async fn open(config: &MetadataConfig) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }
}

fn opt_usize(v: Option<i64>) -> Option<usize> {
    v.map(|n| n.max(0) as usize)
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| DocError::metadata(format!("invalid timestamp {}", ms)))
}

fn row_to_record(row: &SqliteRow) -> Result<DocumentRecord> {
    let status: String = row.try_get("status")?;
    let status = DocumentStatus::parse(&status)
        .ok_or_else(|| DocError::metadata(format!("unknown status '{}'", status)))?;
    Ok(DocumentRecord {
        document_id: row.try_get("document_id")?,
        user_id: row.try_get("user_id")?,
        filename: row.try_get("filename")?,
        status,
        chunks_count: opt_usize(row.try_get("chunks_count")?),
        total_length: opt_usize(row.try_get("total_length")?),
        estimated_tokens: opt_usize(row.try_get("estimated_tokens")?),
        chunk_size: opt_usize(row.try_get("chunk_size")?),
        chunk_overlap: opt_usize(row.try_get("chunk_overlap")?),
        error_message: row.try_get("error_message")?,
        questions_count: row.try_get::<i64, _>("questions_count")?.max(0) as u64,
        created_at: millis_to_datetime(row.try_get("created_at")?)?,
        updated_at: millis_to_datetime(row.try_get("updated_at")?)?,
    })
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn create(&self, record: DocumentRecord) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO documents (document_id, user_id, filename, status, questions_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&record.document_id)
        .bind(&record.user_id)
        .bind(&record.filename)
        .bind(record.status.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, document_id: &str) -> Result<Option<DocumentRecord>> {
        let row = sqlx::query("SELECT * FROM documents WHERE document_id = ?")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn apply_update(
        &self,
        document_id: &str,
        update: &StatusUpdate,
    ) -> Result<DocumentRecord> {
        let now = Utc::now().timestamp_millis();
        let result = match update {
            StatusUpdate::Ready(stats) => {
                sqlx::query(
                    r#"
                    UPDATE documents
                    SET status = 'ready', chunks_count = ?, total_length = ?, estimated_tokens = ?,
                        chunk_size = ?, chunk_overlap = ?, error_message = NULL, updated_at = ?
                    WHERE document_id = ? AND status = 'processing'
                    "#,
                )
                .bind(stats.chunks_count as i64)
                .bind(stats.total_length as i64)
                .bind(stats.estimated_tokens as i64)
                .bind(stats.chunk_size as i64)
                .bind(stats.chunk_overlap as i64)
                .bind(now)
                .bind(document_id)
                .execute(&self.pool)
                .await?
            }
            StatusUpdate::Failed { message } => {
                sqlx::query(
                    r#"
                    UPDATE documents
                    SET status = 'error', error_message = ?, updated_at = ?
                    WHERE document_id = ? AND status = 'processing'
                    "#,
                )
                .bind(message)
                .bind(now)
                .bind(document_id)
                .execute(&self.pool)
                .await?
            }
        };

        let current = self.get(document_id).await?.ok_or(DocError::NotFound)?;
        if result.rows_affected() == 0 {
            return Err(DocError::InvalidTransition {
                from: current.status.to_string(),
                to: update.status().to_string(),
            });
        }
        Ok(current)
    }

    async fn delete(&self, document_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<DocumentRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM documents WHERE user_id = ? ORDER BY created_at DESC, document_id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn increment_questions(&self, document_id: &str) -> Result<u64> {
        let count: Option<i64> = sqlx::query_scalar(
            "UPDATE documents SET questions_count = questions_count + 1 WHERE document_id = ? RETURNING questions_count",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        count
            .map(|c| c.max(0) as u64)
            .ok_or(DocError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IngestStats;
    use tempfile::TempDir;

    async fn store(tmp: &TempDir) -> SqliteMetadataStore {
        let config = MetadataConfig {
            backend: "sqlite".into(),
            path: tmp.path().join("meta/docqa.sqlite"),
            ..MetadataConfig::default()
        };
        SqliteMetadataStore::open(&config).await.unwrap()
    }

    fn ready() -> StatusUpdate {
        StatusUpdate::Ready(IngestStats {
            chunks_count: 4,
            total_length: 1800,
            estimated_tokens: 450,
            chunk_size: 500,
            chunk_overlap: 100,
        })
    }

    #[tokio::test]
    async fn lifecycle_persists() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        store
            .create(DocumentRecord::placeholder("d1", "alice", "notes.txt"))
            .await
            .unwrap();

        let rec = store.get("d1").await.unwrap().unwrap();
        assert_eq!(rec.status, DocumentStatus::Processing);
        assert_eq!(rec.filename, "notes.txt");

        let rec = store.apply_update("d1", &ready()).await.unwrap();
        assert_eq!(rec.status, DocumentStatus::Ready);
        assert_eq!(rec.chunks_count, Some(4));
        assert_eq!(rec.estimated_tokens, Some(450));
    }

    #[tokio::test]
    async fn terminal_status_is_guarded() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        store
            .create(DocumentRecord::placeholder("d1", "alice", "a.txt"))
            .await
            .unwrap();
        store
            .apply_update(
                "d1",
                &StatusUpdate::Failed {
                    message: "no text".into(),
                },
            )
            .await
            .unwrap();
        let err = store.apply_update("d1", &ready()).await.unwrap_err();
        assert!(matches!(err, DocError::InvalidTransition { .. }));
        let rec = store.get("d1").await.unwrap().unwrap();
        assert_eq!(rec.status, DocumentStatus::Error);
        assert_eq!(rec.error_message.as_deref(), Some("no text"));
    }

    #[tokio::test]
    async fn deleted_record_is_not_recreated() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        store
            .create(DocumentRecord::placeholder("d1", "alice", "a.txt"))
            .await
            .unwrap();
        assert!(store.delete("d1").await.unwrap());
        assert!(matches!(
            store.apply_update("d1", &ready()).await,
            Err(DocError::NotFound)
        ));
        assert!(store.get("d1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_and_counter() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        for (id, user) in [("a", "alice"), ("b", "bob"), ("c", "alice")] {
            store
                .create(DocumentRecord::placeholder(id, user, "f.txt"))
                .await
                .unwrap();
        }
        let listed = store.list_by_user("alice").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(store.increment_questions("a").await.unwrap(), 1);
        assert_eq!(store.increment_questions("a").await.unwrap(), 2);
        assert!(matches!(
            store.increment_questions("zzz").await,
            Err(DocError::NotFound)
        ));
    }
}
