//! Metadata store collaborator.
//!
//! The manager keeps one [`DocumentRecord`] per upload in a
//! [`MetadataStore`]: a key/value store with query-by-owner and an atomic
//! counter. Two implementations ship:
//!
//! | Backend | Type | Durable |
//! |---------|------|---------|
//! | `memory` | [`InMemoryMetadataStore`] | no |
//! | `sqlite` | [`SqliteMetadataStore`](crate::sqlite_store::SqliteMetadataStore) | yes |
//!
//! Stores assign `created_at` / `updated_at` themselves. Status updates go
//! through [`MetadataStore::apply_update`], which refuses to recreate a
//! deleted record and refuses backward transitions.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::MetadataConfig;
use crate::error::{DocError, Result};
use crate::models::{DocumentRecord, StatusUpdate};

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a new record. Fails if the id is already taken.
    async fn create(&self, record: DocumentRecord) -> Result<()>;

    async fn get(&self, document_id: &str) -> Result<Option<DocumentRecord>>;

    /// Apply a terminal status update and return the updated record.
    ///
    /// Returns [`DocError::NotFound`] when the record no longer exists and
    /// [`DocError::InvalidTransition`] when it is already terminal.
    async fn apply_update(&self, document_id: &str, update: &StatusUpdate)
        -> Result<DocumentRecord>;

    /// Remove a record; returns whether it existed.
    async fn delete(&self, document_id: &str) -> Result<bool>;

    /// All records owned by `user_id`, newest first.
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<DocumentRecord>>;

    /// Atomically bump `questions_count`, returning the new value.
    async fn increment_questions(&self, document_id: &str) -> Result<u64>;
}

/// Open the backend selected by `config.backend`.
pub async fn open_store(config: &MetadataConfig) -> anyhow::Result<Arc<dyn MetadataStore>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryMetadataStore::new())),
        "sqlite" => {
            let store = crate::sqlite_store::SqliteMetadataStore::open(config).await?;
            Ok(Arc::new(store))
        }
        other => anyhow::bail!("Unknown metadata backend: {}", other),
    }
}

/// Process-local store; contents vanish on restart.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    records: RwLock<HashMap<String, DocumentRecord>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn create(&self, mut record: DocumentRecord) -> Result<()> {
        let mut records = self.records.write();
        if records.contains_key(&record.document_id) {
            return Err(DocError::metadata(format!(
                "document {} already exists",
                record.document_id
            )));
        }
        let now = Utc::now();
        record.created_at = now;
        record.updated_at = now;
        records.insert(record.document_id.clone(), record);
        Ok(())
    }

    async fn get(&self, document_id: &str) -> Result<Option<DocumentRecord>> {
        Ok(self.records.read().get(document_id).cloned())
    }

    async fn apply_update(
        &self,
        document_id: &str,
        update: &StatusUpdate,
    ) -> Result<DocumentRecord> {
        let mut records = self.records.write();
        let record = records.get_mut(document_id).ok_or(DocError::NotFound)?;
        record.apply(update, Utc::now())?;
        Ok(record.clone())
    }

    async fn delete(&self, document_id: &str) -> Result<bool> {
        Ok(self.records.write().remove(document_id).is_some())
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<DocumentRecord>> {
        let mut out: Vec<DocumentRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        Ok(out)
    }

    async fn increment_questions(&self, document_id: &str) -> Result<u64> {
        let mut records = self.records.write();
        let record = records.get_mut(document_id).ok_or(DocError::NotFound)?;
        record.questions_count += 1;
        Ok(record.questions_count)
    }
}
