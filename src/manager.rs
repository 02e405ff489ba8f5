//! Document store manager: tenant-scoped lifecycle of uploads and indices.
//!
//! The manager owns every piece of mutable state the pipeline needs:
//!
//! - the [`IndexRegistry`], one slot per `(user_id, document_id)`, which is
//!   `Processing` while ingestion runs and `Ready` once an index is built;
//! - the [`MetadataStore`] holding each document's record;
//! - the [`TempStorage`] area where uploads wait for ingestion;
//! - a semaphore bounding how many ingestions run at once.
//!
//! # Ingestion
//!
//! ```text
//! upload ──▶ slot=Processing, record=processing, temp file ──▶ spawn
//!                                                              │
//!    load ─▶ plan ─▶ split ─▶ embed ─▶ build index ◀───────────┘
//!      │
//!      ├─ ok:  record=ready, install index if the slot is still Processing
//!      └─ err: record=error(message)
//!
//!    always: remove temp file, clear a leftover Processing slot
//! ```
//!
//! A document deleted mid-ingestion loses both its record and its slot, so
//! the worker's final writes find nothing to update and its output is
//! dropped.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::chunk::{self, ChunkPlan};
use crate::config::{ChunkingConfig, Config, UploadConfig};
use crate::embedding::Embedder;
use crate::error::{DocError, Result};
use crate::index::VectorIndex;
use crate::loader::{self, Loader};
use crate::metadata::{self, MetadataStore};
use crate::models::{
    CleanupReport, DeleteReport, DocumentRecord, DocumentStatus, DocumentSummary, IngestStats,
    StatusReport, StatusUpdate, StoreKey, UploadReceipt,
};
use crate::storage::TempStorage;

/// State of one `(user_id, document_id)` entry.
#[derive(Debug, Clone)]
pub enum IndexSlot {
    Processing,
    Ready(Arc<VectorIndex>),
}

/// Concurrency-safe map from [`StoreKey`] to [`IndexSlot`].
///
/// Doubles as the processing-flag map, so "processing" and "indexed" can
/// never both be true for a key. Guards are never held across an `.await`.
#[derive(Debug, Default)]
pub struct IndexRegistry {
    slots: RwLock<HashMap<StoreKey, IndexSlot>>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &StoreKey) -> Option<IndexSlot> {
        self.slots.read().get(key).cloned()
    }

    pub fn mark_processing(&self, key: StoreKey) {
        self.slots.write().insert(key, IndexSlot::Processing);
    }

    /// Swap a `Processing` slot for a ready index. Returns `false`, leaving
    /// the map untouched, if the slot was removed in the meantime.
    pub fn install_if_processing(&self, key: &StoreKey, index: Arc<VectorIndex>) -> bool {
        let mut slots = self.slots.write();
        match slots.get_mut(key) {
            Some(slot) if matches!(slot, IndexSlot::Processing) => {
                *slot = IndexSlot::Ready(index);
                true
            }
            _ => false,
        }
    }

    /// Drop the slot only if it is still `Processing`.
    pub fn clear_processing(&self, key: &StoreKey) -> bool {
        let mut slots = self.slots.write();
        if matches!(slots.get(key), Some(IndexSlot::Processing)) {
            slots.remove(key);
            true
        } else {
            false
        }
    }

    pub fn remove(&self, key: &StoreKey) -> Option<IndexSlot> {
        self.slots.write().remove(key)
    }

    pub fn ready_keys(&self) -> Vec<StoreKey> {
        let mut keys: Vec<StoreKey> = self
            .slots
            .read()
            .iter()
            .filter(|(_, slot)| matches!(slot, IndexSlot::Ready(_)))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

/// Handle on a spawned ingestion. Dropping it detaches the task.
#[derive(Debug)]
pub struct IngestHandle {
    pub document_id: String,
    handle: JoinHandle<()>,
}

impl IngestHandle {
    /// Wait for ingestion to reach a terminal state.
    pub async fn wait(self) {
        if let Err(e) = self.handle.await {
            tracing::error!(document_id = %self.document_id, error = %e, "ingestion task aborted");
        }
    }
}

#[derive(Debug, Clone)]
struct IngestJob {
    key: StoreKey,
    filename: String,
    path: PathBuf,
}

/// Removes the temp file and any leftover `Processing` slot on every exit
/// path of an ingestion, including panics.
struct IngestGuard<'a> {
    registry: &'a IndexRegistry,
    key: &'a StoreKey,
    path: &'a std::path::Path,
}

impl Drop for IngestGuard<'_> {
    fn drop(&mut self) {
        TempStorage::remove(self.path);
        if self.registry.clear_processing(self.key) {
            tracing::debug!(key = %self.key, "cleared processing flag");
        }
    }
}

pub struct DocumentStoreManager {
    metadata: Arc<dyn MetadataStore>,
    embedder: Embedder,
    storage: TempStorage,
    chunking: ChunkingConfig,
    max_upload_bytes: usize,
    registry: IndexRegistry,
    ingest_permits: Arc<Semaphore>,
}

impl DocumentStoreManager {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        embedder: Embedder,
        upload: &UploadConfig,
        chunking: ChunkingConfig,
    ) -> Self {
        Self {
            metadata,
            embedder,
            storage: TempStorage::new(upload.temp_dir.clone()),
            chunking,
            max_upload_bytes: upload.max_upload_bytes,
            registry: IndexRegistry::new(),
            ingest_permits: Arc::new(Semaphore::new(upload.max_concurrent_ingestions.max(1))),
        }
    }

    /// Wire up the metadata backend and embedder named in `config`.
    pub async fn from_config(config: &Config) -> anyhow::Result<Arc<Self>> {
        let metadata = metadata::open_store(&config.metadata).await?;
        let embedder = Embedder::from_config(&config.embedding)?;
        Ok(Arc::new(Self::new(
            metadata,
            embedder,
            &config.upload,
            config.chunking.clone(),
        )))
    }

    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn registry(&self) -> &IndexRegistry {
        &self.registry
    }

    pub fn lookup(&self, key: &StoreKey) -> Option<IndexSlot> {
        self.registry.get(key)
    }

    /// Accept an upload and schedule its ingestion in the background.
    ///
    /// Returns as soon as the record exists; the [`IngestHandle`] may be
    /// awaited or dropped.
    pub async fn upload(
        self: &Arc<Self>,
        bytes: Vec<u8>,
        filename: &str,
        user_id: &str,
    ) -> Result<(UploadReceipt, IngestHandle)> {
        let filename = filename.trim();
        if filename.is_empty() {
            return Err(DocError::validation("No filename provided"));
        }
        if user_id.is_empty() {
            return Err(DocError::validation("Missing user id"));
        }
        Loader::for_extension(&loader::extension_of(filename))?;
        if bytes.is_empty() {
            return Err(DocError::validation("Uploaded file is empty"));
        }
        if bytes.len() > self.max_upload_bytes {
            return Err(DocError::validation(format!(
                "File size {} bytes exceeds the maximum of {} bytes",
                bytes.len(),
                self.max_upload_bytes
            )));
        }

        let document_id = Uuid::new_v4().to_string();
        let key = StoreKey::new(user_id, &document_id);
        self.registry.mark_processing(key.clone());

        let path = match self.storage.write(&document_id, filename, &bytes).await {
            Ok(path) => path,
            Err(e) => {
                self.registry.clear_processing(&key);
                return Err(e);
            }
        };
        let record = DocumentRecord::placeholder(&document_id, user_id, filename);
        if let Err(e) = self.metadata.create(record).await {
            TempStorage::remove(&path);
            self.registry.clear_processing(&key);
            return Err(e);
        }

        tracing::info!(
            document_id = %document_id,
            user_id = %user_id,
            filename = %filename,
            bytes = bytes.len(),
            "upload accepted"
        );

        let job = IngestJob {
            key,
            filename: filename.to_string(),
            path,
        };
        let handle = tokio::spawn(Arc::clone(self).ingest(job));

        Ok((
            UploadReceipt {
                message: "Document uploaded successfully. Processing in background.".to_string(),
                task_id: document_id.clone(),
                document_id: document_id.clone(),
                status: DocumentStatus::Processing,
            },
            IngestHandle {
                document_id,
                handle,
            },
        ))
    }

    async fn ingest(self: Arc<Self>, job: IngestJob) {
        let _guard = IngestGuard {
            registry: &self.registry,
            key: &job.key,
            path: &job.path,
        };
        // The semaphore is never closed, so a failed acquire just runs unbounded.
        let _permit = Arc::clone(&self.ingest_permits).acquire_owned().await.ok();
        let document_id = job.key.document_id.as_str();
        tracing::info!(document_id = %document_id, filename = %job.filename, "ingestion started");

        // Run the pipeline as its own task so a panic becomes a recorded error.
        let worker = {
            let this = Arc::clone(&self);
            let job = job.clone();
            tokio::spawn(async move { this.run_pipeline(&job).await })
        };
        let outcome = match worker.await {
            Ok(Ok(built)) => Ok(built),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("Ingestion worker aborted: {}", e)),
        };

        match outcome {
            Ok((index, stats)) => {
                let update = StatusUpdate::Ready(stats.clone());
                match self.metadata.apply_update(document_id, &update).await {
                    Ok(_) => {
                        if self
                            .registry
                            .install_if_processing(&job.key, Arc::new(index))
                        {
                            tracing::info!(
                                document_id = %document_id,
                                chunks = stats.chunks_count,
                                total_length = stats.total_length,
                                chunk_size = stats.chunk_size,
                                chunk_overlap = stats.chunk_overlap,
                                "ingestion finished"
                            );
                        } else {
                            tracing::warn!(
                                document_id = %document_id,
                                "document removed during ingestion, discarding index"
                            );
                        }
                    }
                    Err(DocError::NotFound) => {
                        tracing::warn!(
                            document_id = %document_id,
                            "document deleted during ingestion, discarding index"
                        );
                    }
                    Err(e) => {
                        tracing::error!(document_id = %document_id, error = %e, "failed to record ready status");
                    }
                }
            }
            Err(message) => {
                tracing::error!(document_id = %document_id, error = %message, "ingestion failed");
                let update = StatusUpdate::Failed { message };
                match self.metadata.apply_update(document_id, &update).await {
                    Ok(_) => {}
                    Err(DocError::NotFound) => {
                        tracing::debug!(document_id = %document_id, "failed document already deleted");
                    }
                    Err(e) => {
                        tracing::error!(document_id = %document_id, error = %e, "failed to record error status");
                    }
                }
            }
        }
    }

    async fn run_pipeline(&self, job: &IngestJob) -> Result<(VectorIndex, IngestStats)> {
        let loader = Loader::for_extension(&loader::extension_of(&job.filename))?;
        let path = job.path.clone();
        let segments = tokio::task::spawn_blocking(move || loader.load(&path))
            .await
            .map_err(|e| DocError::extraction(format!("loader task failed: {}", e)))??;

        let total_length = chunk::char_length(&segments);
        let plan = ChunkPlan::for_length(total_length, &self.chunking);
        let pieces = chunk::split(&segments, &plan);
        if pieces.is_empty() {
            return Err(DocError::NoChunksProduced);
        }
        let chunks = chunk::into_chunks(
            pieces,
            &job.key.document_id,
            &job.key.user_id,
            &job.filename,
        );
        tracing::debug!(
            document_id = %job.key.document_id,
            band = %plan.band,
            total_length,
            chunks = chunks.len(),
            "document split"
        );

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = self.embedder.embed_many(&texts).await?;
        let index = VectorIndex::build(chunks, vectors)?;

        let stats = IngestStats {
            chunks_count: index.len(),
            total_length,
            estimated_tokens: chunk::estimate_tokens(total_length),
            chunk_size: plan.chunk_size,
            chunk_overlap: plan.chunk_overlap,
        };
        Ok((index, stats))
    }

    /// Fetch a record, enforcing ownership.
    async fn owned_record(&self, document_id: &str, user_id: &str) -> Result<DocumentRecord> {
        let record = self
            .metadata
            .get(document_id)
            .await?
            .ok_or(DocError::NotFound)?;
        if !record.is_owned_by(user_id) {
            return Err(DocError::Forbidden);
        }
        Ok(record)
    }

    pub async fn status(&self, document_id: &str, user_id: &str) -> Result<StatusReport> {
        let record = self.owned_record(document_id, user_id).await?;
        let key = StoreKey::new(user_id, document_id);
        let processing = matches!(self.registry.get(&key), Some(IndexSlot::Processing));
        let status = if processing {
            DocumentStatus::Processing
        } else {
            record.status
        };
        Ok(StatusReport {
            processing,
            ready: status == DocumentStatus::Ready,
            status,
            filename: record.filename,
            chunks_count: record.chunks_count,
            error: record.error_message,
        })
    }

    /// Resolve the caller's index for `document_id`.
    ///
    /// Fails with `StillProcessing`, `NotFound`, `Forbidden` or
    /// `VectorStoreMissing`, checked in that order.
    pub async fn ready_index(&self, document_id: &str, user_id: &str) -> Result<Arc<VectorIndex>> {
        let key = StoreKey::new(user_id, document_id);
        match self.registry.get(&key) {
            Some(IndexSlot::Ready(index)) => Ok(index),
            Some(IndexSlot::Processing) => Err(DocError::StillProcessing),
            None => {
                let record = self.owned_record(document_id, user_id).await?;
                tracing::warn!(
                    key = %key,
                    status = %record.status,
                    "no index registered for document"
                );
                Err(DocError::VectorStoreMissing)
            }
        }
    }

    pub async fn delete(&self, document_id: &str, user_id: &str) -> Result<DeleteReport> {
        self.owned_record(document_id, user_id).await?;
        self.metadata.delete(document_id).await?;
        let key = StoreKey::new(user_id, document_id);
        let evicted = self.registry.remove(&key);
        tracing::info!(
            document_id = %document_id,
            had_index = matches!(evicted, Some(IndexSlot::Ready(_))),
            was_processing = matches!(evicted, Some(IndexSlot::Processing)),
            "document deleted"
        );
        Ok(DeleteReport {
            message: "Document deleted successfully".to_string(),
            document_id: document_id.to_string(),
        })
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<DocumentSummary>> {
        let records = self.metadata.list_by_user(user_id).await?;
        Ok(records.iter().map(DocumentSummary::from).collect())
    }

    /// Evict ready indices whose metadata record is gone or belongs to
    /// someone else. In-flight ingestions are left alone.
    pub async fn cleanup_orphans(&self) -> Result<CleanupReport> {
        let mut evicted = Vec::new();
        for key in self.registry.ready_keys() {
            let orphaned = match self.metadata.get(&key.document_id).await? {
                None => true,
                Some(record) => !record.is_owned_by(&key.user_id),
            };
            if orphaned && self.registry.remove(&key).is_some() {
                tracing::info!(key = %key, "evicted orphaned index");
                evicted.push(key.to_string());
            }
        }
        let remaining = self.registry.len();
        if !evicted.is_empty() {
            tracing::info!(evicted = evicted.len(), remaining, "orphan cleanup finished");
        }
        Ok(CleanupReport { evicted, remaining })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingBackend;
    use crate::metadata::InMemoryMetadataStore;
    use tempfile::TempDir;

    fn manager(tmp: &TempDir) -> Arc<DocumentStoreManager> {
        let upload = UploadConfig {
            temp_dir: tmp.path().join("uploads"),
            ..UploadConfig::default()
        };
        Arc::new(DocumentStoreManager::new(
            Arc::new(InMemoryMetadataStore::new()),
            Embedder::new(Arc::new(HashingBackend::new(64)), 16),
            &upload,
            ChunkingConfig::default(),
        ))
    }

    fn text_body() -> Vec<u8> {
        "The vacation policy grants twenty days per year. ".repeat(40).into_bytes()
    }

    #[tokio::test]
    async fn upload_validation() {
        let tmp = TempDir::new().unwrap();
        let m = manager(&tmp);
        assert!(matches!(
            m.upload(b"x".to_vec(), "virus.exe", "alice").await,
            Err(DocError::UnsupportedFileType { .. })
        ));
        assert!(matches!(
            m.upload(Vec::new(), "a.txt", "alice").await,
            Err(DocError::Validation(_))
        ));
        assert!(matches!(
            m.upload(b"x".to_vec(), "  ", "alice").await,
            Err(DocError::Validation(_))
        ));
        let big = vec![b'a'; UploadConfig::default().max_upload_bytes + 1];
        assert!(matches!(
            m.upload(big, "a.txt", "alice").await,
            Err(DocError::Validation(_))
        ));
        assert!(m.registry().is_empty());
    }

    #[tokio::test]
    async fn ingestion_reaches_ready_and_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let m = manager(&tmp);
        let (receipt, handle) = m.upload(text_body(), "policy.txt", "alice").await.unwrap();
        assert_eq!(receipt.status, DocumentStatus::Processing);
        assert_eq!(receipt.task_id, receipt.document_id);
        handle.wait().await;

        let report = m.status(&receipt.document_id, "alice").await.unwrap();
        assert!(report.ready);
        assert!(!report.processing);
        assert!(report.chunks_count.unwrap() > 1);
        assert!(report.error.is_none());

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join("uploads"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty(), "temp file left behind");
    }

    #[tokio::test]
    async fn status_enforces_ownership() {
        let tmp = TempDir::new().unwrap();
        let m = manager(&tmp);
        let (receipt, handle) = m.upload(text_body(), "policy.txt", "alice").await.unwrap();
        handle.wait().await;
        assert!(matches!(
            m.status(&receipt.document_id, "bob").await,
            Err(DocError::Forbidden)
        ));
        assert!(matches!(
            m.status("missing", "alice").await,
            Err(DocError::NotFound)
        ));
        assert!(matches!(
            m.delete(&receipt.document_id, "bob").await,
            Err(DocError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn failed_ingestion_records_error() {
        let tmp = TempDir::new().unwrap();
        let m = manager(&tmp);
        let (receipt, handle) = m
            .upload(b"%PDF-1.4 garbage".to_vec(), "broken.pdf", "alice")
            .await
            .unwrap();
        handle.wait().await;
        let report = m.status(&receipt.document_id, "alice").await.unwrap();
        assert_eq!(report.status, DocumentStatus::Error);
        assert!(!report.error.unwrap_or_default().is_empty());
        assert!(m
            .lookup(&StoreKey::new("alice", &receipt.document_id))
            .is_none());
    }

    #[tokio::test]
    async fn cleanup_evicts_indices_without_records() {
        let tmp = TempDir::new().unwrap();
        let m = manager(&tmp);
        let (receipt, handle) = m.upload(text_body(), "policy.txt", "alice").await.unwrap();
        handle.wait().await;

        // Out-of-band metadata deletion leaks the index.
        m.metadata().delete(&receipt.document_id).await.unwrap();
        let report = m.cleanup_orphans().await.unwrap();
        assert_eq!(
            report.evicted,
            vec![format!("alice/{}", receipt.document_id)]
        );
        assert_eq!(report.remaining, 0);

        let again = m.cleanup_orphans().await.unwrap();
        assert!(again.evicted.is_empty());
    }

    #[tokio::test]
    async fn list_returns_only_callers_documents() {
        let tmp = TempDir::new().unwrap();
        let m = manager(&tmp);
        let (_, h1) = m.upload(text_body(), "a.txt", "alice").await.unwrap();
        let (_, h2) = m.upload(text_body(), "b.txt", "bob").await.unwrap();
        h1.wait().await;
        h2.wait().await;
        let listed = m.list("alice").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].filename, "a.txt");
    }

    #[test]
    fn registry_install_requires_processing_slot() {
        let registry = IndexRegistry::new();
        let key = StoreKey::new("u", "d");
        let index = |content: &str| {
            Arc::new(
                VectorIndex::build(
                    vec![crate::models::Chunk {
                        id: "c".into(),
                        content: content.into(),
                        chunk_index: 0,
                        metadata: crate::models::ChunkMetadata {
                            document_id: "d".into(),
                            user_id: "u".into(),
                            filename: "f.txt".into(),
                            segment: 0,
                        },
                    }],
                    vec![vec![1.0]],
                )
                .unwrap(),
            )
        };

        assert!(!registry.install_if_processing(&key, index("late")));
        registry.mark_processing(key.clone());
        assert!(registry.install_if_processing(&key, index("ok")));
        assert!(!registry.clear_processing(&key));
        assert_eq!(registry.ready_keys(), vec![key]);
    }
}
