//! Core data models used throughout the document pipeline.
//!
//! These types represent the documents, chunks, and responses that flow
//! through ingestion and question answering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DocError, Result};

/// Processing state of an uploaded document.
///
/// The only legal transitions are `processing → ready` and
/// `processing → error`. Terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Processing,
    Ready,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Processing => "processing",
            DocumentStatus::Ready => "ready",
            DocumentStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(DocumentStatus::Processing),
            "ready" => Some(DocumentStatus::Ready),
            "error" => Some(DocumentStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DocumentStatus::Processing)
    }

    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        matches!(
            (self, next),
            (DocumentStatus::Processing, DocumentStatus::Ready)
                | (DocumentStatus::Processing, DocumentStatus::Error)
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata record for one uploaded file, as held by the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub user_id: String,
    pub filename: String,
    pub status: DocumentStatus,
    pub chunks_count: Option<usize>,
    /// Extracted text length in characters.
    pub total_length: Option<usize>,
    pub estimated_tokens: Option<usize>,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub error_message: Option<String>,
    pub questions_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    /// A fresh `processing` placeholder written at upload time.
    pub fn placeholder(document_id: &str, user_id: &str, filename: &str) -> Self {
        let now = Utc::now();
        Self {
            document_id: document_id.to_string(),
            user_id: user_id.to_string(),
            filename: filename.to_string(),
            status: DocumentStatus::Processing,
            chunks_count: None,
            total_length: None,
            estimated_tokens: None,
            chunk_size: None,
            chunk_overlap: None,
            error_message: None,
            questions_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }

    /// Apply a terminal status update, rejecting backward transitions.
    pub fn apply(&mut self, update: &StatusUpdate, now: DateTime<Utc>) -> Result<()> {
        let next = update.status();
        if !self.status.can_transition_to(next) {
            return Err(DocError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        match update {
            StatusUpdate::Ready(stats) => {
                self.chunks_count = Some(stats.chunks_count);
                self.total_length = Some(stats.total_length);
                self.estimated_tokens = Some(stats.estimated_tokens);
                self.chunk_size = Some(stats.chunk_size);
                self.chunk_overlap = Some(stats.chunk_overlap);
                self.error_message = None;
            }
            StatusUpdate::Failed { message } => {
                self.error_message = Some(message.clone());
            }
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

/// Statistics written alongside a `ready` status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub chunks_count: usize,
    pub total_length: usize,
    pub estimated_tokens: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

/// The terminal write performed by the ingestion worker.
#[derive(Debug, Clone)]
pub enum StatusUpdate {
    Ready(IngestStats),
    Failed { message: String },
}

impl StatusUpdate {
    pub fn status(&self) -> DocumentStatus {
        match self {
            StatusUpdate::Ready(_) => DocumentStatus::Ready,
            StatusUpdate::Failed { .. } => DocumentStatus::Error,
        }
    }
}

/// Composite tenant key for in-memory indices.
///
/// Indices are only ever addressed by `(user_id, document_id)`; a document
/// id alone never reaches another tenant's index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreKey {
    pub user_id: String,
    pub document_id: String,
}

impl StoreKey {
    pub fn new(user_id: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            document_id: document_id.into(),
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.document_id)
    }
}

/// Provenance carried by every chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkMetadata {
    pub document_id: String,
    pub user_id: String,
    pub filename: String,
    /// Zero-based page/slide/sheet the chunk was cut from.
    pub segment: usize,
}

/// A fragment of a document's extracted text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub id: String,
    pub content: String,
    pub chunk_index: usize,
    pub metadata: ChunkMetadata,
}

/// Returned by `upload` as soon as the document is accepted.
#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub message: String,
    pub task_id: String,
    pub document_id: String,
    pub status: DocumentStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub processing: bool,
    pub ready: bool,
    pub status: DocumentStatus,
    pub filename: String,
    pub chunks_count: Option<usize>,
    pub error: Option<String>,
}

/// One entry of `source_documents` in an answer.
#[derive(Debug, Clone, Serialize)]
pub struct SourcePreview {
    pub content: String,
    pub filename: String,
    pub chunk_index: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerResponse {
    pub question: String,
    pub answer: String,
    pub chunks_used: usize,
    pub source_documents: Vec<SourcePreview>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteReport {
    pub message: String,
    pub document_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub evicted: Vec<String>,
    pub remaining: usize,
}

/// Listing entry for a user's documents.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummary {
    pub document_id: String,
    pub filename: String,
    pub status: DocumentStatus,
    pub chunks_count: Option<usize>,
    pub questions_count: u64,
    pub created_at: DateTime<Utc>,
}

impl From<&DocumentRecord> for DocumentSummary {
    fn from(r: &DocumentRecord) -> Self {
        Self {
            document_id: r.document_id.clone(),
            filename: r.filename.clone(),
            status: r.status,
            chunks_count: r.chunks_count,
            questions_count: r.questions_count,
            created_at: r.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> IngestStats {
        IngestStats {
            chunks_count: 3,
            total_length: 1200,
            estimated_tokens: 300,
            chunk_size: 500,
            chunk_overlap: 100,
        }
    }

    #[test]
    fn processing_moves_to_ready() {
        let mut rec = DocumentRecord::placeholder("d1", "u1", "a.txt");
        rec.apply(&StatusUpdate::Ready(stats()), Utc::now()).unwrap();
        assert_eq!(rec.status, DocumentStatus::Ready);
        assert_eq!(rec.chunks_count, Some(3));
        assert!(rec.error_message.is_none());
    }

    #[test]
    fn terminal_states_never_reverse() {
        let mut rec = DocumentRecord::placeholder("d1", "u1", "a.txt");
        rec.apply(
            &StatusUpdate::Failed {
                message: "boom".into(),
            },
            Utc::now(),
        )
        .unwrap();
        let err = rec
            .apply(&StatusUpdate::Ready(stats()), Utc::now())
            .unwrap_err();
        assert!(matches!(err, DocError::InvalidTransition { .. }));
        assert_eq!(rec.status, DocumentStatus::Error);
        assert_eq!(rec.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&DocumentStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
        assert_eq!(DocumentStatus::parse("ready"), Some(DocumentStatus::Ready));
        assert_eq!(DocumentStatus::parse("done"), None);
    }

    #[test]
    fn store_keys_differ_by_owner() {
        let a = StoreKey::new("alice", "doc");
        let b = StoreKey::new("bob", "doc");
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "alice/doc");
    }
}
