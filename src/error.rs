//! Error taxonomy for the document pipeline.
//!
//! Every failure the core can report is a variant of [`DocError`]. The
//! variants fall into three groups:
//!
//! | Group | Variants | Surfaced |
//! |-------|----------|----------|
//! | Request | `Validation`, `UnsupportedFileType`, `NotFound`, `Forbidden`, `StillProcessing`, `Unauthenticated` | synchronously to the caller |
//! | Ingestion | `Extraction`, `EmptyContent`, `NoChunksProduced`, `EmbeddingService`, `EmbeddingFormat` | recorded on the document as `error_message` |
//! | Answering | `VectorStoreMissing`, `AnswerGeneration` | synchronously to the asking request |
//!
//! [`DocError::code`] gives each variant a stable machine-readable code
//! used by the HTTP layer.

use thiserror::Error;

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, DocError>;

#[derive(Debug, Error)]
pub enum DocError {
    /// Bad input shape, size or type. Caller's fault; never retried.
    #[error("{0}")]
    Validation(String),

    #[error("Unsupported file type '{extension}'. Supported types are: {supported}")]
    UnsupportedFileType { extension: String, supported: String },

    #[error("Document not found")]
    NotFound,

    #[error("Not authorized to access this document")]
    Forbidden,

    /// Ingestion is still running; the caller should retry shortly.
    #[error("Document is still processing. Please wait a moment and try again.")]
    StillProcessing,

    #[error("Authentication failed: {0}")]
    Unauthenticated(String),

    #[error("Failed to extract text: {0}")]
    Extraction(String),

    #[error("No content could be extracted from the document")]
    EmptyContent,

    #[error("Document splitting resulted in no chunks")]
    NoChunksProduced,

    #[error("Embedding service error: {0}")]
    EmbeddingService(String),

    #[error("Malformed embedding response: {0}")]
    EmbeddingFormat(String),

    /// Metadata says the document is ready but no index is registered.
    #[error("Document vector index not found. Processing may have failed or the service restarted.")]
    VectorStoreMissing,

    #[error("Could not generate an answer: {0}")]
    AnswerGeneration(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Metadata store error: {0}")]
    Metadata(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DocError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn extraction(message: impl std::fmt::Display) -> Self {
        Self::Extraction(message.to_string())
    }

    pub fn metadata(message: impl std::fmt::Display) -> Self {
        Self::Metadata(message.to_string())
    }

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            DocError::Validation(_) => "bad_request",
            DocError::UnsupportedFileType { .. } => "unsupported_file_type",
            DocError::NotFound => "not_found",
            DocError::Forbidden => "forbidden",
            DocError::StillProcessing => "still_processing",
            DocError::Unauthenticated(_) => "unauthenticated",
            DocError::Extraction(_) => "extraction_error",
            DocError::EmptyContent => "empty_content",
            DocError::NoChunksProduced => "no_chunks_produced",
            DocError::EmbeddingService(_) => "embedding_service_error",
            DocError::EmbeddingFormat(_) => "embedding_format_error",
            DocError::VectorStoreMissing => "vector_store_missing",
            DocError::AnswerGeneration(_) => "answer_generation_error",
            DocError::InvalidTransition { .. } => "invalid_transition",
            DocError::Metadata(_) => "metadata_error",
            DocError::Io(_) => "io_error",
        }
    }

    /// Whether the caller may retry the same request later and expect success.
    pub fn is_transient(&self) -> bool {
        matches!(self, DocError::StillProcessing)
    }
}

impl From<sqlx::Error> for DocError {
    fn from(err: sqlx::Error) -> Self {
        DocError::Metadata(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_type_lists_supported_set() {
        let err = DocError::UnsupportedFileType {
            extension: ".exe".into(),
            supported: ".pdf, .txt".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains(".exe"));
        assert!(msg.contains(".pdf, .txt"));
        assert_eq!(err.code(), "unsupported_file_type");
    }

    #[test]
    fn only_still_processing_is_transient() {
        assert!(DocError::StillProcessing.is_transient());
        assert!(!DocError::NotFound.is_transient());
        assert!(!DocError::VectorStoreMissing.is_transient());
    }
}
