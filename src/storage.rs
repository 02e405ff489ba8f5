//! Transient on-disk storage for uploads awaiting ingestion.

use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct TempStorage {
    dir: PathBuf,
}

impl TempStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist an upload as `<dir>/<document_id>_<sanitised filename>`.
    pub async fn write(&self, document_id: &str, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self
            .dir
            .join(format!("{}_{}", document_id, sanitize_filename(filename)));
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    /// Best-effort delete; failures are logged, never returned.
    pub fn remove(path: &Path) {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove temp file");
            }
        }
    }
}

/// Keep only the final path component and drop characters that could
/// escape the storage directory.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename);
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() || c == ':' { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').trim();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sanitize_strips_directories() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\docs\\q3.xlsx"), "q3.xlsx");
        assert_eq!(sanitize_filename(".."), "upload");
        assert_eq!(sanitize_filename(".hidden.txt"), "hidden.txt");
    }

    #[tokio::test]
    async fn write_then_remove() {
        let tmp = TempDir::new().unwrap();
        let storage = TempStorage::new(tmp.path().join("uploads"));
        let path = storage.write("doc-1", "../notes.txt", b"hello").await.unwrap();
        assert!(path.starts_with(storage.dir()));
        assert_eq!(path.file_name().unwrap(), "doc-1_notes.txt");
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");

        TempStorage::remove(&path);
        assert!(!path.exists());
        // Second removal is a silent no-op.
        TempStorage::remove(&path);
    }
}
