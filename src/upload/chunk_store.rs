//! Chunk Store
//!
//! Transient per-session storage for uploaded chunks before assembly.
//!
//! Layout: `<root>/chunks/<fileId>/<chunkNumber>`. A session exists exactly
//! as long as its directory does; there is no separate session record.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::types::UploadError;
use crate::config::StorageConfig;

// ============================================================================
// Chunk Store
// ============================================================================

/// Filesystem-backed chunk storage keyed by `(fileId, chunkNumber)`
#[derive(Clone)]
pub struct ChunkStore {
    storage: Arc<StorageConfig>,
}

impl ChunkStore {
    pub fn new(storage: Arc<StorageConfig>) -> Self {
        Self { storage }
    }

    /// Directory holding all chunks of one session
    pub fn session_dir(&self, file_id: &str) -> Result<PathBuf, UploadError> {
        validate_file_id(file_id)?;
        Ok(self.storage.chunks_dir().join(file_id))
    }

    pub fn chunk_path(&self, file_id: &str, chunk_number: u32) -> Result<PathBuf, UploadError> {
        Ok(self.session_dir(file_id)?.join(chunk_number.to_string()))
    }

    /// Store a chunk, replacing any earlier bytes for the same index.
    ///
    /// The chunk becomes visible to [`ChunkStore::list`] only once fully written.
    pub async fn put(
        &self,
        file_id: &str,
        chunk_number: u32,
        data: &[u8],
    ) -> Result<(), UploadError> {
        let path = self.chunk_path(file_id, chunk_number)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        write_atomic(&path, data).await?;

        tracing::debug!(
            file_id = %file_id,
            chunk_number = chunk_number,
            size = data.len(),
            "Chunk stored"
        );

        Ok(())
    }

    /// Chunk numbers present for a session, ascending and deduplicated.
    ///
    /// A session with no directory yet has no chunks; that is not an error.
    pub async fn list(&self, file_id: &str) -> Result<Vec<u32>, UploadError> {
        let dir = self.session_dir(file_id)?;

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut chunks = BTreeSet::new();
        while let Some(entry) = entries.next_entry().await? {
            // In-flight temp files and stray entries are not chunks
            if let Some(n) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) {
                chunks.insert(n);
            }
        }

        Ok(chunks.into_iter().collect())
    }

    /// Whether the session directory exists at all
    pub async fn session_exists(&self, file_id: &str) -> Result<bool, UploadError> {
        let dir = self.session_dir(file_id)?;
        Ok(tokio::fs::try_exists(&dir).await?)
    }

    /// Read one chunk's full bytes
    pub async fn read(&self, file_id: &str, chunk_number: u32) -> Result<Vec<u8>, UploadError> {
        let path = self.chunk_path(file_id, chunk_number)?;
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                UploadError::MissingChunk(chunk_number)
            } else {
                UploadError::Storage(e)
            }
        })
    }

    /// Delete all chunks of a session and its directory.
    ///
    /// Best-effort: failures are logged and swallowed. Returns the number of
    /// chunk files removed.
    pub async fn remove(&self, file_id: &str) -> usize {
        let dir = match self.session_dir(file_id) {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!(file_id = %file_id, error = %e, "Refusing to clean up chunks");
                return 0;
            }
        };

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return 0,
            Err(e) => {
                tracing::warn!(file_id = %file_id, error = %e, "Error cleaning up chunks");
                return 0;
            }
        };

        let mut count = 0;
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => count += 1,
                    Err(e) => tracing::warn!(
                        path = %entry.path().display(),
                        error = %e,
                        "Failed to remove chunk file"
                    ),
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(file_id = %file_id, error = %e, "Error listing chunks for cleanup");
                    break;
                }
            }
        }

        match tokio::fs::remove_dir(&dir).await {
            Ok(()) => tracing::info!(file_id = %file_id, removed = count, "Cleaned up chunk directory"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                file_id = %file_id,
                error = %e,
                "Failed to remove chunk directory"
            ),
        }

        count
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Reject session ids that are not exactly one plain path component
pub fn validate_file_id(file_id: &str) -> Result<(), UploadError> {
    let mut components = Path::new(file_id).components();
    let single_normal = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );

    if !single_normal || file_id.contains(['/', '\\', '\0']) {
        return Err(UploadError::InvalidFileId(file_id.to_string()));
    }
    Ok(())
}

/// Hidden sibling path used while `path` is being written
pub(crate) fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp-{}", name, Uuid::new_v4()))
}

/// Write `data` to a temp file, fsync, then rename over `path`
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let temp_path = temp_path_for(path);

    let result = async {
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp_path, path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&temp_path).await;
    }
    result
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> ChunkStore {
        ChunkStore::new(Arc::new(StorageConfig::new(dir.path(), "http://localhost")))
    }

    #[tokio::test]
    async fn test_put_and_list() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        store.put("abc", 2, b"cc").await.unwrap();
        store.put("abc", 0, b"aa").await.unwrap();
        store.put("abc", 10, b"k").await.unwrap();

        assert_eq!(store.list("abc").await.unwrap(), vec![0, 2, 10]);
        assert!(temp_dir.path().join("chunks/abc/2").exists());
    }

    #[tokio::test]
    async fn test_list_unknown_session_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        assert!(store.list("never-seen").await.unwrap().is_empty());
        assert!(!store.session_exists("never-seen").await.unwrap());
    }

    #[tokio::test]
    async fn test_put_overwrites_same_index() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        store.put("abc", 0, b"first").await.unwrap();
        store.put("abc", 0, b"2nd").await.unwrap();

        assert_eq!(store.list("abc").await.unwrap(), vec![0]);
        assert_eq!(store.read("abc", 0).await.unwrap(), b"2nd");
    }

    #[tokio::test]
    async fn test_list_ignores_non_chunk_entries() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        store.put("abc", 1, b"x").await.unwrap();
        let dir = store.session_dir("abc").unwrap();
        std::fs::write(dir.join(".1.tmp-123"), b"partial").unwrap();
        std::fs::write(dir.join("notes.txt"), b"?").unwrap();

        assert_eq!(store.list("abc").await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_read_missing_chunk() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        store.put("abc", 0, b"x").await.unwrap();
        let result = store.read("abc", 1).await;
        assert!(matches!(result, Err(UploadError::MissingChunk(1))));
    }

    #[tokio::test]
    async fn test_remove() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        store.put("abc", 0, b"a").await.unwrap();
        store.put("abc", 1, b"b").await.unwrap();

        assert_eq!(store.remove("abc").await, 2);
        assert!(!temp_dir.path().join("chunks/abc").exists());

        // Removing again is a no-op
        assert_eq!(store.remove("abc").await, 0);
    }

    #[tokio::test]
    async fn test_rejects_traversal_file_ids() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        for bad in ["", ".", "..", "../escape", "a/b", "a\\b", "/abs"] {
            let result = store.put(bad, 0, b"x").await;
            assert!(
                matches!(result, Err(UploadError::InvalidFileId(_))),
                "accepted {bad:?}"
            );
        }
        assert_eq!(store.remove("../escape").await, 0);
    }
}
