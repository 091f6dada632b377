//! Merge Engine
//!
//! Assembles a complete chunk set into one final file:
//!
//! 1. Instant upload: if the content hash is already stored, skip assembly
//!    and discard this session's chunks.
//! 2. Re-verify the chunk count.
//! 3. Pick `files/<YYYY-MM-DD>/<base>_<timestamp><.ext>`.
//! 4. Stream chunks `0..totalChunks` in index order into a temp file,
//!    failing on the first missing index.
//! 5. Flush, fsync and rename the temp file into place.
//! 6. Write the sidecar record when a hash was supplied.
//! 7. Remove the chunk directory (best-effort).
//! 8. Return the public URL.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWriteExt, BufWriter};

use super::chunk_store::{temp_path_for, ChunkStore};
use super::deduplication::DedupIndex;
use super::metadata::{sidecar_path, write_sidecar};
use super::types::{FileMetadata, MergeOutcome, UploadError};
use crate::config::StorageConfig;

/// Last timestamp handed out for a final file name, in milliseconds
static LAST_STAMP: AtomicI64 = AtomicI64::new(0);

/// Everything needed to finalize one session
#[derive(Debug, Clone, Copy)]
pub struct MergeRequest<'a> {
    pub file_id: &'a str,
    pub file_name: &'a str,
    pub total_chunks: u32,
    pub total_size: u64,
    pub mime_type: &'a str,
    pub file_hash: Option<&'a str>,
}

impl MergeRequest<'_> {
    fn hash(&self) -> Option<&str> {
        self.file_hash.filter(|h| !h.is_empty())
    }
}

#[derive(Clone)]
pub struct MergeEngine {
    storage: Arc<StorageConfig>,
    chunk_store: ChunkStore,
    dedup: DedupIndex,
}

impl MergeEngine {
    pub fn new(storage: Arc<StorageConfig>, chunk_store: ChunkStore, dedup: DedupIndex) -> Self {
        Self {
            storage,
            chunk_store,
            dedup,
        }
    }

    /// Finalize a session believed to be complete.
    ///
    /// Callers must hold the session lock for `request.file_id`.
    pub async fn merge(&self, request: &MergeRequest<'_>) -> Result<MergeOutcome, UploadError> {
        let file_id = request.file_id;

        if let Some(hash) = request.hash() {
            if let Some(existing) = self.dedup.lookup(hash).await {
                tracing::info!(
                    file_id = %file_id,
                    file_hash = %hash,
                    url = %existing.url,
                    "File already stored, skipping merge"
                );
                self.chunk_store.remove(file_id).await;
                return Ok(MergeOutcome::Deduplicated { url: existing.url });
            }
        }

        if !self.chunk_store.session_exists(file_id).await? {
            tracing::error!(file_id = %file_id, "Chunk directory does not exist");
            return Err(UploadError::MissingChunkDirectory(file_id.to_string()));
        }

        let uploaded = self.chunk_store.list(file_id).await?;
        if uploaded.len() != request.total_chunks as usize {
            tracing::error!(
                file_id = %file_id,
                uploaded = uploaded.len(),
                expected = request.total_chunks,
                "Chunk count mismatch"
            );
            return Err(UploadError::ChunkCountMismatch {
                uploaded: uploaded.len(),
                expected: request.total_chunks,
            });
        }

        let now = Utc::now();
        let final_path = self.destination(request.file_name, now).await?;

        tracing::info!(
            file_id = %file_id,
            chunks = request.total_chunks,
            path = %final_path.display(),
            "Merging chunks"
        );

        let temp_path = temp_path_for(&final_path);
        let (size, sha256) = match self.assemble(file_id, request.total_chunks, &temp_path).await {
            Ok(result) => result,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                tracing::error!(file_id = %file_id, error = %e, "Merge aborted");
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        if size != request.total_size {
            tracing::warn!(
                file_id = %file_id,
                declared = request.total_size,
                actual = size,
                "Merged size differs from declared total size"
            );
        }

        if let Some(hash) = request.hash() {
            let metadata = FileMetadata {
                file_id: file_id.to_string(),
                file_name: request.file_name.to_string(),
                file_hash: hash.to_string(),
                mime_type: request.mime_type.to_string(),
                size,
                uploaded_at: now,
                sha256: Some(sha256.clone()),
            };

            // The file itself is durable at this point; a failed sidecar only
            // costs dedup visibility.
            match write_sidecar(&final_path, &metadata).await {
                Ok(path) => {
                    self.dedup.record(hash, &final_path).await;
                    tracing::info!(sidecar = %path.display(), "Wrote file metadata");
                }
                Err(e) => tracing::warn!(
                    path = %final_path.display(),
                    error = %e,
                    "Failed to write file metadata"
                ),
            }
        }

        self.chunk_store.remove(file_id).await;

        let relative_path = self
            .storage
            .relative_path(&final_path)
            .ok_or_else(|| UploadError::InvalidPath(final_path.display().to_string()))?;
        let url = self.storage.public_url(&relative_path);

        tracing::info!(
            file_id = %file_id,
            size = size,
            sha256 = %sha256,
            url = %url,
            "File merged"
        );

        Ok(MergeOutcome::Stored {
            url,
            relative_path,
            size,
            sha256,
        })
    }

    /// Stream chunks `0..total_chunks` into `output`, returning the byte
    /// count and SHA-256 of what was written.
    async fn assemble(
        &self,
        file_id: &str,
        total_chunks: u32,
        output: &Path,
    ) -> Result<(u64, String), UploadError> {
        let file = tokio::fs::File::create(output).await?;
        let mut writer = BufWriter::new(file);
        let mut hasher = Sha256::new();
        let mut size = 0u64;

        for i in 0..total_chunks {
            let chunk = self.chunk_store.read(file_id, i).await?;
            hasher.update(&chunk);
            writer.write_all(&chunk).await?;
            size += chunk.len() as u64;

            tracing::debug!(file_id = %file_id, chunk_number = i, size = chunk.len(), "Wrote chunk");
        }

        writer.flush().await?;
        writer.into_inner().sync_all().await?;

        Ok((size, hex::encode(hasher.finalize())))
    }

    /// Unused final path in today's partition
    async fn destination(&self, file_name: &str, now: DateTime<Utc>) -> Result<PathBuf, UploadError> {
        let dir = self
            .storage
            .files_dir()
            .join(now.format("%Y-%m-%d").to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let (stem, ext) = split_file_name(file_name);
        loop {
            let candidate = dir.join(format!("{}_{}{}", stem, next_stamp(now), ext));
            let taken = tokio::fs::try_exists(&candidate).await?
                || tokio::fs::try_exists(sidecar_path(&candidate)).await?;
            if !taken {
                return Ok(candidate);
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Millisecond timestamp, strictly increasing within this process
fn next_stamp(now: DateTime<Utc>) -> i64 {
    let now = now.timestamp_millis();
    let mut last = LAST_STAMP.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_STAMP.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// Split a client-supplied name into a directory-free stem and `.ext` suffix
fn split_file_name(file_name: &str) -> (String, String) {
    let normalized = file_name.replace('\\', "/");
    let base = Path::new(&normalized)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if base.is_empty() {
        return ("file".to_string(), String::new());
    }

    let path = Path::new(&base);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| base.clone());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    (stem, ext)
}

// ============================================================================
// Tests
// ============================================================================
