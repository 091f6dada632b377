//! Upload Coordinator
//!
//! Entry point for every upload operation. Handles one chunk-arrival event
//! end to end: instant-upload check, chunk storage, completion check and
//! merge. Completion checks and merges for the same `fileId` are serialized
//! through [`SessionLocks`].

use std::io::ErrorKind;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use super::chunk_store::{validate_file_id, ChunkStore};
use super::deduplication::DedupIndex;
use super::locks::SessionLocks;
use super::merge::{MergeEngine, MergeRequest};
use super::types::{
    CheckFileResponse, ChunkInfoResponse, ChunkUpload, ChunkUploadResponse, CompleteFileRequest,
    UploadError,
};
use crate::config::{StorageConfig, UploadConfig};

#[derive(Clone)]
pub struct UploadCoordinator {
    inner: Arc<UploadCoordinatorInner>,
}

struct UploadCoordinatorInner {
    chunk_store: ChunkStore,
    dedup: DedupIndex,
    merge: MergeEngine,
    locks: SessionLocks,

    /// Recently merged sessions: fileId -> public URL
    recent: Mutex<LruCache<String, String>>,
}

impl UploadCoordinator {
    pub fn new(storage: Arc<StorageConfig>, config: &UploadConfig) -> Self {
        let chunk_store = ChunkStore::new(storage.clone());
        let dedup = DedupIndex::new(storage.clone(), config.dedup_rescan_on_miss);
        let merge = MergeEngine::new(storage, chunk_store.clone(), dedup.clone());
        let capacity = NonZeroUsize::new(config.recent_completions).unwrap_or(NonZeroUsize::MIN);

        Self {
            inner: Arc::new(UploadCoordinatorInner {
                chunk_store,
                dedup,
                merge,
                locks: SessionLocks::new(),
                recent: Mutex::new(LruCache::new(capacity)),
            }),
        }
    }

    pub fn dedup(&self) -> &DedupIndex {
        &self.inner.dedup
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Handle one chunk arrival.
    ///
    /// A single-file upload is the case `total_chunks == 1, chunk_number == 0`.
    pub async fn upload_chunk(&self, upload: ChunkUpload) -> Result<ChunkUploadResponse, UploadError> {
        let ChunkUpload {
            file_id,
            chunk_number,
            total_chunks,
            data,
            file_name,
            total_size,
            mime_type,
            file_hash,
        } = upload;
        let file_hash = file_hash.filter(|h| !h.is_empty());

        validate_file_id(&file_id)?;
        if total_chunks == 0 {
            return Err(UploadError::InvalidChunkCount);
        }
        if chunk_number >= total_chunks {
            return Err(UploadError::ChunkIndexOutOfBounds {
                index: chunk_number,
                total: total_chunks,
            });
        }

        tracing::info!(
            file_id = %file_id,
            chunk_number = chunk_number,
            total_chunks = total_chunks,
            size = data.len(),
            "Processing chunk"
        );

        if let Some(hash) = file_hash.as_deref() {
            if let Some(existing) = self.inner.dedup.lookup(hash).await {
                tracing::info!(
                    file_id = %file_id,
                    file_hash = %hash,
                    url = %existing.url,
                    "File already stored, instant upload"
                );
                // Earlier chunks of this session are now redundant
                self.inner.chunk_store.remove(&file_id).await;
                return Ok(completed(chunk_number, file_id, existing.url));
            }
        }

        // Late resend for a session that is already merged
        if let Some(url) = self.recent_url(&file_id) {
            tracing::debug!(file_id = %file_id, chunk_number = chunk_number, "Session already merged");
            return Ok(completed(chunk_number, file_id, url));
        }

        match self.inner.chunk_store.put(&file_id, chunk_number, &data).await {
            Ok(()) => {}
            // A peer's post-merge cleanup removed the directory mid-write;
            // the peer records the URL before releasing the session lock
            Err(UploadError::Storage(e)) if e.kind() == ErrorKind::NotFound => {
                let _guard = self.inner.locks.acquire(&file_id).await;
                return match self.recent_url(&file_id) {
                    Some(url) => {
                        self.inner.chunk_store.remove(&file_id).await;
                        Ok(completed(chunk_number, file_id, url))
                    }
                    None => Err(UploadError::Storage(e)),
                };
            }
            Err(e) => return Err(e),
        }

        let _guard = self.inner.locks.acquire(&file_id).await;

        // Merged while we were writing: our chunk is either part of the
        // stored file or an orphan in a recreated directory
        if let Some(url) = self.recent_url(&file_id) {
            self.inner.chunk_store.remove(&file_id).await;
            tracing::debug!(file_id = %file_id, "Session already merged by a concurrent request");
            return Ok(completed(chunk_number, file_id, url));
        }

        let uploaded = self.inner.chunk_store.list(&file_id).await?;
        tracing::debug!(
            file_id = %file_id,
            uploaded = uploaded.len(),
            total_chunks = total_chunks,
            "Checked uploaded chunks"
        );

        if uploaded.len() == total_chunks as usize {
            let request = MergeRequest {
                file_id: &file_id,
                file_name: &file_name,
                total_chunks,
                total_size,
                mime_type: &mime_type,
                file_hash: file_hash.as_deref(),
            };
            let url = self.inner.merge.merge(&request).await?.into_url();
            self.remember(&file_id, &url);
            return Ok(completed(chunk_number, file_id, url));
        }

        Ok(ChunkUploadResponse {
            success: true,
            chunk_number,
            file_id,
            completed: false,
            file_url: None,
        })
    }

    /// Explicit completion for a session whose chunk delivery the caller
    /// tracked itself. Returns the public URL of the stored file.
    pub async fn complete_file(&self, request: &CompleteFileRequest) -> Result<String, UploadError> {
        validate_file_id(&request.file_id)?;
        if request.total_chunks == 0 {
            return Err(UploadError::InvalidChunkCount);
        }
        let file_hash = request.file_hash.as_deref().filter(|h| !h.is_empty());

        if let Some(hash) = file_hash {
            if let Some(existing) = self.inner.dedup.lookup(hash).await {
                tracing::info!(
                    file_id = %request.file_id,
                    file_hash = %hash,
                    "File already stored, instant completion"
                );
                self.inner.chunk_store.remove(&request.file_id).await;
                return Ok(existing.url);
            }
        }

        let _guard = self.inner.locks.acquire(&request.file_id).await;

        let uploaded = self.inner.chunk_store.list(&request.file_id).await?;
        if uploaded.len() != request.total_chunks as usize {
            tracing::warn!(
                file_id = %request.file_id,
                uploaded = uploaded.len(),
                expected = request.total_chunks,
                "Completion requested before all chunks arrived"
            );
            return Err(UploadError::ChunkCountMismatch {
                uploaded: uploaded.len(),
                expected: request.total_chunks,
            });
        }

        let merge_request = MergeRequest {
            file_id: &request.file_id,
            file_name: &request.file_name,
            total_chunks: request.total_chunks,
            total_size: request.total_size,
            mime_type: &request.mime_type,
            file_hash,
        };
        let url = self.inner.merge.merge(&merge_request).await?.into_url();
        self.remember(&request.file_id, &url);

        Ok(url)
    }

    /// Whether content with `file_hash` is already stored
    pub async fn check_file_exists(&self, file_hash: &str) -> CheckFileResponse {
        match self.inner.dedup.lookup(file_hash).await {
            Some(stored) => CheckFileResponse {
                exists: true,
                file_info: Some(stored.file_info()),
            },
            None => CheckFileResponse::default(),
        }
    }

    /// Chunk numbers already stored for `file_id`; empty for unknown sessions
    pub async fn uploaded_chunk_info(&self, file_id: &str) -> ChunkInfoResponse {
        match self.inner.chunk_store.list(file_id).await {
            Ok(uploaded_chunks) => {
                tracing::debug!(file_id = %file_id, uploaded = ?uploaded_chunks, "Uploaded chunk info");
                ChunkInfoResponse { uploaded_chunks }
            }
            Err(e) => {
                tracing::warn!(file_id = %file_id, error = %e, "Failed to list uploaded chunks");
                ChunkInfoResponse::default()
            }
        }
    }

    /// Drop an abandoned session's chunks. Intended for an external reaper.
    pub async fn discard(&self, file_id: &str) -> usize {
        let _guard = self.inner.locks.acquire(file_id).await;
        self.inner.chunk_store.remove(file_id).await
    }

    fn recent_url(&self, file_id: &str) -> Option<String> {
        self.inner.recent.lock().get(file_id).cloned()
    }

    fn remember(&self, file_id: &str, url: &str) {
        self.inner
            .recent
            .lock()
            .put(file_id.to_string(), url.to_string());
    }
}

fn completed(chunk_number: u32, file_id: String, url: String) -> ChunkUploadResponse {
    ChunkUploadResponse {
        success: true,
        chunk_number,
        file_id,
        completed: true,
        file_url: Some(url),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::metadata::find_sidecars;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        storage: Arc<StorageConfig>,
        coordinator: UploadCoordinator,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(StorageConfig::new(dir.path(), "http://localhost:8080/uploads"));
        let config = UploadConfig {
            recent_completions: 16,
            dedup_rescan_on_miss: false,
        };
        let coordinator = UploadCoordinator::new(storage.clone(), &config);
        Fixture {
            dir,
            storage,
            coordinator,
        }
    }

    fn chunk(file_id: &str, n: u32, total: u32, data: &[u8], hash: Option<&str>) -> ChunkUpload {
        ChunkUpload {
            file_id: file_id.to_string(),
            chunk_number: n,
            total_chunks: total,
            data: data.to_vec(),
            file_name: "video.mp4".to_string(),
            total_size: 7,
            mime_type: "video/mp4".to_string(),
            file_hash: hash.map(str::to_string),
        }
    }

    fn read_url(f: &Fixture, url: &str) -> Vec<u8> {
        let rel = url.strip_prefix("http://localhost:8080/uploads/").unwrap();
        std::fs::read(f.storage.root.join(rel)).unwrap()
    }

    fn stored_files(f: &Fixture) -> usize {
        let mut count = 0;
        let Ok(days) = std::fs::read_dir(f.storage.files_dir()) else {
            return 0;
        };
        for day in days {
            for entry in std::fs::read_dir(day.unwrap().path()).unwrap() {
                let path = entry.unwrap().path();
                if !path.to_string_lossy().ends_with(".meta.json") {
                    count += 1;
                }
            }
        }
        count
    }

    #[tokio::test]
    async fn test_out_of_order_arrival() {
        let f = fixture();
        let c = &f.coordinator;

        let r = c.upload_chunk(chunk("abc", 2, 3, b"gh", None)).await.unwrap();
        assert!(!r.completed);
        let r = c.upload_chunk(chunk("abc", 0, 3, b"ab", None)).await.unwrap();
        assert!(!r.completed);
        assert!(r.file_url.is_none());

        let r = c.upload_chunk(chunk("abc", 1, 3, b"cde", None)).await.unwrap();
        assert!(r.completed);
        assert!(r.success);
        assert_eq!(r.chunk_number, 1);

        let bytes = read_url(&f, r.file_url.as_deref().unwrap());
        assert_eq!(bytes.len(), 7);
        assert_eq!(bytes, b"abcdegh");
        assert!(!f.dir.path().join("chunks/abc").exists());
    }

    #[tokio::test]
    async fn test_every_arrival_order_assembles_identically() {
        let parts: [&[u8]; 4] = [b"00", b"111", b"2", b"3333"];
        let orders = [[0, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1], [1, 3, 0, 2]];

        for (i, order) in orders.iter().enumerate() {
            let f = fixture();
            let file_id = format!("perm-{i}");
            let mut last = None;
            for &n in order {
                last = Some(
                    f.coordinator
                        .upload_chunk(chunk(&file_id, n, 4, parts[n as usize], None))
                        .await
                        .unwrap(),
                );
            }
            let url = last.unwrap().file_url.unwrap();
            assert_eq!(read_url(&f, &url), b"001112333".to_vec());
        }
    }

    #[tokio::test]
    async fn test_resend_overwrites_before_merge() {
        let f = fixture();
        let c = &f.coordinator;

        c.upload_chunk(chunk("abc", 0, 2, b"bad", None)).await.unwrap();
        c.upload_chunk(chunk("abc", 0, 2, b"good", None)).await.unwrap();
        let r = c.upload_chunk(chunk("abc", 1, 2, b"!", None)).await.unwrap();

        assert_eq!(read_url(&f, &r.file_url.unwrap()), b"good!");
    }

    #[tokio::test]
    async fn test_instant_upload_stores_nothing() {
        let f = fixture();
        let c = &f.coordinator;

        let first = c.upload_chunk(chunk("orig", 0, 1, b"payload", Some("H1"))).await.unwrap();
        let url = first.file_url.unwrap();

        let r = c.upload_chunk(chunk("copy", 0, 3, b"pa", Some("H1"))).await.unwrap();
        assert!(r.completed);
        assert_eq!(r.file_url.as_deref(), Some(url.as_str()));
        assert!(!f.dir.path().join("chunks/copy").exists());
        assert_eq!(stored_files(&f), 1);
    }

    #[tokio::test]
    async fn test_duplicate_completion_reuses_first_file() {
        let f = fixture();
        let c = &f.coordinator;

        let first = c.upload_chunk(chunk("one", 0, 1, b"same", Some("H1"))).await.unwrap();

        // Second session stores its chunks without a hash, then completes with one
        c.upload_chunk(chunk("two", 0, 2, b"sa", None)).await.unwrap();
        let request = CompleteFileRequest {
            file_id: "two".to_string(),
            file_name: "video.mp4".to_string(),
            total_chunks: 2,
            total_size: 4,
            mime_type: "video/mp4".to_string(),
            file_hash: Some("H1".to_string()),
        };
        let url = c.complete_file(&request).await.unwrap();

        assert_eq!(Some(url), first.file_url);
        assert_eq!(stored_files(&f), 1);
        assert!(!f.dir.path().join("chunks/two").exists());
        assert_eq!(find_sidecars(&f.storage.files_dir()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_complete_file_count_mismatch() {
        let f = fixture();
        let c = &f.coordinator;

        c.upload_chunk(chunk("abc", 0, 3, b"a", None)).await.unwrap();

        let mut request = CompleteFileRequest {
            file_id: "abc".to_string(),
            file_name: "video.mp4".to_string(),
            total_chunks: 3,
            total_size: 3,
            mime_type: "video/mp4".to_string(),
            file_hash: None,
        };
        let result = c.complete_file(&request).await;
        assert!(matches!(
            result,
            Err(UploadError::ChunkCountMismatch { uploaded: 1, expected: 3 })
        ));

        request.file_id = "nobody".to_string();
        let result = c.complete_file(&request).await;
        assert!(matches!(
            result,
            Err(UploadError::ChunkCountMismatch { uploaded: 0, expected: 3 })
        ));
    }

    #[tokio::test]
    async fn test_complete_file_merges() {
        let f = fixture();
        let c = &f.coordinator;

        // Declared total is larger, so uploadChunk never auto-merges
        c.upload_chunk(chunk("abc", 0, 5, b"he", None)).await.unwrap();
        c.upload_chunk(chunk("abc", 1, 5, b"llo", None)).await.unwrap();

        let request = CompleteFileRequest {
            file_id: "abc".to_string(),
            file_name: "greeting.txt".to_string(),
            total_chunks: 2,
            total_size: 5,
            mime_type: "text/plain".to_string(),
            file_hash: Some("HELLO".to_string()),
        };
        let url = c.complete_file(&request).await.unwrap();
        assert_eq!(read_url(&f, &url), b"hello");

        let check = c.check_file_exists("HELLO").await;
        assert!(check.exists);
        let info = check.file_info.unwrap();
        assert_eq!(info.url, url);
        assert_eq!(info.file_name, "greeting.txt");
        assert_eq!(info.size, 5);
    }

    #[tokio::test]
    async fn test_chunk_info() {
        let f = fixture();
        let c = &f.coordinator;

        assert!(c.uploaded_chunk_info("unknown").await.uploaded_chunks.is_empty());
        assert!(c.uploaded_chunk_info("../etc").await.uploaded_chunks.is_empty());

        c.upload_chunk(chunk("abc", 3, 5, b"d", None)).await.unwrap();
        c.upload_chunk(chunk("abc", 1, 5, b"b", None)).await.unwrap();
        assert_eq!(c.uploaded_chunk_info("abc").await.uploaded_chunks, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_check_file_exists_miss() {
        let f = fixture();
        assert_eq!(f.coordinator.check_file_exists("").await, CheckFileResponse::default());
        assert!(!f.coordinator.check_file_exists("nope").await.exists);
    }

    #[tokio::test]
    async fn test_rejects_invalid_chunk_numbers() {
        let f = fixture();
        let c = &f.coordinator;

        let result = c.upload_chunk(chunk("abc", 3, 3, b"x", None)).await;
        assert!(matches!(
            result,
            Err(UploadError::ChunkIndexOutOfBounds { index: 3, total: 3 })
        ));

        let result = c.upload_chunk(chunk("abc", 0, 0, b"x", None)).await;
        assert!(matches!(result, Err(UploadError::InvalidChunkCount)));
        assert!(!f.dir.path().join("chunks/abc").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_final_chunks_merge_once() {
        let f = fixture();
        let total = 16u32;

        let tasks: Vec<_> = (0..total)
            .map(|n| {
                let c = f.coordinator.clone();
                tokio::spawn(async move {
                    c.upload_chunk(chunk("race", n, total, &[n as u8], None))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let urls: Vec<String> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter_map(|r| r.unwrap().file_url)
            .collect();

        assert_eq!(stored_files(&f), 1);
        assert!(!urls.is_empty());
        assert!(urls.iter().all(|u| u == &urls[0]));

        let expected: Vec<u8> = (0..total as u8).collect();
        assert_eq!(read_url(&f, &urls[0]), expected);
    }

    #[tokio::test]
    async fn test_single_chunk_retry_does_not_merge_twice() {
        let f = fixture();
        let c = &f.coordinator;

        let first = c.upload_chunk(chunk("solo", 0, 1, b"payload", None)).await.unwrap();
        let retry = c.upload_chunk(chunk("solo", 0, 1, b"payload", None)).await.unwrap();

        assert!(retry.completed);
        assert_eq!(retry.file_url, first.file_url);
        assert_eq!(stored_files(&f), 1);
        assert!(!f.dir.path().join("chunks/solo").exists());
    }

    #[tokio::test]
    async fn test_resend_after_merge_leaves_no_chunks() {
        let f = fixture();
        let c = &f.coordinator;

        c.upload_chunk(chunk("pair", 0, 2, b"ab", None)).await.unwrap();
        let merged = c.upload_chunk(chunk("pair", 1, 2, b"cd", None)).await.unwrap();
        assert!(merged.completed);

        let late = c.upload_chunk(chunk("pair", 1, 2, b"cd", None)).await.unwrap();
        assert!(late.completed);
        assert_eq!(late.file_url, merged.file_url);
        assert!(!f.dir.path().join("chunks/pair").exists());
        assert!(c.uploaded_chunk_info("pair").await.uploaded_chunks.is_empty());
        assert_eq!(stored_files(&f), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resends_racing_merge_cleanup_succeed() {
        let f = fixture();
        let total = 8u32;

        // Every chunk is sent twice at once; second copies race the merge's cleanup
        let tasks: Vec<_> = (0..total)
            .chain(0..total)
            .map(|n| {
                let c = f.coordinator.clone();
                tokio::spawn(async move { c.upload_chunk(chunk("dup", n, total, &[n as u8], None)).await })
            })
            .collect();

        let responses: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        let urls: Vec<&String> = responses.iter().filter_map(|r| r.file_url.as_ref()).collect();
        assert!(!urls.is_empty());
        assert!(urls.iter().all(|u| *u == urls[0]));
        assert_eq!(stored_files(&f), 1);

        // Resending after the fact changes nothing
        for n in 0..total {
            let late = f
                .coordinator
                .upload_chunk(chunk("dup", n, total, &[n as u8], None))
                .await
                .unwrap();
            assert_eq!(late.file_url.as_ref(), Some(urls[0]));
        }
        assert!(!f.dir.path().join("chunks/dup").exists());
        assert_eq!(stored_files(&f), 1);
    }

    #[tokio::test]
    async fn test_discard() {
        let f = fixture();
        f.coordinator
            .upload_chunk(chunk("abandoned", 0, 2, b"x", None))
            .await
            .unwrap();

        assert_eq!(f.coordinator.discard("abandoned").await, 1);
        assert!(f.coordinator.uploaded_chunk_info("abandoned").await.uploaded_chunks.is_empty());
    }
}
