//! Deduplication Index
//!
//! Content-hash lookup over finalized files ("instant upload").
//!
//! The sidecar records under `files/` are the only durable state. An
//! in-memory `hash -> final path` map is bootstrapped from a full sidecar
//! scan and kept current by the merge engine. A full scan is also the repair
//! path whenever the map points at a file that no longer exists.
//!
//! A miss also falls back to a full scan unless `rescan_on_miss` is off. With
//! it off, sidecars placed by anything other than this process (restores,
//! manual copies) stay invisible until [`DedupIndex::rebuild`] runs.
//!
//! Two concurrent merges of identical content under different file ids can
//! both miss the lookup and both store a copy. First lookup wins afterwards;
//! uniqueness is not enforced.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{OnceCell, RwLock};

use super::metadata::{described_file, find_sidecars, read_sidecar, sidecar_path};
use super::types::{StoredFile, UploadError};
use crate::config::StorageConfig;

// ============================================================================
// Deduplication Index
// ============================================================================

#[derive(Clone)]
pub struct DedupIndex {
    inner: Arc<DedupIndexInner>,
}

struct DedupIndexInner {
    storage: Arc<StorageConfig>,

    /// File hash -> absolute path of the final file
    entries: RwLock<HashMap<String, PathBuf>>,

    /// Set once the initial scan has run; holds the number of entries found
    bootstrapped: OnceCell<usize>,

    /// Consult the sidecars directly when the map has no entry
    rescan_on_miss: bool,
}

impl DedupIndex {
    pub fn new(storage: Arc<StorageConfig>, rescan_on_miss: bool) -> Self {
        Self {
            inner: Arc::new(DedupIndexInner {
                storage,
                entries: RwLock::new(HashMap::new()),
                bootstrapped: OnceCell::new(),
                rescan_on_miss,
            }),
        }
    }

    /// Populate the map from the sidecars on disk, once.
    pub async fn bootstrap(&self) -> usize {
        *self
            .inner
            .bootstrapped
            .get_or_init(|| async { self.rebuild().await })
            .await
    }

    /// Replace the map with the result of a full sidecar scan.
    ///
    /// When several sidecars carry the same hash, the first in path order wins.
    pub async fn rebuild(&self) -> usize {
        let sidecars = find_sidecars(&self.inner.storage.files_dir()).await;
        let mut fresh = HashMap::new();

        for sidecar in sidecars {
            let Some(final_path) = described_file(&sidecar) else {
                continue;
            };

            match read_sidecar(&sidecar).await {
                Ok(meta) if !meta.file_hash.is_empty() => {
                    if path_exists(&final_path).await {
                        fresh.entry(meta.file_hash).or_insert(final_path);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(sidecar = %sidecar.display(), error = %e, "Skipping unreadable metadata");
                }
            }
        }

        let count = fresh.len();
        *self.inner.entries.write().await = fresh;

        tracing::info!(entries = count, "Rebuilt deduplication index");
        count
    }

    /// Find a stored file whose content hash is `hash`.
    ///
    /// Only returns files that still exist on disk; a dangling entry is
    /// dropped and the sidecars are rescanned for another copy.
    pub async fn lookup(&self, hash: &str) -> Option<StoredFile> {
        if hash.is_empty() {
            return None;
        }

        self.bootstrap().await;

        let cached = self.inner.entries.read().await.get(hash).cloned();

        match cached {
            Some(final_path) => {
                if let Some(stored) = self.load(&final_path, hash).await {
                    tracing::debug!(file_hash = %hash, url = %stored.url, "Deduplication index hit");
                    return Some(stored);
                }

                tracing::warn!(
                    file_hash = %hash,
                    path = %final_path.display(),
                    "Deduplication entry points at a missing file, rescanning"
                );
                self.evict(hash, &final_path).await;
                self.scan(hash).await
            }
            None if self.inner.rescan_on_miss => self.scan(hash).await,
            None => None,
        }
    }

    /// Fresh full scan of the sidecars for `hash`, bypassing the map.
    ///
    /// A hit is written back into the map.
    pub async fn scan(&self, hash: &str) -> Option<StoredFile> {
        if hash.is_empty() {
            return None;
        }

        let sidecars = find_sidecars(&self.inner.storage.files_dir()).await;
        tracing::debug!(count = sidecars.len(), file_hash = %hash, "Scanning metadata files");

        for sidecar in sidecars {
            let meta = match read_sidecar(&sidecar).await {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::warn!(sidecar = %sidecar.display(), error = %e, "Skipping unreadable metadata");
                    continue;
                }
            };

            if meta.file_hash != hash {
                continue;
            }

            let Some(final_path) = described_file(&sidecar) else {
                continue;
            };

            if let Some(stored) = self.load(&final_path, hash).await {
                self.record(hash, &final_path).await;
                return Some(stored);
            }

            tracing::warn!(path = %final_path.display(), "Metadata points at a missing file");
        }

        tracing::debug!(file_hash = %hash, "No stored file with this hash");
        None
    }

    /// Note a freshly written sidecar. An existing entry for the same hash
    /// is kept.
    pub(crate) async fn record(&self, hash: &str, final_path: &Path) {
        let mut entries = self.inner.entries.write().await;
        entries
            .entry(hash.to_string())
            .or_insert_with(|| final_path.to_path_buf());
    }

    pub async fn len(&self) -> usize {
        self.inner.entries.read().await.len()
    }

    async fn evict(&self, hash: &str, final_path: &Path) {
        let mut entries = self.inner.entries.write().await;
        if entries.get(hash).map(PathBuf::as_path) == Some(final_path) {
            entries.remove(hash);
        }
    }

    /// Load a stored file if both it and a sidecar matching `hash` exist
    async fn load(&self, final_path: &Path, hash: &str) -> Option<StoredFile> {
        if !path_exists(final_path).await {
            return None;
        }

        let meta = match read_sidecar(&sidecar_path(final_path)).await {
            Ok(meta) => meta,
            Err(UploadError::MetadataParse { path, source }) => {
                tracing::warn!(sidecar = %path.display(), error = %source, "Skipping unreadable metadata");
                return None;
            }
            Err(_) => return None,
        };

        if meta.file_hash != hash {
            return None;
        }

        let relative_path = self.inner.storage.relative_path(final_path)?;
        Some(StoredFile {
            path: final_path.to_path_buf(),
            url: self.inner.storage.public_url(&relative_path),
            relative_path,
            metadata: meta,
        })
    }
}

async fn path_exists(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(m) if m.is_file())
}

// ============================================================================
// Tests
// ============================================================================
