//! Sidecar metadata records
//!
//! Every deduplicatable final file has a `<name>.meta.json` record beside it,
//! which makes the final-storage tree self-describing.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::chunk_store::write_atomic;
use super::types::{FileMetadata, UploadError, SIDECAR_SUFFIX};

/// Sidecar path for a final file
pub fn sidecar_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

/// Final file a sidecar describes, or `None` if `path` is not a sidecar
pub fn described_file(sidecar: &Path) -> Option<PathBuf> {
    let name = sidecar.file_name()?.to_str()?;
    let stem = name.strip_suffix(SIDECAR_SUFFIX)?;
    if stem.is_empty() {
        return None;
    }
    Some(sidecar.with_file_name(stem))
}

pub async fn write_sidecar(final_path: &Path, metadata: &FileMetadata) -> Result<PathBuf, UploadError> {
    let path = sidecar_path(final_path);
    let json = serde_json::to_vec_pretty(metadata).map_err(|source| UploadError::MetadataParse {
        path: path.clone(),
        source,
    })?;
    write_atomic(&path, &json).await?;
    Ok(path)
}

pub async fn read_sidecar(path: &Path) -> Result<FileMetadata, UploadError> {
    let raw = tokio::fs::read(path).await?;
    serde_json::from_slice(&raw).map_err(|source| UploadError::MetadataParse {
        path: path.to_path_buf(),
        source,
    })
}

/// Recursively collect every sidecar under `root`.
///
/// Unreadable directories are logged and skipped. Files appearing or
/// vanishing mid-walk may or may not be reported.
pub async fn find_sidecars(root: &Path) -> Vec<PathBuf> {
    let mut results = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Error searching metadata files");
                continue;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "Error searching metadata files");
                    break;
                }
            };

            let file_type = match entry.file_type().await {
                Ok(t) => t,
                Err(_) => continue,
            };

            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() && described_file(&path).is_some() {
                results.push(path);
            }
        }
    }

    results.sort();
    results
}
