//! File Server
//!
//! Reads finalized files back by storage-root-relative path. Requests are
//! confined to the storage root: only plain path segments are accepted, and
//! the resolved path must canonicalize to somewhere under the root, which
//! also rules out symlinks pointing outside it.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::body::Bytes;

use super::types::ServedFile;
use crate::config::StorageConfig;
use crate::upload::metadata::{read_sidecar, sidecar_path};
use crate::upload::{UploadError, DEFAULT_MIME_TYPE};

#[derive(Clone)]
pub struct FileServer {
    storage: Arc<StorageConfig>,
}

impl FileServer {
    pub fn new(storage: Arc<StorageConfig>) -> Self {
        Self { storage }
    }

    /// Read a stored file and its MIME type.
    pub async fn get_file(&self, relative_path: &str) -> Result<ServedFile, UploadError> {
        let candidate = self.candidate_path(relative_path)?;

        let root = self.storage.root.clone();
        let requested = relative_path.to_string();
        let path = tokio::task::spawn_blocking(move || contain(&root, &candidate, &requested))
            .await
            .map_err(|e| UploadError::Storage(std::io::Error::other(format!("spawn_blocking failed: {e}"))))??;

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(UploadError::FileNotFound(relative_path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let mime_type = match read_sidecar(&sidecar_path(&path)).await {
            Ok(meta) if !meta.mime_type.is_empty() => meta.mime_type,
            Ok(_) => DEFAULT_MIME_TYPE.to_string(),
            Err(UploadError::Storage(e)) if e.kind() == ErrorKind::NotFound => DEFAULT_MIME_TYPE.to_string(),
            Err(e) => {
                tracing::warn!(path = %relative_path, error = %e, "Could not read file metadata");
                DEFAULT_MIME_TYPE.to_string()
            }
        };

        tracing::debug!(path = %relative_path, size = data.len(), mime_type = %mime_type, "Serving file");

        Ok(ServedFile {
            relative_path: relative_path.to_string(),
            mime_type,
            data: Bytes::from(data),
        })
    }

    /// Join `relative_path` onto the root after rejecting anything but
    /// plain segments
    fn candidate_path(&self, relative_path: &str) -> Result<PathBuf, UploadError> {
        let invalid = || UploadError::InvalidPath(relative_path.to_string());

        if relative_path.is_empty() || relative_path.contains('\0') || relative_path.contains('\\') {
            return Err(invalid());
        }

        let mut path = self.storage.root.clone();
        let mut segments = 0;
        for component in Path::new(relative_path).components() {
            match component {
                Component::Normal(segment) => {
                    path.push(segment);
                    segments += 1;
                }
                Component::CurDir => {}
                _ => return Err(invalid()),
            }
        }

        if segments == 0 {
            return Err(invalid());
        }
        Ok(path)
    }
}

/// Canonicalize `path` and verify it is a regular file under `root`
fn contain(root: &Path, path: &Path, requested: &str) -> Result<PathBuf, UploadError> {
    let not_found = || UploadError::FileNotFound(requested.to_string());

    let root = match root.canonicalize() {
        Ok(root) => root,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(not_found()),
        Err(e) => return Err(e.into()),
    };

    let canonical = match path.canonicalize() {
        Ok(canonical) => canonical,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(not_found()),
        Err(e) => return Err(e.into()),
    };

    if !canonical.starts_with(&root) {
        tracing::warn!(path = %requested, "Rejected path escaping the storage root");
        return Err(UploadError::InvalidPath(requested.to_string()));
    }

    if !canonical.is_file() {
        return Err(not_found());
    }

    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::metadata::write_sidecar;
    use crate::upload::FileMetadata;
    use chrono::Utc;
    use tempfile::TempDir;

    fn server(dir: &TempDir) -> FileServer {
        FileServer::new(Arc::new(StorageConfig::new(
            dir.path(),
            "http://localhost:8080/uploads",
        )))
    }

    #[tokio::test]
    async fn test_serves_file_with_sidecar_mime() {
        let temp_dir = TempDir::new().unwrap();
        let day = temp_dir.path().join("files/2024-01-01");
        std::fs::create_dir_all(&day).unwrap();
        let path = day.join("photo_1.png");
        std::fs::write(&path, b"pixels").unwrap();
        let meta = FileMetadata {
            file_id: "f".to_string(),
            file_name: "photo.png".to_string(),
            file_hash: "H".to_string(),
            mime_type: "image/png".to_string(),
            size: 6,
            uploaded_at: Utc::now(),
            sha256: None,
        };
        write_sidecar(&path, &meta).await.unwrap();

        let served = server(&temp_dir)
            .get_file("files/2024-01-01/photo_1.png")
            .await
            .unwrap();
        assert_eq!(served.mime_type, "image/png");
        assert_eq!(&served.data[..], b"pixels");
        assert_eq!(served.file_name(), "photo_1.png");
        assert_eq!(served.size(), 6);
    }

    #[tokio::test]
    async fn test_missing_sidecar_falls_back_to_octet_stream() {
        let temp_dir = TempDir::new().unwrap();
        let day = temp_dir.path().join("files/2024-01-01");
        std::fs::create_dir_all(&day).unwrap();
        std::fs::write(day.join("data_1.png"), b"x").unwrap();

        let served = server(&temp_dir)
            .get_file("files/2024-01-01/data_1.png")
            .await
            .unwrap();
        assert_eq!(served.mime_type, DEFAULT_MIME_TYPE);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let result = server(&temp_dir).get_file("files/nope.txt").await;
        assert!(matches!(result, Err(UploadError::FileNotFound(_))));

        // Directories are not files
        std::fs::create_dir_all(temp_dir.path().join("files")).unwrap();
        let result = server(&temp_dir).get_file("files").await;
        assert!(matches!(result, Err(UploadError::FileNotFound(_))));
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let temp_dir = TempDir::new().unwrap();
        let server = server(&temp_dir);

        for path in ["../secret", "files/../../secret", "/etc/passwd", "a\\..\\b", ""] {
            let result = server.get_file(path).await;
            assert!(
                matches!(result, Err(UploadError::InvalidPath(_))),
                "{path:?} should be rejected"
            );
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rejects_symlink_out_of_root() {
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"secret").unwrap();

        let temp_dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), temp_dir.path().join("files")).unwrap();

        let result = server(&temp_dir).get_file("files/secret.txt").await;
        assert!(matches!(result, Err(UploadError::InvalidPath(_))));
    }
}
