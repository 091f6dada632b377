//! Storage types

use axum::body::Bytes;

/// A stored file read back for serving
#[derive(Debug, Clone)]
pub struct ServedFile {
    /// Path relative to the storage root, as requested
    pub relative_path: String,

    /// MIME type from the sidecar record, or `application/octet-stream`
    pub mime_type: String,

    pub data: Bytes,
}

impl ServedFile {
    /// Last path segment, used for `Content-Disposition`
    pub fn file_name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_path)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}
