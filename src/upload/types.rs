//! Upload types for chunked and instant uploads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ============================================================================
// Constants
// ============================================================================

/// Suffix of the sidecar metadata record written next to a final file
pub const SIDECAR_SUFFIX: &str = ".meta.json";

/// MIME type used when nothing better is known
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

// ============================================================================
// Chunk Upload Types
// ============================================================================

/// One chunk-arrival event
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub file_id: String,
    pub chunk_number: u32,
    pub total_chunks: u32,
    pub data: Vec<u8>,
    pub file_name: String,
    pub total_size: u64,
    pub mime_type: String,
    pub file_hash: Option<String>,
}

/// Response after uploading a chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    pub success: bool,

    /// Chunk number that was uploaded
    pub chunk_number: u32,

    pub file_id: String,

    /// Whether the whole file is now stored
    pub completed: bool,

    /// Public URL of the stored file, once completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
}

// ============================================================================
// Completion Types
// ============================================================================

/// Explicit completion request for a session whose chunks were tracked
/// by the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteFileRequest {
    pub file_id: String,
    pub file_name: String,
    pub total_chunks: u32,
    pub total_size: u64,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteFileResponse {
    pub success: bool,
    pub file_url: String,
}

// ============================================================================
// Query Types
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkInfoResponse {
    /// Chunk numbers already stored, ascending
    pub uploaded_chunks: Vec<u32>,
}

/// Public description of a stored file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub file_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub size: u64,
    pub url: String,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckFileResponse {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_info: Option<FileInfo>,
}

// ============================================================================
// Stored File Types
// ============================================================================

/// Sidecar metadata persisted as `<final file>.meta.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_id: String,
    pub file_name: String,
    pub file_hash: String,
    pub mime_type: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,

    /// SHA-256 of the stored bytes; absent in records written by older servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// A final file located on disk together with its sidecar record
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFile {
    /// Absolute path of the final file
    pub path: PathBuf,

    /// Path relative to the storage root, `/`-separated
    pub relative_path: String,

    /// Public URL derived from `relative_path`
    pub url: String,

    pub metadata: FileMetadata,
}

impl StoredFile {
    pub fn file_info(&self) -> FileInfo {
        FileInfo {
            file_id: self.metadata.file_id.clone(),
            file_name: self.metadata.file_name.clone(),
            mime_type: self.metadata.mime_type.clone(),
            size: self.metadata.size,
            url: self.url.clone(),
            uploaded_at: self.metadata.uploaded_at,
        }
    }
}

/// Result of a merge request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Chunks were assembled into a new final file
    Stored {
        url: String,
        relative_path: String,
        size: u64,
        sha256: String,
    },

    /// Identical content was already stored; nothing was assembled
    Deduplicated { url: String },
}

impl MergeOutcome {
    pub fn url(&self) -> &str {
        match self {
            Self::Stored { url, .. } | Self::Deduplicated { url } => url,
        }
    }

    pub fn into_url(self) -> String {
        match self {
            Self::Stored { url, .. } | Self::Deduplicated { url } => url,
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Chunk count mismatch: uploaded {uploaded}, expected {expected}")]
    ChunkCountMismatch { uploaded: usize, expected: u32 },

    #[error("No chunks stored for file {0}")]
    MissingChunkDirectory(String),

    #[error("Chunk {0} is missing")]
    MissingChunk(u32),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Unreadable metadata at {path}: {source}")]
    MetadataParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid file id: {0:?}")]
    InvalidFileId(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Chunk number out of bounds: {index} (total: {total})")]
    ChunkIndexOutOfBounds { index: u32, total: u32 },

    #[error("Total chunk count must be at least 1")]
    InvalidChunkCount,

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::ChunkCountMismatch { .. } => StatusCode::BAD_REQUEST,
            Self::MissingChunkDirectory(_) => StatusCode::BAD_REQUEST,
            Self::MissingChunk(_) => StatusCode::CONFLICT,
            Self::FileNotFound(_) => StatusCode::NOT_FOUND,
            Self::MetadataParse { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidFileId(_) => StatusCode::BAD_REQUEST,
            Self::InvalidPath(_) => StatusCode::BAD_REQUEST,
            Self::ChunkIndexOutOfBounds { .. } => StatusCode::BAD_REQUEST,
            Self::InvalidChunkCount => StatusCode::BAD_REQUEST,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            Self::ChunkCountMismatch { .. } => "CHUNK_COUNT_MISMATCH",
            Self::MissingChunkDirectory(_) => "MISSING_CHUNK_DIRECTORY",
            Self::MissingChunk(_) => "MISSING_CHUNK",
            Self::FileNotFound(_) => "FILE_NOT_FOUND",
            Self::MetadataParse { .. } => "METADATA_PARSE_ERROR",
            Self::InvalidFileId(_) => "INVALID_FILE_ID",
            Self::InvalidPath(_) => "INVALID_PATH",
            Self::ChunkIndexOutOfBounds { .. } => "CHUNK_INDEX_OUT_OF_BOUNDS",
            Self::InvalidChunkCount => "INVALID_CHUNK_COUNT",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }
}
