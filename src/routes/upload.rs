//! Upload Routes
//!
//! HTTP endpoints for chunked and single-file uploads.
//!
//! Endpoints:
//! - POST /api/v1/upload/image - Upload a whole file in one request
//! - POST /api/v1/upload/chunk - Upload one chunk (multipart)
//! - POST /api/v1/upload/complete-file - Merge a session explicitly
//! - GET /api/v1/upload/chunk-info/:file_id - Chunks already stored, for resuming
//! - GET /api/v1/upload/check-file?fileHash= - Instant-upload check
//! - GET /api/v1/upload/file/*path - Serve a stored file

use std::collections::HashMap;
use std::str::FromStr;

use axum::{
    body::Bytes,
    extract::{Multipart, Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use super::files::serve_file;
use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::upload::{
    CheckFileResponse, ChunkInfoResponse, ChunkUpload, ChunkUploadResponse, CompleteFileRequest,
    CompleteFileResponse,
};

/// Default name for single-file uploads that arrive without one
const UNNAMED_FILE: &str = "unnamed-file";

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/image", post(upload_image))
        .route("/chunk", post(upload_chunk))
        .route("/complete-file", post(complete_file))
        .route("/chunk-info/:file_id", get(chunk_info))
        .route("/check-file", get(check_file))
        .route("/file/*path", get(serve_file))
}

// ============================================================================
// Multipart Form
// ============================================================================

/// The `file` part of a multipart upload
struct FilePart {
    file_name: Option<String>,
    content_type: Option<String>,
    data: Bytes,
}

/// Multipart body split into the `file` part and plain text fields
#[derive(Default)]
struct UploadForm {
    file: Option<FilePart>,
    fields: HashMap<String, String>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> Result<Self> {
        let mut form = UploadForm::default();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| AppError::BadRequest(format!("Malformed multipart body: {}", e)))?
        {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };

            if name == "file" {
                let file_name = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("Failed to read file part: {}", e)))?;
                form.file = Some(FilePart {
                    file_name,
                    content_type,
                    data,
                });
            } else {
                let value = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("Failed to read field {}: {}", name, e)))?;
                form.fields.insert(name, value.trim().to_string());
            }
        }

        Ok(form)
    }

    fn take_file(&mut self) -> Result<FilePart> {
        self.file
            .take()
            .ok_or_else(|| AppError::BadRequest("Missing file part".to_string()))
    }

    fn text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str).filter(|v| !v.is_empty())
    }

    fn required<T: FromStr>(&self, name: &str) -> Result<T> {
        let raw = self
            .text(name)
            .ok_or_else(|| AppError::BadRequest(format!("Missing field: {}", name)))?;
        raw.parse()
            .map_err(|_| AppError::BadRequest(format!("Invalid value for {}: {}", name, raw)))
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/upload/chunk
///
/// One chunk of a session. The response reports whether this arrival
/// completed the file.
async fn upload_chunk(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ChunkUploadResponse>> {
    let mut form = UploadForm::read(multipart).await?;
    let file = form.take_file()?;

    let upload = ChunkUpload {
        file_id: form.required("fileId")?,
        chunk_number: form.required("chunkNumber")?,
        total_chunks: form.required("totalChunks")?,
        data: file.data.to_vec(),
        file_name: form.required("fileName")?,
        total_size: form.required("totalSize")?,
        mime_type: form.required("mimeType")?,
        file_hash: form.text("fileHash").map(str::to_string),
    };

    let response = state.coordinator().upload_chunk(upload).await?;
    Ok(Json(response))
}

/// POST /api/v1/upload/image
///
/// A whole file in one request, stored as a single-chunk session.
async fn upload_image(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ChunkUploadResponse>> {
    let mut form = UploadForm::read(multipart).await?;
    let file = form.take_file()?;

    let file_name = file
        .file_name
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| UNNAMED_FILE.to_string());
    let mime_type = file
        .content_type
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| mime_guess::from_path(&file_name).first_or_octet_stream().to_string());

    tracing::info!(file_name = %file_name, size = file.data.len(), "Single file upload");

    let upload = ChunkUpload {
        file_id: Uuid::new_v4().to_string(),
        chunk_number: 0,
        total_chunks: 1,
        total_size: file.data.len() as u64,
        data: file.data.to_vec(),
        file_name,
        mime_type,
        file_hash: None,
    };

    let response = state.coordinator().upload_chunk(upload).await?;
    Ok(Json(response))
}

/// POST /api/v1/upload/complete-file
async fn complete_file(
    State(state): State<AppState>,
    Json(request): Json<CompleteFileRequest>,
) -> Result<Json<CompleteFileResponse>> {
    let file_url = state.coordinator().complete_file(&request).await?;
    Ok(Json(CompleteFileResponse {
        success: true,
        file_url,
    }))
}

/// GET /api/v1/upload/chunk-info/:file_id
async fn chunk_info(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> Json<ChunkInfoResponse> {
    Json(state.coordinator().uploaded_chunk_info(&file_id).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckFileQuery {
    #[serde(default)]
    file_hash: String,
}

/// GET /api/v1/upload/check-file?fileHash=
async fn check_file(
    State(state): State<AppState>,
    Query(query): Query<CheckFileQuery>,
) -> Json<CheckFileResponse> {
    Json(state.coordinator().check_file_exists(query.file_hash.trim()).await)
}
