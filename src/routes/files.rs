//! File serving routes
//!
//! Serves merged files from the local storage tree.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::Response,
    routing::get,
    Router,
};

use crate::error::{AppError, Result};
use crate::state::AppState;

/// Create the files router
pub fn router() -> Router<AppState> {
    Router::new().route("/*path", get(serve_file))
}

/// Serve a stored file by its storage-root-relative path
pub(crate) async fn serve_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response> {
    let file = state.file_server().get_file(&path).await?;

    let disposition = format!(
        "inline; filename*=UTF-8''{}",
        urlencoding::encode(file.file_name())
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, file.mime_type.as_str())
        .header(header::CONTENT_LENGTH, file.size())
        .header(header::CONTENT_DISPOSITION, disposition)
        .header(header::CACHE_CONTROL, "public, max-age=86400")
        .body(Body::from(file.data))
        .map_err(|e| AppError::Internal(e.to_string()))
}
