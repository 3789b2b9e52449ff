//! Upload Routes
//!
//! Endpoints:
//! - POST /api/v1/files/upload - Accept a single file (multipart) for delivery
//!
//! Responses:
//! - 200 when the file is queued
//! - 400 when identical content is still in flight, no file was sent, or the
//!   body exceeds `MAX_UPLOAD_BYTES`
//! - 500 when the file could not be queued
//! - 503 when the relay has stopped and nothing would deliver the file

use axum::{
    extract::{multipart::MultipartError, Multipart, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::publisher::Accepted;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub status: &'static str,
    pub message: String,
    #[serde(flatten)]
    pub file: Accepted,
}

/// Create the upload router
pub fn router() -> Router<AppState> {
    Router::new().route("/upload", post(upload_file))
}

/// POST /api/v1/files/upload
///
/// Takes the first multipart field that carries a file name.
async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>> {
    if !state.readiness().accepting() {
        return Err(AppError::Unavailable(
            "Delivery pipeline is not running".to_string(),
        ));
    }

    let max_upload_bytes = state.config().server.max_upload_bytes;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, "Invalid multipart body", max_upload_bytes))?
    {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };

        if file_name.trim().is_empty() {
            return Err(AppError::BadRequest("File name is empty".to_string()));
        }

        let data = field
            .bytes()
            .await
            .map_err(|e| multipart_error(e, "Failed to read file", max_upload_bytes))?;

        tracing::debug!(file_name = %file_name, size = data.len(), "Upload received");

        let accepted = state.publisher().accept(data.to_vec(), &file_name).await?;

        return Ok(Json(UploadResponse {
            status: "accepted",
            message: "File accepted and queued for delivery".to_string(),
            file: accepted,
        }));
    }

    Err(AppError::BadRequest("No file provided".to_string()))
}

fn multipart_error(e: MultipartError, context: &str, max_upload_bytes: usize) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return AppError::BadRequest(format!(
            "Upload exceeds the limit of {} bytes",
            max_upload_bytes
        ));
    }
    AppError::BadRequest(format!("{}: {}", context, e))
}
