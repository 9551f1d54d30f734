//! Image upload.

use std::sync::Arc;

use axum::extract::{multipart::MultipartRejection, Multipart, State};
use axum::Json;
use serde::Serialize;
use tokio::time::timeout;
use tracing::{info, warn};

use super::error::ApiError;
use super::{AppState, UPLOAD_TIMEOUT};
use crate::error::MetaAiError;

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub media_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub upload_session_id: String,
}

struct FilePart {
    file_name: String,
    content_type: Option<String>,
    bytes: Vec<u8>,
}

/// Reads the `file` field; other fields are ignored.
async fn read_file_part(multipart: &mut Multipart) -> Result<FilePart, ApiError> {
    let bad_request =
        |err: axum::extract::multipart::MultipartError| ApiError::BadRequest(err.body_text());
    while let Some(field) = multipart.next_field().await.map_err(bad_request)? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload").to_string();
        // A generic content type says nothing; let the file name decide.
        let content_type = field
            .content_type()
            .filter(|mime| *mime != "application/octet-stream")
            .map(str::to_string);
        let bytes = field.bytes().await.map_err(bad_request)?;
        return Ok(FilePart {
            file_name,
            content_type,
            bytes: bytes.to_vec(),
        });
    }
    Err(ApiError::BadRequest("multipart field `file` is required".into()))
}

pub async fn upload_image(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut multipart = multipart?;
    let part = read_file_part(&mut multipart).await?;
    info!(file_name = %part.file_name, size = part.bytes.len(), "upload requested");

    let upload = state
        .client
        .upload_image(part.bytes, &part.file_name, part.content_type.as_deref());
    let media = match timeout(UPLOAD_TIMEOUT, upload).await {
        Ok(Ok(media)) => media,
        Ok(Err(err @ MetaAiError::InvalidRequest(_))) => {
            return Err(ApiError::BadRequest(err.to_string()))
        }
        Ok(Err(err)) => return Err(ApiError::Upload(err)),
        Err(_) => {
            warn!(file_name = %part.file_name, "upload timed out");
            return Err(ApiError::Timeout {
                what: "Upload",
                limit: UPLOAD_TIMEOUT,
                hint: "Please try again.",
            });
        }
    };

    Ok(Json(UploadResponse {
        success: true,
        media_id: media.media_id,
        file_name: media.file_name,
        file_size: media.file_size,
        mime_type: media.mime_type,
        upload_session_id: media.upload_session_id,
    }))
}
