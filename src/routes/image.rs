//! Synchronous image generation.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{info, warn};

use super::error::ApiError;
use super::{generation_request, ApiJson, AppState};
use crate::types::{AttachmentMetadata, GenerationKind, MediaItem, Orientation};

#[derive(Debug, Deserialize)]
pub struct ImageRequest {
    pub prompt: String,
    /// `VERTICAL`, `LANDSCAPE` or `SQUARE`; defaults to vertical.
    #[serde(default)]
    pub orientation: Option<String>,
    #[serde(default)]
    pub media_ids: Option<Vec<String>>,
    #[serde(default)]
    pub attachment_metadata: Option<AttachmentMetadata>,
}

#[derive(Debug, Serialize)]
pub struct ImageResponse {
    pub success: bool,
    pub prompt: String,
    pub orientation: Orientation,
    pub image_urls: Vec<String>,
    pub media: Vec<MediaItem>,
    pub conversation_id: String,
}

pub async fn generate_image(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<ImageRequest>,
) -> Result<Json<ImageResponse>, ApiError> {
    let request = generation_request(
        GenerationKind::Image,
        body.prompt,
        body.orientation.as_deref(),
        body.media_ids,
        body.attachment_metadata,
    )?;
    info!(orientation = %request.orientation, "image generation requested");

    let result = match timeout(state.request_timeout, state.client.generate(&request)).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => return Err(ApiError::generation("Image", err)),
        Err(_) => {
            warn!(limit = ?state.request_timeout, "image generation timed out");
            return Err(ApiError::Timeout {
                what: "Image generation",
                limit: state.request_timeout,
                hint: "The generation may still be processing.",
            });
        }
    };

    if !result.success {
        return Err(ApiError::GenerationFailed {
            message: result
                .error
                .unwrap_or_else(|| "No images were generated".to_string()),
            detail: "Image generation failed".to_string(),
        });
    }

    Ok(Json(ImageResponse {
        success: true,
        image_urls: result.urls(),
        prompt: result.prompt,
        orientation: request.orientation,
        media: result.media,
        conversation_id: result.conversation_id,
    }))
}
