//! HTTP routes of the generation bridge.

pub mod error;
pub mod health;
pub mod image;
pub mod upload;
pub mod video;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{DefaultBodyLimit, FromRequest},
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::client::MetaAiClient;
use crate::config::ServerConfig;
use crate::jobs::JobOrchestrator;
use crate::types::{AttachmentMetadata, GenerationKind, GenerationRequest, Orientation};

/// Largest accepted upload body.
const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

/// Upper bound for an upload request, independent of the generation timeout.
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// `Json` whose rejections are answered like every other [`error::ApiError`].
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(error::ApiError))]
pub struct ApiJson<T>(pub T);

/// Application state shared across all request handlers
pub struct AppState {
    pub client: MetaAiClient,
    pub jobs: JobOrchestrator,
    /// Upper bound for synchronous generation requests
    pub request_timeout: Duration,
    pub cors_allowed_origins: Vec<String>,
}

impl AppState {
    pub fn new(client: MetaAiClient, config: &ServerConfig) -> Self {
        Self {
            client,
            jobs: JobOrchestrator::new(),
            request_timeout: config.request_timeout,
            cors_allowed_origins: config.cors_allowed_origins.clone(),
        }
    }
}

/// Turns the optional request fields shared by the generation endpoints into a
/// validated [`GenerationRequest`].
pub(crate) fn generation_request(
    kind: GenerationKind,
    prompt: String,
    orientation: Option<&str>,
    media_ids: Option<Vec<String>>,
    attachment_metadata: Option<AttachmentMetadata>,
) -> Result<GenerationRequest, error::ApiError> {
    let orientation = match orientation {
        Some(raw) => raw
            .parse::<Orientation>()
            .map_err(|err| error::ApiError::generation("Request", err))?,
        None => Orientation::default(),
    };
    let mut request = GenerationRequest::new(kind, prompt).with_orientation(orientation);
    if let Some(media_ids) = media_ids {
        request = request.with_media_ids(media_ids);
    }
    if let Some(metadata) = attachment_metadata {
        request = request.with_attachment_metadata(metadata);
    }
    request
        .validate()
        .map_err(|err| error::ApiError::generation("Request", err))?;
    Ok(request)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    if parsed.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(parsed))
    }
}

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.cors_allowed_origins);

    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/image", post(image::generate_image))
        .route("/video", post(video::generate_video))
        .route("/video/async", post(video::submit_video_job))
        .route("/video/jobs/:job_id", get(video::video_job_status))
        .route(
            "/upload",
            post(upload::upload_image).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
