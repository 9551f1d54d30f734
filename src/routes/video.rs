//! Video generation, synchronous and as background jobs.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{info, warn};

use super::error::ApiError;
use super::{generation_request, ApiJson, AppState};
use crate::jobs::{Job, JobState};
use crate::resolve::ResolutionPolicy;
use crate::types::{AttachmentMetadata, GenerationKind, GenerationRequest, MediaItem};

#[derive(Debug, Deserialize)]
pub struct VideoRequest {
    pub prompt: String,
    #[serde(default)]
    pub orientation: Option<String>,
    #[serde(default)]
    pub media_ids: Option<Vec<String>>,
    #[serde(default)]
    pub attachment_metadata: Option<AttachmentMetadata>,
    /// Seconds to wait before the first media query (0..=60).
    #[serde(default)]
    pub wait_before_poll: Option<u64>,
    /// Media queries to spend (1..=60).
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Base delay between media queries in seconds (1..=30).
    #[serde(default)]
    pub wait_seconds: Option<u64>,
}

impl VideoRequest {
    /// The client's video policy with this request's overrides applied.
    fn policy(&self, mut policy: ResolutionPolicy) -> Result<ResolutionPolicy, ApiError> {
        if let Some(secs) = self.wait_before_poll {
            if secs > 60 {
                return Err(ApiError::BadRequest(
                    "wait_before_poll must be between 0 and 60".into(),
                ));
            }
            policy.polling.initial_delay = Duration::from_secs(secs);
        }
        if let Some(attempts) = self.max_attempts {
            if !(1..=60).contains(&attempts) {
                return Err(ApiError::BadRequest("max_attempts must be between 1 and 60".into()));
            }
            policy.polling.max_attempts = attempts;
        }
        if let Some(secs) = self.wait_seconds {
            if !(1..=30).contains(&secs) {
                return Err(ApiError::BadRequest("wait_seconds must be between 1 and 30".into()));
            }
            policy.polling.backoff.base = Duration::from_secs(secs);
            let backoff = &mut policy.polling.backoff;
            backoff.ceiling = backoff.ceiling.max(backoff.base);
        }
        Ok(policy)
    }

    fn into_parts(
        self,
        base: ResolutionPolicy,
    ) -> Result<(GenerationRequest, ResolutionPolicy), ApiError> {
        let policy = self.policy(base)?;
        let request = generation_request(
            GenerationKind::Video,
            self.prompt,
            self.orientation.as_deref(),
            self.media_ids,
            self.attachment_metadata,
        )?;
        Ok((request, policy))
    }
}

#[derive(Debug, Serialize)]
pub struct VideoResponse {
    pub success: bool,
    pub prompt: String,
    pub video_urls: Vec<String>,
    pub media: Vec<MediaItem>,
    pub conversation_id: String,
}

#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: String,
    pub status: JobState,
}

pub async fn generate_video(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<VideoRequest>,
) -> Result<Json<VideoResponse>, ApiError> {
    let (request, policy) = body.into_parts(state.client.policy_for(GenerationKind::Video))?;
    info!(max_attempts = policy.polling.max_attempts, "video generation requested");

    let generation = state.client.generate_with_policy(&request, &policy);
    let result = match timeout(state.request_timeout, generation).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => return Err(ApiError::generation("Video", err)),
        Err(_) => {
            warn!(limit = ?state.request_timeout, "video generation timed out");
            return Err(ApiError::Timeout {
                what: "Video generation",
                limit: state.request_timeout,
                hint: "Use /video/async for longer operations.",
            });
        }
    };

    if !result.success {
        return Err(ApiError::GenerationFailed {
            message: result
                .error
                .unwrap_or_else(|| "No videos were generated".to_string()),
            detail: "Video generation failed".to_string(),
        });
    }

    Ok(Json(VideoResponse {
        success: true,
        video_urls: result.urls(),
        prompt: result.prompt,
        media: result.media,
        conversation_id: result.conversation_id,
    }))
}

pub async fn submit_video_job(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<VideoRequest>,
) -> Result<Json<JobAccepted>, ApiError> {
    let (request, policy) = body.into_parts(state.client.policy_for(GenerationKind::Video))?;
    let client = state.client.clone();
    let job = state
        .jobs
        .submit(async move { client.generate_with_policy(&request, &policy).await })
        .await;
    info!(job_id = %job.job_id, "video job submitted");

    Ok(Json(JobAccepted {
        job_id: job.job_id,
        status: job.status,
    }))
}

pub async fn video_job_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.jobs.get(&job_id).await?))
}
