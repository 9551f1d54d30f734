//! Background generation jobs.
//!
//! A job moves `pending → running → succeeded | failed`. The terminal state is written
//! exactly once, by the task that ran the generation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::MetaAiError;
use crate::types::GenerationResult;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Job {
    pub job_id: String,
    pub status: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result: Option<GenerationResult>,
    pub error: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(String),
}

/// The job table.
#[derive(Default)]
pub struct JobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self) -> Job {
        let now = Utc::now();
        let job = Job {
            job_id: Uuid::new_v4().to_string(),
            status: JobState::Pending,
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
        };
        self.jobs.lock().await.insert(job.job_id.clone(), job.clone());
        job
    }

    pub async fn get(&self, job_id: &str) -> Result<Job, JobError> {
        self.jobs
            .lock()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    pub async fn set_running(&self, job_id: &str) -> Result<(), JobError> {
        self.update(job_id, |job| job.status = JobState::Running).await
    }

    pub async fn set_result(&self, job_id: &str, result: GenerationResult) -> Result<(), JobError> {
        self.update(job_id, |job| {
            job.status = JobState::Succeeded;
            job.result = Some(result);
            job.error = None;
        })
        .await
    }

    pub async fn set_error(&self, job_id: &str, error: String) -> Result<(), JobError> {
        self.update(job_id, |job| {
            job.status = JobState::Failed;
            job.error = Some(error);
        })
        .await
    }

    /// Applies `change` unless the job already reached a terminal state.
    async fn update<F>(&self, job_id: &str, change: F) -> Result<(), JobError>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        if job.status.is_terminal() {
            warn!(job_id, status = ?job.status, "ignoring update to finished job");
            return Ok(());
        }
        change(job);
        job.updated_at = Utc::now();
        Ok(())
    }
}

/// Runs generations in the background and records their outcome.
#[derive(Clone, Default)]
pub struct JobOrchestrator {
    store: Arc<JobStore>,
}

impl JobOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a job and spawns `generation` for it. Returns the job as `pending`.
    pub async fn submit<F>(&self, generation: F) -> Job
    where
        F: Future<Output = Result<GenerationResult, MetaAiError>> + Send + 'static,
    {
        let job = self.store.create().await;
        let store = Arc::clone(&self.store);
        let job_id = job.job_id.clone();

        tokio::spawn(async move {
            if let Err(err) = run_job(&store, &job_id, generation).await {
                warn!(job_id = %job_id, error = %err, "job vanished while running");
            }
        });
        job
    }

    pub async fn get(&self, job_id: &str) -> Result<Job, JobError> {
        self.store.get(job_id).await
    }
}

async fn run_job<F>(store: &JobStore, job_id: &str, generation: F) -> Result<(), JobError>
where
    F: Future<Output = Result<GenerationResult, MetaAiError>>,
{
    store.set_running(job_id).await?;
    info!(job_id, "job started");

    match generation.await {
        Ok(result) if result.success && !result.media.is_empty() => {
            info!(job_id, media = result.media.len(), "job succeeded");
            store.set_result(job_id, result).await
        }
        Ok(result) => {
            let error = if result.success {
                "Video generation completed but no video URLs were found. The video may still be processing or the extraction failed.".to_string()
            } else {
                result
                    .error
                    .unwrap_or_else(|| "Video generation failed".to_string())
            };
            warn!(job_id, %error, "job failed");
            store.set_error(job_id, error).await
        }
        Err(err) => {
            warn!(job_id, error = %err, "job failed");
            store.set_error(job_id, err.to_string()).await
        }
    }
}
