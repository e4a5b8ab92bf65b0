//! Job status and cancellation handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::handlers::generation::JobLinks;
use crate::AppState;
use zistudy_common::{
    auth::AuthContext,
    errors::{AppError, Result},
    generation::{GenerationAttempt, GenerationJob, GenerationSummary, JobStatus},
};

/// Job status response
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub attempts: Vec<AttemptView>,
    pub card_ids: Vec<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<GenerationSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobErrorView>,
    pub cancel_requested: bool,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    pub links: JobLinks,
}

/// One attempt, without the prompt snapshot or the raw model output
#[derive(Debug, Serialize)]
pub struct AttemptView {
    pub attempt_index: u32,
    pub requested_count: u32,
    pub accepted_count: u32,
    pub rejected_count: u32,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct JobErrorView {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub cancel_requested: bool,
}

impl From<&GenerationAttempt> for AttemptView {
    fn from(attempt: &GenerationAttempt) -> Self {
        Self {
            attempt_index: attempt.attempt_index,
            requested_count: attempt.requested_count,
            accepted_count: attempt.accepted_count,
            rejected_count: attempt.rejected_count,
            outcome: attempt.outcome.as_str().to_string(),
            detail: attempt.detail.clone(),
            created_at: attempt.created_at.to_rfc3339(),
        }
    }
}

impl From<GenerationJob> for JobResponse {
    fn from(job: GenerationJob) -> Self {
        let error = job.error_code.map(|code| JobErrorView {
            code,
            message: job.error_message.unwrap_or_default(),
        });

        Self {
            job_id: job.id,
            status: job.status,
            attempts: job.attempts.iter().map(AttemptView::from).collect(),
            card_ids: job.card_ids,
            retention_note: job.retention_note,
            summary: job.summary,
            error,
            cancel_requested: job.cancel_requested,
            created_at: job.created_at.to_rfc3339(),
            started_at: job.started_at.map(|dt| dt.to_rfc3339()),
            completed_at: job.completed_at.map(|dt| dt.to_rfc3339()),
            links: JobLinks::for_job(job.id),
        }
    }
}

/// Load a job the caller owns; another owner's job does not exist for them
async fn owned_job(state: &AppState, auth: &AuthContext, job_id: Uuid) -> Result<GenerationJob> {
    state
        .orchestrator
        .store()
        .get_job(job_id)
        .await?
        .filter(|job| job.owner_id == auth.owner_id)
        .ok_or_else(|| AppError::JobNotFound {
            id: job_id.to_string(),
        })
}

/// Get job status
///
/// A job whose worker died is failed here once it outlives its time envelope.
pub async fn get_job(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobResponse>> {
    let job = owned_job(&state, &auth, job_id).await?;
    let job = state.orchestrator.refresh(job).await?;
    Ok(Json(JobResponse::from(job)))
}

/// Ask a running or queued job to stop
///
/// The orchestrator notices the flag between attempts; the job reaches
/// `cancelled` asynchronously.
pub async fn cancel_job(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(job_id): Path<Uuid>,
) -> Result<(StatusCode, Json<CancelResponse>)> {
    let job = owned_job(&state, &auth, job_id).await?;
    if job.status.is_terminal() {
        return Err(AppError::InvalidTransition {
            id: job_id.to_string(),
            from: job.status.to_string(),
            to: JobStatus::Cancelled.to_string(),
        });
    }

    let status = state
        .orchestrator
        .store()
        .request_cancellation(job_id)
        .await?
        .ok_or_else(|| AppError::JobNotFound {
            id: job_id.to_string(),
        })?;

    info!(job_id = %job_id, status = %status, "Cancellation requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            job_id,
            status,
            cancel_requested: !status.is_terminal(),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use zistudy_common::generation::{AttemptOutcome, GenerationRequest};

    #[test]
    fn test_failed_job_view() {
        let mut job = GenerationJob::queued("learner-1", GenerationRequest::for_topics(["Sepsis"]));
        job.status = JobStatus::Failed;
        job.error_code = Some("GENERATION_EXHAUSTED".to_string());
        job.error_message = Some("no usable cards after 3 attempts".to_string());
        job.attempts.push(GenerationAttempt {
            attempt_index: 1,
            requested_count: 3,
            accepted_count: 0,
            rejected_count: 3,
            outcome: AttemptOutcome::SchemaInvalid,
            prompt_snapshot: serde_json::json!({"system": "..."}),
            raw_response: Some("{}".to_string()),
            detail: Some("every candidate failed validation".to_string()),
            created_at: Utc::now(),
        });

        let view = serde_json::to_value(JobResponse::from(job)).unwrap();
        assert_eq!(view["status"], "failed");
        assert_eq!(view["error"]["code"], "GENERATION_EXHAUSTED");
        assert_eq!(view["attempts"][0]["rejected_count"], 3);
        assert!(view["attempts"][0].get("prompt_snapshot").is_none());
        assert!(view["attempts"][0].get("raw_response").is_none());
        assert!(view.get("retention_note").is_none());
    }

    #[test]
    fn test_queued_job_view() {
        let job = GenerationJob::queued("learner-1", GenerationRequest::for_topics(["Asthma"]));
        let id = job.id;
        let view = JobResponse::from(job);
        assert_eq!(view.status, JobStatus::Queued);
        assert!(view.error.is_none());
        assert!(view.card_ids.is_empty());
        assert_eq!(view.links.status, format!("/v1/jobs/{}", id));
    }
}
