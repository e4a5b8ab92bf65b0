//! Durable job record
//!
//! The orchestrator is the only writer of job status. Every status write is a
//! conditional update against the current state, so two workers racing on the
//! same job cannot both claim it, and a terminal job is never rewritten.

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::types::{GenerationAttempt, GenerationJob, GenerationRequest, GenerationSummary, JobStatus};
use crate::errors::Result;

/// How a job ended
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed {
        card_ids: Vec<Uuid>,
        retention_note: String,
        summary: GenerationSummary,
        partial: bool,
    },
    Failed {
        code: String,
        message: String,
        summary: Option<GenerationSummary>,
    },
    Cancelled {
        summary: Option<GenerationSummary>,
    },
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed { partial: false, .. } => JobStatus::Completed,
            JobOutcome::Completed { partial: true, .. } => JobStatus::CompletedPartial,
            JobOutcome::Failed { .. } => JobStatus::Failed,
            JobOutcome::Cancelled { .. } => JobStatus::Cancelled,
        }
    }

    /// Apply the outcome to an in-memory job view
    pub fn apply_to(self, job: &mut GenerationJob) {
        let now = Utc::now();
        job.status = self.status();
        job.updated_at = now;
        job.completed_at = Some(now);
        match self {
            JobOutcome::Completed {
                card_ids,
                retention_note,
                summary,
                ..
            } => {
                job.card_ids = card_ids;
                job.retention_note = Some(retention_note);
                job.summary = Some(summary);
            }
            JobOutcome::Failed {
                code,
                message,
                summary,
            } => {
                job.error_code = Some(code);
                job.error_message = Some(message);
                job.summary = summary;
            }
            JobOutcome::Cancelled { summary } => {
                job.summary = summary;
            }
        }
    }
}

impl GenerationJob {
    /// Fresh queued job for `owner_id`
    pub fn queued(owner_id: impl Into<String>, request: GenerationRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            owner_id: owner_id.into(),
            status: JobStatus::Queued,
            request,
            attempts: Vec::new(),
            card_ids: Vec::new(),
            retention_note: None,
            summary: None,
            error_code: None,
            error_message: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job in `queued`
    async fn create_job(&self, owner_id: &str, request: GenerationRequest) -> Result<GenerationJob>;

    /// Job with its attempts in index order
    async fn get_job(&self, id: Uuid) -> Result<Option<GenerationJob>>;

    /// `queued` to `in_progress`; false when the job was not queued
    async fn claim_job(&self, id: Uuid) -> Result<bool>;

    /// Append an attempt record; attempts are never rewritten
    async fn record_attempt(&self, job_id: Uuid, attempt: &GenerationAttempt) -> Result<()>;

    /// Write the terminal state; false when the job was already terminal
    async fn finish_job(&self, id: Uuid, outcome: JobOutcome) -> Result<bool>;

    /// Set the cancellation flag; returns the status observed, `None` if unknown
    async fn request_cancellation(&self, id: Uuid) -> Result<Option<JobStatus>>;

    async fn is_cancellation_requested(&self, id: Uuid) -> Result<bool>;
}

#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use crate::errors::AppError;
    use crate::generation::persister::{CardStore, ExistingCard, NewStudyCard};
    use crate::generation::types::CardType;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// In-memory job and card store for tests
    #[derive(Default)]
    pub struct MemoryStore {
        jobs: Mutex<HashMap<Uuid, GenerationJob>>,
        cards: Mutex<Vec<NewStudyCard>>,
        existing: Mutex<Vec<ExistingCard>>,
        fail_inserts: AtomicBool,
        cancel_after_attempts: Mutex<Option<usize>>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_inserts(&self, fail: bool) {
            self.fail_inserts.store(fail, Ordering::SeqCst);
        }

        /// Raise the cancellation flag once `n` attempts are recorded
        pub fn cancel_after_attempts(&self, n: usize) {
            *self.cancel_after_attempts.lock().unwrap() = Some(n);
        }

        pub fn cards(&self) -> Vec<NewStudyCard> {
            self.cards.lock().unwrap().clone()
        }

        pub fn add_existing(&self, card_type: CardType, prompt: &str) -> Uuid {
            let id = Uuid::new_v4();
            self.existing.lock().unwrap().push(ExistingCard {
                id,
                card_type,
                prompt: prompt.to_string(),
            });
            id
        }

        pub fn job(&self, id: Uuid) -> GenerationJob {
            self.jobs.lock().unwrap()[&id].clone()
        }
    }

    #[async_trait]
    impl JobStore for MemoryStore {
        async fn create_job(&self, owner_id: &str, request: GenerationRequest) -> Result<GenerationJob> {
            let job = GenerationJob::queued(owner_id, request);
            self.jobs.lock().unwrap().insert(job.id, job.clone());
            Ok(job)
        }

        async fn get_job(&self, id: Uuid) -> Result<Option<GenerationJob>> {
            Ok(self.jobs.lock().unwrap().get(&id).cloned())
        }

        async fn claim_job(&self, id: Uuid) -> Result<bool> {
            let mut jobs = self.jobs.lock().unwrap();
            let job = jobs.get_mut(&id).ok_or(AppError::JobNotFound { id: id.to_string() })?;
            if job.status != JobStatus::Queued {
                return Ok(false);
            }
            job.status = JobStatus::InProgress;
            job.started_at = Some(Utc::now());
            job.updated_at = Utc::now();
            Ok(true)
        }

        async fn record_attempt(&self, job_id: Uuid, attempt: &GenerationAttempt) -> Result<()> {
            let mut jobs = self.jobs.lock().unwrap();
            let job = jobs
                .get_mut(&job_id)
                .ok_or(AppError::JobNotFound { id: job_id.to_string() })?;
            job.attempts.push(attempt.clone());
            if *self.cancel_after_attempts.lock().unwrap() == Some(job.attempts.len()) {
                job.cancel_requested = true;
            }
            Ok(())
        }

        async fn finish_job(&self, id: Uuid, outcome: JobOutcome) -> Result<bool> {
            let mut jobs = self.jobs.lock().unwrap();
            let job = jobs.get_mut(&id).ok_or(AppError::JobNotFound { id: id.to_string() })?;
            if !job.status.can_transition_to(outcome.status()) {
                return Ok(false);
            }
            outcome.apply_to(job);
            Ok(true)
        }

        async fn request_cancellation(&self, id: Uuid) -> Result<Option<JobStatus>> {
            let mut jobs = self.jobs.lock().unwrap();
            Ok(jobs.get_mut(&id).map(|job| {
                if !job.status.is_terminal() {
                    job.cancel_requested = true;
                }
                job.status
            }))
        }

        async fn is_cancellation_requested(&self, id: Uuid) -> Result<bool> {
            Ok(self
                .jobs
                .lock()
                .unwrap()
                .get(&id)
                .map(|job| job.cancel_requested)
                .unwrap_or(false))
        }
    }

    #[async_trait]
    impl CardStore for MemoryStore {
        async fn lookup_cards(&self, ids: &[Uuid]) -> Result<Vec<ExistingCard>> {
            let existing = self.existing.lock().unwrap();
            Ok(ids
                .iter()
                .filter_map(|id| existing.iter().find(|c| c.id == *id).cloned())
                .collect())
        }

        async fn insert_cards(&self, cards: Vec<NewStudyCard>) -> Result<Vec<Uuid>> {
            if self.fail_inserts.load(Ordering::SeqCst) {
                return Err(AppError::Transaction {
                    message: "insert rejected".to_string(),
                });
            }
            let ids = cards.iter().map(|c| c.id).collect();
            self.cards.lock().unwrap().extend(cards);
            Ok(ids)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest::for_topics(["Sepsis"])
    }

    #[tokio::test]
    async fn test_only_one_claim_wins() {
        let store = MemoryStore::new();
        let job = store.create_job("user-1", request()).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);

        assert!(store.claim_job(job.id).await.unwrap());
        assert!(!store.claim_job(job.id).await.unwrap());
        assert_eq!(store.job(job.id).status, JobStatus::InProgress);
    }

    #[tokio::test]
    async fn test_terminal_state_is_final() {
        let store = MemoryStore::new();
        let job = store.create_job("user-1", request()).await.unwrap();
        store.claim_job(job.id).await.unwrap();

        let failed = JobOutcome::Failed {
            code: "GENERATION_EXHAUSTED".into(),
            message: "no cards".into(),
            summary: None,
        };
        assert!(store.finish_job(job.id, failed).await.unwrap());
        assert!(!store
            .finish_job(job.id, JobOutcome::Cancelled { summary: None })
            .await
            .unwrap());

        let stored = store.job(job.id);
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_code.as_deref(), Some("GENERATION_EXHAUSTED"));
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_cancellation_flag_ignored_for_terminal_jobs() {
        let store = MemoryStore::new();
        let job = store.create_job("user-1", request()).await.unwrap();

        assert_eq!(
            store.request_cancellation(job.id).await.unwrap(),
            Some(JobStatus::Queued)
        );
        assert!(store.is_cancellation_requested(job.id).await.unwrap());
        assert_eq!(store.request_cancellation(Uuid::new_v4()).await.unwrap(), None);
    }

    #[test]
    fn test_outcome_status() {
        let done = JobOutcome::Completed {
            card_ids: vec![],
            retention_note: String::new(),
            summary: GenerationSummary::default(),
            partial: true,
        };
        assert_eq!(done.status(), JobStatus::CompletedPartial);
    }
}
