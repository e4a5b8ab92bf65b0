//! Job orchestrator
//!
//! Owns one generation job end to end:
//! 1. Claims the job (`queued` to `in_progress`)
//! 2. Revalidates the request and prepares documents
//! 3. Runs sequential attempts until the target is met or attempts run out
//! 4. Persists the accepted batch and writes the terminal state
//!
//! Attempts are strictly sequential. Cancellation is checked before each attempt
//! and again when the model call returns.
//!
//! A job left `in_progress` past its time envelope (its worker died) is failed
//! with `JOB_TIMED_OUT` by the next run or status read.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::client::{GenerationClient, GenerativeClient};
use super::error::{GenerationError, ProviderError, ReconcileError};
use super::pdf::DocumentExtractor;
use super::persister::{CardPersister, CardStore, Provenance};
use super::prompt::{AttemptDirective, PromptAssembler, PromptPayload};
use super::reconciler::ResponseReconciler;
use super::schema::{validate_request, RequestLimits};
use super::store::{JobOutcome, JobStore};
use super::types::{
    AttemptOutcome, CardSummary, GenerationAttempt, GenerationJob, GenerationRequest,
    GenerationSummary, JobStatus,
};
use crate::config::{AppConfig, GenerationConfig};
use crate::metrics;

/// Attempt accounting for one job
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Provider outages tolerated without consuming an attempt
    pub provider_retry_budget: u32,
    pub provider_failures_consume_attempt: bool,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            provider_retry_budget: config.provider_retry_budget,
            provider_failures_consume_attempt: config.provider_failures_consume_attempt,
            backoff_initial: Duration::from_millis(config.backoff_initial_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms.max(config.backoff_initial_ms)),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.backoff_initial)
            .with_max_interval(self.backoff_max)
            .with_max_elapsed_time(None)
            .build()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&GenerationConfig::default())
    }
}

/// What a run of the orchestrator left behind
#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub attempts: u32,
    pub card_ids: Vec<Uuid>,
    pub error_code: Option<String>,
}

impl JobReport {
    fn from_job(job: &GenerationJob) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            attempts: job.attempts.len() as u32,
            card_ids: job.card_ids.clone(),
            error_code: job.error_code.clone(),
        }
    }
}

pub struct JobOrchestrator {
    store: Arc<dyn JobStore>,
    cards: Arc<dyn CardStore>,
    client: GenerationClient,
    extractor: DocumentExtractor,
    assembler: PromptAssembler,
    persister: CardPersister,
    limits: RequestLimits,
    policy: RetryPolicy,
    stale_after: Duration,
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        cards: Arc<dyn CardStore>,
        client: GenerationClient,
        extractor: DocumentExtractor,
        limits: RequestLimits,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            persister: CardPersister::new(cards.clone()),
            cards,
            client,
            extractor,
            assembler: PromptAssembler::new(),
            limits,
            policy,
            stale_after: GenerationConfig::default().job_time_envelope(),
        }
    }

    /// How long an `in_progress` job may run before it is considered abandoned
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Wire an orchestrator from application configuration
    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn JobStore>,
        cards: Arc<dyn CardStore>,
        provider: Arc<dyn GenerativeClient>,
    ) -> Self {
        Self::new(
            store,
            cards,
            GenerationClient::new(provider, config.generation.attempt_timeout()),
            DocumentExtractor::new(&config.documents),
            RequestLimits::from_config(&config.generation, &config.documents),
            RetryPolicy::from_config(&config.generation),
        )
        .with_stale_after(config.generation.job_time_envelope() + config.documents.parse_timeout())
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Validate a request and record it as a queued job
    ///
    /// Invalid requests are rejected here, before any model call is made.
    #[instrument(skip(self, request), fields(owner = %owner_id))]
    pub async fn submit(
        &self,
        owner_id: &str,
        request: GenerationRequest,
    ) -> Result<GenerationJob, GenerationError> {
        let valid = validate_request(request, &self.limits)?;
        let job = self.store.create_job(owner_id, valid.request).await?;

        metrics::record_job_submitted();
        info!(
            job_id = %job.id,
            target = valid.target_card_count,
            documents = job.request.documents.len(),
            "Generation job queued"
        );
        Ok(job)
    }

    /// Run a job to a terminal state
    ///
    /// Safe to call for a job that is already terminal or owned by another
    /// worker: the current state is reported and nothing is written.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn run(&self, job_id: Uuid) -> Result<JobReport, GenerationError> {
        let job = self.load(job_id).await?;
        if job.status.is_terminal() {
            info!(status = %job.status, "Job already finished");
            return Ok(JobReport::from_job(&job));
        }

        if !self.store.claim_job(job_id).await? {
            let current = self.expire_if_overdue(self.load(job_id).await?).await?;
            info!(status = %current.status, "Job claimed elsewhere");
            return Ok(JobReport::from_job(&current));
        }

        let started = Instant::now();
        let mut summary = GenerationSummary::default();
        let outcome = match self.execute(&job, &mut summary).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(code = e.code(), error = %e, "Generation job failed");
                JobOutcome::Failed {
                    code: e.code().to_string(),
                    message: e.to_string(),
                    summary: Some(summary),
                }
            }
        };

        let status = outcome.status();
        if !self.store.finish_job(job_id, outcome).await? {
            warn!(status = %status, "Job reached a terminal state concurrently; outcome discarded");
        }
        metrics::record_job_finished(status.as_str(), started.elapsed());

        let finished = self.load(job_id).await?;
        info!(
            status = %finished.status,
            attempts = finished.attempts.len(),
            cards = finished.card_ids.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Generation job finished"
        );
        Ok(JobReport::from_job(&finished))
    }

    /// Fail a queued job that never reached a worker
    #[instrument(skip(self, reason), fields(job_id = %job_id))]
    pub async fn fail_undispatched(&self, job_id: Uuid, reason: &str) -> Result<(), GenerationError> {
        let error = GenerationError::DispatchFailed {
            message: reason.to_string(),
        };
        let outcome = JobOutcome::Failed {
            code: error.code().to_string(),
            message: error.to_string(),
            summary: None,
        };
        if self.store.finish_job(job_id, outcome).await? {
            warn!(error = %reason, "Job could not be dispatched; marked failed");
            metrics::record_job_finished(JobStatus::Failed.as_str(), Duration::ZERO);
        }
        Ok(())
    }

    /// Current view of a job, failing it first if its worker has gone away
    pub async fn refresh(&self, job: GenerationJob) -> Result<GenerationJob, GenerationError> {
        self.expire_if_overdue(job).await
    }

    async fn expire_if_overdue(&self, job: GenerationJob) -> Result<GenerationJob, GenerationError> {
        let Some(elapsed) = self.overdue(&job) else {
            return Ok(job);
        };

        let error = GenerationError::TimedOut {
            elapsed_secs: elapsed.as_secs(),
        };
        let outcome = JobOutcome::Failed {
            code: error.code().to_string(),
            message: error.to_string(),
            summary: job.summary.clone(),
        };
        if self.store.finish_job(job.id, outcome).await? {
            warn!(
                job_id = %job.id,
                elapsed_secs = elapsed.as_secs(),
                "Job outlived its time envelope; marked failed"
            );
            metrics::record_job_finished(JobStatus::Failed.as_str(), elapsed);
        }
        self.load(job.id).await
    }

    fn overdue(&self, job: &GenerationJob) -> Option<Duration> {
        if job.status != JobStatus::InProgress {
            return None;
        }
        let elapsed = (Utc::now() - job.started_at?).to_std().ok()?;
        (elapsed > self.stale_after).then_some(elapsed)
    }

    async fn load(&self, job_id: Uuid) -> Result<GenerationJob, GenerationError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| GenerationError::Store {
                message: format!("job {} not found", job_id),
            })
    }

    async fn execute(
        &self,
        job: &GenerationJob,
        summary: &mut GenerationSummary,
    ) -> Result<JobOutcome, GenerationError> {
        if self.store.is_cancellation_requested(job.id).await? {
            info!("Cancelled before start");
            return Ok(JobOutcome::Cancelled { summary: None });
        }

        let valid = validate_request(job.request.clone(), &self.limits)?;
        summary.requested_count = valid.target_card_count;
        summary.model_used = valid.model.clone();
        summary.temperature_applied = valid.temperature;

        let documents = self
            .extractor
            .prepare(&valid.request.documents, valid.pdf_mode, self.client.provider())
            .await;
        summary.sources = documents.sources.clone();
        summary.source_document_ids = documents.source_ids.clone();
        summary.truncations = documents.truncations.clone();
        summary.skipped_documents = documents.skipped.clone();
        summary.skipped_images = documents.skipped_images.clone();

        let existing = self.cards.lookup_cards(&valid.request.existing_card_ids).await?;
        let prior: Vec<CardSummary> = existing
            .iter()
            .map(|card| CardSummary::new(Some(card.id), card.card_type, &card.prompt))
            .collect();

        let mut reconciler = ResponseReconciler::new(
            valid.target_card_count,
            valid.allowed_types(),
            valid.request.include_retention_aid,
            existing.into_iter().map(|card| card.prompt),
        );

        let mut feedback: Option<String> = None;
        let mut backoff = self.policy.backoff();
        let mut provider_budget = self.policy.provider_retry_budget;
        let mut provider_failure: Option<String> = None;
        let mut consumed = 0u32;
        let mut attempt_index = 0u32;

        while consumed < self.policy.max_attempts && !reconciler.is_satisfied() {
            if self.store.is_cancellation_requested(job.id).await? {
                info!(attempt = attempt_index, "Cancellation requested");
                return Ok(JobOutcome::Cancelled {
                    summary: Some(summary.clone()),
                });
            }

            let requested = reconciler.shortfall();
            let payload = self.assembler.build(
                &valid,
                &documents,
                &prior,
                &reconciler.summaries(),
                AttemptDirective {
                    requested,
                    feedback: feedback.as_deref(),
                },
            );

            attempt_index += 1;
            let result = self.client.invoke(&payload, attempt_index).await;

            if self.store.is_cancellation_requested(job.id).await? {
                info!(attempt = attempt_index, "Cancellation requested during model call; response discarded");
                return Ok(JobOutcome::Cancelled {
                    summary: Some(summary.clone()),
                });
            }

            match result {
                Ok(raw) => {
                    consumed += 1;
                    provider_failure = None;
                    match reconciler.reconcile(&raw.text) {
                        Ok(report) => {
                            let shortfall = reconciler.shortfall();
                            let detail = (!report.reasons.is_empty()).then(|| report.reasons.join("; "));
                            self.record(job.id, attempt_index, &payload, report.outcome, report.accepted, report.rejected, Some(raw.text), detail)
                                .await?;
                            metrics::record_candidates_rejected(report.rejected);
                            info!(
                                attempt = attempt_index,
                                requested,
                                accepted = report.accepted,
                                rejected = report.rejected,
                                shortfall,
                                "Attempt reconciled"
                            );
                            feedback = Some(report.feedback(shortfall));
                        }
                        Err(ReconcileError::MalformedOutput { message }) => {
                            warn!(attempt = attempt_index, error = %message, "Model output could not be parsed");
                            self.record(
                                job.id,
                                attempt_index,
                                &payload,
                                AttemptOutcome::SchemaInvalid,
                                0,
                                0,
                                Some(raw.text),
                                Some(message.clone()),
                            )
                            .await?;
                            feedback = Some(malformed_feedback(&message, requested));
                        }
                        Err(other) => return Err(other.into()),
                    }
                }
                Err(ProviderError::Unusable { message }) => {
                    consumed += 1;
                    provider_failure = None;
                    reconciler.record_empty_attempt();
                    warn!(attempt = attempt_index, error = %message, "Model returned unusable output");
                    self.record(
                        job.id,
                        attempt_index,
                        &payload,
                        AttemptOutcome::SchemaInvalid,
                        0,
                        0,
                        None,
                        Some(message.clone()),
                    )
                    .await?;
                    feedback = Some(malformed_feedback(&message, requested));
                }
                Err(ProviderError::Rejected { status, message }) => {
                    let error = ProviderError::Rejected { status, message };
                    self.record(
                        job.id,
                        attempt_index,
                        &payload,
                        AttemptOutcome::ProviderError,
                        0,
                        0,
                        None,
                        Some(error.to_string()),
                    )
                    .await?;
                    return Err(error.into());
                }
                Err(ProviderError::Unavailable { message }) => {
                    self.record(
                        job.id,
                        attempt_index,
                        &payload,
                        AttemptOutcome::ProviderError,
                        0,
                        0,
                        None,
                        Some(message.clone()),
                    )
                    .await?;

                    if self.policy.provider_failures_consume_attempt {
                        consumed += 1;
                        reconciler.record_empty_attempt();
                    } else if provider_budget > 0 {
                        provider_budget -= 1;
                    } else {
                        warn!(attempt = attempt_index, "Provider retry budget exhausted");
                        if reconciler.accepted().is_empty() {
                            return Err(GenerationError::ProviderUnavailable { message });
                        }
                        break;
                    }
                    provider_failure = Some(message);

                    if consumed < self.policy.max_attempts {
                        let delay = backoff.next_backoff().unwrap_or(self.policy.backoff_max);
                        warn!(
                            attempt = attempt_index,
                            delay_ms = delay.as_millis() as u64,
                            budget_left = provider_budget,
                            "Provider unavailable, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let batch = match reconciler.finish() {
            Ok(batch) => batch,
            Err(e) => {
                return Err(match provider_failure {
                    Some(message) => GenerationError::ProviderUnavailable { message },
                    None => e.into(),
                })
            }
        };

        let provenance = Provenance::new(job.id, attempt_index, &valid, &documents);
        let persisted = self.persister.persist(job.id, &batch, &provenance).await?;
        summary.card_count = persisted.card_ids.len();

        if batch.is_partial() {
            warn!(
                accepted = batch.cards.len(),
                requested = batch.requested,
                "Finishing with a partial batch"
            );
        }

        Ok(JobOutcome::Completed {
            card_ids: persisted.card_ids,
            retention_note: persisted.retention_note,
            summary: summary.clone(),
            partial: batch.is_partial(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        job_id: Uuid,
        attempt_index: u32,
        payload: &PromptPayload,
        outcome: AttemptOutcome,
        accepted: u32,
        rejected: u32,
        raw_response: Option<String>,
        detail: Option<String>,
    ) -> Result<(), GenerationError> {
        let attempt = GenerationAttempt {
            attempt_index,
            requested_count: payload.requested_count,
            accepted_count: accepted,
            rejected_count: rejected,
            outcome,
            prompt_snapshot: payload.snapshot(),
            raw_response,
            detail,
            created_at: Utc::now(),
        };
        self.store.record_attempt(job_id, &attempt).await?;
        metrics::record_attempt(outcome.as_str());
        Ok(())
    }
}

fn malformed_feedback(message: &str, requested: u32) -> String {
    format!(
        "The previous response could not be used ({}). Return only JSON matching the schema with {} card(s).",
        message, requested
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DocumentConfig;
    use crate::generation::client::{MockGenerativeClient, RawResponse};
    use crate::generation::fixtures::{self, distinct_cards, response, response_with_aid};
    use crate::generation::store::memory::MemoryStore;
    use crate::generation::types::{CardType, UploadedDocument};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Step = std::result::Result<String, ProviderError>;

    /// Plays back canned responses and records what each call asked for
    #[derive(Default)]
    struct ScriptedClient {
        script: Mutex<VecDeque<Step>>,
        requested: Mutex<Vec<u32>>,
        prompts: Mutex<Vec<String>>,
        cancel: Mutex<Option<(Arc<MemoryStore>, Uuid)>>,
    }

    impl ScriptedClient {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(steps.into()),
                ..Self::default()
            })
        }

        fn requested(&self) -> Vec<u32> {
            self.requested.lock().unwrap().clone()
        }

        fn cancel_during_call(&self, store: Arc<MemoryStore>, job_id: Uuid) {
            *self.cancel.lock().unwrap() = Some((store, job_id));
        }
    }

    #[async_trait]
    impl GenerativeClient for ScriptedClient {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, payload: &PromptPayload) -> std::result::Result<RawResponse, ProviderError> {
            self.requested.lock().unwrap().push(payload.requested_count);
            self.prompts.lock().unwrap().push(payload.text());

            let pending_cancel = self.cancel.lock().unwrap().clone();
            if let Some((store, job_id)) = pending_cancel {
                store.request_cancellation(job_id).await.unwrap();
            }

            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(response(vec![])));
            step.map(|text| RawResponse {
                text,
                model: payload.model.clone(),
                finish_reason: Some("STOP".into()),
            })
        }

        async fn upload_file(&self, _: &[u8], _: &str, _: &str) -> std::result::Result<String, ProviderError> {
            Ok("scripted://file".into())
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            provider_retry_budget: 2,
            provider_failures_consume_attempt: false,
            backoff_initial: Duration::from_millis(1),
            backoff_max: Duration::from_millis(2),
        }
    }

    fn orchestrator(
        store: &Arc<MemoryStore>,
        client: Arc<dyn GenerativeClient>,
        policy: RetryPolicy,
    ) -> JobOrchestrator {
        JobOrchestrator::new(
            store.clone(),
            store.clone(),
            GenerationClient::new(client, Duration::from_secs(5)),
            DocumentExtractor::new(&DocumentConfig::default()),
            RequestLimits::default(),
            policy,
        )
    }

    fn sepsis(count: i64) -> GenerationRequest {
        let mut request = GenerationRequest::for_topics(["Sepsis"]);
        request.target_card_count = Some(count);
        request
    }

    fn invalid_mcq() -> serde_json::Value {
        let mut bad = fixtures::mcq_single("Which lactate level defines septic shock?");
        bad["payload"]["correct_answers"] = json!(["Z"]);
        bad
    }

    #[tokio::test]
    async fn test_compliant_provider_completes_with_exact_count() {
        let store = Arc::new(MemoryStore::new());
        let mock = Arc::new(MockGenerativeClient::new());
        let orch = orchestrator(&store, mock.clone(), policy(3));

        let job = orch.submit("user-1", sepsis(6)).await.unwrap();
        let report = orch.run(job.id).await.unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.card_ids.len(), 6);
        assert_eq!(report.attempts, 1);
        assert_eq!(mock.calls(), 1);

        let cards = store.cards();
        let mut prompts: Vec<String> = cards.iter().map(|c| c.data["prompt"].to_string()).collect();
        prompts.sort();
        prompts.dedup();
        assert_eq!(prompts.len(), 6);

        let stored = store.job(job.id);
        assert_eq!(stored.retention_note.as_deref(), Some("# Mock retention aid\n- Review the specific findings."));
        assert_eq!(stored.summary.unwrap().card_count, 6);
    }

    #[tokio::test]
    async fn test_sepsis_shortfall_is_requested_and_filled() {
        let store = Arc::new(MemoryStore::new());
        let client = ScriptedClient::new(vec![
            Ok(response(vec![
                fixtures::mcq_single("What defines sepsis?"),
                fixtures::written("Name the qSOFA criteria", "RR, mentation, SBP"),
                invalid_mcq(),
            ])),
            Ok(response(vec![fixtures::mcq_single("First-line vasopressor in septic shock?")])),
        ]);
        let orch = orchestrator(&store, client.clone(), policy(3));

        let job = orch.submit("user-1", sepsis(3)).await.unwrap();
        let report = orch.run(job.id).await.unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.card_ids.len(), 3);
        assert_eq!(report.attempts, 2);
        assert_eq!(client.requested(), vec![3, 1]);

        let stored = store.job(job.id);
        assert_eq!(stored.attempts[0].outcome, AttemptOutcome::SchemaInvalid);
        assert_eq!(stored.attempts[0].accepted_count, 2);
        assert_eq!(stored.attempts[0].rejected_count, 1);
        assert_eq!(stored.attempts[1].outcome, AttemptOutcome::Accepted);

        let second_prompt = client.prompts.lock().unwrap()[1].clone();
        assert!(second_prompt.contains("Cards already generated in this run"));
        assert!(second_prompt.contains("What defines sepsis?"));
        assert!(second_prompt.contains("Previous feedback: Received 2 new card(s); 1 additional"));

        assert!(store.cards().iter().all(|c| c.generation_attempts == 2));
    }

    #[tokio::test]
    async fn test_sepsis_partial_after_attempts_run_out() {
        let store = Arc::new(MemoryStore::new());
        let client = ScriptedClient::new(vec![
            Ok(response(vec![
                fixtures::mcq_single("What defines sepsis?"),
                fixtures::written("Name the qSOFA criteria", "RR, mentation, SBP"),
                invalid_mcq(),
            ])),
            Ok(response(vec![invalid_mcq()])),
        ]);
        let orch = orchestrator(&store, client.clone(), policy(2));

        let job = orch.submit("user-1", sepsis(3)).await.unwrap();
        let report = orch.run(job.id).await.unwrap();

        assert_eq!(report.status, JobStatus::CompletedPartial);
        assert_eq!(report.card_ids.len(), 2);
        assert_eq!(store.cards().len(), 2);
        assert_eq!(client.requested(), vec![3, 1]);
    }

    #[tokio::test]
    async fn test_exhaustion_without_cards_fails() {
        let store = Arc::new(MemoryStore::new());
        let client = ScriptedClient::new(vec![
            Ok("not json at all".into()),
            Ok(response(vec![invalid_mcq()])),
            Ok(response(vec![])),
        ]);
        let orch = orchestrator(&store, client.clone(), policy(3));

        let job = orch.submit("user-1", sepsis(2)).await.unwrap();
        let report = orch.run(job.id).await.unwrap();

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.error_code.as_deref(), Some("GENERATION_EXHAUSTED"));
        assert_eq!(report.attempts, 3);
        assert!(store.cards().is_empty());
        assert!(store.job(job.id).attempts[0].detail.as_deref().unwrap().contains("not valid JSON"));
    }

    #[tokio::test]
    async fn test_single_card_target_uses_one_attempt() {
        let store = Arc::new(MemoryStore::new());
        let client = ScriptedClient::new(vec![Ok(response(distinct_cards(1, 3)))]);
        let orch = orchestrator(&store, client.clone(), policy(3));

        let job = orch.submit("user-1", sepsis(1)).await.unwrap();
        let report = orch.run(job.id).await.unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.card_ids.len(), 1);
        assert_eq!(client.requested(), vec![1]);
    }

    #[tokio::test]
    async fn test_polling_a_finished_job_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let client = ScriptedClient::new(vec![Ok(response_with_aid(distinct_cards(1, 2), "# Aid"))]);
        let orch = orchestrator(&store, client.clone(), policy(3));

        let job = orch.submit("user-1", sepsis(2)).await.unwrap();
        let first = orch.run(job.id).await.unwrap();
        let second = orch.run(job.id).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(client.requested().len(), 1);
        assert_eq!(store.job(job.id).retention_note.as_deref(), Some("# Aid"));
    }

    #[tokio::test]
    async fn test_cancellation_between_attempts() {
        let store = Arc::new(MemoryStore::new());
        store.cancel_after_attempts(1);
        let client = ScriptedClient::new(vec![Ok(response(distinct_cards(1, 1)))]);
        let orch = orchestrator(&store, client.clone(), policy(3));

        let job = orch.submit("user-1", sepsis(3)).await.unwrap();
        let report = orch.run(job.id).await.unwrap();

        assert_eq!(report.status, JobStatus::Cancelled);
        assert_eq!(client.requested(), vec![3]);
        assert!(store.cards().is_empty());
    }

    #[tokio::test]
    async fn test_job_cancelled_while_queued_never_calls_the_model() {
        let store = Arc::new(MemoryStore::new());
        let client = ScriptedClient::new(vec![Ok(response(distinct_cards(1, 2)))]);
        let orch = orchestrator(&store, client.clone(), policy(3));

        let job = orch.submit("user-1", sepsis(2)).await.unwrap();
        store.request_cancellation(job.id).await.unwrap();
        let report = orch.run(job.id).await.unwrap();

        assert_eq!(report.status, JobStatus::Cancelled);
        assert!(client.requested().is_empty());
        assert!(store.job(job.id).attempts.is_empty());
    }

    #[tokio::test]
    async fn test_job_abandoned_by_crashed_worker_times_out() {
        let store = Arc::new(MemoryStore::new());
        let client = ScriptedClient::new(vec![Ok(response(distinct_cards(1, 2)))]);
        let orch = orchestrator(&store, client.clone(), policy(3))
            .with_stale_after(Duration::from_millis(50));

        let job = orch.submit("user-1", sepsis(2)).await.unwrap();
        // Claimed by a worker that never finishes
        assert!(store.claim_job(job.id).await.unwrap());

        let report = orch.run(job.id).await.unwrap();
        assert_eq!(report.status, JobStatus::InProgress);

        tokio::time::sleep(Duration::from_millis(120)).await;
        for _ in 0..2 {
            let report = orch.run(job.id).await.unwrap();
            assert_eq!(report.status, JobStatus::Failed);
            assert_eq!(report.error_code.as_deref(), Some("JOB_TIMED_OUT"));
        }
        assert!(client.requested().is_empty());
        assert!(store.job(job.id).completed_at.is_some());
    }

    #[tokio::test]
    async fn test_refresh_leaves_running_jobs_alone() {
        let store = Arc::new(MemoryStore::new());
        let orch = orchestrator(&store, Arc::new(MockGenerativeClient::new()), policy(3));

        let job = orch.submit("user-1", sepsis(2)).await.unwrap();
        store.claim_job(job.id).await.unwrap();

        let current = orch.refresh(store.job(job.id)).await.unwrap();
        assert_eq!(current.status, JobStatus::InProgress);
        assert!(current.error_code.is_none());
    }

    #[tokio::test]
    async fn test_undispatched_job_fails_without_running() {
        let store = Arc::new(MemoryStore::new());
        let client = ScriptedClient::new(vec![Ok(response(distinct_cards(1, 2)))]);
        let orch = orchestrator(&store, client.clone(), policy(3));

        let job = orch.submit("user-1", sepsis(2)).await.unwrap();
        orch.fail_undispatched(job.id, "queue unreachable").await.unwrap();

        let stored = store.job(job.id);
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_code.as_deref(), Some("DISPATCH_FAILED"));
        assert!(stored.error_message.unwrap().contains("queue unreachable"));

        let report = orch.run(job.id).await.unwrap();
        assert_eq!(report.status, JobStatus::Failed);
        assert!(client.requested().is_empty());
    }

    #[tokio::test]
    async fn test_response_arriving_after_cancellation_is_discarded() {
        let store = Arc::new(MemoryStore::new());
        let client = ScriptedClient::new(vec![Ok(response(distinct_cards(1, 2)))]);
        let orch = orchestrator(&store, client.clone(), policy(3));

        let job = orch.submit("user-1", sepsis(2)).await.unwrap();
        client.cancel_during_call(store.clone(), job.id);
        let report = orch.run(job.id).await.unwrap();

        assert_eq!(report.status, JobStatus::Cancelled);
        assert_eq!(report.attempts, 0);
        assert!(store.cards().is_empty());
    }

    #[tokio::test]
    async fn test_provider_outages_use_the_retry_budget() {
        let store = Arc::new(MemoryStore::new());
        let outage = || Err(ProviderError::Unavailable { message: "503".into() });
        let client = ScriptedClient::new(vec![outage(), outage(), Ok(response(distinct_cards(1, 2)))]);
        let orch = orchestrator(&store, client.clone(), policy(1));

        let job = orch.submit("user-1", sepsis(2)).await.unwrap();
        let report = orch.run(job.id).await.unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.attempts, 3);
        let outcomes: Vec<_> = store.job(job.id).attempts.iter().map(|a| a.outcome).collect();
        assert_eq!(
            outcomes,
            vec![AttemptOutcome::ProviderError, AttemptOutcome::ProviderError, AttemptOutcome::Accepted]
        );
    }

    #[tokio::test]
    async fn test_provider_outage_beyond_budget_fails() {
        let store = Arc::new(MemoryStore::new());
        let outage = || Err(ProviderError::Unavailable { message: "timeout".into() });
        let client = ScriptedClient::new(vec![outage(), outage(), outage()]);
        let orch = orchestrator(&store, client.clone(), policy(3));

        let job = orch.submit("user-1", sepsis(2)).await.unwrap();
        let report = orch.run(job.id).await.unwrap();

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.error_code.as_deref(), Some("PROVIDER_UNAVAILABLE"));
        assert_eq!(client.requested().len(), 3);
    }

    #[tokio::test]
    async fn test_provider_rejection_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        let client = ScriptedClient::new(vec![Err(ProviderError::Rejected {
            status: 400,
            message: "INVALID_ARGUMENT".into(),
        })]);
        let orch = orchestrator(&store, client.clone(), policy(3));

        let job = orch.submit("user-1", sepsis(2)).await.unwrap();
        let report = orch.run(job.id).await.unwrap();

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.error_code.as_deref(), Some("PROVIDER_REJECTED"));
        assert_eq!(client.requested().len(), 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_fails_the_job() {
        let store = Arc::new(MemoryStore::new());
        store.fail_inserts(true);
        let orch = orchestrator(&store, Arc::new(MockGenerativeClient::new()), policy(3));

        let job = orch.submit("user-1", sepsis(2)).await.unwrap();
        let report = orch.run(job.id).await.unwrap();

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.error_code.as_deref(), Some("PERSISTENCE_FAILED"));
        assert!(report.card_ids.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_document_rejected_before_model_call() {
        let store = Arc::new(MemoryStore::new());
        let mock = Arc::new(MockGenerativeClient::new());
        let limits = RequestLimits {
            max_document_bytes: 64,
            ..RequestLimits::default()
        };
        let orch = JobOrchestrator::new(
            store.clone(),
            store.clone(),
            GenerationClient::new(mock.clone(), Duration::from_secs(5)),
            DocumentExtractor::new(&DocumentConfig::default()),
            limits,
            policy(3),
        );

        let mut at_limit = b"%PDF-1.4\n".to_vec();
        at_limit.resize(64, b' ');
        let mut accepted = sepsis(1);
        accepted.documents = vec![UploadedDocument::new(Some("ok.pdf".into()), at_limit.clone())];
        assert!(orch.submit("user-1", accepted).await.is_ok());

        let mut over = at_limit;
        over.push(b' ');
        let mut rejected = sepsis(1);
        rejected.documents = vec![UploadedDocument::new(Some("big.pdf".into()), over)];
        let err = orch.submit("user-1", rejected).await.unwrap_err();

        assert_eq!(err.code(), "INVALID_REQUEST");
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_existing_cards_are_summarised_and_not_repeated() {
        let store = Arc::new(MemoryStore::new());
        let known = store.add_existing(CardType::McqSingle, "What defines sepsis?");
        let client = ScriptedClient::new(vec![
            Ok(response(vec![
                fixtures::mcq_single("what defines   SEPSIS?"),
                fixtures::mcq_single("Which score predicts ICU mortality?"),
            ])),
            Ok(response(vec![fixtures::mcq_single("When should antibiotics start?")])),
        ]);
        let orch = orchestrator(&store, client.clone(), policy(3));

        let mut request = sepsis(2);
        request.existing_card_ids = vec![known, known];
        let job = orch.submit("user-1", request).await.unwrap();
        let report = orch.run(job.id).await.unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(client.requested(), vec![2, 1]);
        let first_prompt = client.prompts.lock().unwrap()[0].clone();
        assert_eq!(first_prompt.matches(&known.to_string()).count(), 1);
    }
}
