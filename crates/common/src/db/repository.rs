//! Repository pattern for database operations
//!
//! Implements the pipeline's [`JobStore`] and [`CardStore`] over Postgres.
//! Status writes are conditional updates so a terminal job is never rewritten.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    Set, TransactionTrait,
};
use std::collections::HashMap;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::{AppError, Result};
use crate::generation::{
    CardStore, ExistingCard, GenerationAttempt, GenerationJob, GenerationRequest, JobOutcome,
    JobStatus, JobStore, NewStudyCard,
};

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Existing-card lookups may use the replica
    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.card_reads()
    }

    /// Job state is always read from here: a replica may lag a transition.
    fn write_conn(&self) -> &DatabaseConnection {
        self.pool.primary()
    }

    // ========================================================================
    // Health Check
    // ========================================================================

    /// Ping the database
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    async fn attempts_for(&self, job_id: Uuid) -> Result<Vec<GenerationAttempt>> {
        let rows = GenerationAttemptEntity::find()
            .filter(GenerationAttemptColumn::JobId.eq(job_id))
            .order_by_asc(GenerationAttemptColumn::AttemptIndex)
            .all(self.write_conn())
            .await?;
        Ok(rows.into_iter().map(GenerationAttempt::from).collect())
    }
}

/// Statuses from which `target` may be entered
fn sources_of(target: JobStatus) -> Vec<&'static str> {
    [JobStatus::Queued, JobStatus::InProgress]
        .into_iter()
        .filter(|from| from.can_transition_to(target))
        .map(|from| from.as_str())
        .collect()
}

fn non_terminal() -> Vec<&'static str> {
    vec![JobStatus::Queued.as_str(), JobStatus::InProgress.as_str()]
}

// ============================================================================
// Job Operations
// ============================================================================

#[async_trait]
impl JobStore for Repository {
    #[instrument(skip(self, request))]
    async fn create_job(&self, owner_id: &str, request: GenerationRequest) -> Result<GenerationJob> {
        let job = GenerationJob::queued(owner_id, request);

        let row = GenerationJobActiveModel {
            id: Set(job.id),
            owner_id: Set(job.owner_id.clone()),
            status: Set(job.status.as_str().to_string()),
            request: Set(serde_json::to_value(&job.request)?),
            card_ids: Set(serde_json::json!([])),
            retention_note: Set(None),
            summary: Set(None),
            error_code: Set(None),
            error_message: Set(None),
            cancel_requested: Set(false),
            created_at: Set(job.created_at.into()),
            updated_at: Set(job.updated_at.into()),
            started_at: Set(None),
            completed_at: Set(None),
        };
        row.insert(self.write_conn()).await?;

        debug!(job_id = %job.id, "Job row created");
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<GenerationJob>> {
        let Some(row) = GenerationJobEntity::find_by_id(id).one(self.write_conn()).await? else {
            return Ok(None);
        };
        let attempts = self.attempts_for(id).await?;
        row.into_job(attempts).map(Some)
    }

    #[instrument(skip(self))]
    async fn claim_job(&self, id: Uuid) -> Result<bool> {
        let now: DateTimeWithTimeZone = Utc::now().into();
        let result = GenerationJobEntity::update_many()
            .col_expr(GenerationJobColumn::Status, Expr::value(JobStatus::InProgress.as_str()))
            .col_expr(GenerationJobColumn::StartedAt, Expr::value(now))
            .col_expr(GenerationJobColumn::UpdatedAt, Expr::value(now))
            .filter(GenerationJobColumn::Id.eq(id))
            .filter(GenerationJobColumn::Status.eq(JobStatus::Queued.as_str()))
            .exec(self.write_conn())
            .await?;

        Ok(result.rows_affected == 1)
    }

    async fn record_attempt(&self, job_id: Uuid, attempt: &GenerationAttempt) -> Result<()> {
        let row = GenerationAttemptActiveModel {
            id: Set(Uuid::now_v7()),
            job_id: Set(job_id),
            attempt_index: Set(attempt.attempt_index as i32),
            requested_count: Set(attempt.requested_count as i32),
            accepted_count: Set(attempt.accepted_count as i32),
            rejected_count: Set(attempt.rejected_count as i32),
            outcome: Set(attempt.outcome.as_str().to_string()),
            prompt_snapshot: Set(attempt.prompt_snapshot.clone()),
            raw_response: Set(attempt.raw_response.clone()),
            detail: Set(attempt.detail.clone()),
            created_at: Set(attempt.created_at.into()),
        };
        row.insert(self.write_conn()).await?;
        Ok(())
    }

    #[instrument(skip(self, outcome), fields(status = %outcome.status()))]
    async fn finish_job(&self, id: Uuid, outcome: JobOutcome) -> Result<bool> {
        let status = outcome.status();
        let now: DateTimeWithTimeZone = Utc::now().into();

        let mut update = GenerationJobEntity::update_many()
            .col_expr(GenerationJobColumn::Status, Expr::value(status.as_str()))
            .col_expr(GenerationJobColumn::UpdatedAt, Expr::value(now))
            .col_expr(GenerationJobColumn::CompletedAt, Expr::value(now));

        update = match outcome {
            JobOutcome::Completed {
                card_ids,
                retention_note,
                summary,
                ..
            } => update
                .col_expr(GenerationJobColumn::CardIds, Expr::value(serde_json::to_value(card_ids)?))
                .col_expr(GenerationJobColumn::RetentionNote, Expr::value(retention_note))
                .col_expr(GenerationJobColumn::Summary, Expr::value(serde_json::to_value(summary)?)),
            JobOutcome::Failed {
                code,
                message,
                summary,
            } => update
                .col_expr(GenerationJobColumn::ErrorCode, Expr::value(code))
                .col_expr(GenerationJobColumn::ErrorMessage, Expr::value(message))
                .col_expr(
                    GenerationJobColumn::Summary,
                    Expr::value(summary.map(serde_json::to_value).transpose()?),
                ),
            JobOutcome::Cancelled { summary } => update.col_expr(
                GenerationJobColumn::Summary,
                Expr::value(summary.map(serde_json::to_value).transpose()?),
            ),
        };

        let result = update
            .filter(GenerationJobColumn::Id.eq(id))
            .filter(GenerationJobColumn::Status.is_in(sources_of(status)))
            .exec(self.write_conn())
            .await?;

        Ok(result.rows_affected == 1)
    }

    async fn request_cancellation(&self, id: Uuid) -> Result<Option<JobStatus>> {
        GenerationJobEntity::update_many()
            .col_expr(GenerationJobColumn::CancelRequested, Expr::value(true))
            .filter(GenerationJobColumn::Id.eq(id))
            .filter(GenerationJobColumn::Status.is_in(non_terminal()))
            .exec(self.write_conn())
            .await?;

        let row = GenerationJobEntity::find_by_id(id).one(self.write_conn()).await?;
        Ok(row.map(|r| r.job_status()).transpose()?)
    }

    async fn is_cancellation_requested(&self, id: Uuid) -> Result<bool> {
        let row = GenerationJobEntity::find_by_id(id)
            .one(self.write_conn())
            .await?
            .ok_or_else(|| AppError::JobNotFound { id: id.to_string() })?;
        Ok(row.cancel_requested)
    }
}

// ============================================================================
// Card Operations
// ============================================================================

#[async_trait]
impl CardStore for Repository {
    async fn lookup_cards(&self, ids: &[Uuid]) -> Result<Vec<ExistingCard>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = StudyCardEntity::find()
            .filter(StudyCardColumn::Id.is_in(ids.to_vec()))
            .all(self.read_conn())
            .await?;
        let mut by_id: HashMap<Uuid, ExistingCard> = rows
            .iter()
            .filter_map(StudyCardRow::to_existing)
            .map(|card| (card.id, card))
            .collect();

        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    #[instrument(skip(self, cards), fields(count = cards.len()))]
    async fn insert_cards(&self, cards: Vec<NewStudyCard>) -> Result<Vec<Uuid>> {
        let txn = self.write_conn().begin().await.map_err(|e| AppError::Transaction {
            message: format!("Failed to open transaction: {}", e),
        })?;

        let now: DateTimeWithTimeZone = Utc::now().into();
        let mut ids = Vec::with_capacity(cards.len());
        for card in cards {
            let row = StudyCardActiveModel {
                id: Set(card.id),
                card_type: Set(card.card_type.as_str().to_string()),
                difficulty: Set(i16::from(card.difficulty)),
                data: Set(card.data),
                generation_job_id: Set(Some(card.generation_job_id)),
                generation_attempts: Set(Some(card.generation_attempts as i32)),
                source_document_ids: Set(serde_json::to_value(&card.source_document_ids)?),
                created_at: Set(now),
                updated_at: Set(now),
            };
            // Dropping `txn` on error rolls the batch back
            row.insert(&txn).await?;
            ids.push(card.id);
        }

        txn.commit().await.map_err(|e| AppError::Transaction {
            message: format!("Failed to commit card batch: {}", e),
        })?;
        Ok(ids)
    }
}
