//! Generation job entity

use chrono::Utc;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::generation::{GenerationAttempt, GenerationError, GenerationJob, GenerationSummary, JobStatus};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "generation_jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(column_type = "Text")]
    pub owner_id: String,

    #[sea_orm(column_type = "Text")]
    pub status: String,

    /// The validated request, documents included (base64)
    #[sea_orm(column_type = "JsonBinary")]
    pub request: Json,

    /// Persisted card ids, in acceptance order
    #[sea_orm(column_type = "JsonBinary")]
    pub card_ids: Json,

    #[sea_orm(column_type = "Text", nullable)]
    pub retention_note: Option<String>,

    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub summary: Option<Json>,

    #[sea_orm(column_type = "Text", nullable)]
    pub error_code: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub error_message: Option<String>,

    pub cancel_requested: bool,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,

    pub started_at: Option<DateTimeWithTimeZone>,

    pub completed_at: Option<DateTimeWithTimeZone>,
}

impl Model {
    pub fn job_status(&self) -> Result<JobStatus, GenerationError> {
        JobStatus::try_from(self.status.as_str())
    }

    /// Domain view of the row with its attempts
    pub fn into_job(self, attempts: Vec<GenerationAttempt>) -> crate::errors::Result<GenerationJob> {
        let summary: Option<GenerationSummary> = self.summary.clone().map(serde_json::from_value).transpose()?;
        Ok(GenerationJob {
            id: self.id,
            status: self.job_status()?,
            owner_id: self.owner_id,
            request: serde_json::from_value(self.request)?,
            attempts,
            card_ids: serde_json::from_value(self.card_ids)?,
            retention_note: self.retention_note,
            summary,
            error_code: self.error_code,
            error_message: self.error_message,
            cancel_requested: self.cancel_requested,
            created_at: self.created_at.with_timezone(&Utc),
            updated_at: self.updated_at.with_timezone(&Utc),
            started_at: self.started_at.map(|t| t.with_timezone(&Utc)),
            completed_at: self.completed_at.map(|t| t.with_timezone(&Utc)),
        })
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::generation_attempt::Entity", on_delete = "Cascade")]
    Attempts,
}

impl Related<super::generation_attempt::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Attempts.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::GenerationRequest;

    fn row(status: &str) -> Model {
        let now = Utc::now().fixed_offset();
        Model {
            id: Uuid::now_v7(),
            owner_id: "learner-1".to_string(),
            status: status.to_string(),
            request: serde_json::to_value(GenerationRequest::for_topics(["Sepsis"])).unwrap(),
            card_ids: serde_json::json!([]),
            retention_note: None,
            summary: None,
            error_code: None,
            error_message: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            started_at: Some(now),
            completed_at: None,
        }
    }

    #[test]
    fn test_row_into_job() {
        let job = row("in_progress").into_job(Vec::new()).unwrap();
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.request.topics, vec!["Sepsis".to_string()]);
        assert!(job.started_at.is_some());
    }

    #[test]
    fn test_unknown_status_is_not_claimable() {
        assert!(row("pending").job_status().is_err());
        assert!(row("pending").into_job(Vec::new()).is_err());
    }
}
