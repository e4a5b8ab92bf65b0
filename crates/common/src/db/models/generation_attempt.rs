//! Generation attempt entity; rows are append-only

use chrono::Utc;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::generation::{AttemptOutcome, GenerationAttempt};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "generation_attempts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub job_id: Uuid,

    pub attempt_index: i32,

    pub requested_count: i32,

    pub accepted_count: i32,

    pub rejected_count: i32,

    #[sea_orm(column_type = "Text")]
    pub outcome: String,

    /// Prompt text with inline document bytes elided
    #[sea_orm(column_type = "JsonBinary")]
    pub prompt_snapshot: Json,

    #[sea_orm(column_type = "Text", nullable)]
    pub raw_response: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub detail: Option<String>,

    pub created_at: DateTimeWithTimeZone,
}

impl From<Model> for GenerationAttempt {
    fn from(row: Model) -> Self {
        GenerationAttempt {
            attempt_index: row.attempt_index.max(0) as u32,
            requested_count: row.requested_count.max(0) as u32,
            accepted_count: row.accepted_count.max(0) as u32,
            rejected_count: row.rejected_count.max(0) as u32,
            outcome: AttemptOutcome::from(row.outcome.as_str()),
            prompt_snapshot: row.prompt_snapshot,
            raw_response: row.raw_response,
            detail: row.detail,
            created_at: row.created_at.with_timezone(&Utc),
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::generation_job::Entity",
        from = "Column::JobId",
        to = "super::generation_job::Column::Id"
    )]
    Job,
}

impl Related<super::generation_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Job.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
