//! Study card entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::generation::{CardType, ExistingCard};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "study_cards")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(column_type = "Text")]
    pub card_type: String,

    pub difficulty: i16,

    /// Typed card body plus the `generator` provenance block
    #[sea_orm(column_type = "JsonBinary")]
    pub data: Json,

    pub generation_job_id: Option<Uuid>,

    pub generation_attempts: Option<i32>,

    #[sea_orm(column_type = "JsonBinary")]
    pub source_document_ids: Json,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Prompt text used for summaries and duplicate detection
    pub fn prompt(&self) -> Option<&str> {
        self.data
            .get("prompt")
            .or_else(|| self.data.get("title"))
            .and_then(Json::as_str)
    }

    pub fn to_existing(&self) -> Option<ExistingCard> {
        Some(ExistingCard {
            id: self.id,
            card_type: CardType::parse(&self.card_type)?,
            prompt: self.prompt()?.to_string(),
        })
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
