//! Card persistence
//!
//! Writes an accepted batch as study cards in a single transaction, stamps each
//! card with provenance, and produces the job's retention note.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

use super::error::GenerationError;
use super::pdf::DocumentContext;
use super::reconciler::AcceptedBatch;
use super::schema::ValidRequest;
use super::types::CardType;
use crate::errors::Result;
use crate::metrics;

/// Version of the `data` document written for generated cards
pub const CARD_SCHEMA_VERSION: &str = "1.0.0";

/// A previously stored card referenced by `existing_card_ids`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingCard {
    pub id: Uuid,
    pub card_type: CardType,
    pub prompt: String,
}

/// Row to insert for an accepted card
#[derive(Debug, Clone, PartialEq)]
pub struct NewStudyCard {
    pub id: Uuid,
    pub card_type: CardType,
    pub difficulty: u8,
    pub data: Value,
    pub generation_job_id: Uuid,
    pub generation_attempts: u32,
    pub source_document_ids: Vec<String>,
}

/// Storage for study cards
#[async_trait]
pub trait CardStore: Send + Sync {
    /// Look up existing cards; unknown ids are skipped, input order is kept
    async fn lookup_cards(&self, ids: &[Uuid]) -> Result<Vec<ExistingCard>>;

    /// Insert all cards or none
    async fn insert_cards(&self, cards: Vec<NewStudyCard>) -> Result<Vec<Uuid>>;
}

/// Metadata linking persisted cards to the run that produced them
#[derive(Debug, Clone)]
pub struct Provenance {
    pub job_id: Uuid,
    pub attempts: u32,
    pub model: String,
    pub temperature: f32,
    pub requested_count: u32,
    pub topics: Vec<String>,
    pub clinical_focus: Vec<String>,
    pub learning_objectives: Vec<String>,
    pub preferred_card_types: Vec<CardType>,
    pub existing_card_ids: Vec<Uuid>,
    pub sources: Vec<String>,
    pub source_document_ids: Vec<String>,
}

impl Provenance {
    pub fn new(job_id: Uuid, attempts: u32, valid: &ValidRequest, documents: &DocumentContext) -> Self {
        let request = &valid.request;
        Self {
            job_id,
            attempts,
            model: valid.model.clone(),
            temperature: valid.temperature,
            requested_count: valid.target_card_count,
            topics: request.topics.clone(),
            clinical_focus: request.clinical_focus.clone(),
            learning_objectives: request.learning_objectives.clone(),
            preferred_card_types: request.preferred_card_types.clone(),
            existing_card_ids: request.existing_card_ids.clone(),
            sources: documents.sources.clone(),
            source_document_ids: documents.source_ids.clone(),
        }
    }

    /// The `generator` block embedded in each card's data
    pub fn generator_metadata(&self) -> Value {
        json!({
            "model": self.model,
            "temperature": self.temperature,
            "requested_card_count": self.requested_count,
            "topics": self.topics,
            "clinical_focus": self.clinical_focus,
            "learning_objectives": self.learning_objectives,
            "preferred_card_types": self.preferred_card_types,
            "existing_card_ids": self.existing_card_ids,
            "sources": self.sources,
            "source_document_ids": self.source_document_ids,
            "generation_job_id": self.job_id,
            "generation_attempts": self.attempts,
            "schema_version": CARD_SCHEMA_VERSION,
        })
    }
}

/// Result of a successful write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedBatch {
    pub card_ids: Vec<Uuid>,
    pub retention_note: String,
}

#[derive(Clone)]
pub struct CardPersister {
    store: Arc<dyn CardStore>,
}

impl CardPersister {
    pub fn new(store: Arc<dyn CardStore>) -> Self {
        Self { store }
    }

    /// Persist the batch; on failure nothing is written
    #[instrument(skip(self, batch, provenance), fields(cards = batch.cards.len()))]
    pub async fn persist(
        &self,
        job_id: Uuid,
        batch: &AcceptedBatch,
        provenance: &Provenance,
    ) -> std::result::Result<PersistedBatch, GenerationError> {
        let generator = provenance.generator_metadata();
        let rows: Vec<NewStudyCard> = batch
            .cards
            .iter()
            .map(|card| NewStudyCard {
                id: Uuid::now_v7(),
                card_type: card.card_type,
                difficulty: card.difficulty,
                data: card.to_card_data(&generator),
                generation_job_id: job_id,
                generation_attempts: provenance.attempts,
                source_document_ids: provenance.source_document_ids.clone(),
            })
            .collect();

        let card_ids = self.store.insert_cards(rows).await.map_err(|e| {
            error!(error = %e, "Card batch rolled back");
            GenerationError::PersistenceFailed {
                message: e.to_string(),
            }
        })?;

        metrics::record_cards_persisted(card_ids.len());
        info!(persisted = card_ids.len(), "Persisted generated cards");

        let retention_note = match &batch.retention_aid {
            Some(markdown) => markdown.clone(),
            None => retention_digest(batch),
        };

        Ok(PersistedBatch {
            card_ids,
            retention_note,
        })
    }
}

/// Markdown digest of the persisted prompts, grouped by card type
pub fn retention_digest(batch: &AcceptedBatch) -> String {
    let mut grouped: BTreeMap<&'static str, Vec<&str>> = BTreeMap::new();
    for card in &batch.cards {
        grouped
            .entry(card.card_type.as_str())
            .or_default()
            .push(card.prompt());
    }

    let mut out = String::from("# Retention digest\n");
    for (card_type, prompts) in grouped {
        out.push_str(&format!("\n## {} ({})\n", card_type, prompts.len()));
        for prompt in prompts {
            out.push_str(&format!("- {}\n", prompt));
        }
    }
    out
}
