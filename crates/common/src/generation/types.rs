//! Domain types shared across the generation pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;
use validator::Validate;

use super::GenerationError;

/// Maximum characters of a prior-card description shown to the model
pub const SUMMARY_MAX_CHARS: usize = 120;

/// Study card variants the generator may produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardType {
    McqSingle,
    McqMulti,
    Written,
    TrueFalse,
    Cloze,
    Emq,
    Note,
    Flashcard,
}

impl CardType {
    pub const ALL: [CardType; 8] = [
        CardType::McqSingle,
        CardType::McqMulti,
        CardType::Written,
        CardType::TrueFalse,
        CardType::Cloze,
        CardType::Emq,
        CardType::Note,
        CardType::Flashcard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CardType::McqSingle => "mcq_single",
            CardType::McqMulti => "mcq_multi",
            CardType::Written => "written",
            CardType::TrueFalse => "true_false",
            CardType::Cloze => "cloze",
            CardType::Emq => "emq",
            CardType::Note => "note",
            CardType::Flashcard => "flashcard",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }

    /// Question cards carry a stem, an answer key and a rationale
    pub fn is_question(&self) -> bool {
        !matches!(self, CardType::Note | CardType::Flashcard)
    }
}

impl fmt::Display for CardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall difficulty distribution requested by the learner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifficultyProfile {
    #[default]
    Balanced,
    Advanced,
    Foundational,
}

impl DifficultyProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            DifficultyProfile::Balanced => "balanced",
            DifficultyProfile::Advanced => "advanced",
            DifficultyProfile::Foundational => "foundational",
        }
    }
}

/// How uploaded PDFs reach the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PdfMode {
    /// Hand the document to the provider as-is (inline or uploaded)
    #[default]
    Native,
    /// Extract page text locally and fold it into the prompt
    #[serde(alias = "ingest")]
    InlineExtract,
}

impl PdfMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PdfMode::Native => "native",
            PdfMode::InlineExtract => "inline-extract",
        }
    }
}

/// A PDF uploaded alongside a generation request
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedDocument {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

impl UploadedDocument {
    pub fn new(filename: Option<String>, content: Vec<u8>) -> Self {
        Self { filename, content }
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }

    /// Name shown to the model and recorded in summaries
    pub fn display_name(&self, index: usize) -> String {
        match self.filename.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("uploaded-{}.pdf", index + 1),
        }
    }

    /// Stable source id: hex SHA-256 of the bytes
    pub fn source_id(&self) -> String {
        hex::encode(Sha256::digest(&self.content))
    }
}

impl fmt::Debug for UploadedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadedDocument")
            .field("filename", &self.filename)
            .field("bytes", &self.content.len())
            .finish()
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

fn default_true() -> bool {
    true
}

/// A learner's request for a batch of generated study cards
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GenerationRequest {
    /// Core subjects to emphasise, in priority order
    #[validate(length(min = 1, message = "at least one topic is required"))]
    pub topics: Vec<String>,

    #[serde(default)]
    pub clinical_focus: Vec<String>,

    #[serde(default)]
    pub learning_objectives: Vec<String>,

    /// Falls back to the configured default when omitted
    #[validate(range(min = 1, message = "target card count must be at least 1"))]
    #[serde(default)]
    pub target_card_count: Option<i64>,

    /// Restricts generated variants when non-empty
    #[serde(default)]
    pub preferred_card_types: Vec<CardType>,

    #[serde(default)]
    pub difficulty_profile: DifficultyProfile,

    #[validate(range(min = 0.0, max = 2.0, message = "temperature must be within 0.0..=2.0"))]
    #[serde(default)]
    pub temperature: Option<f32>,

    #[validate(length(min = 1, max = 128))]
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default = "default_true")]
    pub include_retention_aid: bool,

    #[validate(length(max = 200))]
    #[serde(default)]
    pub learner_level: Option<String>,

    #[validate(length(max = 4000))]
    #[serde(default)]
    pub context_hints: Option<String>,

    /// Previously generated cards to reference and avoid duplicating
    #[serde(default)]
    pub existing_card_ids: Vec<Uuid>,

    #[serde(default)]
    pub pdf_mode: Option<PdfMode>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub documents: Vec<UploadedDocument>,
}

impl GenerationRequest {
    pub fn for_topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
            clinical_focus: Vec::new(),
            learning_objectives: Vec::new(),
            target_card_count: None,
            preferred_card_types: Vec::new(),
            difficulty_profile: DifficultyProfile::default(),
            temperature: None,
            model: None,
            include_retention_aid: true,
            learner_level: None,
            context_hints: None,
            existing_card_ids: Vec::new(),
            pdf_mode: None,
            documents: Vec::new(),
        }
    }

    pub fn total_document_bytes(&self) -> usize {
        self.documents.iter().map(UploadedDocument::size).sum()
    }
}

/// Generation job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
    CompletedPartial,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const TERMINAL: [JobStatus; 4] = [
        JobStatus::Completed,
        JobStatus::CompletedPartial,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::CompletedPartial => "completed_partial",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// Allowed edges of the job state machine
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Queued => matches!(
                next,
                JobStatus::InProgress | JobStatus::Failed | JobStatus::Cancelled
            ),
            JobStatus::InProgress => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown strings are rejected so a corrupt row is never treated as claimable
impl TryFrom<&str> for JobStatus {
    type Error = GenerationError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "in_progress" => Ok(JobStatus::InProgress),
            "completed" => Ok(JobStatus::Completed),
            "completed_partial" => Ok(JobStatus::CompletedPartial),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(GenerationError::Store {
                message: format!("unknown job status '{}'", other),
            }),
        }
    }
}

impl From<JobStatus> for String {
    fn from(status: JobStatus) -> Self {
        status.as_str().to_string()
    }
}

/// Validation outcome of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Accepted,
    SchemaInvalid,
    InsufficientCount,
    ProviderError,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Accepted => "accepted",
            AttemptOutcome::SchemaInvalid => "schema_invalid",
            AttemptOutcome::InsufficientCount => "insufficient_count",
            AttemptOutcome::ProviderError => "provider_error",
        }
    }
}

impl From<&str> for AttemptOutcome {
    fn from(s: &str) -> Self {
        match s {
            "accepted" => AttemptOutcome::Accepted,
            "insufficient_count" => AttemptOutcome::InsufficientCount,
            "provider_error" => AttemptOutcome::ProviderError,
            _ => AttemptOutcome::SchemaInvalid,
        }
    }
}

/// Recorded attempt; immutable once written
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationAttempt {
    pub attempt_index: u32,
    pub requested_count: u32,
    pub accepted_count: u32,
    pub rejected_count: u32,
    pub outcome: AttemptOutcome,
    pub prompt_snapshot: serde_json::Value,
    pub raw_response: Option<String>,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Human-facing summary of a finished generation run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationSummary {
    pub card_count: usize,
    pub requested_count: u32,
    pub model_used: String,
    pub temperature_applied: f32,
    pub sources: Vec<String>,
    pub source_document_ids: Vec<String>,
    #[serde(default)]
    pub truncations: Vec<String>,
    #[serde(default)]
    pub skipped_documents: Vec<String>,
    #[serde(default)]
    pub skipped_images: Vec<String>,
}

/// Pollable view of a generation job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: Uuid,
    pub owner_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing)]
    pub request: GenerationRequest,
    pub attempts: Vec<GenerationAttempt>,
    pub card_ids: Vec<Uuid>,
    pub retention_note: Option<String>,
    pub summary: Option<GenerationSummary>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Compact description of a card; never a full body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardSummary {
    pub id: Option<Uuid>,
    pub card_type: CardType,
    pub description: String,
}

impl CardSummary {
    pub fn new(id: Option<Uuid>, card_type: CardType, text: &str) -> Self {
        Self {
            id,
            card_type,
            description: shorten(text, SUMMARY_MAX_CHARS),
        }
    }

    pub fn render(&self) -> String {
        match self.id {
            Some(id) => format!("- [{}] {} | {}", id, self.card_type, self.description),
            None => format!("- {} | {}", self.card_type, self.description),
        }
    }
}

/// Collapse whitespace and cut to `max` characters with an ellipsis
pub fn shorten(text: &str, max: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max {
        return collapsed;
    }
    let mut out: String = collapsed.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_type_round_trips_through_str() {
        for card_type in CardType::ALL {
            assert_eq!(CardType::parse(card_type.as_str()), Some(card_type));
        }
        assert_eq!(CardType::parse("essay"), None);
        assert!(CardType::Emq.is_question());
        assert!(!CardType::Flashcard.is_question());
    }

    #[test]
    fn test_terminal_states_never_transition() {
        for status in JobStatus::TERMINAL {
            assert!(status.is_terminal());
            for next in [JobStatus::Queued, JobStatus::InProgress, JobStatus::Completed] {
                assert!(!status.can_transition_to(next));
            }
        }
        assert!(JobStatus::Queued.can_transition_to(JobStatus::InProgress));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::InProgress.can_transition_to(JobStatus::CompletedPartial));
    }

    #[test]
    fn test_stored_status_parsing() {
        for status in [JobStatus::Queued, JobStatus::InProgress]
            .into_iter()
            .chain(JobStatus::TERMINAL)
        {
            assert_eq!(JobStatus::try_from(status.as_str()).unwrap(), status);
        }
        let err = JobStatus::try_from("pending").unwrap_err();
        assert_eq!(err.code(), "JOB_STORE_ERROR");
    }

    #[test]
    fn test_pdf_mode_accepts_legacy_alias() {
        let mode: PdfMode = serde_json::from_str("\"ingest\"").unwrap();
        assert_eq!(mode, PdfMode::InlineExtract);
        let mode: PdfMode = serde_json::from_str("\"native\"").unwrap();
        assert_eq!(mode, PdfMode::Native);
    }

    #[test]
    fn test_documents_serialize_as_base64() {
        let doc = UploadedDocument::new(Some("a.pdf".into()), b"%PDF-1.4".to_vec());
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["content"], "JVBERi0xLjQ=");
        let back: UploadedDocument = serde_json::from_value(json).unwrap();
        assert_eq!(back, doc);
        assert_eq!(doc.source_id().len(), 64);
    }

    #[test]
    fn test_request_defaults() {
        let req: GenerationRequest = serde_json::from_str(r#"{"topics":["Sepsis"]}"#).unwrap();
        assert!(req.include_retention_aid);
        assert_eq!(req.difficulty_profile, DifficultyProfile::Balanced);
        assert!(req.documents.is_empty());
    }

    #[test]
    fn test_summary_is_bounded() {
        let long = "word ".repeat(100);
        let summary = CardSummary::new(None, CardType::Written, &long);
        assert_eq!(summary.description.chars().count(), SUMMARY_MAX_CHARS);
        assert!(summary.description.ends_with('…'));
    }
}
