//! Validation boundary for generation requests and model output
//!
//! Untrusted JSON from the model is converted into typed [`GeneratedCard`]s here and
//! nowhere else. Each candidate is checked against the rules of its declared variant;
//! a failure names the offending field path so it can be fed back to the model.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;
use validator::{Validate, ValidationErrors};

use super::error::{RequestError, SchemaError};
use super::types::{CardSummary, CardType, GenerationRequest, PdfMode};
use crate::config::{DocumentConfig, GenerationConfig};

/// Limits and defaults applied while validating a request
#[derive(Debug, Clone)]
pub struct RequestLimits {
    pub default_card_count: u32,
    pub max_card_count: u32,
    pub max_document_bytes: usize,
    pub max_total_document_bytes: usize,
    pub default_temperature: f32,
    pub default_model: String,
    pub default_pdf_mode: PdfMode,
}

impl RequestLimits {
    pub fn from_config(generation: &GenerationConfig, documents: &DocumentConfig) -> Self {
        Self {
            default_card_count: generation.default_card_count,
            max_card_count: generation.max_card_count.max(1),
            max_document_bytes: documents.max_document_bytes,
            max_total_document_bytes: documents.max_total_document_bytes,
            default_temperature: generation.default_temperature,
            default_model: generation.model.clone(),
            default_pdf_mode: documents.pdf_mode,
        }
    }
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self::from_config(&GenerationConfig::default(), &DocumentConfig::default())
    }
}

/// A request that passed validation, with every default resolved
#[derive(Debug, Clone)]
pub struct ValidRequest {
    pub request: GenerationRequest,
    pub target_card_count: u32,
    pub temperature: f32,
    pub model: String,
    pub pdf_mode: PdfMode,
}

impl ValidRequest {
    /// Card types the model may return; empty means unrestricted
    pub fn allowed_types(&self) -> &[CardType] {
        &self.request.preferred_card_types
    }
}

/// Validate and normalise a generation request
pub fn validate_request(
    mut request: GenerationRequest,
    limits: &RequestLimits,
) -> Result<ValidRequest, RequestError> {
    request.validate().map_err(|e| first_field_error(&e))?;

    if let Some(index) = request.topics.iter().position(|t| t.trim().is_empty()) {
        return Err(RequestError::BlankTopic { index });
    }

    for (index, document) in request.documents.iter().enumerate() {
        if document.size() > limits.max_document_bytes {
            return Err(RequestError::DocumentTooLarge {
                name: document.display_name(index),
                size: document.size(),
                limit: limits.max_document_bytes,
            });
        }
    }
    let total = request.total_document_bytes();
    if total > limits.max_total_document_bytes {
        return Err(RequestError::DocumentsTooLarge {
            size: total,
            limit: limits.max_total_document_bytes,
        });
    }

    request.topics = trim_all(request.topics);
    request.clinical_focus = trim_all(request.clinical_focus);
    request.learning_objectives = trim_all(request.learning_objectives);

    let mut seen_ids = HashSet::new();
    request.existing_card_ids.retain(|id| seen_ids.insert(*id));
    let mut seen_types = HashSet::new();
    request.preferred_card_types.retain(|t| seen_types.insert(*t));

    let requested = request
        .target_card_count
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
        .unwrap_or(limits.default_card_count);
    let target_card_count = requested.clamp(1, limits.max_card_count);

    let temperature = request.temperature.unwrap_or(limits.default_temperature);
    let model = request
        .model
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(limits.default_model.as_str())
        .to_string();
    let pdf_mode = request.pdf_mode.unwrap_or(limits.default_pdf_mode);

    Ok(ValidRequest {
        request,
        target_card_count,
        temperature,
        model,
        pdf_mode,
    })
}

fn trim_all(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

fn first_field_error(errors: &ValidationErrors) -> RequestError {
    let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
    fields.sort_by(|a, b| a.0.cmp(&b.0));
    match fields.first() {
        Some((field, errs)) => {
            let message = errs
                .first()
                .map(|e| match &e.message {
                    Some(message) => message.to_string(),
                    None => e.code.to_string(),
                })
                .unwrap_or_else(|| "invalid value".to_string());
            RequestError::field(field.to_string(), message)
        }
        None => RequestError::field("request", errors.to_string()),
    }
}

/// Multiple-choice option as emitted by the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardOption {
    pub id: String,
    pub text: String,
}

/// Explanation bundle: the primary rationale plus per-option notes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rationale {
    #[serde(default)]
    pub primary: String,
    #[serde(default)]
    pub alternatives: BTreeMap<String, String>,
}

/// Variant-agnostic card body returned by the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardPayload {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub options: Option<Vec<CardOption>>,
    #[serde(default, deserialize_with = "lenient_strings")]
    pub correct_answers: Vec<String>,
    #[serde(default)]
    pub rationale: Rationale,
    #[serde(default)]
    pub connections: Vec<String>,
    #[serde(default)]
    pub glossary: BTreeMap<String, String>,
    #[serde(default)]
    pub numerical_ranges: Vec<String>,
    #[serde(default)]
    pub references: Vec<String>,
}

/// Answers are strings on the wire, but numbers and booleans are common enough to accept
fn lenient_strings<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let values = Vec::<Value>::deserialize(deserializer)?;
    values
        .into_iter()
        .map(|value| match value {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(serde::de::Error::custom(format!(
                "expected a string answer, found {other}"
            ))),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmqMatch {
    pub premise_index: usize,
    pub option_index: usize,
}

/// Typed answer key derived during validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerKey {
    SingleChoice { correct: String },
    MultiChoice { correct: Vec<String> },
    Written { expected: String },
    TrueFalse(bool),
    Cloze(Vec<String>),
    Emq { matches: Vec<EmqMatch> },
    Note { title: String, markdown: String },
    Flashcard { back: String },
}

/// A candidate that satisfied its variant's schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedCard {
    pub card_type: CardType,
    pub difficulty: u8,
    pub payload: CardPayload,
    pub answer: AnswerKey,
}

impl GeneratedCard {
    /// The text learners see first: the stem, or the note title
    pub fn prompt(&self) -> &str {
        match &self.answer {
            AnswerKey::Note { title, .. } if self.payload.question.trim().is_empty() => title,
            _ => self.payload.question.trim(),
        }
    }

    pub fn normalized_prompt(&self) -> String {
        normalize_prompt(self.prompt())
    }

    pub fn summary(&self, id: Option<Uuid>) -> CardSummary {
        CardSummary::new(id, self.card_type, self.prompt())
    }

    /// Typed `data` document stored on the study card row
    pub fn to_card_data(&self, generator: &Value) -> Value {
        let payload = &self.payload;
        if let AnswerKey::Note { title, markdown } = &self.answer {
            return json!({
                "generator": generator,
                "title": title,
                "markdown": markdown,
            });
        }

        let mut data = Map::new();
        data.insert("generator".into(), generator.clone());
        data.insert("prompt".into(), json!(self.prompt()));
        data.insert("rationale".into(), json!(payload.rationale));
        data.insert("glossary".into(), json!(payload.glossary));
        data.insert("connections".into(), json!(payload.connections));
        data.insert("references".into(), json!(payload.references));
        data.insert("numerical_ranges".into(), json!(payload.numerical_ranges));

        let options = payload.options.clone().unwrap_or_default();
        match &self.answer {
            AnswerKey::SingleChoice { correct } => {
                data.insert("options".into(), json!(options));
                data.insert("correct_option_ids".into(), json!([correct]));
            }
            AnswerKey::MultiChoice { correct } => {
                data.insert("options".into(), json!(options));
                data.insert("correct_option_ids".into(), json!(correct));
            }
            AnswerKey::Written { expected } => {
                data.insert("expected_answer".into(), json!(expected));
            }
            AnswerKey::TrueFalse(answer) => {
                data.insert("correct_answer".into(), json!(answer));
            }
            AnswerKey::Cloze(answers) => {
                data.insert("cloze_answers".into(), json!(answers));
            }
            AnswerKey::Emq { matches } => {
                let texts: Vec<&str> = options.iter().map(|o| o.text.as_str()).collect();
                data.insert("instructions".into(), json!(payload.references.first()));
                data.insert("premises".into(), json!(payload.connections));
                data.insert("options".into(), json!(texts));
                data.insert("matches".into(), json!(matches));
            }
            AnswerKey::Flashcard { back } => {
                data.insert("back".into(), json!(back));
            }
            AnswerKey::Note { .. } => {}
        }
        Value::Object(data)
    }
}

/// Case- and whitespace-insensitive key used for duplicate detection
pub fn normalize_prompt(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Title of a Markdown note: first heading, else the first non-blank line
pub fn extract_heading(markdown: &str) -> Option<String> {
    for line in markdown.lines() {
        let stripped = line.trim();
        if stripped.starts_with('#') {
            let heading = stripped.trim_start_matches('#').trim();
            if !heading.is_empty() {
                return Some(heading.to_string());
            }
        } else if !stripped.is_empty() {
            return Some(stripped.chars().take(80).collect::<String>().trim().to_string());
        }
    }
    None
}

/// Parse a true/false answer as the model tends to phrase it
pub fn parse_boolean_answer(answer: &str) -> Option<bool> {
    match answer.trim().to_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "y" => Some(true),
        "false" | "f" | "0" | "no" | "n" => Some(false),
        _ => None,
    }
}

fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}

/// Validate one candidate against its declared variant
///
/// `allowed` restricts the accepted variants when non-empty.
pub fn validate_candidate(value: &Value, allowed: &[CardType]) -> Result<GeneratedCard, SchemaError> {
    let obj = value
        .as_object()
        .ok_or_else(|| SchemaError::new("$", "candidate must be a JSON object"))?;

    let raw_type = obj
        .get("card_type")
        .and_then(Value::as_str)
        .ok_or_else(|| SchemaError::new("card_type", "missing or not a string"))?;
    let card_type = CardType::parse(raw_type.trim())
        .ok_or_else(|| SchemaError::new("card_type", format!("unknown card type {raw_type:?}")))?;
    if !allowed.is_empty() && !allowed.contains(&card_type) {
        return Err(SchemaError::new(
            "card_type",
            format!("{card_type} is not among the requested card types"),
        ));
    }

    let difficulty = match obj.get("difficulty") {
        None | Some(Value::Null) => 1,
        Some(v) => v
            .as_u64()
            .filter(|d| (1..=5).contains(d))
            .map(|d| d as u8)
            .ok_or_else(|| SchemaError::new("difficulty", "must be an integer from 1 to 5"))?,
    };

    let raw_payload = obj
        .get("payload")
        .filter(|p| p.is_object())
        .ok_or_else(|| SchemaError::new("payload", "missing or not an object"))?;
    let payload: CardPayload = serde_json::from_value(raw_payload.clone())
        .map_err(|e| SchemaError::new("payload", e.to_string()))?;

    if card_type.is_question() || card_type == CardType::Flashcard {
        if is_blank(&payload.question) {
            return Err(SchemaError::new("payload.question", "must not be blank"));
        }
    }
    if card_type.is_question() && is_blank(&payload.rationale.primary) {
        return Err(SchemaError::new("payload.rationale.primary", "must not be blank"));
    }

    let answer = match card_type {
        CardType::McqSingle => {
            let ids = check_options(&payload)?;
            let correct = non_blank_answers(&payload);
            if correct.len() != 1 {
                return Err(SchemaError::new(
                    "payload.correct_answers",
                    format!("exactly one correct option id is required, found {}", correct.len()),
                ));
            }
            let correct = correct[0].clone();
            if !ids.contains(correct.as_str()) {
                return Err(SchemaError::new(
                    "payload.correct_answers[0]",
                    format!("{correct:?} does not name an option"),
                ));
            }
            AnswerKey::SingleChoice { correct }
        }
        CardType::McqMulti => {
            let ids = check_options(&payload)?;
            let mut correct = non_blank_answers(&payload);
            if correct.is_empty() {
                return Err(SchemaError::new(
                    "payload.correct_answers",
                    "at least one correct option id is required",
                ));
            }
            if let Some(i) = correct.iter().position(|c| !ids.contains(c.as_str())) {
                return Err(SchemaError::new(
                    format!("payload.correct_answers[{i}]"),
                    format!("{:?} does not name an option", correct[i]),
                ));
            }
            let mut seen = HashSet::new();
            correct.retain(|c| seen.insert(c.clone()));
            AnswerKey::MultiChoice { correct }
        }
        CardType::Written => {
            let expected = first_answer(&payload, "at least one expected answer is required")?;
            AnswerKey::Written { expected }
        }
        CardType::Flashcard => {
            let back = first_answer(&payload, "a back-side answer is required")?;
            AnswerKey::Flashcard { back }
        }
        CardType::TrueFalse => {
            let first = payload.correct_answers.first().map(String::as_str).unwrap_or("");
            let value = parse_boolean_answer(first).ok_or_else(|| {
                SchemaError::new("payload.correct_answers[0]", "must be true or false")
            })?;
            AnswerKey::TrueFalse(value)
        }
        CardType::Cloze => {
            let answers = non_blank_answers(&payload);
            if answers.is_empty() {
                return Err(SchemaError::new(
                    "payload.correct_answers",
                    "at least one cloze answer is required",
                ));
            }
            AnswerKey::Cloze(answers)
        }
        CardType::Emq => AnswerKey::Emq {
            matches: check_emq(&payload)?,
        },
        CardType::Note => {
            let markdown = payload.rationale.primary.trim().to_string();
            if markdown.is_empty() {
                return Err(SchemaError::new(
                    "payload.rationale.primary",
                    "note markdown must not be blank",
                ));
            }
            let title = payload
                .glossary
                .get("title")
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .or_else(|| extract_heading(&markdown))
                .unwrap_or_else(|| "Note".to_string());
            AnswerKey::Note { title, markdown }
        }
    };

    Ok(GeneratedCard {
        card_type,
        difficulty,
        payload,
        answer,
    })
}

fn non_blank_answers(payload: &CardPayload) -> Vec<String> {
    payload
        .correct_answers
        .iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect()
}

fn first_answer(payload: &CardPayload, message: &str) -> Result<String, SchemaError> {
    non_blank_answers(payload)
        .into_iter()
        .next()
        .ok_or_else(|| SchemaError::new("payload.correct_answers", message))
}

fn check_options(payload: &CardPayload) -> Result<HashSet<&str>, SchemaError> {
    let options = payload.options.as_deref().unwrap_or(&[]);
    if options.len() < 2 {
        return Err(SchemaError::new(
            "payload.options",
            format!("at least two options are required, found {}", options.len()),
        ));
    }
    let mut ids = HashSet::new();
    for (i, option) in options.iter().enumerate() {
        if is_blank(&option.id) {
            return Err(SchemaError::new(format!("payload.options[{i}].id"), "must not be blank"));
        }
        if is_blank(&option.text) {
            return Err(SchemaError::new(format!("payload.options[{i}].text"), "must not be blank"));
        }
        if !ids.insert(option.id.trim()) {
            return Err(SchemaError::new(
                format!("payload.options[{i}].id"),
                format!("duplicate option id {:?}", option.id),
            ));
        }
    }
    Ok(ids)
}

fn check_emq(payload: &CardPayload) -> Result<Vec<EmqMatch>, SchemaError> {
    check_options(payload)?;
    let options = payload.options.as_deref().unwrap_or(&[]);
    let premises = payload.connections.iter().filter(|p| !is_blank(p)).count();
    if premises == 0 {
        return Err(SchemaError::new("payload.connections", "at least one premise is required"));
    }
    if payload.correct_answers.len() != premises {
        return Err(SchemaError::new(
            "payload.correct_answers",
            format!(
                "one match per premise is required ({} premises, {} matches)",
                premises,
                payload.correct_answers.len()
            ),
        ));
    }

    payload
        .correct_answers
        .iter()
        .enumerate()
        .map(|(premise_index, answer)| {
            let answer = answer.trim();
            let option_index = match answer.parse::<usize>() {
                Ok(index) => Some(index),
                Err(_) => options.iter().position(|o| o.id.trim() == answer),
            };
            match option_index {
                Some(option_index) if option_index < options.len() => Ok(EmqMatch {
                    premise_index,
                    option_index,
                }),
                _ => Err(SchemaError::new(
                    format!("payload.correct_answers[{premise_index}]"),
                    format!("{answer:?} is not a valid option index"),
                )),
            }
        })
        .collect()
}

/// JSON schema of the response document the model must return
pub fn response_schema() -> Value {
    let card_types: Vec<&str> = CardType::ALL.iter().map(CardType::as_str).collect();
    json!({
        "type": "object",
        "required": ["cards"],
        "properties": {
            "cards": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["card_type", "difficulty", "payload"],
                    "properties": {
                        "card_type": { "type": "string", "enum": card_types },
                        "difficulty": { "type": "integer", "minimum": 1, "maximum": 5 },
                        "payload": {
                            "type": "object",
                            "required": ["question", "rationale"],
                            "properties": {
                                "question": { "type": "string" },
                                "options": {
                                    "type": "array",
                                    "items": {
                                        "type": "object",
                                        "required": ["id", "text"],
                                        "properties": {
                                            "id": { "type": "string" },
                                            "text": { "type": "string" }
                                        }
                                    }
                                },
                                "correct_answers": { "type": "array", "items": { "type": "string" } },
                                "rationale": {
                                    "type": "object",
                                    "required": ["primary"],
                                    "properties": {
                                        "primary": { "type": "string" },
                                        "alternatives": {
                                            "type": "object",
                                            "additionalProperties": { "type": "string" }
                                        }
                                    }
                                },
                                "connections": { "type": "array", "items": { "type": "string" } },
                                "glossary": {
                                    "type": "object",
                                    "additionalProperties": { "type": "string" }
                                },
                                "numerical_ranges": { "type": "array", "items": { "type": "string" } },
                                "references": { "type": "array", "items": { "type": "string" } }
                            }
                        }
                    }
                }
            },
            "retention_aid": {
                "type": "object",
                "required": ["markdown"],
                "properties": { "markdown": { "type": "string" } }
            }
        }
    })
}
