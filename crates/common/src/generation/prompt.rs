//! Prompt assembly
//!
//! Builds the instruction and context payload for one attempt. Assembly is
//! deterministic: the same inputs always give the same payload. Sampling settings
//! travel alongside the payload but never change its text.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::pdf::DocumentContext;
use super::schema::{response_schema, ValidRequest};
use super::types::CardSummary;

pub const SYSTEM_INSTRUCTION: &str = "\
You are ZiStudy's senior clinical educator. Generate high-yield study materials that maximise exam performance for advanced medical learners.

Core objectives:
- Prioritise essential topics and clinical presentations that are repeatedly examined.
- Write multi-layered cases that probe differential diagnosis, pathophysiology, investigations, management and follow-up.
- Demand clinical reasoning and connections across organ systems, guidelines and current evidence.

Content guidelines:
- Obey the JSON schema supplied with each request and populate every field thoughtfully.
- For question cards, write concise, information-dense stems with realistic vitals and labs where relevant.
- Explain in `rationale.alternatives` why each distractor is wrong, and surface pitfalls in `connections`.
- Annotate numeric values with an accepted range in `numerical_ranges` and define uncommon terms in `glossary`.
- Integrate supplied documents directly into the teaching points.
- Render the retention aid as expressive Markdown (headings, tables, mnemonics).

Safety and integrity:
- Never fabricate laboratory reference ranges; note variability when relevant.
- When sources conflict or are insufficient, say so and suggest follow-up reading in `connections`.";

/// One part of the user message sent to the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// Base64 document or image bytes
    InlineData { mime_type: String, data: String },
    /// Reference to a file previously uploaded to the provider
    FileData { mime_type: String, file_uri: String },
}

/// Everything one model invocation needs
#[derive(Debug, Clone, PartialEq)]
pub struct PromptPayload {
    pub system_instruction: String,
    pub parts: Vec<ContentPart>,
    pub requested_count: u32,
    pub model: String,
    pub temperature: f32,
}

impl PromptPayload {
    /// Text parts verbatim; inline document bytes replaced by a size marker
    pub fn snapshot(&self) -> Value {
        let parts: Vec<Value> = self
            .parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({ "kind": "text", "text": text }),
                ContentPart::InlineData { mime_type, data } => json!({
                    "kind": "inline_data",
                    "mime_type": mime_type,
                    "data": format!("<{} base64 chars omitted>", data.len()),
                }),
                ContentPart::FileData { mime_type, file_uri } => json!({
                    "kind": "file_data",
                    "mime_type": mime_type,
                    "file_uri": file_uri,
                }),
            })
            .collect();

        json!({
            "system_instruction": self.system_instruction,
            "model": self.model,
            "temperature": self.temperature,
            "requested_count": self.requested_count,
            "parts": parts,
        })
    }

    /// Concatenated text parts
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Per-attempt inputs to the assembler
#[derive(Debug, Clone, Copy)]
pub struct AttemptDirective<'a> {
    /// Cards to ask for in this attempt (the current shortfall)
    pub requested: u32,
    /// Why the previous attempt fell short, if it did
    pub feedback: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct PromptAssembler {
    schema_json: String,
}

impl Default for PromptAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptAssembler {
    pub fn new() -> Self {
        let schema_json = serde_json::to_string_pretty(&response_schema())
            .unwrap_or_else(|_| response_schema().to_string());
        Self { schema_json }
    }

    /// Assemble the payload for one attempt
    ///
    /// `prior_cards` are the caller-supplied existing cards; `run_cards` are the cards
    /// already accepted earlier in this job. Both are rendered as compact summaries.
    pub fn build(
        &self,
        request: &ValidRequest,
        documents: &DocumentContext,
        prior_cards: &[CardSummary],
        run_cards: &[CardSummary],
        directive: AttemptDirective<'_>,
    ) -> PromptPayload {
        let mut parts = Vec::with_capacity(documents.parts.len() + 3);

        let instructions = self.render_instructions(request, directive);
        parts.push(ContentPart::Text {
            text: format!(
                "{}\n\nReturn a JSON document that matches the following schema:\n```json\n{}\n```",
                instructions, self.schema_json
            ),
        });

        parts.extend(documents.parts.iter().cloned());

        if !prior_cards.is_empty() {
            parts.push(ContentPart::Text {
                text: render_section("Existing cards to avoid repeating:", prior_cards),
            });
        }
        if !run_cards.is_empty() {
            parts.push(ContentPart::Text {
                text: render_section("Cards already generated in this run (do not repeat):", run_cards),
            });
        }

        PromptPayload {
            system_instruction: SYSTEM_INSTRUCTION.to_string(),
            parts,
            requested_count: directive.requested,
            model: request.model.clone(),
            temperature: request.temperature,
        }
    }

    fn render_instructions(&self, valid: &ValidRequest, directive: AttemptDirective<'_>) -> String {
        let request = &valid.request;
        let mut lines = Vec::new();

        lines.push(format!(
            "Generate {} additional exam-ready study cards.",
            directive.requested
        ));
        lines.push(format!(
            "Difficulty profile: {}.",
            request.difficulty_profile.as_str()
        ));
        if !request.preferred_card_types.is_empty() {
            let joined = request
                .preferred_card_types
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("Allowed card types: {}.", joined));
        }
        push_list(&mut lines, "Topics of emphasis:", &request.topics);
        push_list(&mut lines, "Clinical focus areas:", &request.clinical_focus);
        push_list(&mut lines, "Learning objectives:", &request.learning_objectives);
        if let Some(level) = request.learner_level.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
            lines.push(format!("Learner level: {}. Adapt nuance accordingly.", level));
        }
        if let Some(hints) = request.context_hints.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
            lines.push("Additional priorities:".to_string());
            lines.push(hints.to_string());
        }
        if request.include_retention_aid {
            lines.push(
                "Include a retention aid that uses expressive markdown with headings and emphasised cues."
                    .to_string(),
            );
        }
        lines.push("Return only JSON matching the enforced schema.".to_string());
        lines.push("Do not duplicate any card listed in the context, and do not repeat cards within this response.".to_string());
        if let Some(feedback) = directive.feedback {
            lines.push(format!("Previous feedback: {}", feedback));
        }

        lines.join("\n")
    }
}

fn push_list(lines: &mut Vec<String>, heading: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    lines.push(heading.to_string());
    lines.extend(items.iter().map(|item| format!("- {}", item)));
}

fn render_section(heading: &str, cards: &[CardSummary]) -> String {
    let mut buffer = vec![heading.to_string()];
    buffer.extend(cards.iter().map(CardSummary::render));
    buffer.join("\n")
}
