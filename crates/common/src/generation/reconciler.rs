//! Response reconciliation
//!
//! Accumulates accepted candidates across the attempts of one job. Every raw
//! response is repaired if needed, parsed, validated candidate by candidate and
//! deduplicated. Accepted cards are carried forward untouched; only the shortfall
//! is asked for again.

use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

use super::error::ReconcileError;
use super::schema::{normalize_prompt, validate_candidate, GeneratedCard};
use super::types::{AttemptOutcome, CardSummary, CardType};

/// What one attempt contributed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    pub outcome: AttemptOutcome,
    /// Candidates accepted from this response
    pub accepted: u32,
    /// Candidates that failed validation or duplicated an earlier card
    pub rejected: u32,
    /// Valid candidates beyond the target, dropped in model order
    pub surplus: u32,
    pub reasons: Vec<String>,
}

impl AttemptReport {
    /// Feedback for the next attempt, naming what went wrong
    pub fn feedback(&self, shortfall: u32) -> String {
        let mut text = format!(
            "Received {} new card(s); {} additional distinct card(s) are still required.",
            self.accepted, shortfall
        );
        if !self.reasons.is_empty() {
            let shown: Vec<&str> = self.reasons.iter().take(5).map(String::as_str).collect();
            text.push_str(&format!(" Rejected: {}.", shown.join("; ")));
        }
        text
    }
}

/// Final set of cards handed to the persister
#[derive(Debug, Clone)]
pub struct AcceptedBatch {
    pub cards: Vec<GeneratedCard>,
    pub retention_aid: Option<String>,
    pub requested: u32,
    pub attempts: u32,
}

impl AcceptedBatch {
    pub fn is_partial(&self) -> bool {
        (self.cards.len() as u32) < self.requested
    }
}

#[derive(Debug)]
pub struct ResponseReconciler {
    target: u32,
    allowed: Vec<CardType>,
    keep_retention_aid: bool,
    accepted: Vec<GeneratedCard>,
    seen: HashSet<String>,
    retention_aid: Option<String>,
    attempts: u32,
}

impl ResponseReconciler {
    /// `existing_prompts` are the stems of cards the learner already has
    pub fn new<I>(target: u32, allowed: &[CardType], keep_retention_aid: bool, existing_prompts: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            target,
            allowed: allowed.to_vec(),
            keep_retention_aid,
            accepted: Vec::new(),
            seen: existing_prompts
                .into_iter()
                .map(|p| normalize_prompt(&p))
                .filter(|p| !p.is_empty())
                .collect(),
            retention_aid: None,
            attempts: 0,
        }
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn accepted(&self) -> &[GeneratedCard] {
        &self.accepted
    }

    pub fn shortfall(&self) -> u32 {
        self.target.saturating_sub(self.accepted.len() as u32)
    }

    pub fn is_satisfied(&self) -> bool {
        self.shortfall() == 0
    }

    /// Compact summaries of the cards accepted so far in this run
    pub fn summaries(&self) -> Vec<CardSummary> {
        self.accepted.iter().map(|c| c.summary(None)).collect()
    }

    /// Fold one raw model response into the accepted set
    pub fn reconcile(&mut self, raw: &str) -> Result<AttemptReport, ReconcileError> {
        self.attempts += 1;

        let document = repair_json(raw).map_err(|message| ReconcileError::MalformedOutput { message })?;
        let (candidates, aid) = match &document {
            Value::Array(items) => (items.as_slice(), None),
            Value::Object(obj) => {
                let cards = obj
                    .get("cards")
                    .and_then(Value::as_array)
                    .ok_or_else(|| ReconcileError::MalformedOutput {
                        message: "response has no `cards` array".to_string(),
                    })?;
                let aid = obj
                    .get("retention_aid")
                    .and_then(|a| a.get("markdown"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|m| !m.is_empty());
                (cards.as_slice(), aid)
            }
            _ => {
                return Err(ReconcileError::MalformedOutput {
                    message: "response is neither an object nor an array".to_string(),
                })
            }
        };

        let mut report = AttemptReport {
            outcome: AttemptOutcome::InsufficientCount,
            accepted: 0,
            rejected: 0,
            surplus: 0,
            reasons: Vec::new(),
        };
        let mut schema_failures = 0u32;

        for (index, candidate) in candidates.iter().enumerate() {
            match validate_candidate(candidate, &self.allowed) {
                Err(e) => {
                    schema_failures += 1;
                    report.rejected += 1;
                    report.reasons.push(e.at_index(index).to_string());
                }
                Ok(card) => {
                    let key = card.normalized_prompt();
                    if !self.seen.insert(key) {
                        report.rejected += 1;
                        report
                            .reasons
                            .push(format!("cards[{}]: duplicates an earlier or existing card", index));
                    } else if self.is_satisfied() {
                        report.surplus += 1;
                    } else {
                        self.accepted.push(card);
                        report.accepted += 1;
                    }
                }
            }
        }

        if self.keep_retention_aid {
            if let Some(markdown) = aid {
                self.retention_aid = Some(markdown.to_string());
            }
        }

        report.outcome = if self.is_satisfied() {
            AttemptOutcome::Accepted
        } else if schema_failures > 0 {
            AttemptOutcome::SchemaInvalid
        } else {
            AttemptOutcome::InsufficientCount
        };

        debug!(
            attempt = self.attempts,
            candidates = candidates.len(),
            accepted = report.accepted,
            rejected = report.rejected,
            surplus = report.surplus,
            shortfall = self.shortfall(),
            "Reconciled model response"
        );

        Ok(report)
    }

    /// Count an attempt that produced no response (provider failure)
    pub fn record_empty_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Close the run: partial success if anything was accepted
    pub fn finish(self) -> Result<AcceptedBatch, ReconcileError> {
        if self.accepted.is_empty() {
            return Err(ReconcileError::GenerationExhausted {
                attempts: self.attempts,
            });
        }
        Ok(AcceptedBatch {
            cards: self.accepted,
            retention_aid: self.retention_aid,
            requested: self.target,
            attempts: self.attempts,
        })
    }
}

/// Parse model text as JSON, tolerating code fences and surrounding prose
pub fn repair_json(raw: &str) -> Result<Value, String> {
    let trimmed = raw.trim();
    let first_error = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => return Ok(value),
        Err(e) => e.to_string(),
    };

    let unfenced = strip_code_fence(trimmed);
    if let Ok(value) = serde_json::from_str::<Value>(unfenced) {
        return Ok(value);
    }

    let start = unfenced.find(['{', '[']);
    let end = unfenced.rfind(['}', ']']);
    if let (Some(start), Some(end)) = (start, end) {
        if end > start {
            if let Ok(value) = serde_json::from_str::<Value>(&unfenced[start..=end]) {
                return Ok(value);
            }
        }
    }

    Err(format!("response is not valid JSON: {}", first_error))
}

fn strip_code_fence(text: &str) -> &str {
    let Some(open) = text.find("```") else {
        return text;
    };
    let after_open = &text[open + 3..];
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_open[body_start..];
    match body.find("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::fixtures::{self, distinct_cards, response, response_with_aid};
    use serde_json::json;

    fn reconciler(target: u32) -> ResponseReconciler {
        ResponseReconciler::new(target, &[], true, Vec::<String>::new())
    }

    #[test]
    fn test_accepts_up_to_target_in_model_order() {
        let mut r = reconciler(2);
        let report = r.reconcile(&response(distinct_cards(1, 4))).unwrap();
        assert_eq!(report.outcome, AttemptOutcome::Accepted);
        assert_eq!(report.accepted, 2);
        assert_eq!(report.surplus, 2);
        assert_eq!(r.accepted()[0].prompt(), "Sepsis question 1?");
        assert_eq!(r.accepted()[1].prompt(), "Sepsis question 2?");
    }

    #[test]
    fn test_invalid_candidates_are_dropped_individually() {
        let mut r = reconciler(3);
        let mut bad = fixtures::mcq_single("Broken?");
        bad["payload"]["correct_answers"] = json!([]);
        let mut cards = distinct_cards(1, 2);
        cards.insert(1, bad);

        let report = r.reconcile(&response(cards)).unwrap();
        assert_eq!(report.outcome, AttemptOutcome::SchemaInvalid);
        assert_eq!(report.accepted, 2);
        assert_eq!(report.rejected, 1);
        assert!(report.reasons[0].starts_with("schema mismatch at cards[1].payload.correct_answers"));
        assert_eq!(r.shortfall(), 1);
    }

    #[test]
    fn test_duplicates_are_case_and_whitespace_insensitive() {
        let mut r = ResponseReconciler::new(5, &[], true, vec!["what is  QSOFA?".to_string()]);
        let cards = vec![
            fixtures::mcq_single("What is qSOFA?"),
            fixtures::written("Define   sepsis", "x"),
            fixtures::written("define sepsis", "y"),
        ];
        let report = r.reconcile(&response(cards)).unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected, 2);
        assert_eq!(report.outcome, AttemptOutcome::InsufficientCount);

        let again = r.reconcile(&response(vec![fixtures::written("DEFINE SEPSIS", "z")])).unwrap();
        assert_eq!(again.accepted, 0);
        assert_eq!(r.accepted().len(), 1);
    }

    #[test]
    fn test_accepted_cards_carry_forward() {
        let mut r = reconciler(3);
        r.reconcile(&response(distinct_cards(1, 2))).unwrap();
        let first = r.accepted().to_vec();
        r.reconcile(&response(distinct_cards(3, 1))).unwrap();
        assert!(r.is_satisfied());
        assert_eq!(&r.accepted()[..2], first.as_slice());
        assert_eq!(r.attempts(), 2);
    }

    #[test]
    fn test_repairs_fences_prose_and_bare_arrays() {
        let fenced = format!("Here you go:\n```json\n{}\n```", response(distinct_cards(1, 1)));
        assert!(repair_json(&fenced).is_ok());

        let mut r = reconciler(2);
        let bare = serde_json::to_string(&distinct_cards(1, 2)).unwrap();
        let report = r.reconcile(&format!("Sure! {}", bare)).unwrap();
        assert_eq!(report.accepted, 2);
    }

    #[test]
    fn test_malformed_output() {
        let mut r = reconciler(1);
        assert!(matches!(
            r.reconcile("I cannot help with that."),
            Err(ReconcileError::MalformedOutput { .. })
        ));
        assert!(matches!(
            r.reconcile(r#"{"items": []}"#),
            Err(ReconcileError::MalformedOutput { .. })
        ));
        assert_eq!(r.attempts(), 2);
    }

    #[test]
    fn test_latest_retention_aid_is_kept() {
        let mut r = reconciler(2);
        r.reconcile(&response_with_aid(distinct_cards(1, 1), "# First")).unwrap();
        r.reconcile(&response_with_aid(distinct_cards(2, 1), "# Second")).unwrap();
        let batch = r.finish().unwrap();
        assert_eq!(batch.retention_aid.as_deref(), Some("# Second"));
        assert!(!batch.is_partial());
    }

    #[test]
    fn test_retention_aid_dropped_when_not_requested() {
        let mut r = ResponseReconciler::new(1, &[], false, Vec::<String>::new());
        r.reconcile(&response_with_aid(distinct_cards(1, 1), "# Aid")).unwrap();
        assert_eq!(r.finish().unwrap().retention_aid, None);
    }

    #[test]
    fn test_finish_reports_partial_or_exhausted() {
        let mut partial = reconciler(3);
        partial.reconcile(&response(distinct_cards(1, 1))).unwrap();
        let batch = partial.finish().unwrap();
        assert!(batch.is_partial());
        assert_eq!(batch.cards.len(), 1);

        let mut empty = reconciler(3);
        empty.reconcile(&response(vec![])).unwrap();
        empty.record_empty_attempt();
        assert_eq!(
            empty.finish().unwrap_err(),
            ReconcileError::GenerationExhausted { attempts: 2 }
        );
    }

    #[test]
    fn test_feedback_names_shortfall_and_reasons() {
        let report = AttemptReport {
            outcome: AttemptOutcome::SchemaInvalid,
            accepted: 2,
            rejected: 1,
            surplus: 0,
            reasons: vec!["schema mismatch at cards[2].payload.options: too few".into()],
        };
        let text = report.feedback(1);
        assert!(text.starts_with("Received 2 new card(s); 1 additional"));
        assert!(text.contains("cards[2].payload.options"));
    }
}
