//! Candidate card builders shared by pipeline tests

use serde_json::{json, Value};

pub fn mcq_single(question: &str) -> Value {
    json!({
        "card_type": "mcq_single",
        "difficulty": 3,
        "payload": {
            "question": question,
            "options": [
                { "id": "A", "text": "Altered mentation, RR >= 22, SBP <= 100" },
                { "id": "B", "text": "Fever, tachycardia, leukocytosis" },
                { "id": "C", "text": "Lactate > 4 mmol/L" }
            ],
            "correct_answers": ["A"],
            "rationale": {
                "primary": "qSOFA scores mentation, respiratory rate and systolic pressure.",
                "alternatives": { "B": "These are SIRS criteria." }
            },
            "connections": ["SOFA score"],
            "numerical_ranges": ["RR >= 22/min"]
        }
    })
}

pub fn written(question: &str, answer: &str) -> Value {
    json!({
        "card_type": "written",
        "difficulty": 2,
        "payload": {
            "question": question,
            "correct_answers": [answer],
            "rationale": { "primary": "Core definition." }
        }
    })
}

pub fn emq(question: &str, premises: &[&str], answers: &[&str]) -> Value {
    json!({
        "card_type": "emq",
        "difficulty": 4,
        "payload": {
            "question": question,
            "options": [
                { "id": "A", "text": "Streptococcus pyogenes" },
                { "id": "B", "text": "Neisseria meningitidis" },
                { "id": "C", "text": "Escherichia coli" }
            ],
            "connections": premises,
            "correct_answers": answers,
            "rationale": { "primary": "Classic organism associations." },
            "references": ["Choose the most likely organism for each presentation."]
        }
    })
}

pub fn note(markdown: &str) -> Value {
    json!({
        "card_type": "note",
        "difficulty": 1,
        "payload": {
            "question": "",
            "rationale": { "primary": markdown }
        }
    })
}

/// `count` distinct single-choice candidates, numbered from `start`
pub fn distinct_cards(start: usize, count: usize) -> Vec<Value> {
    (start..start + count)
        .map(|i| mcq_single(&format!("Sepsis question {i}?")))
        .collect()
}

/// A raw model response document holding `cards`
pub fn response(cards: Vec<Value>) -> String {
    json!({ "cards": cards }).to_string()
}

/// A response document with a retention aid attached
pub fn response_with_aid(cards: Vec<Value>, markdown: &str) -> String {
    json!({ "cards": cards, "retention_aid": { "markdown": markdown } }).to_string()
}
