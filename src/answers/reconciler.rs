//! Answer reconciler
//!
//! Merge order is structured payload, then the local text scan, then the AI
//! derivation. A later source only fills fields an earlier one left empty.

use serde_json::{json, Value};
use tracing::{debug, warn};

use super::structured::{entries_from_payload, StructuredAnswer};
use super::{merge_entries, resolve_choice, text, StudentAnswerEntry};
use crate::ai::AiClient;
use crate::exam::ParsedQuestion;
use crate::parser::clean_response;

pub const ANSWER_PROMPT: &str = r#"You are reading a student's completed exam. You'll receive the exam's questions as a JSON array and the raw text extracted from the student's submission.
For every question the student answered, return an object:
{
  "questionIndex": <0-based index into the questions array>,
  "question": "<exact question text>",
  "answer": "<the student's answer text, verbatim>",
  "choice": "<the option letter the student picked, if any>"
}
Rules:
- Only report what the student wrote or selected; never infer the correct answer.
- Omit questions the student left blank.
Return ONLY the JSON array, no markdown fences, no extra text."#;

pub struct AnswerReconciler {
    ai: Option<AiClient>,
}

impl AnswerReconciler {
    pub fn new(ai: AiClient) -> Self {
        Self { ai: Some(ai) }
    }

    /// Reconciler that never calls the AI service
    pub fn local_only() -> Self {
        Self { ai: None }
    }

    /// One entry per answered question, indexed entries first.
    pub async fn reconcile(
        &self,
        structured: Option<&str>,
        raw_text: Option<&str>,
        questions: &[ParsedQuestion],
    ) -> Vec<StudentAnswerEntry> {
        let structured_entries = structured
            .filter(|s| !s.trim().is_empty())
            .map(entries_from_payload);
        let raw_text = raw_text.map(str::trim).filter(|t| !t.is_empty());

        let structured_incomplete = match &structured_entries {
            None => true,
            Some(entries) => entries.is_empty() || entries.iter().any(|e| !e.has_answer()),
        };

        let mut entries = structured_entries.unwrap_or_default();
        if let Some(raw) = raw_text {
            let local = text::extract_answers(raw);
            debug!("Local scan found {} answered question(s)", local.len());
            entries.extend(local);
        }
        let mut merged = merge_entries(entries, questions);

        if let Some(raw) = raw_text {
            if structured_incomplete {
                let derived = self.derive_with_ai(raw, questions).await;
                merged = merge_entries(merged.into_iter().chain(derived), questions);
            }
        }

        for entry in &mut merged {
            if let Some(question) = entry.question_index.and_then(|i| questions.get(i)) {
                resolve_choice(entry, question);
            }
        }
        merged
    }

    /// Ask the AI service to read answers out of the raw text. Failures yield nothing.
    async fn derive_with_ai(&self, raw: &str, questions: &[ParsedQuestion]) -> Vec<StudentAnswerEntry> {
        let Some(ai) = &self.ai else {
            return Vec::new();
        };
        let question_list = json!(questions).to_string();
        let response = match ai.generate(&[ANSWER_PROMPT, &question_list, raw]).await {
            Ok(response) => response,
            Err(e) => {
                warn!("AI answer derivation failed, continuing without it: {:#}", e);
                return Vec::new();
            }
        };

        match serde_json::from_str::<Value>(&clean_response(&response)) {
            Ok(value) => StructuredAnswer::from_value(value)
                .map(StructuredAnswer::into_entries)
                .unwrap_or_default(),
            Err(_) => {
                warn!("AI answer derivation returned non-JSON output; ignoring it");
                Vec::new()
            }
        }
    }
}
