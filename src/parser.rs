//! Question parser
//!
//! Raw exam text in, normalized `ParsedQuestion` records out. Output the AI
//! service returns as something other than JSON questions is passed through
//! as text instead of failing the job.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::ai::AiClient;
use crate::error::Result;
use crate::exam::{ExamRepository, ParsedQuestion};

pub const PARSE_PROMPT: &str = r#"You are an exam PDF parser receiving raw extracted PDF text. Return a JSON array. Each element MUST be an object with:
{
  "type": "multiple-choice" | "theory",
  "question": "<exact question text>",
  "options": ["<option 1>", "<option 2>", ...],
  "answer": "<exact answer text>"
}
Rules:
- Detect the question type accurately.
- Do NOT paraphrase or modify any part of the question, options, or answer.
- For theory questions, never invent answers; include "answer" only when it appears verbatim in the source.
- Remove any leading or trailing whitespace from all text.
- Remove duplicate options if shown in the source.
- If no questions are present, return an empty array.
Return ONLY the JSON array, no markdown fences, no extra text."#;

/// Result of one parse
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Questions(Vec<ParsedQuestion>),
    /// Cleaned AI output that did not decode into questions
    Degraded(String),
}

impl ParseOutcome {
    /// Job result value: the question array, or the raw text as a string.
    pub fn into_value(self) -> Value {
        match self {
            ParseOutcome::Questions(questions) => {
                serde_json::to_value(questions).unwrap_or(Value::Null)
            }
            ParseOutcome::Degraded(raw) => Value::String(raw),
        }
    }
}

/// Strip markdown fences and comma-only lines left over by the model
pub fn clean_response(raw: &str) -> String {
    let mut text = String::with_capacity(raw.len());
    let mut rest = raw;
    // "```json" in any case, then bare fences
    while let Some(pos) = rest.to_ascii_lowercase().find("```json") {
        text.push_str(&rest[..pos]);
        rest = &rest[pos + "```json".len()..];
    }
    text.push_str(rest);
    let text = text.replace("```", "");

    text.trim()
        .lines()
        .filter(|line| line.trim() != ",")
        .collect::<Vec<_>>()
        .join("\n")
}

/// Decode cleaned output: an array of questions, or a single question object.
pub fn decode(cleaned: &str) -> ParseOutcome {
    let questions = match serde_json::from_str::<Value>(cleaned) {
        Ok(value @ Value::Array(_)) => serde_json::from_value::<Vec<ParsedQuestion>>(value).ok(),
        Ok(value @ Value::Object(_)) => serde_json::from_value::<ParsedQuestion>(value)
            .ok()
            .map(|q| vec![q]),
        _ => None,
    };
    match questions {
        Some(questions) => ParseOutcome::Questions(questions),
        None => ParseOutcome::Degraded(cleaned.to_string()),
    }
}

pub struct QuestionParser {
    ai: AiClient,
    exams: Arc<dyn ExamRepository>,
}

impl QuestionParser {
    pub fn new(ai: AiClient, exams: Arc<dyn ExamRepository>) -> Self {
        Self { ai, exams }
    }

    /// Parse `raw_text` and, on success, replace the exam's question set.
    pub async fn parse(&self, exam_key: &str, raw_text: &str) -> Result<ParseOutcome> {
        let response = self.ai.generate(&[PARSE_PROMPT, raw_text]).await?;
        let outcome = decode(&clean_response(&response));

        match &outcome {
            ParseOutcome::Questions(questions) => {
                debug!("Updating exam {} with {} parsed questions", exam_key, questions.len());
                if self.exams.replace_question_set(exam_key, questions).await? {
                    info!("Stored {} questions for exam {}", questions.len(), exam_key);
                } else {
                    warn!("Exam {} not found; parsed questions were not stored", exam_key);
                }
            }
            ParseOutcome::Degraded(raw) => {
                warn!(
                    "AI returned non-question output for exam {} ({} chars); returning raw",
                    exam_key,
                    raw.len()
                );
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exam::Exam;
    use crate::retry::RetryPolicy;
    use crate::testing::{MemoryExamRepository, ScriptedGenerator};

    fn parser(generator: Arc<ScriptedGenerator>, exams: Arc<MemoryExamRepository>) -> QuestionParser {
        let ai = AiClient::new(generator).with_retry(RetryPolicy::immediate(3));
        QuestionParser::new(ai, exams)
    }

    #[test]
    fn test_clean_response_strips_fences_and_commas() {
        let raw = "```JSON\n[\n{\"type\": \"theory\", \"question\": \"Q\"}\n,\n]\n```";
        assert_eq!(
            clean_response(raw),
            "[\n{\"type\": \"theory\", \"question\": \"Q\"}\n]"
        );
        assert_eq!(clean_response("  not json  "), "not json");
    }

    #[test]
    fn test_decode_single_object_and_garbage() {
        let single = decode(r#"{"type": "theory", "question": "Explain gravity."}"#);
        assert_eq!(
            single,
            ParseOutcome::Questions(vec![ParsedQuestion::theory("Explain gravity.")])
        );
        assert_eq!(
            decode(r#"{"unexpected": true}"#),
            ParseOutcome::Degraded(r#"{"unexpected": true}"#.into())
        );
        assert_eq!(decode("[]"), ParseOutcome::Questions(vec![]));
    }

    #[tokio::test]
    async fn test_parse_replaces_question_set() {
        let exams = Arc::new(MemoryExamRepository::default());
        let mut exam = Exam::new("MTH101", "Maths");
        exam.question_set = vec![ParsedQuestion::theory("Old question")];
        exams.insert(exam);

        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_ok(
            "```json\n[{\"type\": \"multiple-choice\", \"question\": \"What is 2+2?\", \"options\": [\"1\", \"4\"], \"answer\": \"4\"}]\n```",
        );

        let outcome = parser(generator.clone(), exams.clone())
            .parse("MTH101", "Question 1) What is 2+2? A. 1 B. 4")
            .await
            .unwrap();

        let expected = vec![ParsedQuestion::multiple_choice("What is 2+2?", &["1", "4"], Some("4"))];
        assert_eq!(outcome, ParseOutcome::Questions(expected.clone()));
        assert_eq!(exams.get("MTH101").unwrap().question_set, expected);
        assert_eq!(generator.calls()[0][0], PARSE_PROMPT);
    }

    #[tokio::test]
    async fn test_non_json_is_returned_as_is() {
        let exams = Arc::new(MemoryExamRepository::default());
        let mut exam = Exam::new("MTH101", "Maths");
        exam.question_set = vec![ParsedQuestion::theory("Kept")];
        exams.insert(exam);

        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_ok("not json");

        let outcome = parser(generator, exams.clone())
            .parse("MTH101", "some text")
            .await
            .unwrap();
        assert_eq!(outcome.clone().into_value(), Value::String("not json".into()));
        assert_eq!(outcome, ParseOutcome::Degraded("not json".into()));
        assert_eq!(
            exams.get("MTH101").unwrap().question_set,
            vec![ParsedQuestion::theory("Kept")]
        );
    }

    #[tokio::test]
    async fn test_unknown_exam_still_returns_questions() {
        let exams = Arc::new(MemoryExamRepository::default());
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_ok("[]");

        let outcome = parser(generator, exams).parse("NOPE", "text").await.unwrap();
        assert_eq!(outcome, ParseOutcome::Questions(vec![]));
    }
}
