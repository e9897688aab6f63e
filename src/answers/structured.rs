//! Structured answer payloads
//!
//! The payload submitted alongside a student's PDF has no fixed schema. It is
//! read into one of four shapes and each shape is normalized into entries.

use serde_json::{Map, Value};

use super::alias;
use super::StudentAnswerEntry;

/// Field names carrying the answer text, in preference order
const ANSWER_FIELDS: &[&str] = &[
    "answer",
    "response",
    "value",
    "text",
    "answerText",
    "answer_text",
    "selectedAnswer",
    "selectedOption",
    "selected",
];

/// Field names carrying a choice letter
const CHOICE_FIELDS: &[&str] = &["choice", "letter", "choiceLetter", "choice_letter", "option"];

/// Integer option positions, converted to letters
const OPTION_INDEX_FIELDS: &[&str] = &["optionIndex", "option_index", "selectedIndex"];

/// 0-based question positions
const INDEX_FIELDS: &[&str] = &["questionIndex", "question_index", "index"];

/// 1-based question numbers
const NUMBER_FIELDS: &[&str] = &["questionNumber", "question_number", "number"];

const QUESTION_FIELDS: &[&str] = &["question", "questionText", "question_text"];

/// Wrapper keys some clients nest the real payload under
const WRAPPER_FIELDS: &[&str] = &["answers", "responses"];

#[derive(Debug, Clone, PartialEq)]
pub enum StructuredAnswer {
    /// `[entry, entry, ...]`, positional
    List(Vec<Value>),
    /// `{"0": entry, "1": entry}`
    ByIndex(Vec<(usize, Value)>),
    /// `{"What is 2+2?": entry}`
    ByQuestion(Vec<(String, Value)>),
    /// A bare value answering a single question
    Scalar(Value),
}

impl StructuredAnswer {
    /// Read a raw payload. Non-JSON text is a scalar; blank input is `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => Self::from_value(value),
            Err(_) => Some(StructuredAnswer::Scalar(Value::String(raw.to_string()))),
        }
    }

    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Array(items) => Some(StructuredAnswer::List(items)),
            Value::Object(mut map) => {
                if let Some(inner) = take_wrapper(&mut map) {
                    return Self::from_value(inner);
                }
                if looks_like_entry(&map) {
                    return Some(StructuredAnswer::List(vec![Value::Object(map)]));
                }
                let keys_are_indexes = !map.is_empty()
                    && map.keys().all(|k| k.trim().parse::<usize>().is_ok());
                if keys_are_indexes {
                    let mut items: Vec<(usize, Value)> = map
                        .into_iter()
                        .filter_map(|(k, v)| k.trim().parse().ok().map(|i| (i, v)))
                        .collect();
                    items.sort_by_key(|(i, _)| *i);
                    Some(StructuredAnswer::ByIndex(items))
                } else {
                    Some(StructuredAnswer::ByQuestion(map.into_iter().collect()))
                }
            }
            scalar => Some(StructuredAnswer::Scalar(scalar)),
        }
    }

    /// Normalize into entries, keeping positional and keyed context.
    pub fn into_entries(self) -> Vec<StudentAnswerEntry> {
        match self {
            StructuredAnswer::List(items) => items
                .into_iter()
                .enumerate()
                .filter_map(|(i, v)| entry_from_value(v, Some(i), None))
                .collect(),
            StructuredAnswer::ByIndex(items) => items
                .into_iter()
                .filter_map(|(i, v)| entry_from_value(v, Some(i), None))
                .collect(),
            StructuredAnswer::ByQuestion(items) => items
                .into_iter()
                .filter_map(|(q, v)| entry_from_value(v, None, Some(q)))
                .collect(),
            StructuredAnswer::Scalar(value) => {
                entry_from_value(value, Some(0), None).into_iter().collect()
            }
        }
    }
}

/// Parse and normalize a raw payload in one step.
pub fn entries_from_payload(raw: &str) -> Vec<StudentAnswerEntry> {
    StructuredAnswer::parse(raw)
        .map(StructuredAnswer::into_entries)
        .unwrap_or_default()
}

fn take_wrapper(map: &mut Map<String, Value>) -> Option<Value> {
    if map.len() != 1 {
        return None;
    }
    let key = WRAPPER_FIELDS.iter().find(|k| map.contains_key(**k))?;
    match map.get(*key) {
        Some(Value::Array(_)) | Some(Value::Object(_)) => map.remove(*key),
        _ => None,
    }
}

fn looks_like_entry(map: &Map<String, Value>) -> bool {
    [
        ANSWER_FIELDS,
        CHOICE_FIELDS,
        OPTION_INDEX_FIELDS,
        INDEX_FIELDS,
        NUMBER_FIELDS,
        QUESTION_FIELDS,
    ]
    .iter()
    .flat_map(|fields| fields.iter())
    .any(|f| map.contains_key(*f))
}

/// Scalars as text; containers are not answers.
fn scalar_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn first_text(map: &Map<String, Value>, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|f| map.get(*f).and_then(scalar_text))
}

fn first_uint(map: &Map<String, Value>, fields: &[&str]) -> Option<usize> {
    fields.iter().find_map(|f| match map.get(*f)? {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Build one entry from a payload value.
///
/// `position` is the index implied by where the value sat; an explicit index
/// or question number inside an object takes precedence.
pub fn entry_from_value(
    value: Value,
    position: Option<usize>,
    question: Option<String>,
) -> Option<StudentAnswerEntry> {
    let mut entry = StudentAnswerEntry {
        question_index: position,
        question_text: question.filter(|q| !q.trim().is_empty()),
        ..Default::default()
    };

    match &value {
        Value::Null | Value::Array(_) => return None,
        Value::Object(map) => {
            if let Some(index) = first_uint(map, INDEX_FIELDS) {
                entry.question_index = Some(index);
            } else if let Some(number) = first_uint(map, NUMBER_FIELDS) {
                entry.question_index = number.checked_sub(1);
            }
            if let Some(q) = first_text(map, QUESTION_FIELDS) {
                entry.question_text = Some(q);
            }

            let (letter, text) = first_text(map, ANSWER_FIELDS)
                .map(|a| alias::split_choice(&a))
                .unwrap_or((None, None));
            let (choice, choice_text) = first_text(map, CHOICE_FIELDS)
                .map(|c| alias::split_choice(&c))
                .unwrap_or((None, None));
            entry.answer_text = text.or(choice_text);
            entry.choice_letter = choice
                .or_else(|| first_uint(map, OPTION_INDEX_FIELDS).and_then(alias::letter_for))
                .or(letter);
        }
        scalar => {
            let (letter, text) = scalar_text(scalar)
                .map(|a| alias::split_choice(&a))
                .unwrap_or((None, None));
            entry.answer_text = text;
            entry.choice_letter = letter;
        }
    }

    entry.raw_value = value;
    Some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_list_of_objects_with_field_variants() {
        let entries = entries_from_payload(
            r#"[
                {"answer": "4"},
                {"response": "Mass attracts mass"},
                {"selectedOption": "C. Rome"},
                {"optionIndex": 1},
                {"letter": "d)"}
            ]"#,
        );
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].question_index, Some(0));
        assert_eq!(entries[0].answer_text.as_deref(), Some("4"));
        assert_eq!(entries[1].answer_text.as_deref(), Some("Mass attracts mass"));
        assert_eq!(entries[2].choice_letter.as_deref(), Some("C"));
        assert_eq!(entries[2].answer_text.as_deref(), Some("Rome"));
        assert_eq!(entries[3].choice_letter.as_deref(), Some("B"));
        assert_eq!(entries[3].answer_text, None);
        assert_eq!(entries[4].choice_letter.as_deref(), Some("D"));
        assert_eq!(entries[4].question_index, Some(4));
    }

    #[test]
    fn test_list_of_scalars() {
        let entries = entries_from_payload(r#"["B", "Gravity", null, 7]"#);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].choice_letter.as_deref(), Some("B"));
        assert_eq!(entries[1].answer_text.as_deref(), Some("Gravity"));
        assert_eq!(entries[2].question_index, Some(3));
        assert_eq!(entries[2].answer_text.as_deref(), Some("7"));
    }

    #[test]
    fn test_explicit_index_and_number_override_position() {
        let entries = entries_from_payload(
            r#"[{"questionNumber": 3, "answer": "x"}, {"questionIndex": "0", "choice": "A"}]"#,
        );
        assert_eq!(entries[0].question_index, Some(2));
        assert_eq!(entries[1].question_index, Some(0));
        assert_eq!(entries[1].choice_letter.as_deref(), Some("A"));
    }

    #[test]
    fn test_object_keyed_by_index() {
        let parsed = StructuredAnswer::parse(r#"{"1": "B", "0": {"value": "4"}}"#).unwrap();
        assert!(matches!(parsed, StructuredAnswer::ByIndex(_)));
        let entries = parsed.into_entries();
        assert_eq!(entries[0].question_index, Some(0));
        assert_eq!(entries[0].answer_text.as_deref(), Some("4"));
        assert_eq!(entries[1].question_index, Some(1));
        assert_eq!(entries[1].choice_letter.as_deref(), Some("B"));
    }

    #[test]
    fn test_object_keyed_by_question() {
        let parsed = StructuredAnswer::parse(r#"{"What is 2+2?": "4"}"#).unwrap();
        assert!(matches!(parsed, StructuredAnswer::ByQuestion(_)));
        let entries = parsed.into_entries();
        assert_eq!(entries[0].question_index, None);
        assert_eq!(entries[0].question_text.as_deref(), Some("What is 2+2?"));
        assert_eq!(entries[0].answer_text.as_deref(), Some("4"));
    }

    #[test]
    fn test_single_entry_object_and_wrapper() {
        let single = entries_from_payload(r#"{"question": "What is 2+2?", "answer": "4"}"#);
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].question_text.as_deref(), Some("What is 2+2?"));

        let wrapped = entries_from_payload(r#"{"answers": [{"answer": "4"}, {"answer": "B"}]}"#);
        assert_eq!(wrapped.len(), 2);
        assert_eq!(wrapped[1].choice_letter.as_deref(), Some("B"));
    }

    #[test]
    fn test_scalars_and_blank() {
        assert_eq!(StructuredAnswer::parse("  "), None);
        assert_eq!(StructuredAnswer::parse("null"), None);

        let entries = entries_from_payload("B");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].question_index, Some(0));
        assert_eq!(entries[0].choice_letter.as_deref(), Some("B"));
        assert_eq!(entries[0].raw_value, json!("B"));
    }
}
