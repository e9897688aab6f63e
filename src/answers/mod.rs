//! Student answer reconciliation
//!
//! Answers come from up to three sources: the structured payload submitted
//! with the exam, a local scan of the submission text, and an AI pass over
//! the same text. Each source yields `StudentAnswerEntry` records which are
//! merged per question without ever discarding a populated field.

pub mod alias;
pub mod reconciler;
pub mod structured;
pub mod text;

use serde::{Deserialize, Serialize};

use crate::exam::ParsedQuestion;

pub use reconciler::AnswerReconciler;
pub use structured::StructuredAnswer;

/// One student's answer to one question, as far as it is known
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAnswerEntry {
    /// 0-based position in the exam's question set
    pub question_index: Option<usize>,
    pub question_text: Option<String>,
    pub answer_text: Option<String>,
    pub choice_letter: Option<String>,
    /// The value this entry was read from
    #[serde(default)]
    pub raw_value: serde_json::Value,
}

fn is_blank(field: &Option<String>) -> bool {
    field.as_deref().map_or(true, |s| s.trim().is_empty())
}

fn fill(slot: &mut Option<String>, incoming: &Option<String>) {
    if is_blank(slot) && !is_blank(incoming) {
        *slot = incoming.clone();
    }
}

impl StudentAnswerEntry {
    pub fn has_answer(&self) -> bool {
        !is_blank(&self.answer_text) || !is_blank(&self.choice_letter)
    }

    /// Copy fields from `other` into the ones still empty here.
    pub fn merge_from(&mut self, other: &StudentAnswerEntry) {
        if self.question_index.is_none() {
            self.question_index = other.question_index;
        }
        fill(&mut self.question_text, &other.question_text);
        fill(&mut self.answer_text, &other.answer_text);
        fill(&mut self.choice_letter, &other.choice_letter);
        if self.raw_value.is_null() {
            self.raw_value = other.raw_value.clone();
        }
    }

    fn trimmed_question(&self) -> Option<&str> {
        self.question_text
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
    }
}

/// Index of the question an entry refers to.
///
/// An explicit index wins when it is in range; otherwise the question text
/// must equal one question's text exactly (after trimming).
pub fn resolve_index(entry: &StudentAnswerEntry, questions: &[ParsedQuestion]) -> Option<usize> {
    if let Some(index) = entry.question_index {
        if questions.is_empty() || index < questions.len() {
            return Some(index);
        }
    }
    let text = entry.trimmed_question()?;
    questions
        .iter()
        .position(|q| q.question_text.trim() == text)
}

/// Merge entries from all sources, in priority order.
///
/// Entries meet first by resolved index, then by identical question text.
/// Output: indexed entries ascending, then the unmatched ones in arrival order.
pub fn merge_entries<I>(entries: I, questions: &[ParsedQuestion]) -> Vec<StudentAnswerEntry>
where
    I: IntoIterator<Item = StudentAnswerEntry>,
{
    let mut merged: Vec<StudentAnswerEntry> = Vec::new();

    for mut entry in entries {
        entry.question_index = resolve_index(&entry, questions);

        let existing = match entry.question_index {
            Some(index) => merged
                .iter()
                .position(|e| e.question_index == Some(index))
                .or_else(|| {
                    let text = entry.trimmed_question()?;
                    merged.iter().position(|e| {
                        e.question_index.is_none() && e.trimmed_question() == Some(text)
                    })
                }),
            None => entry.trimmed_question().and_then(|text| {
                merged
                    .iter()
                    .position(|e| e.trimmed_question() == Some(text))
            }),
        };

        match existing {
            Some(pos) => merged[pos].merge_from(&entry),
            None => merged.push(entry),
        }
    }

    let (mut indexed, unmatched): (Vec<_>, Vec<_>) = merged
        .into_iter()
        .partition(|e| e.question_index.is_some());
    indexed.sort_by_key(|e| e.question_index);
    indexed.extend(unmatched);
    indexed
}

/// Fill the missing half of a (letter, text) pair from the question's options.
pub fn resolve_choice(entry: &mut StudentAnswerEntry, question: &ParsedQuestion) {
    if question.options.is_empty() {
        return;
    }
    if is_blank(&entry.answer_text) {
        if let Some(option) = entry
            .choice_letter
            .as_deref()
            .and_then(alias::index_for)
            .and_then(|i| question.options.get(i))
        {
            entry.answer_text = Some(option.clone());
        }
    } else if is_blank(&entry.choice_letter) {
        let answer = entry.answer_text.as_deref().map(alias::normalize);
        entry.choice_letter = question
            .options
            .iter()
            .position(|o| Some(alias::normalize(o)) == answer)
            .and_then(alias::letter_for);
    }
}
