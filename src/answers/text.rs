//! Answers read directly from submission text
//!
//! Deterministic scan for the layouts exam PDFs usually come in:
//!
//! ```text
//! Question 1) What is 2 + 2?
//! A. 1
//! B. 4
//! Answer: B
//!
//! Question 2 - Pick a primary colour.
//! [ ] A. Green
//! [x] B. Blue
//! ```

use std::sync::OnceLock;

use regex::Regex;

use super::alias;
use super::StudentAnswerEntry;

fn question_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bquestion\s+(\d+)\s*[).:\-]").expect("question header regex"))
}

fn answer_label() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\banswer\s*:").expect("answer label regex"))
}

/// Option marker, optionally preceded by a checkbox: `A. `, `b) `, `[x] C. `, `☑ D) `
fn option_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|\s)(\[[ xX✓✔]?\]\s*|[☐☒☑]\s*)?([A-H])[.)]\s+").expect("option marker regex")
    })
}

#[derive(Debug, Clone, PartialEq)]
struct BlockOption {
    letter: String,
    text: String,
    checked: bool,
}

fn is_checked(checkbox: &str) -> bool {
    checkbox.contains(&['x', 'X', '✓', '✔', '☒', '☑'][..])
}

/// Question text and options of a block's prompt section
fn split_prompt(prompt: &str) -> (String, Vec<BlockOption>) {
    let markers: Vec<_> = option_marker().captures_iter(prompt).collect();
    let Some(first) = markers.first().and_then(|c| c.get(0)) else {
        return (collapse(prompt), Vec::new());
    };

    let question = collapse(&prompt[..first.start()]);
    let options = markers
        .iter()
        .enumerate()
        .filter_map(|(i, caps)| {
            let whole = caps.get(0)?;
            let end = markers
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map_or(prompt.len(), |m| m.start());
            Some(BlockOption {
                letter: caps[2].to_string(),
                text: collapse(&prompt[whole.end()..end]),
                checked: caps.get(1).is_some_and(|c| is_checked(c.as_str())),
            })
        })
        .collect();
    (question, options)
}

/// Join non-empty trimmed lines with single spaces
fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn option_text(options: &[BlockOption], letter: &str) -> Option<String> {
    options
        .iter()
        .find(|o| o.letter.eq_ignore_ascii_case(letter))
        .map(|o| o.text.clone())
        .filter(|t| !t.is_empty())
}

/// Turn one question block into an entry, if it carries an answer.
fn read_block(number: usize, block: &str) -> Option<StudentAnswerEntry> {
    let (prompt, answer) = match answer_label().find(block) {
        Some(label) => (&block[..label.start()], collapse(&block[label.end()..])),
        None => (block, String::new()),
    };
    let (question, options) = split_prompt(prompt);

    let mut entry = StudentAnswerEntry {
        question_index: number.checked_sub(1),
        question_text: (!question.is_empty()).then_some(question),
        raw_value: serde_json::Value::String(block.trim().to_string()),
        ..Default::default()
    };

    match alias::split_choice(&answer) {
        (Some(letter), text) => {
            entry.answer_text = text.or_else(|| option_text(&options, &letter));
            entry.choice_letter = Some(letter);
        }
        (None, Some(text)) => {
            let norm = alias::normalize(&text);
            entry.choice_letter = options
                .iter()
                .find(|o| alias::normalize(&o.text) == norm)
                .map(|o| o.letter.clone());
            entry.answer_text = Some(text);
        }
        (None, None) => {
            if let Some(ticked) = options.iter().find(|o| o.checked) {
                entry.choice_letter = Some(ticked.letter.clone());
                entry.answer_text = (!ticked.text.is_empty()).then(|| ticked.text.clone());
            }
        }
    }

    entry.has_answer().then_some(entry)
}

/// Extract every answered question block from raw submission text.
pub fn extract_answers(text: &str) -> Vec<StudentAnswerEntry> {
    let headers: Vec<_> = question_header().captures_iter(text).collect();

    headers
        .iter()
        .enumerate()
        .filter_map(|(i, caps)| {
            let header = caps.get(0)?;
            let number: usize = caps[1].parse().ok()?;
            let end = headers
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map_or(text.len(), |m| m.start());
            read_block(number, &text[header.end()..end])
        })
        .collect()
}
