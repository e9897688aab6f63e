//! Choice letters and answer aliases
//!
//! `"B"`, `"B. Paris"` and `"Paris"` all name the same answer once the
//! question's options are known.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

/// "B", "b)", "(B)", "B." on their own
fn lone_letter() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\(?([A-Za-z])\s*[.):]?$").expect("lone letter regex"))
}

/// "B. Paris", "b) Paris", "(B) Paris", "B: Paris"
fn lettered_text() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\(?([A-Za-z])\s*[.):]\s+(\S.*)$").expect("lettered text regex")
    })
}

/// Letter for a 0-based option index (`0 -> "A"`).
pub fn letter_for(index: usize) -> Option<String> {
    (index < 26).then(|| char::from(b'A' + index as u8).to_string())
}

/// 0-based option index for a single letter (`"b" -> 1`).
pub fn index_for(letter: &str) -> Option<usize> {
    let mut chars = letter.trim().chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => {
            Some((c.to_ascii_uppercase() as u8 - b'A') as usize)
        }
        _ => None,
    }
}

/// Split an answer into its choice letter and free text.
///
/// `"B"` -> `(Some("B"), None)`, `"B. Paris"` -> `(Some("B"), Some("Paris"))`,
/// `"Paris"` -> `(None, Some("Paris"))`.
pub fn split_choice(text: &str) -> (Option<String>, Option<String>) {
    let text = text.trim();
    if text.is_empty() {
        return (None, None);
    }
    if let Some(caps) = lone_letter().captures(text) {
        return (Some(caps[1].to_ascii_uppercase()), None);
    }
    if let Some(caps) = lettered_text().captures(text) {
        return (
            Some(caps[1].to_ascii_uppercase()),
            Some(caps[2].trim().to_string()),
        );
    }
    (None, Some(text.to_string()))
}

/// Case-insensitive, whitespace-collapsed form with any leading letter marker removed
pub fn normalize(text: &str) -> String {
    let (letter, rest) = split_choice(text);
    let base = match (letter, rest) {
        (_, Some(rest)) => rest,
        (Some(letter), None) => letter,
        (None, None) => String::new(),
    };
    base.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches('.')
        .to_lowercase()
}

/// Every normalized form under which `text` may appear, given the question's options
pub fn aliases(text: &str, options: &[String]) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let (letter, rest) = split_choice(text);

    if let Some(letter) = &letter {
        out.insert(letter.to_lowercase());
        if let Some(option) = index_for(letter).and_then(|i| options.get(i)) {
            out.insert(normalize(option));
        }
    }
    if let Some(rest) = &rest {
        let norm = normalize(rest);
        if let Some(i) = options.iter().position(|o| normalize(o) == norm) {
            if let Some(letter) = letter_for(i) {
                out.insert(letter.to_lowercase());
            }
        }
        out.insert(norm);
    }
    out.remove("");
    out
}

/// Whether two answers name the same thing
pub fn answers_match(student: &str, correct: &str, options: &[String]) -> bool {
    let student = aliases(student, options);
    let correct = aliases(correct, options);
    !student.is_empty() && !student.is_disjoint(&correct)
}
