//! AI-assisted scoring
//!
//! The model is asked for a bare `X/Y` fraction over the multiple-choice
//! questions. Anything else in the response is a data error.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ai::AiClient;
use crate::error::{Error, Result};

pub const MARK_PROMPT: &str = "You are an exam PDF parser. You'll receive raw extracted text containing exam questions, the correct answers, and a student's responses. Your task:
1. Identify every question.
2. Compare the student's answer to the correct answer for each.
3. Calculate the total correct responses.
4. Return ONLY the result as a fraction in the form X/Y, where Y is the total number of questions.
5. Do not include any additional text, explanations, or formatting.
6. Do not mark theory questions; only multiple-choice questions are scored.
Do not include any other text or explanation.";

fn score_format() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\d+)\s*/\s*(\d+)\s*$").expect("score regex"))
}

/// An `X/Y` score as reported by the AI service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub correct: u32,
    pub total: u32,
}

impl Score {
    /// Validate and read a score string; whitespace around the parts is allowed.
    pub fn parse(text: &str) -> Result<Self> {
        let unexpected = || Error::bad_input(format!("Unexpected score format \"{}\"", text.trim()));
        let caps = score_format().captures(text).ok_or_else(unexpected)?;
        Ok(Self {
            correct: caps[1].parse().map_err(|_| unexpected())?,
            total: caps[2].parse().map_err(|_| unexpected())?,
        })
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.correct, self.total)
    }
}

pub struct Scorer {
    ai: AiClient,
}

impl Scorer {
    pub fn new(ai: AiClient) -> Self {
        Self { ai }
    }

    pub async fn score(&self, raw_text: &str) -> Result<Score> {
        let response = self.ai.generate(&[MARK_PROMPT, raw_text]).await?;
        Score::parse(&response)
    }
}
