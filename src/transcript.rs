//! Transcript rendering
//!
//! A graded submission becomes a self-contained HTML page, which a headless
//! browser prints to an A4 PDF.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::page::PrintToPdfParams;
use chromiumoxide::{Browser, BrowserConfig};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{debug, warn};

use crate::answers::{alias, StudentAnswerEntry};
use crate::error::Result;
use crate::exam::ParsedQuestion;
use crate::scorer::Score;

/// A4 in inches
const PAPER_WIDTH_IN: f64 = 8.27;
const PAPER_HEIGHT_IN: f64 = 11.69;
/// 1.5cm in inches
const MARGIN_IN: f64 = 1.5 / 2.54;

/// Everything a transcript shows
#[derive(Debug, Clone)]
pub struct TranscriptContext<'a> {
    pub exam_key: &'a str,
    pub student_email: &'a str,
    pub student_name: Option<&'a str>,
    pub score: Score,
    /// Seconds
    pub time_spent: u64,
    pub submitted_at: DateTime<Utc>,
    pub questions: &'a [ParsedQuestion],
    pub answers: &'a [StudentAnswerEntry],
}

/// One question's line in the transcript
#[derive(Debug, Clone, PartialEq)]
pub struct QuestionReview {
    pub question: String,
    pub options: Vec<String>,
    pub student_answer: Option<String>,
    pub correct_answer: Option<String>,
    /// None when the question has no reference answer
    pub correct: Option<bool>,
}

fn display_answer(entry: &StudentAnswerEntry) -> Option<String> {
    let text = entry.answer_text.as_deref().map(str::trim).filter(|t| !t.is_empty());
    let letter = entry.choice_letter.as_deref().map(str::trim).filter(|l| !l.is_empty());
    match (letter, text) {
        (Some(l), Some(t)) => Some(format!("{}. {}", l, t)),
        (Some(l), None) => Some(l.to_string()),
        (None, Some(t)) => Some(t.to_string()),
        (None, None) => None,
    }
}

/// Pair every question with the student's answer and an alias-normalized verdict.
pub fn review(questions: &[ParsedQuestion], answers: &[StudentAnswerEntry]) -> Vec<QuestionReview> {
    questions
        .iter()
        .enumerate()
        .map(|(i, q)| {
            let entry = answers.iter().find(|a| a.question_index == Some(i));
            let correct_answer = q
                .correct_answer
                .as_deref()
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string);

            let correct = correct_answer.as_deref().map(|expected| {
                entry.is_some_and(|e| {
                    [e.answer_text.as_deref(), e.choice_letter.as_deref()]
                        .into_iter()
                        .flatten()
                        .any(|given| alias::answers_match(given, expected, &q.options))
                })
            });

            QuestionReview {
                question: q.question_text.clone(),
                options: q.options.clone(),
                student_answer: entry.and_then(display_answer),
                correct_answer,
                correct,
            }
        })
        .collect()
}

/// Share of gradable questions answered correctly; display only.
pub fn display_percentage(reviews: &[QuestionReview]) -> Option<f64> {
    let gradable: Vec<bool> = reviews.iter().filter_map(|r| r.correct).collect();
    if gradable.is_empty() {
        return None;
    }
    let correct = gradable.iter().filter(|c| **c).count();
    Some(correct as f64 * 100.0 / gradable.len() as f64)
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

const STYLE: &str = r#"
  body { font-family: Arial, sans-serif; margin: 1cm; }
  .header { display: flex; justify-content: space-between; align-items: center; }
  .score { font-size: 22px; color: #1a4d99; font-weight: bold; }
  .details { margin-top: 20px; }
  .qa { margin-top: 15px; padding: 10px; border-bottom: 1px solid #ddd; }
  .question { font-weight: 600; }
  .options { margin: 4px 0 4px 16px; padding: 0; list-style: none; }
  .choice { color: #d9534f; }
  .correct { color: #5cb85c; }
  .verdict-ok { color: #5cb85c; font-weight: bold; }
  .verdict-bad { color: #d9534f; font-weight: bold; }
"#;

pub fn render_html(ctx: &TranscriptContext<'_>) -> String {
    let reviews = review(ctx.questions, ctx.answers);
    let percentage = display_percentage(&reviews)
        .map(|p| format!("{:.0}%", p))
        .unwrap_or_else(|| "N/A".into());

    let mut html = String::new();
    let _ = write!(
        html,
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="UTF-8" />
<title>Exam Transcript</title>
<style>{style}</style>
</head>
<body>
<div class="header">
  <h2>Exam Transcript</h2>
  <div class="score">Score: {score}</div>
</div>
<div class="details">
  <p><strong>Student:</strong> {email} ({name})</p>
  <p><strong>Exam Key:</strong> {exam_key}</p>
  <p><strong>Date:</strong> {date}</p>
  <p><strong>Time Spent:</strong> {time_spent}s</p>
  <p><strong>Correct:</strong> {percentage}</p>
</div>
"#,
        style = STYLE,
        score = ctx.score,
        email = escape_html(ctx.student_email),
        name = escape_html(ctx.student_name.unwrap_or("N/A")),
        exam_key = escape_html(ctx.exam_key),
        date = ctx.submitted_at.format("%Y-%m-%d"),
        time_spent = ctx.time_spent,
        percentage = percentage,
    );

    for (i, r) in reviews.iter().enumerate() {
        let _ = write!(
            html,
            r#"<div class="qa"><p class="question">{}. {}</p>"#,
            i + 1,
            escape_html(&r.question)
        );
        if !r.options.is_empty() {
            html.push_str(r#"<ul class="options">"#);
            for (j, option) in r.options.iter().enumerate() {
                let letter = alias::letter_for(j).unwrap_or_default();
                let _ = write!(html, "<li>{}. {}</li>", letter, escape_html(option));
            }
            html.push_str("</ul>");
        }
        let _ = write!(
            html,
            r#"<p class="choice">Your answer: {}</p><p class="correct">Correct answer: {}</p>"#,
            escape_html(r.student_answer.as_deref().unwrap_or("N/A")),
            escape_html(r.correct_answer.as_deref().unwrap_or("N/A")),
        );
        match r.correct {
            Some(true) => html.push_str(r#"<p class="verdict-ok">Correct</p>"#),
            Some(false) => html.push_str(r#"<p class="verdict-bad">Incorrect</p>"#),
            None => {}
        }
        html.push_str("</div>\n");
    }

    html.push_str("</body>\n</html>\n");
    html
}

/// HTML to PDF
#[async_trait]
pub trait PdfRasterizer: Send + Sync {
    async fn rasterize(&self, html: &str) -> anyhow::Result<Vec<u8>>;
}

/// Headless Chromium, one browser per document
pub struct ChromiumRasterizer {
    chrome_path: Option<PathBuf>,
}

impl ChromiumRasterizer {
    pub fn new(chrome_path: Option<PathBuf>) -> Self {
        Self { chrome_path }
    }

    fn browser_config(&self) -> anyhow::Result<BrowserConfig> {
        let mut builder = BrowserConfig::builder().new_headless_mode().args(vec![
            "--no-sandbox",
            "--disable-setuid-sandbox",
            "--disable-dev-shm-usage",
            "--disable-accelerated-2d-canvas",
            "--disable-gpu",
        ]);
        if let Some(path) = &self.chrome_path {
            builder = builder.chrome_executable(path);
        }
        builder
            .build()
            .map_err(|e| anyhow!("Invalid browser configuration: {}", e))
    }
}

#[async_trait]
impl PdfRasterizer for ChromiumRasterizer {
    async fn rasterize(&self, html: &str) -> anyhow::Result<Vec<u8>> {
        let (mut browser, mut handler) = Browser::launch(self.browser_config()?)
            .await
            .context("Failed to launch headless browser")?;
        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let printed = async {
            let page = browser
                .new_page("about:blank")
                .await
                .context("Failed to open page")?;
            page.set_content(html)
                .await
                .context("Failed to load transcript HTML")?;
            let params = PrintToPdfParams {
                print_background: Some(true),
                paper_width: Some(PAPER_WIDTH_IN),
                paper_height: Some(PAPER_HEIGHT_IN),
                margin_top: Some(MARGIN_IN),
                margin_bottom: Some(MARGIN_IN),
                margin_left: Some(MARGIN_IN),
                margin_right: Some(MARGIN_IN),
                prefer_css_page_size: Some(false),
                ..Default::default()
            };
            page.pdf(params).await.context("Failed to print PDF")
        }
        .await;

        if let Err(e) = browser.close().await {
            warn!("Failed to close headless browser: {}", e);
        }
        let _ = browser.wait().await;
        events.abort();

        let bytes = printed?;
        debug!("Rasterized transcript ({} bytes)", bytes.len());
        Ok(bytes)
    }
}

pub struct TranscriptRenderer {
    rasterizer: Arc<dyn PdfRasterizer>,
}

impl TranscriptRenderer {
    pub fn new(rasterizer: Arc<dyn PdfRasterizer>) -> Self {
        Self { rasterizer }
    }

    pub async fn render(&self, ctx: &TranscriptContext<'_>) -> Result<Vec<u8>> {
        let html = render_html(ctx);
        let pdf = self
            .rasterizer
            .rasterize(&html)
            .await
            .context("Failed to render transcript")?;
        Ok(pdf)
    }
}
