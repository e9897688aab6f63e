//! AI inference client
//!
//! `TextGenerator` is the raw call to the generative-text service;
//! `AiClient` wraps it in the bounded retry envelope every caller shares.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::config::AiConfig;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// 3 attempts, waiting 500ms * attempt between them
pub const AI_RETRY: RetryPolicy = RetryPolicy::linear(3, Duration::from_millis(500));

/// One round trip to a generative-text service
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Send the prompt parts in order and return the generated text.
    async fn generate(&self, parts: &[String]) -> anyhow::Result<String>;
}

/// Google Gemini `generateContent` over HTTPS
pub struct GeminiClient {
    http: Client,
    config: AiConfig,
}

impl GeminiClient {
    pub fn new(config: AiConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(&self, parts: &[String]) -> anyhow::Result<String> {
        let payload = serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": parts
                    .iter()
                    .map(|text| serde_json::json!({ "text": text }))
                    .collect::<Vec<_>>(),
            }],
        });

        debug!(
            "Calling {} with {} prompt part(s)",
            self.config.model,
            parts.len()
        );

        let response = self
            .http
            .post(self.endpoint())
            .header("x-goog-api-key", &self.config.api_key)
            .json(&payload)
            .send()
            .await
            .context("AI request failed")?;

        let status = response.status();
        let response_text = response
            .text()
            .await
            .context("failed to read AI response body")?;
        if !status.is_success() {
            bail!(
                "AI call failed with status {}: {}",
                status,
                preview(&response_text)
            );
        }

        let body: GenerateContentResponse = serde_json::from_str(&response_text)
            .with_context(|| {
                format!(
                    "failed to parse AI response as JSON. Response body: {}",
                    preview(&response_text)
                )
            })?;
        extract_candidate_text(body)
    }
}

fn extract_candidate_text(body: GenerateContentResponse) -> anyhow::Result<String> {
    if let Some(reason) = body.prompt_feedback.and_then(|f| f.block_reason) {
        bail!("AI service blocked the prompt: {}", reason);
    }
    let candidate = body
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("AI response contained no candidates"))?;
    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.is_empty() {
        bail!(
            "AI response candidate had no text (finish reason: {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        );
    }
    Ok(text)
}

fn preview(body: &str) -> String {
    if body.len() > 500 {
        let cut = (0..=500).rev().find(|i| body.is_char_boundary(*i)).unwrap_or(0);
        format!("{}...", &body[..cut])
    } else {
        body.to_string()
    }
}

/// Shared AI client with retry; cheap to clone
#[derive(Clone)]
pub struct AiClient {
    generator: Arc<dyn TextGenerator>,
    retry: RetryPolicy,
}

impl AiClient {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            generator,
            retry: AI_RETRY,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Generate text, retrying transient failures. The last failure propagates.
    pub async fn generate(&self, parts: &[&str]) -> Result<String> {
        let parts: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
        self.retry
            .run("AI generate", |_| self.generator.generate(&parts))
            .await
            .map_err(Error::External)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}
