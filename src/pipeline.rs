//! Job bodies for both queues
//!
//! - parse: extract -> AI parse -> replace question set
//! - mark: extract -> reconcile answers -> AI score -> render transcript
//!   -> upload -> upsert submission
//! - open-exam: flip a scheduled exam to open
//!
//! The temp file named in a parse/mark payload is removed once no further
//! attempt will need it.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::ai::AiClient;
use crate::answers::AnswerReconciler;
use crate::error::{Error, Result};
use crate::exam::{ExamRepository, Submission};
use crate::extractor::TextExtractor;
use crate::parser::QuestionParser;
use crate::queue::{
    remove_temp_file, Job, JobContext, JobPayload, JobProcessor, MarkJobPayload, ParseJobPayload,
};
use crate::scorer::Scorer;
use crate::storage::{transcript_key, ArtifactStore, PDF_CONTENT_TYPE};
use crate::transcript::{PdfRasterizer, TranscriptContext, TranscriptRenderer};

/// Progress reported after each mark stage
mod progress {
    pub const EXTRACTED: u8 = 15;
    pub const RECONCILED: u8 = 30;
    pub const SCORED: u8 = 55;
    pub const RENDERED: u8 = 75;
    pub const UPLOADED: u8 = 90;
    pub const PERSISTED: u8 = 100;
}

/// Processor for the `pdf-processing` queue
pub struct PdfJobProcessor {
    exams: Arc<dyn ExamRepository>,
    extractor: Arc<TextExtractor>,
    parser: QuestionParser,
    reconciler: AnswerReconciler,
    scorer: Scorer,
    renderer: TranscriptRenderer,
    artifacts: Arc<dyn ArtifactStore>,
}

impl PdfJobProcessor {
    pub fn new(
        exams: Arc<dyn ExamRepository>,
        extractor: Arc<TextExtractor>,
        ai: AiClient,
        rasterizer: Arc<dyn PdfRasterizer>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            parser: QuestionParser::new(ai.clone(), exams.clone()),
            reconciler: AnswerReconciler::new(ai.clone()),
            scorer: Scorer::new(ai),
            renderer: TranscriptRenderer::new(rasterizer),
            exams,
            extractor,
            artifacts,
        }
    }

    async fn extract(&self, path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(path).await?;
        let text = self.extractor.extract_text(&bytes).await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::bad_input("No text found in PDF"));
        }
        Ok(text.to_string())
    }

    async fn parse(&self, payload: &ParseJobPayload) -> Result<Value> {
        debug!("Processing parse job for {:?}", payload.temp_file_path);
        let text = self.extract(&payload.temp_file_path).await?;
        let outcome = self.parser.parse(&payload.exam_key, &text).await?;
        Ok(outcome.into_value())
    }

    async fn mark(&self, payload: &MarkJobPayload, ctx: &JobContext) -> Result<Value> {
        debug!("Processing mark job for {:?}", payload.temp_file_path);
        let exam = self
            .exams
            .find(&payload.exam_key)
            .await?
            .ok_or_else(|| Error::not_found("Exam not found"))?;

        let text = self.extract(&payload.temp_file_path).await?;
        ctx.progress(progress::EXTRACTED).await;

        let answers = self
            .reconciler
            .reconcile(Some(&payload.student_answer), Some(&text), &exam.question_set)
            .await;
        ctx.progress(progress::RECONCILED).await;

        let score = self.scorer.score(&text).await?;
        ctx.progress(progress::SCORED).await;

        let email = payload.student_email.trim().to_lowercase();
        let submitted_at = Utc::now();
        let pdf = self
            .renderer
            .render(&TranscriptContext {
                exam_key: &exam.exam_key,
                student_email: &email,
                student_name: exam.invitee_name(&email),
                score,
                time_spent: payload.time_spent,
                submitted_at,
                questions: &exam.question_set,
                answers: &answers,
            })
            .await?;
        ctx.progress(progress::RENDERED).await;

        let transcript_url = self
            .artifacts
            .upload(&transcript_key(&exam.exam_key, &email), pdf, PDF_CONTENT_TYPE)
            .await?;
        ctx.progress(progress::UPLOADED).await;

        self.exams
            .upsert_submission(
                &exam.exam_key,
                Submission {
                    email: email.clone(),
                    student_answer: payload.student_answer.clone(),
                    score: score.correct,
                    transcript: transcript_url.clone(),
                    time_submitted: submitted_at,
                    time_spent: payload.time_spent,
                },
            )
            .await?;
        ctx.progress(progress::PERSISTED).await;

        info!(
            "Marked exam {} for {}: {} (transcript {})",
            exam.exam_key, email, score, transcript_url
        );
        Ok(json!({
            "score": score.to_string(),
            "transcriptUrl": transcript_url,
            "answers": answers,
        }))
    }
}

#[async_trait]
impl JobProcessor for PdfJobProcessor {
    async fn process(&self, job: &Job, ctx: &JobContext) -> Result<Value> {
        let (path, outcome) = match &job.payload {
            JobPayload::Parse(payload) => (&payload.temp_file_path, self.parse(payload).await),
            JobPayload::Mark(payload) => (&payload.temp_file_path, self.mark(payload, ctx).await),
            JobPayload::OpenExam(_) => {
                return Err(Error::bad_input(format!(
                    "{} job {} does not belong on the PDF queue",
                    job.kind(),
                    job.id
                )))
            }
        };

        match &outcome {
            Err(e) if ctx.will_retry(e) => {
                debug!("Retaining {:?} for retry of job {}", path, job.id);
            }
            _ => remove_temp_file(path).await,
        }
        outcome
    }
}

/// Processor for the `exam-scheduler` queue
pub struct OpenExamProcessor {
    exams: Arc<dyn ExamRepository>,
}

impl OpenExamProcessor {
    pub fn new(exams: Arc<dyn ExamRepository>) -> Self {
        Self { exams }
    }
}

#[async_trait]
impl JobProcessor for OpenExamProcessor {
    async fn process(&self, job: &Job, _ctx: &JobContext) -> Result<Value> {
        let JobPayload::OpenExam(payload) = &job.payload else {
            return Err(Error::bad_input(format!(
                "{} job {} does not belong on the scheduler queue",
                job.kind(),
                job.id
            )));
        };

        let opened = self.exams.open_if_scheduled(&payload.exam_key).await?;
        if opened {
            info!("Exam {} is now open", payload.exam_key);
        } else {
            warn!(
                "Exam {} was not scheduled (or no longer exists); leaving access unchanged",
                payload.exam_key
            );
        }
        Ok(json!({ "examKey": payload.exam_key, "opened": opened }))
    }
}
