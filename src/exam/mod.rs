//! Exam aggregate as seen by the pipeline
//!
//! The CRUD layer owns exams; the pipeline only reads them and mutates
//! the question set, the submissions list and the scheduled access state.

pub mod redis_repo;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::Result;

pub use redis_repo::RedisExamRepository;

/// Question kind as produced by the parser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuestionType {
    #[serde(alias = "multiple_choice", alias = "multiplechoice", alias = "mcq")]
    MultipleChoice,
    #[serde(alias = "essay", alias = "open")]
    Theory,
}

/// One question of an exam's question set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedQuestion {
    #[serde(rename = "type")]
    pub kind: QuestionType,
    #[serde(rename = "question", alias = "questionText")]
    pub question_text: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub options: Vec<String>,
    /// Omitted for theory questions unless present verbatim in the source
    #[serde(
        rename = "answer",
        alias = "correctAnswer",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correct_answer: Option<String>,
}

impl ParsedQuestion {
    pub fn multiple_choice(
        question: impl Into<String>,
        options: &[&str],
        answer: Option<&str>,
    ) -> Self {
        Self {
            kind: QuestionType::MultipleChoice,
            question_text: question.into(),
            options: options.iter().map(|o| o.to_string()).collect(),
            correct_answer: answer.map(str::to_string),
        }
    }

    pub fn theory(question: impl Into<String>) -> Self {
        Self {
            kind: QuestionType::Theory,
            question_text: question.into(),
            options: Vec::new(),
            correct_answer: None,
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// A graded submission, one per (exam, lower-cased email)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub email: String,
    /// Raw student answer artifact as received (often JSON)
    pub student_answer: String,
    /// Numerator of the AI-reported fraction
    pub score: u32,
    /// URL of the uploaded transcript
    pub transcript: String,
    pub time_submitted: DateTime<Utc>,
    /// Seconds
    pub time_spent: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExamAccess {
    Open,
    Private,
    Restricted,
    Scheduled,
}

impl ExamAccess {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExamAccess::Open => "open",
            ExamAccess::Private => "private",
            ExamAccess::Restricted => "restricted",
            ExamAccess::Scheduled => "scheduled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(ExamAccess::Open),
            "private" => Some(ExamAccess::Private),
            "restricted" => Some(ExamAccess::Restricted),
            "scheduled" => Some(ExamAccess::Scheduled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invite {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exam {
    pub exam_key: String,
    pub exam_name: String,
    pub access: ExamAccess,
    #[serde(default)]
    pub invites: Vec<Invite>,
    #[serde(default)]
    pub question_set: Vec<ParsedQuestion>,
    #[serde(default)]
    pub submissions: Vec<Submission>,
}

impl Exam {
    pub fn new(exam_key: impl Into<String>, exam_name: impl Into<String>) -> Self {
        Self {
            exam_key: exam_key.into(),
            exam_name: exam_name.into(),
            access: ExamAccess::Private,
            invites: Vec::new(),
            question_set: Vec::new(),
            submissions: Vec::new(),
        }
    }

    /// Replace the submission for the same (case-insensitive) email in place, or append.
    pub fn upsert_submission(&mut self, mut submission: Submission) {
        submission.email = submission.email.to_lowercase();
        match self
            .submissions
            .iter()
            .position(|s| s.email.to_lowercase() == submission.email)
        {
            Some(idx) => self.submissions[idx] = submission,
            None => self.submissions.push(submission),
        }
    }

    /// Invite display name for a student, if the CRUD layer recorded one.
    pub fn invitee_name(&self, email: &str) -> Option<&str> {
        let email = email.to_lowercase();
        self.invites
            .iter()
            .find(|i| i.email.to_lowercase() == email)
            .and_then(|i| i.name.as_deref())
    }
}

/// Persistence for the parts of the exam aggregate the pipeline touches
#[async_trait]
pub trait ExamRepository: Send + Sync {
    async fn find(&self, exam_key: &str) -> Result<Option<Exam>>;

    async fn exists(&self, exam_key: &str) -> Result<bool> {
        Ok(self.find(exam_key).await?.is_some())
    }

    /// Replace the whole question set. Returns false if the exam does not exist.
    async fn replace_question_set(
        &self,
        exam_key: &str,
        questions: &[ParsedQuestion],
    ) -> Result<bool>;

    /// Insert or replace the submission keyed by lower-cased email.
    async fn upsert_submission(&self, exam_key: &str, submission: Submission) -> Result<()>;

    async fn set_access(&self, exam_key: &str, access: ExamAccess) -> Result<()>;

    /// Flip `scheduled` to `open`. Returns false if the exam was not scheduled.
    async fn open_if_scheduled(&self, exam_key: &str) -> Result<bool>;
}
