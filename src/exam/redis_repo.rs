//! Redis-backed exam repository
//!
//! Layout per exam key:
//! - `{prefix}:exam:{key}`             exam document written by the CRUD layer (JSON)
//! - `{prefix}:exam:{key}:access`      access state, flipped by the scheduler
//! - `{prefix}:exam:{key}:questions`   question set (JSON array, replaced wholesale)
//! - `{prefix}:exam:{key}:submissions` hash of lower-cased email -> submission JSON

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Exam, ExamAccess, ExamRepository, Invite, ParsedQuestion, Submission};
use crate::error::{Error, Result};

/// Flip access to `open` only if it is currently `scheduled`.
const OPEN_IF_SCHEDULED: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2])
    return 1
end
return 0
"#;

/// Exam document as stored by the CRUD layer
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExamDocument {
    exam_key: String,
    exam_name: String,
    #[serde(default)]
    access: Option<ExamAccess>,
    #[serde(default)]
    invites: Vec<Invite>,
}

pub struct RedisExamRepository {
    conn: ConnectionManager,
    prefix: String,
    open_script: Script,
}

impl RedisExamRepository {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            open_script: Script::new(OPEN_IF_SCHEDULED),
        }
    }

    fn doc_key(&self, exam_key: &str) -> String {
        format!("{}:exam:{}", self.prefix, exam_key)
    }

    fn field_key(&self, exam_key: &str, field: &str) -> String {
        format!("{}:exam:{}:{}", self.prefix, exam_key, field)
    }
}

#[async_trait]
impl ExamRepository for RedisExamRepository {
    async fn find(&self, exam_key: &str) -> Result<Option<Exam>> {
        let mut conn = self.conn.clone();

        let doc: Option<String> = conn.get(self.doc_key(exam_key)).await?;
        let Some(doc) = doc else {
            return Ok(None);
        };
        let doc: ExamDocument = serde_json::from_str(&doc)?;

        let access: Option<String> = conn.get(self.field_key(exam_key, "access")).await?;
        let access = access
            .as_deref()
            .and_then(ExamAccess::parse)
            .or(doc.access)
            .unwrap_or(ExamAccess::Private);

        let questions: Option<String> = conn.get(self.field_key(exam_key, "questions")).await?;
        let question_set = match questions {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };

        let raw_submissions: HashMap<String, String> = conn
            .hgetall(self.field_key(exam_key, "submissions"))
            .await?;
        let mut submissions = Vec::with_capacity(raw_submissions.len());
        for (email, raw) in raw_submissions {
            match serde_json::from_str::<Submission>(&raw) {
                Ok(s) => submissions.push(s),
                Err(e) => warn!("Skipping unreadable submission for {}: {}", email, e),
            }
        }
        submissions.sort_by_key(|s| s.time_submitted);

        Ok(Some(Exam {
            exam_key: doc.exam_key,
            exam_name: doc.exam_name,
            access,
            invites: doc.invites,
            question_set,
            submissions,
        }))
    }

    async fn exists(&self, exam_key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(self.doc_key(exam_key)).await?)
    }

    async fn replace_question_set(
        &self,
        exam_key: &str,
        questions: &[ParsedQuestion],
    ) -> Result<bool> {
        if !self.exists(exam_key).await? {
            return Ok(false);
        }
        let json = serde_json::to_string(questions)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(self.field_key(exam_key, "questions"), json)
            .await?;
        debug!("Stored {} questions for exam {}", questions.len(), exam_key);
        Ok(true)
    }

    async fn upsert_submission(&self, exam_key: &str, mut submission: Submission) -> Result<()> {
        if !self.exists(exam_key).await? {
            return Err(Error::not_found(format!("Exam {} not found", exam_key)));
        }
        submission.email = submission.email.to_lowercase();
        let json = serde_json::to_string(&submission)?;
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(
            self.field_key(exam_key, "submissions"),
            &submission.email,
            json,
        )
        .await?;
        Ok(())
    }

    async fn set_access(&self, exam_key: &str, access: ExamAccess) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(self.field_key(exam_key, "access"), access.as_str())
            .await?;
        Ok(())
    }

    async fn open_if_scheduled(&self, exam_key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let opened: i32 = self
            .open_script
            .key(self.field_key(exam_key, "access"))
            .arg(ExamAccess::Scheduled.as_str())
            .arg(ExamAccess::Open.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(opened == 1)
    }
}
