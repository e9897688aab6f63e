//! Durable job queue
//!
//! Job records, options and payloads shared by producers and workers.
//! - `store`: persistence seam (`JobStore`) and its Redis implementation
//! - `coordinator`: enqueue / status / cancel / attempt bookkeeping
//! - `worker`: bounded worker pools driving a `JobProcessor`

pub mod coordinator;
pub mod store;
pub mod worker;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use coordinator::{JobContext, JobQueue};
pub use store::{JobStore, RedisJobStore};
pub use worker::{JobProcessor, WorkerPool};

/// Queue holding parse and mark jobs
pub const PDF_QUEUE: &str = "pdf-processing";
/// Queue holding delayed open-exam transitions
pub const SCHEDULER_QUEUE: &str = "exam-scheduler";

const ONE_HOUR_SECS: u64 = 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Parse,
    Mark,
    OpenExam,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Parse => "parse",
            JobKind::Mark => "mark",
            JobKind::OpenExam => "open-exam",
        }
    }

    /// Queue that carries jobs of this kind
    pub fn queue(&self) -> &'static str {
        match self {
            JobKind::Parse | JobKind::Mark => PDF_QUEUE,
            JobKind::OpenExam => SCHEDULER_QUEUE,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Extract questions from an exam's master PDF
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseJobPayload {
    pub temp_file_path: PathBuf,
    pub exam_key: String,
}

/// Grade one student's submitted PDF
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkJobPayload {
    pub temp_file_path: PathBuf,
    pub exam_key: String,
    pub student_email: String,
    /// Raw structured answer artifact, often JSON
    #[serde(default)]
    pub student_answer: String,
    /// Seconds
    #[serde(default)]
    pub time_spent: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenExamPayload {
    pub exam_key: String,
}

/// Job payload, tagged by kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job_type")]
pub enum JobPayload {
    #[serde(rename = "parse")]
    Parse(ParseJobPayload),
    #[serde(rename = "mark")]
    Mark(MarkJobPayload),
    #[serde(rename = "open-exam")]
    OpenExam(OpenExamPayload),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Parse(_) => JobKind::Parse,
            JobPayload::Mark(_) => JobKind::Mark,
            JobPayload::OpenExam(_) => JobKind::OpenExam,
        }
    }

    /// Uploaded file the job reads, owned by the job until its last attempt
    pub fn temp_file(&self) -> Option<&Path> {
        match self {
            JobPayload::Parse(p) => Some(&p.temp_file_path),
            JobPayload::Mark(p) => Some(&p.temp_file_path),
            JobPayload::OpenExam(_) => None,
        }
    }
}

/// Delete a job's uploaded file. A file that is already gone is fine.
pub async fn remove_temp_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {:?}: {}", path, e),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_pending(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Delayed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Delay between queue-level attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Linear { delay_ms: u64 },
    Exponential { delay_ms: u64 },
}

impl Backoff {
    /// Delay before the next attempt, given how many attempts already failed (>= 1).
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let n = attempts_made.max(1);
        let ms = match *self {
            Backoff::Fixed { delay_ms } => delay_ms,
            Backoff::Linear { delay_ms } => delay_ms.saturating_mul(n as u64),
            Backoff::Exponential { delay_ms } => {
                delay_ms.saturating_mul(1u64 << (n - 1).min(32))
            }
        };
        Duration::from_millis(ms)
    }
}

/// What happens to a job record once it reaches a terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Retention {
    Keep,
    Remove,
    Expire { secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    pub attempts: u32,
    pub backoff: Backoff,
    /// Initial delay before the first attempt
    #[serde(default)]
    pub delay_ms: u64,
    pub remove_on_complete: Retention,
    pub remove_on_fail: Retention,
    /// Replace a pending job with the same id instead of keeping it
    #[serde(default)]
    pub replace: bool,
}

impl JobOptions {
    /// Parse and mark jobs: 3 attempts, exponential backoff from 1s.
    pub fn pdf() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::Exponential { delay_ms: 1000 },
            delay_ms: 0,
            remove_on_complete: Retention::Expire {
                secs: ONE_HOUR_SECS,
            },
            remove_on_fail: Retention::Remove,
            replace: false,
        }
    }

    /// Open-exam transition fired once after `delay`.
    pub fn scheduled(delay: Duration) -> Self {
        Self {
            attempts: 1,
            backoff: Backoff::Fixed { delay_ms: 0 },
            delay_ms: delay.as_millis() as u64,
            remove_on_complete: Retention::Expire {
                secs: ONE_HOUR_SECS,
            },
            remove_on_fail: Retention::Expire {
                secs: ONE_HOUR_SECS,
            },
            replace: true,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_retention(mut self, on_complete: Retention, on_fail: Retention) -> Self {
        self.remove_on_complete = on_complete;
        self.remove_on_fail = on_fail;
        self
    }
}

/// Stored job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub payload: JobPayload,
    pub opts: JobOptions,
    pub attempts_made: u32,
    pub state: JobState,
    /// 0-100
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ready_at: DateTime<Utc>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: impl Into<String>, payload: JobPayload, opts: JobOptions) -> Self {
        let now = Utc::now();
        let delay = chrono::Duration::milliseconds(opts.delay_ms.min(i64::MAX as u64) as i64);
        let state = if opts.delay_ms > 0 {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        Self {
            id: id.into(),
            queue: payload.kind().queue().to_string(),
            payload,
            opts,
            attempts_made: 0,
            state,
            progress: 0,
            result: None,
            failed_reason: None,
            created_at: now,
            ready_at: now + delay,
            processed_at: None,
            finished_at: None,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    pub fn info(&self) -> JobInfo {
        JobInfo {
            id: self.id.clone(),
            kind: self.kind(),
            state: self.state,
            progress: self.progress,
            attempts_made: self.attempts_made,
            processed_at: self.processed_at,
            finished_at: self.finished_at,
            result: self.result.clone(),
            failure_reason: self.failed_reason.clone(),
        }
    }
}

/// Status snapshot returned to callers polling a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: String,
    pub kind: JobKind,
    pub state: JobState,
    pub progress: u8,
    pub attempts_made: u32,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let backoff = Backoff::Exponential { delay_ms: 1000 };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_linear_and_fixed_backoff() {
        assert_eq!(
            Backoff::Linear { delay_ms: 300 }.delay_for(3),
            Duration::from_millis(900)
        );
        assert_eq!(
            Backoff::Fixed { delay_ms: 50 }.delay_for(7),
            Duration::from_millis(50)
        );
    }

    #[test]
    fn test_payload_wire_format() {
        let payload = JobPayload::Parse(ParseJobPayload {
            temp_file_path: PathBuf::from("/tmp/a.pdf"),
            exam_key: "MTH101".into(),
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["job_type"], "parse");
        assert_eq!(json["exam_key"], "MTH101");

        let back: JobPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), JobKind::Parse);
    }

    #[test]
    fn test_kinds_route_to_queues() {
        assert_eq!(JobKind::Parse.queue(), PDF_QUEUE);
        assert_eq!(JobKind::Mark.queue(), PDF_QUEUE);
        assert_eq!(JobKind::OpenExam.queue(), SCHEDULER_QUEUE);
    }

    #[test]
    fn test_delayed_job_starts_delayed() {
        let job = Job::new(
            "MTH101",
            JobPayload::OpenExam(OpenExamPayload {
                exam_key: "MTH101".into(),
            }),
            JobOptions::scheduled(Duration::from_secs(60)),
        );
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.queue, SCHEDULER_QUEUE);
        assert!(job.ready_at > job.created_at);
    }
}
