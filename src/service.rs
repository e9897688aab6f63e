//! Producer-side operations used by the HTTP layer
//!
//! Uploads are validated and written to `UPLOAD_DIR` before a job is queued;
//! the worker that finishes with the file removes it.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::exam::{ExamAccess, ExamRepository};
use crate::extractor::TextExtractor;
use crate::queue::{
    JobInfo, JobOptions, JobPayload, JobQueue, MarkJobPayload, OpenExamPayload, ParseJobPayload,
    PDF_QUEUE, SCHEDULER_QUEUE,
};

const PDF_MAGIC: &[u8] = b"%PDF-";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleResponse {
    pub message: String,
    pub start_at: DateTime<Utc>,
}

pub struct ProcessService {
    queue: JobQueue,
    exams: Arc<dyn ExamRepository>,
    extractor: Arc<TextExtractor>,
    upload_dir: PathBuf,
}

impl ProcessService {
    pub fn new(
        queue: JobQueue,
        exams: Arc<dyn ExamRepository>,
        extractor: Arc<TextExtractor>,
        upload_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            queue,
            exams,
            extractor,
            upload_dir: upload_dir.into(),
        }
    }

    /// Queue a master PDF for question extraction.
    pub async fn enqueue_process_pdf(&self, exam_key: &str, bytes: Vec<u8>) -> Result<EnqueueResponse> {
        validate_pdf(&bytes)?;
        self.extractor.ensure_tool().await?;

        let payload = |temp_file_path: PathBuf| {
            JobPayload::Parse(ParseJobPayload {
                temp_file_path,
                exam_key: exam_key.to_string(),
            })
        };
        let job_id = self.store_and_enqueue(bytes, payload).await?;
        Ok(EnqueueResponse {
            job_id,
            message: None,
        })
    }

    /// Queue a student's submission for marking. The exam must already exist.
    pub async fn enqueue_mark_pdf(
        &self,
        exam_key: &str,
        student_email: &str,
        student_answer: &str,
        time_spent: u64,
        bytes: Vec<u8>,
    ) -> Result<EnqueueResponse> {
        validate_pdf(&bytes)?;
        if !self.exams.exists(exam_key).await? {
            return Err(Error::bad_input("Exam not found"));
        }
        self.extractor.ensure_tool().await?;

        let payload = |temp_file_path: PathBuf| {
            JobPayload::Mark(MarkJobPayload {
                temp_file_path,
                exam_key: exam_key.to_string(),
                student_email: student_email.to_string(),
                student_answer: student_answer.to_string(),
                time_spent,
            })
        };
        let job_id = self.store_and_enqueue(bytes, payload).await?;
        Ok(EnqueueResponse {
            job_id,
            message: Some("Exam marking job queued successfully".into()),
        })
    }

    /// Status of a parse, mark or open-exam job.
    pub async fn get_job_info(&self, job_id: &str) -> Result<JobInfo> {
        for queue in [PDF_QUEUE, SCHEDULER_QUEUE] {
            match self.queue.get_status(queue, job_id).await {
                Err(Error::NotFound(_)) => continue,
                other => return other,
            }
        }
        Err(Error::not_found(format!("Job {} not found", job_id)))
    }

    /// Open the exam at `start_at`, replacing any earlier schedule for it.
    pub async fn schedule_exam(
        &self,
        exam_key: &str,
        start_at: DateTime<Utc>,
    ) -> Result<ScheduleResponse> {
        let delay = (start_at - Utc::now())
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or_else(|| Error::bad_input("Start time must be in the future"))?;

        if !self.exams.exists(exam_key).await? {
            return Err(Error::not_found("Exam not found"));
        }
        self.exams.set_access(exam_key, ExamAccess::Scheduled).await?;

        if self.queue.cancel(SCHEDULER_QUEUE, exam_key).await? {
            info!("Replaced earlier schedule for exam {}", exam_key);
        }
        self.queue
            .enqueue_with_id(
                exam_key,
                JobPayload::OpenExam(OpenExamPayload {
                    exam_key: exam_key.to_string(),
                }),
                JobOptions::scheduled(delay),
            )
            .await?;

        info!("Exam {} scheduled to open at {}", exam_key, start_at);
        Ok(ScheduleResponse {
            message: "Exam scheduled".into(),
            start_at,
        })
    }

    /// Drop the pending open-exam job, if any.
    pub async fn cancel_schedule(&self, exam_key: &str) -> Result<bool> {
        let cancelled = self.queue.cancel(SCHEDULER_QUEUE, exam_key).await?;
        if cancelled {
            info!("Cancelled schedule for exam {}", exam_key);
        }
        Ok(cancelled)
    }

    async fn store_and_enqueue(
        &self,
        bytes: Vec<u8>,
        payload: impl FnOnce(PathBuf) -> JobPayload,
    ) -> Result<String> {
        let path = self.store_upload(bytes).await?;
        match self.queue.enqueue(payload(path.clone()), JobOptions::pdf()).await {
            Ok(job) => Ok(job.id),
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&path).await {
                    warn!("Failed to remove {:?} after enqueue error: {}", path, rm);
                }
                Err(e)
            }
        }
    }

    async fn store_upload(&self, bytes: Vec<u8>) -> Result<PathBuf> {
        let dir = self.upload_dir.clone();
        let path = tokio::task::spawn_blocking(move || -> anyhow::Result<PathBuf> {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create upload dir {:?}", dir))?;
            let mut file = tempfile::Builder::new()
                .prefix("upload-")
                .suffix(".pdf")
                .tempfile_in(&dir)
                .context("Failed to create upload file")?;
            file.write_all(&bytes).context("Failed to write upload")?;
            let (_, path) = file.keep().context("Failed to persist upload")?;
            Ok(path)
        })
        .await
        .map_err(|e| anyhow!("upload writer panicked: {}", e))??;
        Ok(path)
    }
}

fn validate_pdf(bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Err(Error::bad_input("No file provided"));
    }
    if !bytes.starts_with(PDF_MAGIC) {
        return Err(Error::bad_input("Uploaded file is not a PDF"));
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ToolConfig;
    use crate::exam::Exam;
    use crate::queue::{JobKind, JobState};
    use crate::testing::{fake_pdftotext, MemoryExamRepository, MemoryJobStore};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        store: Arc<MemoryJobStore>,
        exams: Arc<MemoryExamRepository>,
        service: ProcessService,
    }

    fn fixture(pdftotext: Option<&str>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let program = match pdftotext {
            Some(output) => fake_pdftotext(dir.path(), output),
            None => "/nonexistent/bin/pdftotext".into(),
        };
        let tools = ToolConfig {
            pdftotext_path: program,
            auto_install: false,
            chrome_path: None,
        };
        let store = Arc::new(MemoryJobStore::default());
        let exams = Arc::new(MemoryExamRepository::default());
        exams.insert(Exam::new("MTH101", "Maths"));
        let service = ProcessService::new(
            JobQueue::new(store.clone()),
            exams.clone(),
            Arc::new(TextExtractor::new(&tools)),
            dir.path().join("uploads"),
        );
        Fixture {
            dir,
            store,
            exams,
            service,
        }
    }

    fn upload_count(f: &Fixture) -> usize {
        std::fs::read_dir(f.dir.path().join("uploads"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_enqueue_mark_pdf() {
        let f = fixture(Some("text"));
        let response = f
            .service
            .enqueue_mark_pdf("MTH101", "ada@example.com", "[]", 90, b"%PDF-1.4".to_vec())
            .await
            .unwrap();
        assert_eq!(
            response.message.as_deref(),
            Some("Exam marking job queued successfully")
        );

        let info = f.service.get_job_info(&response.job_id).await.unwrap();
        assert_eq!(info.kind, JobKind::Mark);
        assert_eq!(info.state, JobState::Waiting);
        assert_eq!(f.store.ready_len(PDF_QUEUE), 1);
        assert_eq!(upload_count(&f), 1);
    }

    #[tokio::test]
    async fn test_enqueue_process_pdf() {
        let f = fixture(Some("text"));
        let response = f
            .service
            .enqueue_process_pdf("MTH101", b"%PDF-1.7 master".to_vec())
            .await
            .unwrap();
        assert_eq!(response.message, None);
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("message").is_none());
        assert_eq!(json["jobId"], response.job_id.as_str());
        assert_eq!(
            f.service.get_job_info(&response.job_id).await.unwrap().kind,
            JobKind::Parse
        );
    }

    #[tokio::test]
    async fn test_mark_unknown_exam_enqueues_nothing() {
        let f = fixture(Some("text"));
        let err = f
            .service
            .enqueue_mark_pdf("NOPE", "ada@example.com", "", 0, b"%PDF-1.4".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadInput(ref m) if m == "Exam not found"));
        assert_eq!(f.store.ready_len(PDF_QUEUE), 0);
        assert_eq!(upload_count(&f), 0);
    }

    #[tokio::test]
    async fn test_rejects_invalid_uploads() {
        let f = fixture(Some("text"));
        for bytes in [Vec::new(), b"PK\x03\x04 zip".to_vec()] {
            let err = f.service.enqueue_process_pdf("MTH101", bytes).await.unwrap_err();
            assert!(matches!(err, Error::BadInput(_)));
        }
        assert_eq!(f.store.ready_len(PDF_QUEUE), 0);
    }

    #[tokio::test]
    async fn test_missing_tool_fails_before_enqueue() {
        let f = fixture(None);
        let err = f
            .service
            .enqueue_process_pdf("MTH101", b"%PDF-1.4".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
        assert_eq!(f.store.ready_len(PDF_QUEUE), 0);
        assert_eq!(upload_count(&f), 0);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let f = fixture(Some("text"));
        let err = f.service.get_job_info("missing").await.unwrap_err();
        assert_eq!(err.to_string(), "not found: Job missing not found");
    }

    #[tokio::test]
    async fn test_schedule_twice_leaves_one_pending_job() {
        let f = fixture(None);
        let first = Utc::now() + chrono::Duration::hours(1);
        let second = Utc::now() + chrono::Duration::hours(2);

        f.service.schedule_exam("MTH101", first).await.unwrap();
        let response = f.service.schedule_exam("MTH101", second).await.unwrap();
        assert_eq!(response.message, "Exam scheduled");
        assert_eq!(response.start_at, second);

        assert_eq!(f.store.delayed_len(SCHEDULER_QUEUE), 1);
        let info = f.service.get_job_info("MTH101").await.unwrap();
        assert_eq!(info.kind, JobKind::OpenExam);
        assert_eq!(info.state, JobState::Delayed);
        assert_eq!(
            f.exams.get("MTH101").unwrap().access,
            ExamAccess::Scheduled
        );
    }

    #[tokio::test]
    async fn test_schedule_rejects_past_and_unknown() {
        let f = fixture(None);
        let past = Utc::now() - chrono::Duration::minutes(5);
        assert!(matches!(
            f.service.schedule_exam("MTH101", past).await,
            Err(Error::BadInput(_))
        ));

        let future = Utc::now() + chrono::Duration::hours(1);
        assert!(matches!(
            f.service.schedule_exam("NOPE", future).await,
            Err(Error::NotFound(_))
        ));
        assert_eq!(f.store.delayed_len(SCHEDULER_QUEUE), 0);
        assert_eq!(f.exams.get("MTH101").unwrap().access, ExamAccess::Private);
    }

    #[tokio::test]
    async fn test_cancel_schedule() {
        let f = fixture(None);
        let at = Utc::now() + chrono::Duration::hours(1);
        f.service.schedule_exam("MTH101", at).await.unwrap();

        assert!(f.service.cancel_schedule("MTH101").await.unwrap());
        assert!(!f.service.cancel_schedule("MTH101").await.unwrap());
        assert_eq!(f.store.delayed_len(SCHEDULER_QUEUE), 0);
    }
}
