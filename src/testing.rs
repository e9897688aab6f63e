//! In-memory doubles for the pipeline's seams

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::ai::TextGenerator;
use crate::error::{Error, Result};
use crate::exam::{Exam, ExamAccess, ExamRepository, ParsedQuestion, Submission};
use crate::queue::{Job, JobStore};
use crate::storage::ArtifactStore;
use crate::transcript::PdfRasterizer;

type JobKey = (String, String);

fn job_key(queue: &str, id: &str) -> JobKey {
    (queue.to_string(), id.to_string())
}

#[derive(Default)]
struct Queues {
    jobs: HashMap<JobKey, Job>,
    expiry: HashMap<JobKey, Duration>,
    ready: HashMap<String, VecDeque<String>>,
    delayed: HashMap<String, Vec<(DateTime<Utc>, String)>>,
    active: HashMap<String, HashMap<String, DateTime<Utc>>>,
}

/// `JobStore` with the same list/sorted-set semantics as the Redis one
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Queues>,
}

impl MemoryJobStore {
    pub fn expiry_of(&self, queue: &str, id: &str) -> Option<Duration> {
        self.inner.lock().unwrap().expiry.get(&job_key(queue, id)).copied()
    }

    pub fn ready_len(&self, queue: &str) -> usize {
        self.inner.lock().unwrap().ready.get(queue).map_or(0, |r| r.len())
    }

    pub fn delayed_len(&self, queue: &str) -> usize {
        self.inner.lock().unwrap().delayed.get(queue).map_or(0, |d| d.len())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn load(&self, queue: &str, id: &str) -> Result<Option<Job>> {
        Ok(self.inner.lock().unwrap().jobs.get(&job_key(queue, id)).cloned())
    }

    async fn save(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = job_key(&job.queue, &job.id);
        inner.expiry.remove(&key);
        inner.jobs.insert(key, job.clone());
        Ok(())
    }

    async fn delete(&self, queue: &str, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = job_key(queue, id);
        inner.jobs.remove(&key);
        inner.expiry.remove(&key);
        Ok(())
    }

    async fn expire(&self, queue: &str, id: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = job_key(queue, id);
        if inner.jobs.contains_key(&key) {
            inner.expiry.insert(key, ttl);
        }
        Ok(())
    }

    async fn schedule(&self, queue: &str, id: &str, ready_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if ready_at <= Utc::now() {
            inner.ready.entry(queue.to_string()).or_default().push_back(id.to_string());
        } else {
            let delayed = inner.delayed.entry(queue.to_string()).or_default();
            delayed.retain(|(_, existing)| existing != id);
            delayed.push((ready_at, id.to_string()));
        }
        Ok(())
    }

    async fn unschedule(&self, queue: &str, id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let mut removed = false;
        if let Some(ready) = inner.ready.get_mut(queue) {
            let before = ready.len();
            ready.retain(|existing| existing != id);
            removed |= ready.len() != before;
        }
        if let Some(delayed) = inner.delayed.get_mut(queue) {
            let before = delayed.len();
            delayed.retain(|(_, existing)| existing != id);
            removed |= delayed.len() != before;
        }
        Ok(removed)
    }

    async fn claim_next(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let mut inner = self.inner.lock().unwrap();
        let mut due = Vec::new();
        if let Some(delayed) = inner.delayed.get_mut(queue) {
            delayed.sort_by_key(|(at, _)| *at);
            let split = delayed.iter().take_while(|(at, _)| *at <= now).count();
            due = delayed.drain(..split).map(|(_, id)| id).collect();
        }
        let ready = inner.ready.entry(queue.to_string()).or_default();
        ready.extend(due);
        let Some(id) = ready.pop_front() else {
            return Ok(None);
        };
        inner
            .active
            .entry(queue.to_string())
            .or_default()
            .insert(id.clone(), lease_until);
        Ok(Some(id))
    }

    async fn track_active(&self, queue: &str, id: &str, lease_until: DateTime<Utc>) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .active
            .entry(queue.to_string())
            .or_default()
            .insert(id.to_string(), lease_until);
        Ok(())
    }

    async fn release_active(&self, queue: &str, id: &str) -> Result<()> {
        if let Some(active) = self.inner.lock().unwrap().active.get_mut(queue) {
            active.remove(id);
        }
        Ok(())
    }

    async fn reclaim_expired(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(active) = inner.active.get_mut(queue) else {
            return Ok(Vec::new());
        };
        let expired: Vec<String> = active
            .iter()
            .filter(|(_, lease)| **lease <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            active.remove(id);
        }
        Ok(expired)
    }
}

/// `MemoryJobStore` that fails chosen operations once each
#[derive(Default)]
pub struct FlakyJobStore {
    pub inner: MemoryJobStore,
    failing: Mutex<HashMap<&'static str, u32>>,
}

impl FlakyJobStore {
    /// Make the next call to `op` fail with a connection error.
    pub fn fail_once(&self, op: &'static str) {
        *self.failing.lock().unwrap().entry(op).or_default() += 1;
    }

    fn check(&self, op: &'static str) -> Result<()> {
        let mut failing = self.failing.lock().unwrap();
        match failing.get_mut(op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Err(Error::External(anyhow!("connection reset during {}", op)))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl JobStore for FlakyJobStore {
    async fn load(&self, queue: &str, id: &str) -> Result<Option<Job>> {
        self.check("load")?;
        self.inner.load(queue, id).await
    }

    async fn save(&self, job: &Job) -> Result<()> {
        self.check("save")?;
        self.inner.save(job).await
    }

    async fn delete(&self, queue: &str, id: &str) -> Result<()> {
        self.check("delete")?;
        self.inner.delete(queue, id).await
    }

    async fn expire(&self, queue: &str, id: &str, ttl: Duration) -> Result<()> {
        self.check("expire")?;
        self.inner.expire(queue, id, ttl).await
    }

    async fn schedule(&self, queue: &str, id: &str, ready_at: DateTime<Utc>) -> Result<()> {
        self.check("schedule")?;
        self.inner.schedule(queue, id, ready_at).await
    }

    async fn unschedule(&self, queue: &str, id: &str) -> Result<bool> {
        self.check("unschedule")?;
        self.inner.unschedule(queue, id).await
    }

    async fn claim_next(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<String>> {
        self.check("claim_next")?;
        self.inner.claim_next(queue, now, lease_until).await
    }

    async fn track_active(&self, queue: &str, id: &str, lease_until: DateTime<Utc>) -> Result<()> {
        self.check("track_active")?;
        self.inner.track_active(queue, id, lease_until).await
    }

    async fn release_active(&self, queue: &str, id: &str) -> Result<()> {
        self.check("release_active")?;
        self.inner.release_active(queue, id).await
    }

    async fn reclaim_expired(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.check("reclaim_expired")?;
        self.inner.reclaim_expired(queue, now).await
    }
}

/// Exams held in a map, keyed by exam key
#[derive(Default)]
pub struct MemoryExamRepository {
    exams: Mutex<HashMap<String, Exam>>,
}

impl MemoryExamRepository {
    pub fn insert(&self, exam: Exam) {
        self.exams.lock().unwrap().insert(exam.exam_key.clone(), exam);
    }

    pub fn get(&self, exam_key: &str) -> Option<Exam> {
        self.exams.lock().unwrap().get(exam_key).cloned()
    }
}

#[async_trait]
impl ExamRepository for MemoryExamRepository {
    async fn find(&self, exam_key: &str) -> Result<Option<Exam>> {
        Ok(self.get(exam_key))
    }

    async fn replace_question_set(
        &self,
        exam_key: &str,
        questions: &[ParsedQuestion],
    ) -> Result<bool> {
        match self.exams.lock().unwrap().get_mut(exam_key) {
            Some(exam) => {
                exam.question_set = questions.to_vec();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn upsert_submission(&self, exam_key: &str, submission: Submission) -> Result<()> {
        match self.exams.lock().unwrap().get_mut(exam_key) {
            Some(exam) => {
                exam.upsert_submission(submission);
                Ok(())
            }
            None => Err(Error::not_found(format!("Exam {} not found", exam_key))),
        }
    }

    async fn set_access(&self, exam_key: &str, access: ExamAccess) -> Result<()> {
        match self.exams.lock().unwrap().get_mut(exam_key) {
            Some(exam) => {
                exam.access = access;
                Ok(())
            }
            None => Err(Error::not_found(format!("Exam {} not found", exam_key))),
        }
    }

    async fn open_if_scheduled(&self, exam_key: &str) -> Result<bool> {
        let mut exams = self.exams.lock().unwrap();
        match exams.get_mut(exam_key) {
            Some(exam) if exam.access == ExamAccess::Scheduled => {
                exam.access = ExamAccess::Open;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// AI stand-in replaying queued responses and recording every prompt
#[derive(Default)]
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<std::result::Result<String, String>>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, response: &str) {
        self.responses.lock().unwrap().push_back(Ok(response.to_string()));
    }

    pub fn push_err(&self, message: &str) {
        self.responses.lock().unwrap().push_back(Err(message.to_string()));
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, parts: &[String]) -> anyhow::Result<String> {
        self.calls.lock().unwrap().push(parts.to_vec());
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted AI response left")),
        }
    }
}

/// Rasterizer returning fixed bytes
pub struct StaticRasterizer {
    pdf: Vec<u8>,
    last_html: Mutex<Option<String>>,
}

impl StaticRasterizer {
    pub fn new(pdf: Vec<u8>) -> Self {
        Self {
            pdf,
            last_html: Mutex::new(None),
        }
    }

    pub fn last_html(&self) -> Option<String> {
        self.last_html.lock().unwrap().clone()
    }
}

#[async_trait]
impl PdfRasterizer for StaticRasterizer {
    async fn rasterize(&self, html: &str) -> anyhow::Result<Vec<u8>> {
        *self.last_html.lock().unwrap() = Some(html.to_string());
        Ok(self.pdf.clone())
    }
}

/// Object store kept in memory; can be told to fail the next uploads
#[derive(Default)]
pub struct MemoryArtifactStore {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
    failures_left: AtomicU32,
}

impl MemoryArtifactStore {
    pub fn fail_next(&self, uploads: u32) {
        self.failures_left.store(uploads, Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Option<(Vec<u8>, String)> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(Error::External(anyhow!("upload failed: connection reset")));
        }
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(format!("memory://{}", key))
    }
}

/// Write an executable stand-in for `pdftotext` that drains stdin and prints `output`.
///
/// `output` must not contain single quotes.
#[cfg(unix)]
pub fn fake_pdftotext(dir: &std::path::Path, output: &str) -> String {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("pdftotext");
    let mut file = std::fs::File::create(&path).unwrap();
    write!(file, "#!/bin/sh\ncat > /dev/null\nprintf '%s' '{}'\n", output).unwrap();
    file.sync_all().unwrap();
    drop(file);
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}
