//! Job queue coordinator
//!
//! Owns the job lifecycle on top of a `JobStore`:
//! waiting/delayed -> active -> completed | failed, with failed attempts
//! going back to delayed until `attempts` are exhausted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{remove_temp_file, Job, JobInfo, JobOptions, JobPayload, JobState, JobStore, Retention};
use crate::error::{Error, Result};

/// How long a worker owns an active job without renewing its lease
pub const DEFAULT_LEASE: Duration = Duration::from_secs(120);

/// Outcome of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Another attempt was scheduled after the given delay
    Retrying(Duration),
    /// No attempts left (or the error was fatal)
    Failed,
}

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    lease: Duration,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            lease: DEFAULT_LEASE,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Enqueue with a fresh random id.
    pub async fn enqueue(&self, payload: JobPayload, opts: JobOptions) -> Result<Job> {
        self.enqueue_with_id(Uuid::new_v4().to_string(), payload, opts)
            .await
    }

    /// Enqueue under a caller-chosen id.
    ///
    /// An existing pending job with the same id is kept (or replaced when
    /// `opts.replace` is set); a terminal one is overwritten; an active one
    /// is a `Conflict`.
    pub async fn enqueue_with_id(
        &self,
        id: impl Into<String>,
        payload: JobPayload,
        opts: JobOptions,
    ) -> Result<Job> {
        let job = Job::new(id, payload, opts);

        if let Some(existing) = self.store.load(&job.queue, &job.id).await? {
            match existing.state {
                JobState::Active => {
                    return Err(Error::Conflict(format!(
                        "job {} is active and cannot be replaced",
                        job.id
                    )));
                }
                state if state.is_pending() && !job.opts.replace => {
                    info!(
                        "Job {} ({}) already pending; ignoring duplicate enqueue",
                        existing.id,
                        existing.kind()
                    );
                    return Ok(existing);
                }
                state if state.is_pending() => {
                    self.store.unschedule(&existing.queue, &existing.id).await?;
                    info!("Replacing pending job {} ({})", existing.id, existing.kind());
                }
                _ => {}
            }
        }

        self.store.save(&job).await?;
        if let Err(e) = self
            .store
            .schedule(&job.queue, &job.id, job.ready_at)
            .await
        {
            // A record that is never scheduled would swallow later enqueues
            if let Err(cleanup) = self.store.delete(&job.queue, &job.id).await {
                warn!("Failed to roll back unscheduled job {}: {:#}", job.id, cleanup);
            }
            return Err(e);
        }
        info!(
            "Enqueued job {} ({}) on {}, ready at {}",
            job.id,
            job.kind(),
            job.queue,
            job.ready_at
        );
        Ok(job)
    }

    pub async fn get_status(&self, queue: &str, id: &str) -> Result<JobInfo> {
        self.store
            .load(queue, id)
            .await?
            .map(|job| job.info())
            .ok_or_else(|| Error::not_found(format!("Job {} not found", id)))
    }

    /// Remove a job that has not started yet. Returns false if there was
    /// nothing pending to cancel.
    pub async fn cancel(&self, queue: &str, id: &str) -> Result<bool> {
        let Some(job) = self.store.load(queue, id).await? else {
            return Ok(false);
        };
        if !job.state.is_pending() {
            return Ok(false);
        }
        if self.store.unschedule(queue, id).await? {
            self.store.delete(queue, id).await?;
            info!("Cancelled pending job {} ({})", id, job.kind());
            return Ok(true);
        }
        // Already popped by a worker
        Ok(false)
    }

    /// Hand the next ready job to the caller and mark it active.
    ///
    /// Jobs whose worker lease expired are first charged a failed attempt.
    /// Jobs that were claimed but never marked active go back to the queue.
    pub async fn reserve(&self, queue: &str) -> Result<Option<Job>> {
        let now = Utc::now();

        for id in self.store.reclaim_expired(queue, now).await? {
            match self.store.load(queue, &id).await? {
                Some(job) if job.state == JobState::Active => {
                    warn!("Job {} ({}) stalled: worker lease expired", job.id, job.kind());
                    let temp_file = job.payload.temp_file().map(|p| p.to_path_buf());
                    let stalled = Error::External(anyhow::anyhow!(
                        "job stalled: worker lease expired"
                    ));
                    if self.fail(job, &stalled).await? == FailOutcome::Failed {
                        if let Some(path) = temp_file {
                            remove_temp_file(&path).await;
                        }
                    }
                }
                Some(job) if job.state.is_pending() => {
                    warn!(
                        "Job {} ({}) was claimed but never started; requeueing",
                        job.id,
                        job.kind()
                    );
                    self.store.unschedule(queue, &job.id).await?;
                    self.store.schedule(queue, &job.id, job.ready_at).await?;
                }
                _ => {}
            }
        }

        let lease_until = now + lease_delta(self.lease);
        loop {
            let Some(id) = self.store.claim_next(queue, now, lease_until).await? else {
                return Ok(None);
            };
            let Some(mut job) = self.store.load(queue, &id).await? else {
                warn!("Ready job {} on {} has no record; skipping", id, queue);
                self.store.release_active(queue, &id).await?;
                continue;
            };
            if !job.state.is_pending() {
                warn!("Job {} popped in state {:?}; skipping", id, job.state);
                if job.state.is_terminal() {
                    self.store.release_active(queue, &id).await?;
                }
                continue;
            }

            job.state = JobState::Active;
            job.processed_at = Some(now);
            self.store.save(&job).await?;
            info!(
                "Job {} ({}) active, attempt {}/{}",
                job.id,
                job.kind(),
                job.attempts_made + 1,
                job.opts.attempts
            );
            return Ok(Some(job));
        }
    }

    /// Extend the lease of an active job.
    pub async fn renew_lease(&self, job: &Job) -> Result<()> {
        self.store
            .track_active(&job.queue, &job.id, Utc::now() + lease_delta(self.lease))
            .await
    }

    /// Record progress (0-100) on an active job. Failures are logged only.
    pub async fn report_progress(&self, queue: &str, id: &str, progress: u8) {
        let update = async {
            if let Some(mut job) = self.store.load(queue, id).await? {
                if job.state == JobState::Active {
                    job.progress = progress.min(100);
                    self.store.save(&job).await?;
                }
            }
            Ok::<_, Error>(())
        };
        if let Err(e) = update.await {
            warn!("Failed to record progress for job {}: {:#}", id, e);
        }
    }

    pub async fn complete(&self, mut job: Job, result: serde_json::Value) -> Result<()> {
        job.attempts_made += 1;
        job.state = JobState::Completed;
        job.progress = 100;
        job.result = Some(result);
        job.finished_at = Some(Utc::now());

        self.finalize(&job, job.opts.remove_on_complete).await?;
        self.store.release_active(&job.queue, &job.id).await?;
        info!(
            "Job {} ({}) completed after {} attempt(s)",
            job.id,
            job.kind(),
            job.attempts_made
        );
        Ok(())
    }

    pub async fn fail(&self, mut job: Job, err: &Error) -> Result<FailOutcome> {
        job.attempts_made += 1;
        job.failed_reason = Some(format!("{:#}", err));

        if err.is_retryable() && job.attempts_made < job.opts.attempts {
            let delay = job.opts.backoff.delay_for(job.attempts_made);
            job.ready_at = Utc::now() + lease_delta(delay);
            job.state = if delay.is_zero() {
                JobState::Waiting
            } else {
                JobState::Delayed
            };
            self.store.save(&job).await?;
            self.store
                .schedule(&job.queue, &job.id, job.ready_at)
                .await?;
            self.store.release_active(&job.queue, &job.id).await?;
            warn!(
                "Job {} ({}) attempt {}/{} failed: {:#}; retrying in {:?}",
                job.id,
                job.kind(),
                job.attempts_made,
                job.opts.attempts,
                err,
                delay
            );
            return Ok(FailOutcome::Retrying(delay));
        }

        job.state = JobState::Failed;
        job.finished_at = Some(Utc::now());
        self.finalize(&job, job.opts.remove_on_fail).await?;
        self.store.release_active(&job.queue, &job.id).await?;
        error!(
            "Job {} ({}) failed after {} attempt(s): {:#}",
            job.id,
            job.kind(),
            job.attempts_made,
            err
        );
        Ok(FailOutcome::Failed)
    }

    async fn finalize(&self, job: &Job, retention: Retention) -> Result<()> {
        match retention {
            Retention::Remove => self.store.delete(&job.queue, &job.id).await,
            Retention::Keep => self.store.save(job).await,
            Retention::Expire { secs } => {
                self.store.save(job).await?;
                self.store
                    .expire(&job.queue, &job.id, Duration::from_secs(secs))
                    .await
            }
        }
    }
}

fn lease_delta(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1000))
}

/// Per-attempt view handed to a `JobProcessor`
#[derive(Clone)]
pub struct JobContext {
    queue: JobQueue,
    queue_name: String,
    job_id: String,
    /// 1-based attempt being executed
    pub attempt: u32,
    pub max_attempts: u32,
}

impl JobContext {
    pub fn new(queue: JobQueue, job: &Job) -> Self {
        Self {
            queue,
            queue_name: job.queue.clone(),
            job_id: job.id.clone(),
            attempt: job.attempts_made + 1,
            max_attempts: job.opts.attempts,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// No retry follows this attempt, whatever its outcome.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Whether a failure with `err` on this attempt would be retried
    pub fn will_retry(&self, err: &Error) -> bool {
        err.is_retryable() && !self.is_last_attempt()
    }

    pub async fn progress(&self, progress: u8) {
        self.queue
            .report_progress(&self.queue_name, &self.job_id, progress)
            .await;
    }
}
