//! Worker pools
//!
//! Each pool runs `concurrency` independent loops against one queue. A job is
//! delivered to exactly one loop; its lease is renewed in the background while
//! the processor runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::coordinator::{JobContext, JobQueue};
use super::Job;
use crate::error::Result;

/// Executes the body of one job attempt
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job, ctx: &JobContext) -> Result<serde_json::Value>;
}

pub struct WorkerPool {
    name: String,
    queue: JobQueue,
    queue_name: String,
    processor: Arc<dyn JobProcessor>,
    concurrency: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(
        name: impl Into<String>,
        queue: JobQueue,
        queue_name: impl Into<String>,
        processor: Arc<dyn JobProcessor>,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            queue_name: queue_name.into(),
            processor,
            concurrency: 1,
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Spawn the worker loops. They exit after their current job once
    /// `shutdown` flips to true.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let pool = Arc::new(self);
        info!(
            "Starting worker pool '{}' on {} with {} worker(s)",
            pool.name, pool.queue_name, pool.concurrency
        );
        (0..pool.concurrency)
            .map(|slot| {
                let pool = pool.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.run_loop(slot, shutdown).await })
            })
            .collect()
    }

    async fn run_loop(&self, slot: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                info!("Worker {}#{} stopping", self.name, slot);
                return;
            }
            match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!("Worker {}#{} queue error: {:#}. Backing off...", self.name, slot, e);
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Reserve and run at most one job. Returns whether a job was processed.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(job) = self.queue.reserve(&self.queue_name).await? else {
            return Ok(false);
        };
        let ctx = JobContext::new(self.queue.clone(), &job);

        let heartbeat = self.spawn_lease_heartbeat(job.clone());
        let outcome = self.processor.process(&job, &ctx).await;
        heartbeat.abort();

        match outcome {
            Ok(result) => self.queue.complete(job, result).await?,
            Err(e) => {
                self.queue.fail(job, &e).await?;
            }
        }
        Ok(true)
    }

    /// Keep the job's lease alive while it runs
    fn spawn_lease_heartbeat(&self, job: Job) -> JoinHandle<()> {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            let interval = (queue.lease() / 2).max(Duration::from_millis(100));
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = queue.renew_lease(&job).await {
                    error!("Failed to renew lease for job {}: {:#}", job.id, e);
                }
            }
        })
    }
}
