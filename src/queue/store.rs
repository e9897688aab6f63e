//! Job persistence
//!
//! `JobStore` is the primitive layer the coordinator builds on. The Redis
//! implementation keeps, per queue:
//! - one JSON record per job
//! - a ready list (FIFO)
//! - a delayed sorted set scored by ready-at epoch millis
//! - an active sorted set scored by worker lease deadline

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::info;

use super::Job;
use crate::error::Result;

/// Max number of due delayed jobs promoted per poll
const PROMOTE_BATCH: isize = 100;

/// Promote due delayed ids, pop the next ready id and lease it in one step.
///
/// KEYS: ready, delayed, active. ARGV: now (ms), lease deadline (ms), batch.
const CLAIM_NEXT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[3]))
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[2], id)
    redis.call('RPUSH', KEYS[1], id)
end
local id = redis.call('LPOP', KEYS[1])
if id then
    redis.call('ZADD', KEYS[3], ARGV[2], id)
end
return id
"#;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load(&self, queue: &str, id: &str) -> Result<Option<Job>>;

    /// Insert or overwrite the record (clears any expiry).
    async fn save(&self, job: &Job) -> Result<()>;

    async fn delete(&self, queue: &str, id: &str) -> Result<()>;

    async fn expire(&self, queue: &str, id: &str, ttl: Duration) -> Result<()>;

    /// Make a job reservable at `ready_at`; immediately if it is not in the future.
    async fn schedule(&self, queue: &str, id: &str, ready_at: DateTime<Utc>) -> Result<()>;

    /// Take a job out of the ready list and delayed set.
    /// Returns true if it was still pending there.
    async fn unschedule(&self, queue: &str, id: &str) -> Result<bool>;

    /// Promote due delayed jobs, then pop the next ready id and lease it
    /// until `lease_until` in the same step.
    ///
    /// A claimed id is always in the active set, so a claim that is never
    /// followed up is found again by `reclaim_expired`.
    async fn claim_next(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<String>>;

    /// Record (or extend) the lease of an active job.
    async fn track_active(&self, queue: &str, id: &str, lease_until: DateTime<Utc>) -> Result<()>;

    async fn release_active(&self, queue: &str, id: &str) -> Result<()>;

    /// Claim active jobs whose lease expired. Each id is returned to exactly one caller.
    async fn reclaim_expired(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<String>>;
}

/// Redis key helpers
mod keys {
    pub fn job(prefix: &str, queue: &str, id: &str) -> String {
        format!("{}:{}:job:{}", prefix, queue, id)
    }

    pub fn ready(prefix: &str, queue: &str) -> String {
        format!("{}:{}:ready", prefix, queue)
    }

    pub fn delayed(prefix: &str, queue: &str) -> String {
        format!("{}:{}:delayed", prefix, queue)
    }

    pub fn active(prefix: &str, queue: &str) -> String {
        format!("{}:{}:active", prefix, queue)
    }
}

/// Redis-backed job store
#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
    prefix: String,
    claim_script: Script,
}

impl RedisJobStore {
    /// Connect to Redis at the given URL.
    ///
    /// The connection manager reconnects on its own after failures.
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        info!("Connected to Redis at {}", redis_url);
        Ok(Self::new(conn, prefix))
    }

    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            claim_script: Script::new(CLAIM_NEXT),
        }
    }

    /// Shared connection, for other Redis-backed components
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn load(&self, queue: &str, id: &str) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(keys::job(&self.prefix, queue, id)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, job: &Job) -> Result<()> {
        let json = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(keys::job(&self.prefix, &job.queue, &job.id), json)
            .await?;
        Ok(())
    }

    async fn delete(&self, queue: &str, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(keys::job(&self.prefix, queue, id)).await?;
        Ok(())
    }

    async fn expire(&self, queue: &str, id: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(
            keys::job(&self.prefix, queue, id),
            ttl.as_secs().max(1) as i64,
        )
        .await?;
        Ok(())
    }

    async fn schedule(&self, queue: &str, id: &str, ready_at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.clone();
        if ready_at <= Utc::now() {
            conn.rpush::<_, _, ()>(keys::ready(&self.prefix, queue), id)
                .await?;
        } else {
            conn.zadd::<_, _, _, ()>(
                keys::delayed(&self.prefix, queue),
                id,
                ready_at.timestamp_millis(),
            )
            .await?;
        }
        Ok(())
    }

    async fn unschedule(&self, queue: &str, id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let from_ready: i64 = conn.lrem(keys::ready(&self.prefix, queue), 0, id).await?;
        let from_delayed: i64 = conn.zrem(keys::delayed(&self.prefix, queue), id).await?;
        Ok(from_ready + from_delayed > 0)
    }

    async fn claim_next(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let id: Option<String> = self
            .claim_script
            .key(keys::ready(&self.prefix, queue))
            .key(keys::delayed(&self.prefix, queue))
            .key(keys::active(&self.prefix, queue))
            .arg(now.timestamp_millis())
            .arg(lease_until.timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await?;
        Ok(id)
    }

    async fn track_active(&self, queue: &str, id: &str, lease_until: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(
            keys::active(&self.prefix, queue),
            id,
            lease_until.timestamp_millis(),
        )
        .await?;
        Ok(())
    }

    async fn release_active(&self, queue: &str, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(keys::active(&self.prefix, queue), id)
            .await?;
        Ok(())
    }

    async fn reclaim_expired(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let active_key = keys::active(&self.prefix, queue);
        let expired: Vec<String> = conn
            .zrangebyscore_limit(&active_key, "-inf", now.timestamp_millis(), 0, PROMOTE_BATCH)
            .await?;

        let mut claimed = Vec::new();
        for id in expired {
            let removed: i64 = conn.zrem(&active_key, &id).await?;
            if removed == 1 {
                claimed.push(id);
            }
        }
        Ok(claimed)
    }
}
