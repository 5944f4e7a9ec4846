//! Token-authenticated processing leases.
//!
//! One lease per job id, stored as a small hash under `tape:lock:{id}`
//! with a PEXPIRE. The TTL is the cancellation mechanism: a holder that
//! crashes simply stops renewing and the job becomes reclaimable once
//! the lease lapses. Release and extension require the token issued at
//! acquisition, so a stale holder can never touch a lease it no longer
//! owns. All three mutations are single Lua scripts, so two concurrent
//! acquisitions cannot both succeed.

use std::time::Duration;

use chrono::Utc;
use redis::{AsyncCommands, Script};
use tracing::{debug, warn};

use tape_models::JobId;

use crate::error::StoreResult;

/// Default lease TTL (15 minutes).
const DEFAULT_LOCK_TTL_SECS: u64 = 900;

/// Default cap on the total lease lifetime across extensions (1 hour).
const DEFAULT_MAX_LEASE_SECS: u64 = 3600;

fn lock_key(job_id: &str) -> String {
    format!("tape:lock:{}", job_id)
}

fn guard_key(name: &str) -> String {
    format!("tape:guard:{}", name)
}

/// Create the lease only when no live one exists. Expired leases are
/// already gone via PEXPIRE, so absence covers both cases.
const ACQUIRE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], 'token', ARGV[1], 'acquired_at', ARGV[2])
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return 1
"#;

/// Push the expiry forward by ARGV[3] ms, never past acquired_at + the
/// max lease (ARGV[4]). ARGV[2] is the caller's clock in epoch ms.
const EXTEND_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'token') ~= ARGV[1] then
    return 0
end
local now = tonumber(ARGV[2])
local remaining = redis.call('PTTL', KEYS[1])
if remaining < 0 then
    return 0
end
local acquired = tonumber(redis.call('HGET', KEYS[1], 'acquired_at'))
local expiry = now + remaining + tonumber(ARGV[3])
local cap = acquired + tonumber(ARGV[4])
if expiry > cap then
    expiry = cap
end
if expiry <= now then
    return 0
end
redis.call('PEXPIRE', KEYS[1], expiry - now)
return 1
"#;

/// Canonical compare-and-delete release.
const RELEASE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'token') == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Snapshot of a live lease.
#[derive(Debug, Clone)]
pub struct LockInfo {
    pub token: String,
    /// Acquisition time, epoch milliseconds
    pub acquired_at_ms: i64,
    /// Remaining time to live
    pub remaining: Duration,
}

/// Lock store client.
pub struct LockStore {
    client: redis::Client,
    ttl: Duration,
    max_lease: Duration,
}

impl LockStore {
    /// Create a new lock store with explicit lease parameters.
    pub fn new(redis_url: &str, ttl: Duration, max_lease: Duration) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            ttl,
            max_lease,
        })
    }

    /// Create from environment variables (`REDIS_URL`, `LOCK_TTL_SECS`,
    /// `LOCK_MAX_LEASE_SECS`).
    pub fn from_env() -> StoreResult<Self> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let ttl = std::env::var("LOCK_TTL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_LOCK_TTL_SECS);
        let max_lease = std::env::var("LOCK_MAX_LEASE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_LEASE_SECS);
        Self::new(
            &url,
            Duration::from_secs(ttl),
            Duration::from_secs(max_lease),
        )
    }

    /// Lease TTL handed out at acquisition.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn conn(&self) -> StoreResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Connectivity probe for readiness checks.
    pub async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    /// Try to acquire the lease for a job. Returns the issued token, or
    /// `None` when another live lease exists.
    pub async fn acquire(&self, job_id: &JobId) -> StoreResult<Option<String>> {
        let mut conn = self.conn().await?;
        let token = uuid::Uuid::new_v4().to_string();

        let script = Script::new(ACQUIRE_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(lock_key(job_id.as_str()))
            .arg(&token)
            .arg(Utc::now().timestamp_millis())
            .arg(self.ttl.as_millis() as u64);
        let acquired: i32 = invocation.invoke_async(&mut conn).await?;

        if acquired == 1 {
            debug!(job_id = %job_id, "Acquired processing lease");
            Ok(Some(token))
        } else {
            debug!(job_id = %job_id, "Lease held elsewhere");
            Ok(None)
        }
    }

    /// Check that a token matches the live lease.
    pub async fn validate(&self, job_id: &JobId, token: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let current: Option<String> = conn.hget(lock_key(job_id.as_str()), "token").await?;
        Ok(current.as_deref() == Some(token))
    }

    /// Extend the lease. A mismatched token or a missing lease leaves
    /// any other holder's lease untouched and returns `false`.
    pub async fn extend(
        &self,
        job_id: &JobId,
        token: &str,
        additional: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let script = Script::new(EXTEND_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(lock_key(job_id.as_str()))
            .arg(token)
            .arg(Utc::now().timestamp_millis())
            .arg(additional.as_millis() as u64)
            .arg(self.max_lease.as_millis() as u64);
        let extended: i32 = invocation.invoke_async(&mut conn).await?;

        if extended != 1 {
            warn!(job_id = %job_id, "Lease extension rejected");
        }
        Ok(extended == 1)
    }

    /// Release the lease. A mismatched token is a no-op.
    pub async fn release(&self, job_id: &JobId, token: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let script = Script::new(RELEASE_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation.key(lock_key(job_id.as_str())).arg(token);
        let deleted: i32 = invocation.invoke_async(&mut conn).await?;

        if deleted == 1 {
            debug!(job_id = %job_id, "Released processing lease");
        }
        Ok(deleted == 1)
    }

    /// Check whether a live lease exists for a job.
    pub async fn exists(&self, job_id: &JobId) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        Ok(conn.exists(lock_key(job_id.as_str())).await?)
    }

    /// Read-only snapshot of the lease, if live.
    pub async fn peek(&self, job_id: &JobId) -> StoreResult<Option<LockInfo>> {
        let mut conn = self.conn().await?;
        let key = lock_key(job_id.as_str());
        let token: Option<String> = conn.hget(&key, "token").await?;
        let Some(token) = token else {
            return Ok(None);
        };
        let acquired_at_ms: i64 = conn.hget(&key, "acquired_at").await.unwrap_or(0);
        let remaining_ms: i64 = conn.pttl(&key).await?;
        Ok(Some(LockInfo {
            token,
            acquired_at_ms,
            remaining: Duration::from_millis(remaining_ms.max(0) as u64),
        }))
    }

    /// Delete a lease unconditionally. Used by recovery when the owning
    /// job record is gone; never part of the normal holder protocol.
    pub async fn force_delete(&self, job_id: &JobId) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let deleted: i32 = conn.del(lock_key(job_id.as_str())).await?;
        Ok(deleted == 1)
    }

    /// Job ids of every live lease (cursor SCAN over the lease keyspace).
    pub async fn scan_job_ids(&self) -> StoreResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let mut ids = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("tape:lock:*")
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            for key in keys {
                if let Some(id) = key.strip_prefix("tape:lock:") {
                    ids.push(id.to_string());
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(ids)
    }

    /// Number of live leases.
    pub async fn live_count(&self) -> StoreResult<u64> {
        Ok(self.scan_job_ids().await?.len() as u64)
    }

    /// Remaining TTL of a lease in milliseconds. `None` when absent,
    /// `Some(-1)` when the key exists without an expiry (a malformed
    /// record that the sweeper deletes defensively).
    pub async fn remaining_ttl_ms(&self, job_id: &JobId) -> StoreResult<Option<i64>> {
        let mut conn = self.conn().await?;
        let pttl: i64 = conn.pttl(lock_key(job_id.as_str())).await?;
        match pttl {
            -2 => Ok(None),
            other => Ok(Some(other)),
        }
    }

    /// Acquire a named, short-lived guard (not tied to a job). Used as
    /// the cross-instance re-entry interval for the sweeper.
    pub async fn acquire_guard(&self, name: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let result: Option<String> = redis::cmd("SET")
            .arg(guard_key(name))
            .arg(Utc::now().timestamp_millis())
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }
}
