//! Redis (key-value) queue backend.
//!
//! # Key Schema
//!
//! | Key | Type | Purpose |
//! |-----|------|---------|
//! | `{queue}:todo` | List | Enqueued keys, `LPUSH` in / `RPOP` out (FIFO) |
//! | `{queue}:doing` | Set | Claimed keys |
//! | `{queue}:done`, `:error`, `:null` | List | Terminal buckets |
//! | `{queue}:doing_time` | Sorted Set | Lease index, score = claim time (ms) |
//! | `{queue}:create_time` | Hash | key -> enqueue time (ms), drives TTL |
//! | `{queue}:state` | String | `{"status": "active"}` |
//! | `{queue}:control` | - | Reserved |
//!
//! Every compound mutation (claim, transition, per-key TTL removal) is a Lua
//! script, so it applies fully or not at all.

use std::collections::BTreeSet;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::{BackendKind, QueueBackend, check_target};
use crate::error::Result;
use crate::model::{Status, StatusCounts, TtlPolicy};
use crate::telemetry::metrics;

// ---------------------------------------------------------------------------
// Lua scripts
// ---------------------------------------------------------------------------

/// KEYS[1] = todo, KEYS[2] = create_time. ARGV[1] = key, ARGV[2] = now ms.
const LUA_PUSH: &str = r#"
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
redis.call('LPUSH', KEYS[1], ARGV[1])
return 1
"#;

/// KEYS[1] = todo, KEYS[2] = doing, KEYS[3] = doing_time. ARGV[1] = now ms.
/// Returns the claimed key or nil.
const LUA_CLAIM: &str = r#"
local key = redis.call('RPOP', KEYS[1])
if not key then
    return false
end
redis.call('SADD', KEYS[2], key)
redis.call('ZADD', KEYS[3], tonumber(ARGV[1]), key)
return key
"#;

/// KEYS[1] = doing, KEYS[2] = doing_time, KEYS[3] = target list. ARGV[1] = key.
/// Returns 1 if moved, 0 if the key was not in doing.
const LUA_TRANSITION: &str = r#"
if redis.call('SREM', KEYS[1], ARGV[1]) == 0 then
    return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('LPUSH', KEYS[3], ARGV[1])
return 1
"#;

/// KEYS[1] = status list, KEYS[2] = create_time. ARGV[1] = key, ARGV[2] = cutoff ms.
/// Removes the key from this list only if its creation time is still older
/// than the cutoff and it is still a member. Returns the number removed.
const LUA_EXPIRE_LISTED: &str = r#"
local created = redis.call('HGET', KEYS[2], ARGV[1])
if not created or tonumber(created) >= tonumber(ARGV[2]) then
    return 0
end
local removed = redis.call('LREM', KEYS[1], 0, ARGV[1])
if removed > 0 then
    redis.call('HDEL', KEYS[2], ARGV[1])
end
return removed
"#;

/// KEYS[1] = doing, KEYS[2] = doing_time, KEYS[3] = create_time.
/// ARGV[1] = key, ARGV[2] = cutoff ms. Returns 1 if removed.
const LUA_EXPIRE_DOING: &str = r#"
local started = redis.call('ZSCORE', KEYS[2], ARGV[1])
if not started or tonumber(started) >= tonumber(ARGV[2]) then
    return 0
end
if redis.call('SREM', KEYS[1], ARGV[1]) == 0 then
    return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
return 1
"#;

struct LuaScripts {
    push: Script,
    claim: Script,
    transition: Script,
    expire_listed: Script,
    expire_doing: Script,
}

impl LuaScripts {
    fn new() -> Self {
        Self {
            push: Script::new(LUA_PUSH),
            claim: Script::new(LUA_CLAIM),
            transition: Script::new(LUA_TRANSITION),
            expire_listed: Script::new(LUA_EXPIRE_LISTED),
            expire_doing: Script::new(LUA_EXPIRE_DOING),
        }
    }
}

// ---------------------------------------------------------------------------
// RedisBackend
// ---------------------------------------------------------------------------

/// Key-value backend for one physical queue.
///
/// Holds a [`MultiplexedConnection`]; clones share one TCP connection, so
/// every queue opened from the same storage multiplexes over it.
pub struct RedisBackend {
    conn: MultiplexedConnection,
    queue_id: String,
    scripts: LuaScripts,
}

impl RedisBackend {
    /// Connect to Redis. URL format: `redis://[[user]:<password>@]<host>:<port>[/<db>]`.
    pub async fn connect(url: &str) -> Result<MultiplexedConnection> {
        let client = ::redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }

    /// Open the queue `queue_id` and mark it active.
    pub async fn open(conn: MultiplexedConnection, queue_id: &str) -> Result<Self> {
        let backend = Self {
            conn,
            queue_id: queue_id.to_string(),
            scripts: LuaScripts::new(),
        };
        backend.set_state(&serde_json::json!({"status": "active"})).await?;
        info!(queue = %backend.queue_id, "opened redis queue");
        Ok(backend)
    }

    /// The queue's status document.
    pub async fn state(&self) -> Result<serde_json::Value> {
        let text: Option<String> = self.conn.clone().get(self.state_key()).await?;
        match text {
            Some(text) => Ok(serde_json::from_str(&text)?),
            None => Ok(serde_json::json!({})),
        }
    }

    pub async fn set_state(&self, state: &serde_json::Value) -> Result<()> {
        let _: () = self
            .conn
            .clone()
            .set(self.state_key(), serde_json::to_string(state)?)
            .await?;
        Ok(())
    }

    fn status_key(&self, status: Status) -> String {
        format!("{}:{}", self.queue_id, status)
    }

    fn doing_time_key(&self) -> String {
        format!("{}:doing_time", self.queue_id)
    }

    fn create_time_key(&self) -> String {
        format!("{}:create_time", self.queue_id)
    }

    fn state_key(&self) -> String {
        format!("{}:state", self.queue_id)
    }

    /// Remove expired members of one list bucket.
    async fn expire_listed(&self, status: Status, ttl: Duration) -> Result<usize> {
        let list_key = self.status_key(status);
        let create_key = self.create_time_key();
        let mut conn = self.conn.clone();

        let members: Vec<String> = conn.lrange(&list_key, 0, -1).await?;
        let members: Vec<String> = members.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        if members.is_empty() {
            return Ok(0);
        }

        let created: Vec<Option<i64>> = ::redis::cmd("HMGET")
            .arg(&create_key)
            .arg(&members)
            .query_async(&mut conn)
            .await?;

        let cutoff = cutoff_ms(ttl);
        let mut removed = 0usize;
        for (key, created) in members.iter().zip(created) {
            match created {
                Some(ms) if ms < cutoff => {
                    let n: i64 = self
                        .scripts
                        .expire_listed
                        .key(&list_key)
                        .key(&create_key)
                        .arg(key)
                        .arg(cutoff)
                        .invoke_async(&mut conn)
                        .await?;
                    removed += n.max(0) as usize;
                }
                Some(_) => {}
                // Predates creation tracking; keep it.
                None => warn!(queue = %self.queue_id, %status, key = %key, "no create_time, skipping ttl"),
            }
        }
        Ok(removed)
    }

    /// Remove doing members whose lease started before the TTL cutoff.
    async fn expire_doing(&self, ttl: Duration) -> Result<usize> {
        let mut conn = self.conn.clone();
        let cutoff = cutoff_ms(ttl);
        let stale: Vec<String> = conn
            .zrangebyscore(self.doing_time_key(), "-inf", format!("({cutoff}"))
            .await?;

        let mut removed = 0usize;
        for key in &stale {
            let n: i64 = self
                .scripts
                .expire_doing
                .key(self.status_key(Status::Doing))
                .key(self.doing_time_key())
                .key(self.create_time_key())
                .arg(key)
                .arg(cutoff)
                .invoke_async(&mut conn)
                .await?;
            removed += n.max(0) as usize;
        }
        Ok(removed)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn cutoff_ms(age: Duration) -> i64 {
    now_ms() - age.as_millis() as i64
}

#[async_trait]
impl QueueBackend for RedisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    fn queue_id(&self) -> &str {
        &self.queue_id
    }

    async fn push(&self, key: &str) -> Result<()> {
        let _: i64 = self
            .scripts
            .push
            .key(self.status_key(Status::Todo))
            .key(self.create_time_key())
            .arg(key)
            .arg(now_ms())
            .invoke_async(&mut self.conn.clone())
            .await?;
        metrics::record_queue_operation(&self.queue_id, "push");
        debug!(queue = %self.queue_id, "pushed key");
        Ok(())
    }

    async fn claim(&self) -> Result<Option<String>> {
        let key: Option<String> = self
            .scripts
            .claim
            .key(self.status_key(Status::Todo))
            .key(self.status_key(Status::Doing))
            .key(self.doing_time_key())
            .arg(now_ms())
            .invoke_async(&mut self.conn.clone())
            .await?;
        metrics::record_queue_operation(
            &self.queue_id,
            if key.is_some() { "claim" } else { "claim_empty" },
        );
        Ok(key)
    }

    async fn transition(&self, key: &str, target: Status) -> Result<bool> {
        check_target(target)?;
        let moved: i64 = self
            .scripts
            .transition
            .key(self.status_key(Status::Doing))
            .key(self.doing_time_key())
            .key(self.status_key(target))
            .arg(key)
            .invoke_async(&mut self.conn.clone())
            .await?;
        let moved = moved > 0;
        if moved {
            metrics::record_transition(Status::Doing, target);
            debug!(queue = %self.queue_id, %target, "moved key out of doing");
        }
        Ok(moved)
    }

    async fn list(&self, status: Status) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = match status {
            Status::Doing => conn.smembers(self.status_key(status)).await?,
            _ => conn.lrange(self.status_key(status), 0, -1).await?,
        };
        Ok(keys)
    }

    async fn scan_expired_leases(&self, timeout: Duration) -> Result<Vec<String>> {
        let cutoff = cutoff_ms(timeout);
        let keys: Vec<String> = self
            .conn
            .clone()
            .zrangebyscore(self.doing_time_key(), "-inf", format!("({cutoff}"))
            .await?;
        Ok(keys)
    }

    async fn sweep_ttl(&self, policy: &TtlPolicy) -> Result<usize> {
        let mut total = 0usize;
        for (status, ttl) in policy.iter() {
            let removed = match status {
                Status::Doing => self.expire_doing(ttl).await?,
                _ => self.expire_listed(status, ttl).await?,
            };
            if removed > 0 {
                metrics::record_swept(&self.queue_id, status, removed);
                debug!(queue = %self.queue_id, %status, removed, "removed expired keys");
            }
            total += removed;
        }
        Ok(total)
    }

    async fn counts(&self) -> Result<StatusCounts> {
        let (todo, doing, done, error, null): (u64, u64, u64, u64, u64) = ::redis::pipe()
            .llen(self.status_key(Status::Todo))
            .scard(self.status_key(Status::Doing))
            .llen(self.status_key(Status::Done))
            .llen(self.status_key(Status::Error))
            .llen(self.status_key(Status::Null))
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(StatusCounts {
            todo,
            doing,
            done,
            error,
            null,
        })
    }

    async fn reset(&self, statuses: &[Status]) -> Result<()> {
        let mut keys: Vec<String> = statuses.iter().map(|s| self.status_key(*s)).collect();
        if statuses.contains(&Status::Doing) {
            keys.push(self.doing_time_key());
        }
        if Status::ALL.iter().all(|s| statuses.contains(s)) {
            keys.push(self.create_time_key());
        }
        if !keys.is_empty() {
            let _: () = self.conn.clone().del(keys).await?;
        }
        info!(queue = %self.queue_id, ?statuses, "queue reset");
        Ok(())
    }
}

/// Tests against a live Redis.
///
/// ```bash
/// REDIS_URL=redis://127.0.0.1:6379/0 cargo test -- --ignored redis_
/// ```
#[cfg(test)]
mod tests {
    use super::*;

    async fn test_backend() -> RedisBackend {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string());
        let conn = RedisBackend::connect(&url).await.unwrap();
        let queue = format!("qtask-test-{}:t", uuid::Uuid::new_v4().simple());
        RedisBackend::open(conn, &queue).await.unwrap()
    }

    #[tokio::test]
    #[ignore] // Requires running Redis
    async fn redis_claim_is_fifo_and_moves_to_doing() {
        let backend = test_backend().await;
        backend.push("a").await.unwrap();
        backend.push("b").await.unwrap();

        assert_eq!(backend.claim().await.unwrap().as_deref(), Some("a"));
        assert_eq!(backend.list_doing().await.unwrap(), vec!["a".to_string()]);
        assert_eq!(backend.list(Status::Todo).await.unwrap(), vec!["b".to_string()]);
        backend.reset(&Status::ALL).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires running Redis
    async fn redis_transition_out_of_doing_only_once() {
        let backend = test_backend().await;
        backend.push("a").await.unwrap();
        backend.claim().await.unwrap();

        assert!(backend.transition("a", Status::Done).await.unwrap());
        assert!(!backend.transition("a", Status::Error).await.unwrap());
        let counts = backend.counts().await.unwrap();
        assert_eq!((counts.done, counts.error, counts.doing), (1, 0, 0));
        assert!(backend.scan_expired_leases(Duration::ZERO).await.unwrap().is_empty());
        backend.reset(&Status::ALL).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires running Redis
    async fn redis_state_document_marks_queue_active() {
        let backend = test_backend().await;
        assert_eq!(backend.state().await.unwrap()["status"], "active");
        let _: () = backend.conn.clone().del(backend.state_key()).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires running Redis
    async fn redis_ttl_sweep_removes_expired_todo_once() {
        let backend = test_backend().await;
        backend.push("old").await.unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;

        let policy = TtlPolicy::new().with(Status::Todo, Duration::from_secs(1));
        assert_eq!(backend.sweep_ttl(&policy).await.unwrap(), 1);
        assert_eq!(backend.sweep_ttl(&policy).await.unwrap(), 0);
        assert_eq!(backend.counts().await.unwrap().todo, 0);
        backend.reset(&Status::ALL).await.unwrap();
    }
}
