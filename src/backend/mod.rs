//! Queue storage backends.
//!
//! A [`QueueBackend`] holds one physical queue's task-by-status buckets and
//! exposes the atomic push / claim / transition / scan / sweep primitives.
//! Variants are chosen at connect time from the storage URI scheme:
//!
//! | Scheme | Variant |
//! |---|---|
//! | `redis://`, `rediss://` | [`redis::RedisBackend`] (key-value) |
//! | `postgres://`, `postgresql://` | [`postgres::PostgresBackend`] (relational) |
//! | `memory://` | [`memory::MemoryBackend`] (in-process) |

pub mod memory;
pub mod postgres;
pub mod redis;

use crate::error::{Error, Result};
use crate::model::{Status, StatusCounts, TtlPolicy};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Explicit tag for the storage variant behind a backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Redis,
    Postgres,
    Memory,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendKind::Redis => "redis",
            BackendKind::Postgres => "postgres",
            BackendKind::Memory => "memory",
        };
        write!(f, "{s}")
    }
}

/// Durable storage for one queue's keys.
///
/// Every mutating operation is atomic: no collaborator may observe a key
/// removed from one bucket without it having landed in the next.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Physical queue id (`{namespace}:{type}`).
    fn queue_id(&self) -> &str;

    /// Insert `key` into `todo` and record its creation time. Duplicates are legal.
    async fn push(&self, key: &str) -> Result<()>;

    /// Move the oldest `todo` key into `doing` with a fresh lease.
    /// `Ok(None)` when there is no eligible work.
    async fn claim(&self) -> Result<Option<String>>;

    /// Move `key` out of `doing` into `target`, clearing its lease.
    /// `Ok(false)` when the key was no longer in `doing`.
    async fn transition(&self, key: &str, target: Status) -> Result<bool>;

    /// Snapshot of the keys currently in `status`.
    async fn list(&self, status: Status) -> Result<Vec<String>>;

    /// Snapshot of in-flight keys.
    async fn list_doing(&self) -> Result<Vec<String>> {
        self.list(Status::Doing).await
    }

    /// Keys whose lease is older than `timeout`.
    async fn scan_expired_leases(&self, timeout: Duration) -> Result<Vec<String>>;

    /// Requeue every expired lease; returns how many keys actually moved.
    async fn requeue_expired_leases(&self, timeout: Duration) -> Result<usize> {
        let expired = self.scan_expired_leases(timeout).await?;
        let mut moved = 0;
        for key in &expired {
            // false means someone else moved it first
            if self.transition(key, Status::Todo).await? {
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Delete entries older than their status's TTL; returns how many went.
    async fn sweep_ttl(&self, policy: &TtlPolicy) -> Result<usize>;

    async fn counts(&self) -> Result<StatusCounts>;

    /// Delete every entry in the given statuses.
    async fn reset(&self, statuses: &[Status]) -> Result<()>;
}

/// Reject transition targets that are not reachable from `doing`.
pub(crate) fn check_target(target: Status) -> Result<()> {
    if Status::Doing.can_transition_to(target) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: Status::Doing,
            to: target,
        })
    }
}

/// A connected storage, shared by every backend instance opened from it.
#[derive(Clone)]
pub enum Storage {
    Redis(::redis::aio::MultiplexedConnection),
    Postgres(sqlx::PgPool),
    Memory(Arc<memory::MemoryStore>),
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Storage").field(&self.kind()).finish()
    }
}

impl Storage {
    /// Connect to the storage named by `uri`, dispatching on its scheme.
    ///
    /// The relational variant runs pending migrations before returning.
    pub async fn connect(uri: &str) -> Result<Self> {
        let scheme = uri
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .ok_or_else(|| Error::UnsupportedScheme("<missing>".to_string()))?;

        match scheme {
            "redis" | "rediss" => Ok(Storage::Redis(redis::RedisBackend::connect(uri).await?)),
            "postgres" | "postgresql" => {
                Ok(Storage::Postgres(postgres::PostgresBackend::connect(uri).await?))
            }
            "memory" => Ok(Storage::Memory(Arc::new(memory::MemoryStore::default()))),
            other => Err(Error::UnsupportedScheme(other.to_string())),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Storage::Redis(_) => BackendKind::Redis,
            Storage::Postgres(_) => BackendKind::Postgres,
            Storage::Memory(_) => BackendKind::Memory,
        }
    }

    /// Open the backend instance for one physical queue.
    pub async fn open(&self, queue_id: &str) -> Result<Arc<dyn QueueBackend>> {
        let backend: Arc<dyn QueueBackend> = match self {
            Storage::Redis(conn) => {
                Arc::new(redis::RedisBackend::open(conn.clone(), queue_id).await?)
            }
            Storage::Postgres(pool) => {
                Arc::new(postgres::PostgresBackend::new(pool.clone(), queue_id))
            }
            Storage::Memory(store) => Arc::new(memory::MemoryBackend::new(store.clone(), queue_id)),
        };
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_scheme_is_rejected() {
        let err = Storage::connect("mysql://localhost/db").await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedScheme(s) if s == "mysql"));
        assert!(Storage::connect("no-scheme").await.is_err());
    }

    #[tokio::test]
    async fn memory_scheme_needs_no_server() {
        let storage = Storage::connect("memory://").await.unwrap();
        assert_eq!(storage.kind(), BackendKind::Memory);
        let backend = storage.open("ns:t").await.unwrap();
        assert_eq!(backend.kind(), BackendKind::Memory);
        assert_eq!(backend.queue_id(), "ns:t");
    }

    #[test]
    fn only_doing_exits_are_valid_targets() {
        assert!(check_target(Status::Done).is_ok());
        assert!(check_target(Status::Todo).is_ok());
        assert!(check_target(Status::Doing).is_err());
    }
}
