//! In-process queue backend.
//!
//! Mirrors the key-value layout (lists for todo and terminal buckets, a set
//! for doing, lease and creation timestamps) behind one mutex per storage.
//! Used for tests and for single-process deployments that need no server.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{BackendKind, QueueBackend, check_target};
use crate::error::Result;
use crate::model::{Status, StatusCounts, TtlPolicy};
use crate::telemetry::metrics;

#[derive(Debug, Default)]
struct QueueState {
    /// Front is newest, back is next to claim.
    todo: VecDeque<String>,
    done: VecDeque<String>,
    error: VecDeque<String>,
    null: VecDeque<String>,
    /// key -> lease start
    doing: HashMap<String, DateTime<Utc>>,
    /// key -> enqueue time
    created: HashMap<String, DateTime<Utc>>,
}

impl QueueState {
    fn bucket(&mut self, status: Status) -> Option<&mut VecDeque<String>> {
        match status {
            Status::Todo => Some(&mut self.todo),
            Status::Done => Some(&mut self.done),
            Status::Error => Some(&mut self.error),
            Status::Null => Some(&mut self.null),
            Status::Doing => None,
        }
    }
}

/// Shared state for every queue opened on one `memory://` storage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    queues: Mutex<HashMap<String, QueueState>>,
}

/// In-process backend for one physical queue.
pub struct MemoryBackend {
    store: Arc<MemoryStore>,
    queue_id: String,
}

impl MemoryBackend {
    pub fn new(store: Arc<MemoryStore>, queue_id: &str) -> Self {
        Self {
            store,
            queue_id: queue_id.to_string(),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut QueueState) -> T) -> T {
        let mut queues = self.store.queues.lock();
        let state = queues.entry(self.queue_id.clone()).or_default();
        f(state)
    }
}

fn older_than(since: DateTime<Utc>, now: DateTime<Utc>, age: Duration) -> bool {
    // future timestamps (clock skew) count as age zero
    (now - since).to_std().unwrap_or_default() > age
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn queue_id(&self) -> &str {
        &self.queue_id
    }

    async fn push(&self, key: &str) -> Result<()> {
        self.with_state(|state| {
            state.created.insert(key.to_string(), Utc::now());
            state.todo.push_front(key.to_string());
        });
        metrics::record_queue_operation(&self.queue_id, "push");
        Ok(())
    }

    async fn claim(&self) -> Result<Option<String>> {
        let key = self.with_state(|state| {
            let key = state.todo.pop_back()?;
            state.doing.insert(key.clone(), Utc::now());
            Some(key)
        });
        metrics::record_queue_operation(
            &self.queue_id,
            if key.is_some() { "claim" } else { "claim_empty" },
        );
        Ok(key)
    }

    async fn transition(&self, key: &str, target: Status) -> Result<bool> {
        check_target(target)?;
        let moved = self.with_state(|state| {
            if state.doing.remove(key).is_none() {
                return false;
            }
            if let Some(bucket) = state.bucket(target) {
                bucket.push_front(key.to_string());
            }
            true
        });
        if moved {
            metrics::record_transition(Status::Doing, target);
            debug!(queue = %self.queue_id, %target, "moved key out of doing");
        }
        Ok(moved)
    }

    async fn list(&self, status: Status) -> Result<Vec<String>> {
        Ok(self.with_state(|state| {
            if status == Status::Doing {
                return state.doing.keys().cloned().collect();
            }
            state
                .bucket(status)
                .map(|b| b.iter().cloned().collect())
                .unwrap_or_default()
        }))
    }

    async fn scan_expired_leases(&self, timeout: Duration) -> Result<Vec<String>> {
        let now = Utc::now();
        Ok(self.with_state(|state| {
            state
                .doing
                .iter()
                .filter(|(_, started)| older_than(**started, now, timeout))
                .map(|(key, _)| key.clone())
                .collect()
        }))
    }

    async fn sweep_ttl(&self, policy: &TtlPolicy) -> Result<usize> {
        let now = Utc::now();
        let mut total = 0usize;
        for (status, ttl) in policy.iter() {
            let removed = self.with_state(|state| {
                if status == Status::Doing {
                    let expired: Vec<String> = state
                        .doing
                        .iter()
                        .filter(|(_, started)| older_than(**started, now, ttl))
                        .map(|(key, _)| key.clone())
                        .collect();
                    for key in &expired {
                        state.doing.remove(key);
                        state.created.remove(key);
                    }
                    return expired.len();
                }

                let members: HashSet<String> = state
                    .bucket(status)
                    .map(|b| b.iter().cloned().collect())
                    .unwrap_or_default();
                let mut expired = HashSet::new();
                for key in members {
                    match state.created.get(&key) {
                        Some(created) if older_than(*created, now, ttl) => {
                            expired.insert(key);
                        }
                        Some(_) => {}
                        None => {
                            warn!(queue = %self.queue_id, %status, key = %key, "no create_time, skipping ttl")
                        }
                    }
                }
                let mut removed = 0;
                if let Some(bucket) = state.bucket(status) {
                    let before = bucket.len();
                    bucket.retain(|k| !expired.contains(k));
                    removed = before - bucket.len();
                }
                for key in &expired {
                    state.created.remove(key);
                }
                removed
            });
            if removed > 0 {
                metrics::record_swept(&self.queue_id, status, removed);
                debug!(queue = %self.queue_id, %status, removed, "removed expired keys");
            }
            total += removed;
        }
        Ok(total)
    }

    async fn counts(&self) -> Result<StatusCounts> {
        Ok(self.with_state(|state| StatusCounts {
            todo: state.todo.len() as u64,
            doing: state.doing.len() as u64,
            done: state.done.len() as u64,
            error: state.error.len() as u64,
            null: state.null.len() as u64,
        }))
    }

    async fn reset(&self, statuses: &[Status]) -> Result<()> {
        self.with_state(|state| {
            for status in statuses {
                if *status == Status::Doing {
                    state.doing.clear();
                } else if let Some(bucket) = state.bucket(*status) {
                    bucket.clear();
                }
            }
            if Status::ALL.iter().all(|s| statuses.contains(s)) {
                state.created.clear();
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> MemoryBackend {
        MemoryBackend::new(Arc::new(MemoryStore::default()), "ns:t")
    }

    #[tokio::test]
    async fn claim_takes_oldest_first() {
        let b = backend();
        b.push("a").await.unwrap();
        b.push("b").await.unwrap();
        assert_eq!(b.claim().await.unwrap().as_deref(), Some("a"));
        assert_eq!(b.claim().await.unwrap().as_deref(), Some("b"));
        assert_eq!(b.claim().await.unwrap(), None);
    }

    #[tokio::test]
    async fn transition_requires_key_in_doing() {
        let b = backend();
        b.push("a").await.unwrap();
        assert!(!b.transition("a", Status::Done).await.unwrap());
        b.claim().await.unwrap();
        assert!(b.transition("a", Status::Done).await.unwrap());
        assert!(!b.transition("a", Status::Done).await.unwrap());
        assert_eq!(b.list(Status::Done).await.unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn transition_to_doing_is_rejected() {
        let b = backend();
        assert!(b.transition("a", Status::Doing).await.is_err());
    }

    #[tokio::test]
    async fn queues_on_one_store_are_isolated() {
        let store = Arc::new(MemoryStore::default());
        let a = MemoryBackend::new(store.clone(), "ns:a");
        let b = MemoryBackend::new(store, "ns:b");
        a.push("x").await.unwrap();
        assert_eq!(b.claim().await.unwrap(), None);
        assert_eq!(a.counts().await.unwrap().todo, 1);
    }

    #[tokio::test]
    async fn sweep_skips_keys_without_creation_time() {
        let b = backend();
        b.with_state(|s| s.done.push_front("legacy".to_string()));
        tokio::time::sleep(Duration::from_millis(5)).await;
        let policy = TtlPolicy::new().with(Status::Done, Duration::ZERO);
        assert_eq!(b.sweep_ttl(&policy).await.unwrap(), 0);
        assert_eq!(b.counts().await.unwrap().done, 1);
    }

    #[tokio::test]
    async fn doing_ttl_ages_from_lease_start() {
        let b = backend();
        b.push("a").await.unwrap();
        b.claim().await.unwrap();
        let policy = TtlPolicy::new().with(Status::Doing, Duration::from_secs(60));
        assert_eq!(b.sweep_ttl(&policy).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let policy = TtlPolicy::new().with(Status::Doing, Duration::ZERO);
        assert_eq!(b.sweep_ttl(&policy).await.unwrap(), 1);
        assert_eq!(b.counts().await.unwrap().total(), 0);
    }
}
