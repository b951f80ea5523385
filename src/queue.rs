//! Task-level queue facade.
//!
//! [`TaskQueue`] owns one backend instance per task type within a namespace,
//! created lazily on first use, and translates between [`TaskRecord`]s and
//! the raw keys backends store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendKind, QueueBackend, Storage};
use crate::engine::sweeper::ExpirySweeper;
use crate::error::Result;
use crate::model::{Status, StatusCounts, TaskRecord, TtlPolicy};
use crate::telemetry::metrics;

/// Backend construction parameters shared by every type in a namespace.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Per-status retention. Empty means no sweeper runs.
    pub ttl: TtlPolicy,
    pub sweep_interval: Duration,
    /// Upper bound on waiting for a sweeper to exit on shutdown.
    pub stop_timeout: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            ttl: TtlPolicy::default(),
            sweep_interval: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct Inner {
    backends: HashMap<String, Arc<dyn QueueBackend>>,
    sweepers: Vec<ExpirySweeper>,
}

pub struct TaskQueue {
    namespace: String,
    storage: Storage,
    options: QueueOptions,
    inner: Mutex<Inner>,
    shutdown: CancellationToken,
}

impl TaskQueue {
    /// Connect to `uri` and build a queue for `namespace`.
    pub async fn connect(namespace: &str, uri: &str, options: QueueOptions) -> Result<Self> {
        let storage = Storage::connect(uri).await?;
        Ok(Self::new(namespace, storage, options))
    }

    /// Build a queue over an existing storage connection.
    pub fn new(namespace: &str, storage: Storage, options: QueueOptions) -> Self {
        Self {
            namespace: namespace.to_string(),
            storage,
            options,
            inner: Mutex::new(Inner::default()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn kind(&self) -> BackendKind {
        self.storage.kind()
    }

    /// Physical queue id for a task type.
    pub fn queue_id(&self, task_type: &str) -> String {
        format!("{}:{}", self.namespace, task_type)
    }

    /// The backend for `task_type`, opened (and its sweeper started) on first use.
    pub async fn backend(&self, task_type: &str) -> Result<Arc<dyn QueueBackend>> {
        let mut inner = self.inner.lock().await;
        if let Some(backend) = inner.backends.get(task_type) {
            return Ok(backend.clone());
        }

        let backend = self.storage.open(&self.queue_id(task_type)).await?;
        if !self.options.ttl.is_empty() && !self.shutdown.is_cancelled() {
            inner.sweepers.push(ExpirySweeper::spawn(
                backend.clone(),
                self.options.ttl.clone(),
                self.options.sweep_interval,
                self.shutdown.child_token(),
            ));
        }
        inner
            .backends
            .insert(task_type.to_string(), backend.clone());
        debug!(queue = %backend.queue_id(), kind = %backend.kind(), "backend created");
        Ok(backend)
    }

    pub async fn enqueue(&self, task: &TaskRecord) -> Result<()> {
        let key = task.key()?;
        self.backend(&task.task_type).await?.push(&key).await?;
        metrics::task_enqueued().add(1, &[KeyValue::new("task_type", task.task_type.clone())]);
        debug!(task_id = %task.id, task_type = %task.task_type, "task enqueued");
        Ok(())
    }

    /// Enqueue each record in order; returns how many were pushed.
    pub async fn enqueue_many(&self, tasks: &[TaskRecord]) -> Result<usize> {
        for task in tasks {
            self.enqueue(task).await?;
        }
        Ok(tasks.len())
    }

    /// Claim the next task of `task_type`, or `None` when there is no work.
    ///
    /// A claimed payload that cannot be decoded is moved to `error` and the
    /// claim retried, so one bad entry never blocks the queue.
    pub async fn claim(&self, task_type: &str) -> Result<Option<TaskRecord>> {
        let backend = self.backend(task_type).await?;
        while let Some(key) = backend.claim().await? {
            match TaskRecord::decode(&key) {
                Ok(task) => {
                    debug!(task_id = %task.id, task_type, "task claimed");
                    return Ok(Some(task));
                }
                Err(e) => {
                    warn!(queue = %backend.queue_id(), "malformed task payload, moving to error: {e}");
                    backend.transition(&key, Status::Error).await?;
                }
            }
        }
        Ok(None)
    }

    /// `doing` → `done`. `Ok(false)` if the task had already left `doing`.
    pub async fn acknowledge(&self, task: &TaskRecord) -> Result<bool> {
        self.finish(task, Status::Done).await
    }

    /// `doing` → `error`.
    pub async fn fail(&self, task: &TaskRecord) -> Result<bool> {
        self.finish(task, Status::Error).await
    }

    /// `doing` → `null`.
    pub async fn nullify(&self, task: &TaskRecord) -> Result<bool> {
        self.finish(task, Status::Null).await
    }

    /// `doing` → `todo`.
    pub async fn requeue(&self, task: &TaskRecord) -> Result<bool> {
        self.finish(task, Status::Todo).await
    }

    async fn finish(&self, task: &TaskRecord, target: Status) -> Result<bool> {
        self.transition(&task.task_type, task, target).await
    }

    /// Move `task` out of `doing` on the queue for `task_type`.
    ///
    /// Use this form when the record's own type may differ from the queue it
    /// was claimed from.
    pub async fn transition(
        &self,
        task_type: &str,
        task: &TaskRecord,
        target: Status,
    ) -> Result<bool> {
        let key = task.key()?;
        let moved = self
            .backend(task_type)
            .await?
            .transition(&key, target)
            .await?;
        if !moved {
            debug!(task_id = %task.id, %target, "task no longer in doing, transition skipped");
        }
        Ok(moved)
    }

    /// Tasks of `task_type` whose lease is older than `timeout`.
    pub async fn scan_expired_leases(
        &self,
        task_type: &str,
        timeout: Duration,
    ) -> Result<Vec<TaskRecord>> {
        let backend = self.backend(task_type).await?;
        let keys = backend.scan_expired_leases(timeout).await?;
        Ok(decode_all(backend.queue_id(), keys))
    }

    /// Return every expired lease of `task_type` to `todo`; returns how many moved.
    pub async fn requeue_expired_leases(&self, task_type: &str, timeout: Duration) -> Result<usize> {
        let moved = self
            .backend(task_type)
            .await?
            .requeue_expired_leases(timeout)
            .await?;
        if moved > 0 {
            metrics::lease_recovered()
                .add(moved as u64, &[KeyValue::new("task_type", task_type.to_string())]);
            info!(task_type, moved, "requeued expired leases");
        }
        Ok(moved)
    }

    pub async fn list_doing(&self, task_type: &str) -> Result<Vec<TaskRecord>> {
        self.list(task_type, Status::Doing).await
    }

    /// Snapshot of the tasks of `task_type` in `status`. Malformed entries are skipped.
    pub async fn list(&self, task_type: &str, status: Status) -> Result<Vec<TaskRecord>> {
        let backend = self.backend(task_type).await?;
        let keys = backend.list(status).await?;
        Ok(decode_all(backend.queue_id(), keys))
    }

    pub async fn counts(&self, task_type: &str) -> Result<StatusCounts> {
        self.backend(task_type).await?.counts().await
    }

    /// Delete every task of `task_type` in the given statuses.
    pub async fn reset(&self, task_type: &str, statuses: &[Status]) -> Result<()> {
        self.backend(task_type).await?.reset(statuses).await
    }

    /// Stop every sweeper this queue started.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let sweepers = std::mem::take(&mut self.inner.lock().await.sweepers);
        for sweeper in sweepers {
            sweeper.stop(self.options.stop_timeout).await;
        }
        debug!(namespace = %self.namespace, "task queue shut down");
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn decode_all(queue: &str, keys: Vec<String>) -> Vec<TaskRecord> {
    keys.into_iter()
        .filter_map(|key| match TaskRecord::decode(&key) {
            Ok(task) => Some(task),
            Err(e) => {
                warn!(%queue, "skipping malformed task payload: {e}");
                None
            }
        })
        .collect()
}
