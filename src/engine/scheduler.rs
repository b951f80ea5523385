//! Worker scheduler: weighted polling, handler dispatch, outcome routing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use super::heartbeat::HeartbeatTimer;
use super::registry::{HandlerRegistry, Heartbeat, HeartbeatCallback, Registration};
use super::supervisor::LeaseSupervisor;
use crate::error::{Error, Result};
use crate::model::{Status, TaskRecord};
use crate::queue::TaskQueue;
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};

/// Configuration for a worker scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Reported in logs and task spans.
    pub worker_id: String,
    /// Sleep after an empty claim.
    pub poll_interval: Duration,
    /// Sleep after finishing a task.
    pub task_delay: Duration,
    /// Lease age after which a `doing` task counts as abandoned.
    pub lease_timeout: Duration,
    /// Upper bound on waiting for a heartbeat timer or callback.
    pub heartbeat_join_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let tag = uuid::Uuid::new_v4().simple().to_string();
        Self {
            worker_id: format!("worker-{}", &tag[..8]),
            poll_interval: Duration::from_secs(1),
            task_delay: Duration::from_millis(10),
            lease_timeout: Duration::from_secs(300),
            heartbeat_join_timeout: Duration::from_secs(5),
        }
    }
}

/// How one claimed task left the scheduler's hands.
enum Processed {
    Finished,
    /// Cancelled mid-handler; the task was requeued.
    Interrupted,
}

/// Sequential poll, claim, execute, transition loop over a [`TaskQueue`].
///
/// Run more instances (tasks or processes) against the same storage for
/// concurrency; claims are exclusive across all of them.
pub struct WorkerScheduler {
    queue: Arc<TaskQueue>,
    registry: HandlerRegistry,
    config: SchedulerConfig,
    shutdown: CancellationToken,
}

impl WorkerScheduler {
    pub fn new(queue: Arc<TaskQueue>, config: SchedulerConfig) -> Self {
        Self {
            queue,
            registry: HandlerRegistry::new(),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Register (or replace) the handler for `task_type`.
    pub fn register_handler(&mut self, task_type: &str, registration: Registration) -> Result<()> {
        self.registry.register(task_type, registration)?;
        Ok(())
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Token that stops [`run`](Self::run) when cancelled. Cancelling it is
    /// the same as calling [`stop`](Self::stop).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Ask the loop to exit. A task held mid-handler is requeued first.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// A lease supervisor over this scheduler's registered types, using its
    /// lease timeout.
    pub fn lease_supervisor(&self) -> LeaseSupervisor {
        LeaseSupervisor::new(
            self.queue.clone(),
            self.registry.types().to_vec(),
            self.config.lease_timeout,
        )
    }

    /// Run until stopped, or until a backend error ends the loop.
    pub async fn run(&self) -> Result<()> {
        if self.registry.is_empty() {
            return Err(Error::Registration("no handlers registered".to_string()));
        }
        let worker_id = self.config.worker_id.as_str();
        info!(worker_id, types = ?self.registry.types(), "scheduler started");

        let mut last_beat: HashMap<String, Instant> = HashMap::new();
        let result = loop {
            if self.shutdown.is_cancelled() {
                break Ok(());
            }
            let Some(task_type) = self.registry.pick().map(str::to_string) else {
                break Ok(());
            };

            self.idle_heartbeat(&task_type, &mut last_beat).await;

            let task = match self.queue.claim(&task_type).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(self.config.poll_interval) => continue,
                    }
                }
                Err(e) => break Err(e),
            };

            match self.process(&task_type, task).await {
                Ok(Processed::Finished) => {}
                Ok(Processed::Interrupted) => break Ok(()),
                Err(e) => break Err(e),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                _ = tokio::time::sleep(self.config.task_delay) => {}
            }
        };

        match &result {
            Ok(()) => self.final_heartbeats().await,
            Err(e) => error!(worker_id, "scheduler stopped on backend error: {e}"),
        }
        self.log_counts().await;
        info!(worker_id, "scheduler stopped");
        result
    }

    /// Dispatch one task claimed from `queue_type` and route its outcome.
    async fn process(&self, queue_type: &str, task: TaskRecord) -> Result<Processed> {
        let span = start_task_span(&self.config.worker_id, &task);

        async {
            let Some(registration) = self.registry.get(&task.task_type) else {
                warn!(task_id = %task.id, task_type = %task.task_type, "no handler for task type");
                metrics::task_unroutable()
                    .add(1, &[KeyValue::new("task_type", task.task_type.clone())]);
                record_state_transition(&span, Status::Doing, Status::Null);
                self.finish(queue_type, &task, Status::Null).await?;
                return Ok(Processed::Finished);
            };

            let heartbeat = registration.heartbeat.as_ref().map(|hb| {
                HeartbeatTimer::start(hb.callback.clone(), hb.interval, task.clone())
            });

            let handler = registration.handler.clone();
            let params = task.params.clone();
            let started = Instant::now();
            let mut job = tokio::spawn(async move { handler.handle(params).await });

            let joined = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                joined = &mut job => Some(joined),
            };

            if let Some(timer) = heartbeat {
                timer.stop(self.config.heartbeat_join_timeout).await;
            }

            let Some(joined) = joined else {
                job.abort();
                info!(task_id = %task.id, "shutdown during handler, requeueing held task");
                record_state_transition(&span, Status::Doing, Status::Todo);
                self.requeue_held(queue_type, &task).await?;
                return Ok(Processed::Interrupted);
            };

            metrics::operation_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("operation", "handle")],
            );

            let outcome = match joined {
                Ok(Ok(result)) => self.deliver_result(registration, &task, result).await,
                Ok(Err(e)) => Err(e),
                Err(join_err) => Err(anyhow::anyhow!("handler panicked: {join_err}")),
            };

            match outcome {
                Ok(()) => {
                    record_state_transition(&span, Status::Doing, Status::Done);
                    self.finish(queue_type, &task, Status::Done).await?;
                    info!(
                        task_id = %task.id,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "task done"
                    );
                }
                Err(e) => {
                    error!(task_id = %task.id, task_type = %task.task_type, "task failed: {e:#}");
                    record_state_transition(&span, Status::Doing, Status::Error);
                    self.finish(queue_type, &task, Status::Error).await?;
                }
            }
            Ok(Processed::Finished)
        }
        .instrument(span.clone())
        .await
    }

    async fn deliver_result(
        &self,
        registration: &Registration,
        task: &TaskRecord,
        result: Option<Value>,
    ) -> anyhow::Result<()> {
        match &registration.on_result {
            Some(callback) => callback
                .on_result(task.clone(), result)
                .await
                .map_err(|e| e.context("result callback failed")),
            None => Ok(()),
        }
    }

    /// Transition a held task; on backend failure, try to hand it back to
    /// `todo` before propagating.
    async fn finish(&self, queue_type: &str, task: &TaskRecord, target: Status) -> Result<()> {
        match self.queue.transition(queue_type, task, target).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                // lease expired and someone requeued it; the other copy wins
                warn!(task_id = %task.id, %target, "task already left doing, outcome not recorded");
                Ok(())
            }
            Err(e) => {
                error!(task_id = %task.id, %target, "transition failed: {e}");
                if let Err(requeue_err) = self.requeue_held(queue_type, task).await {
                    debug!(task_id = %task.id, "requeue after failed transition also failed: {requeue_err}");
                }
                Err(e)
            }
        }
    }

    async fn requeue_held(&self, queue_type: &str, task: &TaskRecord) -> Result<()> {
        match self.queue.transition(queue_type, task, Status::Todo).await {
            Ok(true) => {
                info!(task_id = %task.id, "held task returned to todo");
                Ok(())
            }
            Ok(false) => {
                warn!(task_id = %task.id, "held task was no longer in doing");
                Ok(())
            }
            Err(e) => {
                error!(task_id = %task.id, "failed to requeue held task: {e}");
                Err(e)
            }
        }
    }

    /// Fire the idle heartbeat for `task_type` if its interval has elapsed.
    async fn idle_heartbeat(&self, task_type: &str, last_beat: &mut HashMap<String, Instant>) {
        let Some(hb) = self
            .registry
            .get(task_type)
            .and_then(|r| r.heartbeat.as_ref())
        else {
            return;
        };
        let due = last_beat
            .get(task_type)
            .is_none_or(|at| at.elapsed() >= hb.interval);
        if !due {
            return;
        }
        last_beat.insert(task_type.to_string(), Instant::now());
        self.beat(
            hb.callback.as_ref(),
            Heartbeat::Idle {
                task_type: task_type.to_string(),
            },
        )
        .await;
    }

    async fn final_heartbeats(&self) {
        for task_type in self.registry.types() {
            if let Some(hb) = self
                .registry
                .get(task_type)
                .and_then(|r| r.heartbeat.as_ref())
            {
                let beat = Heartbeat::Idle {
                    task_type: task_type.clone(),
                };
                self.beat(hb.callback.as_ref(), beat).await;
            }
        }
    }

    async fn beat(&self, callback: &dyn HeartbeatCallback, beat: Heartbeat) {
        let task_type = beat.task_type().to_string();
        match tokio::time::timeout(self.config.heartbeat_join_timeout, callback.beat(beat)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%task_type, "heartbeat callback failed: {e:#}"),
            Err(_) => warn!(%task_type, "heartbeat callback timed out"),
        }
    }

    async fn log_counts(&self) {
        for task_type in self.registry.types() {
            match self.queue.counts(task_type).await {
                Ok(c) => info!(
                    worker_id = %self.config.worker_id,
                    task_type = %task_type,
                    todo = c.todo,
                    doing = c.doing,
                    done = c.done,
                    error = c.error,
                    null = c.null,
                    "queue counts"
                ),
                Err(e) => warn!(task_type = %task_type, "could not read queue counts: {e}"),
            }
        }
    }
}
