//! Lease-timeout recovery, independent of any worker's poll cadence.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::MIN_LOOP_INTERVAL;
use crate::queue::TaskQueue;

/// Periodically returns `doing` tasks with expired leases to `todo`.
///
/// Tasks are recovered whether or not their original handler is still
/// running, so handlers must tolerate running more than once.
pub struct LeaseSupervisor {
    queue: Arc<TaskQueue>,
    task_types: Vec<String>,
    lease_timeout: Duration,
    interval: Duration,
}

impl LeaseSupervisor {
    /// Scans every `lease_timeout / 2` (at least 100ms) by default.
    pub fn new(queue: Arc<TaskQueue>, task_types: Vec<String>, lease_timeout: Duration) -> Self {
        Self {
            queue,
            task_types,
            lease_timeout,
            interval: (lease_timeout / 2).max(Duration::from_millis(100)),
        }
    }

    /// Override the scan interval. Clamped to a small minimum.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_LOOP_INTERVAL);
        self
    }

    pub fn task_types(&self) -> &[String] {
        &self.task_types
    }

    /// One pass over every type. Failures are logged per type and skipped.
    /// Returns how many tasks were requeued.
    pub async fn recover_once(&self) -> usize {
        let mut total = 0;
        for task_type in &self.task_types {
            match self
                .queue
                .requeue_expired_leases(task_type, self.lease_timeout)
                .await
            {
                Ok(moved) => total += moved,
                Err(e) => error!(task_type = %task_type, "lease recovery failed: {e}"),
            }
        }
        debug!(requeued = total, "lease recovery pass complete");
        total
    }

    /// Loop until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        info!(
            types = ?self.task_types,
            lease_timeout = ?self.lease_timeout,
            interval = ?self.interval,
            "lease supervisor started"
        );
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            self.recover_once().await;
        }
        info!("lease supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueOptions;

    async fn queue() -> Arc<TaskQueue> {
        Arc::new(
            TaskQueue::connect("sup", "memory://", QueueOptions::default())
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn default_interval_is_half_the_lease_with_a_floor() {
        let long = LeaseSupervisor::new(queue().await, vec![], Duration::from_secs(60));
        assert_eq!(long.interval, Duration::from_secs(30));
        let short = LeaseSupervisor::new(queue().await, vec![], Duration::from_millis(10));
        assert_eq!(short.interval, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn zero_interval_is_clamped() {
        let supervisor = LeaseSupervisor::new(queue().await, vec![], Duration::from_secs(1))
            .interval(Duration::ZERO);
        assert_eq!(supervisor.interval, MIN_LOOP_INTERVAL);
    }
}
