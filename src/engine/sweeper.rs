//! Per-backend retention sweeper.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::MIN_LOOP_INTERVAL;
use crate::backend::QueueBackend;
use crate::model::TtlPolicy;
use crate::telemetry::metrics;

/// Background loop deleting entries older than their status's TTL.
///
/// Sweeps once on start, then every `interval` until stopped. A failed sweep
/// is logged and retried on the next tick.
pub struct ExpirySweeper {
    queue_id: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ExpirySweeper {
    pub fn spawn(
        backend: Arc<dyn QueueBackend>,
        policy: TtlPolicy,
        interval: Duration,
        token: CancellationToken,
    ) -> Self {
        let interval = interval.max(MIN_LOOP_INTERVAL);
        let queue_id = backend.queue_id().to_string();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            let queue = backend.queue_id().to_string();
            info!(%queue, ?interval, "ttl sweeper started");
            loop {
                let started = Instant::now();
                match backend.sweep_ttl(&policy).await {
                    Ok(removed) => {
                        metrics::operation_duration_ms().record(
                            started.elapsed().as_secs_f64() * 1000.0,
                            &[KeyValue::new("operation", "ttl_sweep")],
                        );
                        if removed > 0 {
                            info!(%queue, removed, "ttl sweep removed expired entries");
                        } else {
                            debug!(%queue, "ttl sweep found nothing expired");
                        }
                    }
                    Err(e) => error!(%queue, "ttl sweep failed: {e}"),
                }

                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            info!(%queue, "ttl sweeper stopped");
        });

        Self {
            queue_id,
            token,
            handle,
        }
    }

    /// Signal the loop and wait up to `join_timeout` for it to exit.
    pub async fn stop(self, join_timeout: Duration) {
        self.token.cancel();
        let abort = self.handle.abort_handle();
        if tokio::time::timeout(join_timeout, self.handle).await.is_err() {
            warn!(queue = %self.queue_id, "ttl sweeper did not stop in time, aborting");
            abort.abort();
        }
    }
}
