//! Liveness timer for long-running handlers.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::registry::{Heartbeat, HeartbeatCallback};
use crate::model::TaskRecord;

/// Fires a busy heartbeat every `interval` while a handler runs.
///
/// Purely observational: the callback never touches task state.
pub(crate) struct HeartbeatTimer {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl HeartbeatTimer {
    pub(crate) fn start(
        callback: Arc<dyn HeartbeatCallback>,
        interval: Duration,
        task: TaskRecord,
    ) -> Self {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let beat = Heartbeat::Busy { task: task.clone() };
                if let Err(e) = callback.beat(beat).await {
                    warn!(task_id = %task.id, "heartbeat callback failed: {e:#}");
                }
            }
        });
        Self { token, handle }
    }

    /// Stop the timer, waiting at most `join_timeout` before aborting it.
    pub(crate) async fn stop(self, join_timeout: Duration) {
        self.token.cancel();
        let abort = self.handle.abort_handle();
        if tokio::time::timeout(join_timeout, self.handle).await.is_err() {
            warn!("heartbeat did not stop in time, aborting");
            abort.abort();
        }
    }
}
