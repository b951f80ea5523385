//! Postgres (relational) queue backend.
//!
//! All queues share the `tasks` table, partitioned by `queue_id`. Claims use
//! `FOR UPDATE SKIP LOCKED` so concurrent workers never receive the same row,
//! and every exit from `doing` is a conditional `UPDATE ... AND status =
//! 'doing'` whose row count says whether this caller won.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{debug, info};

use super::{BackendKind, QueueBackend, check_target};
use crate::error::Result;
use crate::model::{Status, StatusCounts, TtlPolicy};
use crate::telemetry::metrics;

/// Relational backend for one physical queue.
pub struct PostgresBackend {
    pool: PgPool,
    queue_id: String,
}

impl PostgresBackend {
    /// Connect to Postgres, create a pool and run pending migrations.
    pub async fn connect(url: &str) -> Result<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("postgres storage ready");
        Ok(pool)
    }

    pub fn new(pool: PgPool, queue_id: &str) -> Self {
        Self {
            pool,
            queue_id: queue_id.to_string(),
        }
    }
}

#[async_trait]
impl QueueBackend for PostgresBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn queue_id(&self) -> &str {
        &self.queue_id
    }

    async fn push(&self, key: &str) -> Result<()> {
        sqlx::query("INSERT INTO tasks (queue_id, key, status) VALUES ($1, $2, 'todo')")
            .bind(&self.queue_id)
            .bind(key)
            .execute(&self.pool)
            .await?;
        metrics::record_queue_operation(&self.queue_id, "push");
        debug!(queue = %self.queue_id, "pushed key");
        Ok(())
    }

    async fn claim(&self) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "UPDATE tasks SET status = 'doing', start_time = now(), updated_at = now()
             WHERE id = (
                 SELECT id FROM tasks
                 WHERE queue_id = $1 AND status = 'todo'
                 ORDER BY created_at, id
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING key",
        )
        .bind(&self.queue_id)
        .fetch_optional(&self.pool)
        .await?;

        metrics::record_queue_operation(
            &self.queue_id,
            if row.is_some() { "claim" } else { "claim_empty" },
        );
        Ok(row.map(|(key,)| key))
    }

    async fn transition(&self, key: &str, target: Status) -> Result<bool> {
        check_target(target)?;
        let result = sqlx::query(
            "UPDATE tasks SET status = $3, updated_at = now(),
                 start_time = CASE WHEN $3 = 'todo' THEN NULL ELSE start_time END
             WHERE id = (
                 SELECT id FROM tasks
                 WHERE queue_id = $1 AND key = $2 AND status = 'doing'
                 ORDER BY id
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             AND status = 'doing'",
        )
        .bind(&self.queue_id)
        .bind(key)
        .bind(target.as_str())
        .execute(&self.pool)
        .await?;

        let moved = result.rows_affected() > 0;
        if moved {
            metrics::record_transition(Status::Doing, target);
            debug!(queue = %self.queue_id, %target, "moved key out of doing");
        }
        Ok(moved)
    }

    async fn list(&self, status: Status) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT key FROM tasks WHERE queue_id = $1 AND status = $2 ORDER BY created_at, id",
        )
        .bind(&self.queue_id)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    async fn scan_expired_leases(&self, timeout: Duration) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT key FROM tasks
             WHERE queue_id = $1 AND status = 'doing'
             AND start_time < now() - make_interval(secs => $2)
             ORDER BY start_time, id",
        )
        .bind(&self.queue_id)
        .bind(timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    async fn sweep_ttl(&self, policy: &TtlPolicy) -> Result<usize> {
        let mut total = 0usize;
        for (status, ttl) in policy.iter() {
            // doing ages from lease start, everything else from enqueue
            let sql = match status {
                Status::Doing => {
                    "DELETE FROM tasks WHERE queue_id = $1 AND status = $2
                     AND start_time < now() - make_interval(secs => $3)"
                }
                _ => {
                    "DELETE FROM tasks WHERE queue_id = $1 AND status = $2
                     AND created_at < now() - make_interval(secs => $3)"
                }
            };
            let result = sqlx::query(sql)
                .bind(&self.queue_id)
                .bind(status.as_str())
                .bind(ttl.as_secs_f64())
                .execute(&self.pool)
                .await?;

            let removed = result.rows_affected() as usize;
            if removed > 0 {
                metrics::record_swept(&self.queue_id, status, removed);
                debug!(queue = %self.queue_id, %status, removed, "removed expired rows");
            }
            total += removed;
        }
        Ok(total)
    }

    async fn counts(&self) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM tasks WHERE queue_id = $1 GROUP BY status",
        )
        .bind(&self.queue_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            counts.set(status.parse()?, n.max(0) as u64);
        }
        Ok(counts)
    }

    async fn reset(&self, statuses: &[Status]) -> Result<()> {
        let names: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        sqlx::query("DELETE FROM tasks WHERE queue_id = $1 AND status = ANY($2)")
            .bind(&self.queue_id)
            .bind(&names)
            .execute(&self.pool)
            .await?;
        info!(queue = %self.queue_id, ?statuses, "queue reset");
        Ok(())
    }
}
