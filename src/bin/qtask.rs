//! qtask CLI: operator interface to a task queue namespace.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use qtask_rs::config::Config;
use qtask_rs::config::secrets::{ExposeSecret, redacted_uri};
use qtask_rs::engine::LeaseSupervisor;
use qtask_rs::model::{Status, TaskRecord};
use qtask_rs::queue::TaskQueue;
use qtask_rs::telemetry::init_telemetry;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "qtask", about = "Lightweight job queue operator tool")]
struct Cli {
    /// Namespace override (defaults to QUEUE_NAMESPACE)
    #[arg(long, global = true)]
    namespace: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Requeue expired leases (and run TTL sweeps) until interrupted
    Supervise {
        /// Task types to watch
        #[arg(required = true, value_delimiter = ',')]
        types: Vec<String>,
        /// Seconds between recovery passes (default: half the lease timeout)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Enqueue one task
    Enqueue {
        task_type: String,
        /// JSON parameters
        #[arg(long)]
        params: Option<String>,
        /// Number of identical tasks to enqueue
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Show per-status counts for a task type
    Stats {
        task_type: String,
        /// Also list the in-flight tasks
        #[arg(long)]
        doing: bool,
    },
    /// Requeue tasks whose lease is older than the timeout, once
    RequeueExpired {
        task_type: String,
        /// Lease timeout in seconds (defaults to LEASE_TIMEOUT)
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }

    match cli.command {
        Command::Supervise { types, interval } => cmd_supervise(config, types, interval).await,
        Command::Enqueue {
            task_type,
            params,
            count,
        } => {
            let queue = connect(&config).await?;
            cmd_enqueue(&queue, task_type, params, count).await
        }
        Command::Stats { task_type, doing } => {
            let queue = connect(&config).await?;
            cmd_stats(&queue, &task_type, doing).await
        }
        Command::RequeueExpired { task_type, timeout } => {
            let queue = connect(&config).await?;
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or(config.lease_timeout);
            let moved = queue.requeue_expired_leases(&task_type, timeout).await?;
            println!("Requeued {moved} task(s) from {}", queue.queue_id(&task_type));
            Ok(())
        }
    }
}

/// Queue for one-shot commands; no background sweeping.
async fn connect(config: &Config) -> anyhow::Result<TaskQueue> {
    let queue = TaskQueue::connect(
        &config.namespace,
        config.queue_uri.expose_secret(),
        Default::default(),
    )
    .await?;
    Ok(queue)
}

async fn cmd_supervise(
    config: Config,
    types: Vec<String>,
    interval: Option<u64>,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(config.telemetry("qtask"))?;

    info!(
        uri = %redacted_uri(&config.queue_uri),
        namespace = %config.namespace,
        "connecting"
    );
    let queue = Arc::new(
        TaskQueue::connect(
            &config.namespace,
            config.queue_uri.expose_secret(),
            config.queue_options(),
        )
        .await?,
    );
    // Open each type up front so TTL sweepers start immediately.
    for task_type in &types {
        queue.backend(task_type).await?;
    }

    let mut supervisor = LeaseSupervisor::new(queue.clone(), types, config.lease_timeout);
    if let Some(secs) = interval {
        supervisor = supervisor.interval(Duration::from_secs(secs));
    }

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    supervisor.run(token).await;
    queue.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

async fn cmd_enqueue(
    queue: &TaskQueue,
    task_type: String,
    params: Option<String>,
    count: usize,
) -> anyhow::Result<()> {
    let params: serde_json::Value = match params {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };

    let tasks: Vec<TaskRecord> = (0..count)
        .map(|_| TaskRecord::new(&task_type, params.clone()))
        .collect();
    queue.enqueue_many(&tasks).await?;

    for task in &tasks {
        println!("Enqueued: {}", task.id);
    }
    Ok(())
}

async fn cmd_stats(queue: &TaskQueue, task_type: &str, show_doing: bool) -> anyhow::Result<()> {
    let counts = queue.counts(task_type).await?;

    println!("Queue: {} ({})", queue.queue_id(task_type), queue.kind());
    for status in Status::ALL {
        println!("  {:<6} {}", status, counts.get(status));
    }
    println!("  {:<6} {}", "total", counts.total());

    if show_doing {
        let doing = queue.list_doing(task_type).await?;
        if doing.is_empty() {
            println!("\nNo tasks in flight.");
        } else {
            println!("\n{:<60}  CREATED", "TASK ID");
            for task in &doing {
                println!(
                    "{:<60}  {}",
                    task.id,
                    task.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
    }
    Ok(())
}
