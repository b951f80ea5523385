//! TTL sweeper and lease supervisor loops.

use std::sync::Arc;
use std::time::Duration;

use qtask_rs::backend::Storage;
use qtask_rs::engine::{ExpirySweeper, LeaseSupervisor};
use qtask_rs::model::{Status, TaskRecord, TtlPolicy};
use qtask_rs::queue::{QueueOptions, TaskQueue};
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn queue_starts_sweeper_for_each_type() {
    let options = QueueOptions {
        ttl: TtlPolicy::new().with(Status::Todo, Duration::from_millis(300)),
        sweep_interval: Duration::from_millis(100),
        ..QueueOptions::default()
    };
    let queue = TaskQueue::connect("ttl", "memory://", options).await.unwrap();
    queue.enqueue(&TaskRecord::new("a", json!({}))).await.unwrap();
    queue.enqueue(&TaskRecord::new("b", json!({}))).await.unwrap();

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(queue.counts("a").await.unwrap().todo, 0);
    assert_eq!(queue.counts("b").await.unwrap().todo, 0);
    queue.shutdown().await;
}

#[tokio::test]
async fn no_ttl_means_nothing_is_swept() {
    let queue = TaskQueue::connect("ttl", "memory://", QueueOptions::default())
        .await
        .unwrap();
    queue.enqueue(&TaskRecord::new("a", json!({}))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.counts("a").await.unwrap().todo, 1);
    queue.shutdown().await;
}

#[tokio::test]
async fn sweeper_leaves_fresh_entries_and_stops_promptly() {
    let storage = Storage::connect("memory://").await.unwrap();
    let backend = storage.open("ns:t").await.unwrap();
    backend.push("old").await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    backend.push("fresh").await.unwrap();

    let policy = TtlPolicy::new().with(Status::Todo, Duration::from_millis(40));
    let sweeper = ExpirySweeper::spawn(
        backend.clone(),
        policy,
        Duration::from_secs(60),
        CancellationToken::new(),
    );
    // first sweep runs on start
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(backend.list(Status::Todo).await.unwrap(), vec!["fresh".to_string()]);

    tokio::time::timeout(Duration::from_secs(1), sweeper.stop(Duration::from_millis(500)))
        .await
        .expect("sweeper stop is bounded");
}

#[tokio::test]
async fn supervisor_requeues_expired_leases_until_cancelled() {
    let queue = Arc::new(
        TaskQueue::connect("lease", "memory://", QueueOptions::default())
            .await
            .unwrap(),
    );
    queue.enqueue(&TaskRecord::new("t", json!({}))).await.unwrap();
    queue.claim("t").await.unwrap().unwrap();

    let supervisor = Arc::new(
        LeaseSupervisor::new(queue.clone(), vec!["t".to_string()], Duration::from_millis(100))
            .interval(Duration::from_millis(25)),
    );
    let token = CancellationToken::new();
    let handle = tokio::spawn({
        let supervisor = supervisor.clone();
        let token = token.clone();
        async move { supervisor.run(token).await }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    let counts = queue.counts("t").await.unwrap();
    assert_eq!((counts.todo, counts.doing), (1, 0));

    token.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("supervisor stops on cancel")
        .unwrap();
}

#[tokio::test]
async fn supervisor_keeps_fresh_leases() {
    let queue = Arc::new(
        TaskQueue::connect("lease", "memory://", QueueOptions::default())
            .await
            .unwrap(),
    );
    queue.enqueue(&TaskRecord::new("t", json!({}))).await.unwrap();
    queue.claim("t").await.unwrap().unwrap();

    let supervisor = LeaseSupervisor::new(queue.clone(), vec!["t".to_string()], Duration::from_secs(60));
    assert_eq!(supervisor.recover_once().await, 0);
    assert_eq!(queue.counts("t").await.unwrap().doing, 1);
}

#[tokio::test]
async fn sweeper_with_zero_interval_still_sweeps_and_stops() {
    let storage = Storage::connect("memory://").await.unwrap();
    let backend = storage.open("ns:t").await.unwrap();
    backend.push("old").await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let policy = TtlPolicy::new().with(Status::Todo, Duration::from_millis(10));
    let sweeper = ExpirySweeper::spawn(backend.clone(), policy, Duration::ZERO, CancellationToken::new());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(backend.list(Status::Todo).await.unwrap().is_empty());

    tokio::time::timeout(Duration::from_secs(1), sweeper.stop(Duration::from_millis(500)))
        .await
        .expect("sweeper stop is bounded");
}
