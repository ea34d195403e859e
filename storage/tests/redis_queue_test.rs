//! Integration tests for the Redis queue backend and Redis lock nodes.
//!
//! These tests use the shared testcontainers Redis fixture and skip when
//! Docker is not available. Queue names are unique per test.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use storage::{
    LockNode, QueueBackend, QueuedJob, RedisLockNode, RedisQueueBackend, Redlock, RedlockSettings
};
use uuid::Uuid;

const LEASE: Duration = Duration::from_secs(60);

async fn backend() -> Option<(RedisQueueBackend, String)> {
    let fixture = testing::redis().await?;
    let backend = RedisQueueBackend::new(fixture.url()).await.ok()?;
    Some((backend, fixture.url().to_string()))
}

#[tokio::test]
async fn test_redis_queue_fifo_and_ack() {
    let Some((backend, _)) = backend().await else {
        eprintln!("Skipping Redis test: Docker not available");
        return;
    };
    let queue = testing::unique_id("fifo");
    backend.push(&QueuedJob::new(&queue, Uuid::new_v4(), json!({ "n": 1 }), 3)).await.unwrap();
    backend.push(&QueuedJob::new(&queue, Uuid::new_v4(), json!({ "n": 2 }), 3)).await.unwrap();
    assert_eq!(backend.pending_count(&queue).await.unwrap(), 2);

    let first = backend.reserve(&queue, LEASE).await.unwrap().unwrap();
    assert_eq!(first.job.payload["n"], 1);
    backend.ack(&queue, &first).await.unwrap();

    let second = backend.reserve(&queue, LEASE).await.unwrap().unwrap();
    assert_eq!(second.job.payload["n"], 2);
    backend.ack(&queue, &second).await.unwrap();

    assert!(backend.reserve(&queue, LEASE).await.unwrap().is_none());
    assert_eq!(backend.recover_stalled(&queue).await.unwrap(), 0);
}

#[tokio::test]
async fn test_redis_queue_retry_and_recovery() {
    let Some((backend, _)) = backend().await else {
        eprintln!("Skipping Redis test: Docker not available");
        return;
    };
    let queue = testing::unique_id("retry");
    backend.push(&QueuedJob::new(&queue, Uuid::new_v4(), json!({}), 3)).await.unwrap();

    let reserved = backend.reserve(&queue, LEASE).await.unwrap().unwrap();
    let mut next = reserved.job.clone();
    next.attempts_made += 1;
    backend
        .schedule_retry(&queue, &reserved, &next, Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(backend.promote_due(&queue).await.unwrap(), 0);
    assert_eq!(backend.pending_count(&queue).await.unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(backend.promote_due(&queue).await.unwrap(), 1);

    // Simulated crash: reserved with a short lease that is never renewed.
    let retried = backend.reserve(&queue, Duration::from_millis(100)).await.unwrap().unwrap();
    assert_eq!(retried.job.attempts_made, 1);
    assert_eq!(backend.recover_stalled(&queue).await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(backend.recover_stalled(&queue).await.unwrap(), 1);
    let redelivered = backend.reserve(&queue, LEASE).await.unwrap().unwrap();
    assert_eq!(redelivered.job.id, retried.job.id);
}

#[tokio::test]
async fn test_redis_second_consumer_leaves_leased_jobs_alone() {
    let Some((first, url)) = backend().await else {
        eprintln!("Skipping Redis test: Docker not available");
        return;
    };
    let second = RedisQueueBackend::new(&url).await.unwrap();
    let queue = testing::unique_id("replicas");
    first.push(&QueuedJob::new(&queue, Uuid::new_v4(), json!({}), 3)).await.unwrap();

    let running = first.reserve(&queue, Duration::from_millis(300)).await.unwrap().unwrap();
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(first.renew(&queue, &running, Duration::from_millis(300)).await.unwrap());
        // A replica starting up must not take over the running job.
        assert_eq!(second.recover_stalled(&queue).await.unwrap(), 0);
        assert!(second.reserve(&queue, LEASE).await.unwrap().is_none());
    }

    first.ack(&queue, &running).await.unwrap();
    assert!(!first.renew(&queue, &running, LEASE).await.unwrap());
    assert_eq!(second.recover_stalled(&queue).await.unwrap(), 0);
}

#[tokio::test]
async fn test_redlock_over_redis_nodes() {
    let Some((_, url)) = backend().await else {
        eprintln!("Skipping Redis test: Docker not available");
        return;
    };
    let node: Arc<dyn LockNode> = Arc::new(RedisLockNode::connect(&url).await.unwrap());
    let settings = RedlockSettings {
        retry_count: 0,
        ..RedlockSettings::default()
    };
    let redlock = Redlock::new(vec![node], settings);
    let resource = vec![testing::unique_id("mirror")];

    let lock = redlock.acquire(&resource, Duration::from_secs(5)).await.unwrap();
    assert!(redlock.acquire(&resource, Duration::from_secs(5)).await.is_err());

    redlock.release(&lock).await;
    let again = redlock.acquire(&resource, Duration::from_secs(5)).await.unwrap();
    redlock.release(&again).await;
}
