//! Durable job queue backends.
//!
//! Each queue has three parts: a pending FIFO, a processing set holding
//! reserved jobs until they are acked, and a delayed set of jobs waiting out
//! a retry backoff.
//!
//! A reserved job carries a lease deadline that its worker keeps renewing
//! while the job runs. A crash between reserve and ack stops the renewals;
//! once the lease runs out [`QueueBackend::recover_stalled`] hands the job
//! back to pending. Jobs still leased by a live worker, in this process or
//! another, are never recovered. Delivery is therefore at-least-once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use errors::QueueError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: Uuid,
    pub queue: String,
    pub payload: serde_json::Value,
    /// Attempts already finished, successful or not.
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>
}

impl QueuedJob {
    pub fn new(queue: &str, id: Uuid, payload: serde_json::Value, max_attempts: u32) -> Self {
        Self {
            id,
            queue: queue.to_string(),
            payload,
            attempts_made: 0,
            max_attempts: max_attempts.max(1),
            enqueued_at: Utc::now()
        }
    }

    /// Whether the attempt that just ran was the last one allowed.
    pub fn is_final_attempt(&self) -> bool {
        self.attempts_made + 1 >= self.max_attempts
    }
}

/// A job taken off the pending list. `receipt` is the exact stored entry
/// and identifies it for [`QueueBackend::ack`].
#[derive(Debug, Clone)]
pub struct Reserved {
    pub job: QueuedJob,
    pub receipt: String
}

pub(crate) fn encode(job: &QueuedJob) -> Result<String, QueueError> {
    serde_json::to_string(job).map_err(|e| QueueError::Payload {
        queue: job.queue.clone(),
        reason: e.to_string()
    })
}

pub(crate) fn decode(queue: &str, raw: String) -> Result<Reserved, QueueError> {
    let job = serde_json::from_str(&raw).map_err(|e| QueueError::Payload {
        queue: queue.to_string(),
        reason: e.to_string()
    })?;
    Ok(Reserved { job, receipt: raw })
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn push(&self, job: &QueuedJob) -> Result<(), QueueError>;

    /// Moves the oldest pending job to processing, leased for `lease`.
    /// Never blocks.
    async fn reserve(&self, queue: &str, lease: Duration) -> Result<Option<Reserved>, QueueError>;

    /// Pushes the lease of a reserved job to `lease` from now. `false` when
    /// the job is no longer in processing.
    async fn renew(&self, queue: &str, reserved: &Reserved, lease: Duration) -> Result<bool, QueueError>;

    /// Removes a finished job from processing.
    async fn ack(&self, queue: &str, reserved: &Reserved) -> Result<(), QueueError>;

    /// Removes the reserved entry and parks `next` until `delay` has passed.
    async fn schedule_retry(
        &self,
        queue: &str,
        reserved: &Reserved,
        next: &QueuedJob,
        delay: Duration
    ) -> Result<(), QueueError>;

    /// Moves delayed jobs whose backoff has elapsed back to pending.
    async fn promote_due(&self, queue: &str) -> Result<usize, QueueError>;

    /// Moves reserved jobs whose lease has run out back to the front of
    /// pending.
    async fn recover_stalled(&self, queue: &str) -> Result<usize, QueueError>;

    /// Pending plus delayed.
    async fn pending_count(&self, queue: &str) -> Result<usize, QueueError>;
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<String>,
    /// `(lease deadline, receipt)`
    processing: Vec<(DateTime<Utc>, String)>,
    delayed: Vec<(DateTime<Utc>, String)>
}

/// Process-local backend; jobs do not survive a restart.
#[derive(Default)]
pub struct InMemoryQueueBackend {
    queues: Mutex<HashMap<String, QueueState>>
}

impl InMemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processing_count(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .get(queue)
            .map_or(0, |q| q.processing.len())
    }
}

fn remove_first(list: &mut Vec<(DateTime<Utc>, String)>, receipt: &str) {
    if let Some(pos) = list.iter().position(|(_, r)| r == receipt) {
        list.remove(pos);
    }
}

fn deadline(lease: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero())
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn push(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let raw = encode(job)?;
        self.queues
            .lock()
            .entry(job.queue.clone())
            .or_default()
            .pending
            .push_back(raw);
        Ok(())
    }

    async fn reserve(&self, queue: &str, lease: Duration) -> Result<Option<Reserved>, QueueError> {
        let raw = {
            let mut queues = self.queues.lock();
            let state = queues.entry(queue.to_string()).or_default();
            match state.pending.pop_front() {
                Some(raw) => {
                    state.processing.push((deadline(lease), raw.clone()));
                    raw
                }
                None => return Ok(None)
            }
        };
        decode(queue, raw).map(Some)
    }

    async fn renew(&self, queue: &str, reserved: &Reserved, lease: Duration) -> Result<bool, QueueError> {
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(false);
        };
        match state.processing.iter_mut().find(|(_, r)| *r == reserved.receipt) {
            Some(entry) => {
                entry.0 = deadline(lease);
                Ok(true)
            }
            None => Ok(false)
        }
    }

    async fn ack(&self, queue: &str, reserved: &Reserved) -> Result<(), QueueError> {
        if let Some(state) = self.queues.lock().get_mut(queue) {
            remove_first(&mut state.processing, &reserved.receipt);
        }
        Ok(())
    }

    async fn schedule_retry(
        &self,
        queue: &str,
        reserved: &Reserved,
        next: &QueuedJob,
        delay: Duration
    ) -> Result<(), QueueError> {
        let raw = encode(next)?;
        let due = deadline(delay);
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        remove_first(&mut state.processing, &reserved.receipt);
        state.delayed.push((due, raw));
        Ok(())
    }

    async fn promote_due(&self, queue: &str) -> Result<usize, QueueError> {
        let now = Utc::now();
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(0);
        };
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.delayed)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        state.delayed = waiting;
        let promoted = due.len();
        state.pending.extend(due.into_iter().map(|(_, raw)| raw));
        Ok(promoted)
    }

    async fn recover_stalled(&self, queue: &str) -> Result<usize, QueueError> {
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(0);
        };
        let now = Utc::now();
        let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut state.processing)
            .into_iter()
            .partition(|(until, _)| *until <= now);
        state.processing = live;
        let count = expired.len();
        for (_, raw) in expired.into_iter().rev() {
            state.pending.push_front(raw);
        }
        Ok(count)
    }

    async fn pending_count(&self, queue: &str) -> Result<usize, QueueError> {
        Ok(self
            .queues
            .lock()
            .get(queue)
            .map_or(0, |q| q.pending.len() + q.delayed.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(60);

    fn job(queue: &str, n: u32) -> QueuedJob {
        QueuedJob::new(queue, Uuid::new_v4(), json!({ "n": n }), 3)
    }

    #[tokio::test]
    async fn test_fifo_reserve_and_ack() {
        let backend = InMemoryQueueBackend::new();
        backend.push(&job("q", 1)).await.unwrap();
        backend.push(&job("q", 2)).await.unwrap();
        assert_eq!(backend.pending_count("q").await.unwrap(), 2);

        let first = backend.reserve("q", LEASE).await.unwrap().unwrap();
        assert_eq!(first.job.payload["n"], 1);
        assert_eq!(backend.processing_count("q"), 1);

        backend.ack("q", &first).await.unwrap();
        assert_eq!(backend.processing_count("q"), 0);

        let second = backend.reserve("q", LEASE).await.unwrap().unwrap();
        assert_eq!(second.job.payload["n"], 2);
        assert!(backend.reserve("q", LEASE).await.unwrap().is_none());
        assert!(backend.reserve("other", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_waits_for_backoff() {
        let backend = InMemoryQueueBackend::new();
        backend.push(&job("q", 1)).await.unwrap();
        let reserved = backend.reserve("q", LEASE).await.unwrap().unwrap();

        let mut next = reserved.job.clone();
        next.attempts_made += 1;
        backend
            .schedule_retry("q", &reserved, &next, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(backend.processing_count("q"), 0);
        assert_eq!(backend.promote_due("q").await.unwrap(), 0);
        assert!(backend.reserve("q", LEASE).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(backend.promote_due("q").await.unwrap(), 1);
        let retried = backend.reserve("q", LEASE).await.unwrap().unwrap();
        assert_eq!(retried.job.attempts_made, 1);
    }

    #[tokio::test]
    async fn test_recover_stalled_redelivers_expired_leases_only() {
        let backend = InMemoryQueueBackend::new();
        backend.push(&job("q", 1)).await.unwrap();
        backend.push(&job("q", 2)).await.unwrap();
        let live = backend.reserve("q", LEASE).await.unwrap().unwrap();
        let lost = backend.reserve("q", Duration::from_millis(20)).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(backend.recover_stalled("q").await.unwrap(), 1);
        assert_eq!(backend.processing_count("q"), 1);
        let again = backend.reserve("q", LEASE).await.unwrap().unwrap();
        assert_eq!(again.job.id, lost.job.id);
        assert!(backend.renew("q", &live, LEASE).await.unwrap());
    }

    #[tokio::test]
    async fn test_renew_keeps_job_leased() {
        let backend = InMemoryQueueBackend::new();
        backend.push(&job("q", 1)).await.unwrap();
        let reserved = backend.reserve("q", Duration::from_millis(30)).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(backend.renew("q", &reserved, LEASE).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.recover_stalled("q").await.unwrap(), 0);

        backend.ack("q", &reserved).await.unwrap();
        assert!(!backend.renew("q", &reserved, LEASE).await.unwrap());
    }

    #[test]
    fn test_final_attempt() {
        let mut j = job("q", 1);
        assert!(!j.is_final_attempt());
        j.attempts_made = 2;
        assert!(j.is_final_attempt());
        assert!(QueuedJob::new("q", Uuid::new_v4(), json!({}), 0).is_final_attempt());
    }
}
