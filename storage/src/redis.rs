//! Redis-backed job queue.
//!
//! Keys per queue: `sync:queue:{name}:pending` (list, LPUSH in, RPOP side
//! out), `:processing` (sorted set of reserved receipts scored by lease
//! deadline) and `:delayed` (sorted set scored by due time). Scores are epoch
//! millis.

use crate::queue::{QueueBackend, QueuedJob, Reserved, decode, encode};
use async_trait::async_trait;
use errors::QueueError;
use std::time::Duration;

const KEY_PREFIX: &str = "sync:queue";

const RESERVE_SCRIPT: &str = r#"
local raw = redis.call("RPOP", KEYS[1])
if not raw then
    return false
end
redis.call("ZADD", KEYS[2], ARGV[1], raw)
return raw
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call("ZSCORE", KEYS[1], ARGV[1]) then
    redis.call("ZADD", KEYS[1], ARGV[2], ARGV[1])
    return 1
end
return 0
"#;

const RETRY_SCRIPT: &str = r#"
redis.call("ZREM", KEYS[1], ARGV[1])
redis.call("ZADD", KEYS[2], ARGV[3], ARGV[2])
return 1
"#;

const PROMOTE_SCRIPT: &str = r#"
local due = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1])
for _, raw in ipairs(due) do
    redis.call("ZREM", KEYS[1], raw)
    redis.call("LPUSH", KEYS[2], raw)
end
return #due
"#;

const RECOVER_SCRIPT: &str = r#"
local expired = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1])
for _, raw in ipairs(expired) do
    redis.call("ZREM", KEYS[1], raw)
    redis.call("RPUSH", KEYS[2], raw)
end
return #expired
"#;

fn millis_from_now(d: Duration) -> i64 {
    chrono::Utc::now().timestamp_millis() + i64::try_from(d.as_millis()).unwrap_or(i64::MAX / 2)
}

pub fn pending_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:{queue}:pending")
}

pub fn processing_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:{queue}:processing")
}

pub fn delayed_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:{queue}:delayed")
}

#[derive(Clone)]
pub struct RedisQueueBackend {
    connection_manager: redis::aio::ConnectionManager
}

impl RedisQueueBackend {
    pub async fn new(connection_string: &str) -> Result<Self, QueueError> {
        let backend_err = |e: redis::RedisError| QueueError::Backend {
            queue: "*".to_string(),
            reason: e.to_string()
        };
        let client = redis::Client::open(connection_string).map_err(backend_err)?;
        let connection_manager = client
            .get_connection_manager()
            .await
            .map_err(backend_err)?;

        Ok(Self { connection_manager })
    }

    pub fn from_manager(connection_manager: redis::aio::ConnectionManager) -> Self {
        Self { connection_manager }
    }

    pub async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| QueueError::Backend {
                queue: "*".to_string(),
                reason: e.to_string()
            })
    }
}

fn query_err(queue: &str) -> impl Fn(redis::RedisError) -> QueueError + '_ {
    move |e| QueueError::Backend {
        queue: queue.to_string(),
        reason: e.to_string()
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn push(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let raw = encode(job)?;
        let mut conn = self.connection_manager.clone();
        redis::cmd("LPUSH")
            .arg(pending_key(&job.queue))
            .arg(raw)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(query_err(&job.queue))?;
        Ok(())
    }

    async fn reserve(&self, queue: &str, lease: Duration) -> Result<Option<Reserved>, QueueError> {
        let mut conn = self.connection_manager.clone();
        let raw: Option<String> = redis::Script::new(RESERVE_SCRIPT)
            .key(pending_key(queue))
            .key(processing_key(queue))
            .arg(millis_from_now(lease))
            .invoke_async(&mut conn)
            .await
            .map_err(query_err(queue))?;

        raw.map(|raw| decode(queue, raw)).transpose()
    }

    async fn renew(&self, queue: &str, reserved: &Reserved, lease: Duration) -> Result<bool, QueueError> {
        let mut conn = self.connection_manager.clone();
        let renewed: i64 = redis::Script::new(RENEW_SCRIPT)
            .key(processing_key(queue))
            .arg(&reserved.receipt)
            .arg(millis_from_now(lease))
            .invoke_async(&mut conn)
            .await
            .map_err(query_err(queue))?;
        Ok(renewed == 1)
    }

    async fn ack(&self, queue: &str, reserved: &Reserved) -> Result<(), QueueError> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("ZREM")
            .arg(processing_key(queue))
            .arg(&reserved.receipt)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(query_err(queue))?;
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
        let due = millis_from_now(delay);
        let mut conn = self.connection_manager.clone();
        redis::Script::new(RETRY_SCRIPT)
            .key(processing_key(queue))
            .key(delayed_key(queue))
            .arg(&reserved.receipt)
            .arg(raw)
            .arg(due)
            .invoke_async::<i64>(&mut conn)
            .await
            .map_err(query_err(queue))?;
        Ok(())
    }

    async fn promote_due(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.connection_manager.clone();
        let promoted: i64 = redis::Script::new(PROMOTE_SCRIPT)
            .key(delayed_key(queue))
            .key(pending_key(queue))
            .arg(chrono::Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(query_err(queue))?;
        Ok(usize::try_from(promoted).unwrap_or(0))
    }

    async fn recover_stalled(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.connection_manager.clone();
        let moved: i64 = redis::Script::new(RECOVER_SCRIPT)
            .key(processing_key(queue))
            .key(pending_key(queue))
            .arg(chrono::Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(query_err(queue))?;
        Ok(usize::try_from(moved).unwrap_or(0))
    }

    async fn pending_count(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.connection_manager.clone();
        let (pending, delayed): (usize, usize) = redis::pipe()
            .cmd("LLEN")
            .arg(pending_key(queue))
            .cmd("ZCARD")
            .arg(delayed_key(queue))
            .query_async(&mut conn)
            .await
            .map_err(query_err(queue))?;
        Ok(pending + delayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(pending_key("connection-sync"), "sync:queue:connection-sync:pending");
        assert_eq!(processing_key("repo-index"), "sync:queue:repo-index:processing");
        assert_eq!(delayed_key("repo-index"), "sync:queue:repo-index:delayed");
    }

    #[tokio::test]
    async fn test_connect_error_is_backend_error() {
        let result = RedisQueueBackend::new("not-a-url").await;
        assert!(matches!(result, Err(QueueError::Backend { .. })));
    }
}
