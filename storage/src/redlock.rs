//! # Distributed Lock
//!
//! Quorum lock over N independent lock nodes (Redlock). A lock is held when
//! a majority of nodes accepted it and the remaining validity, after
//! subtracting elapsed time and clock drift, is still positive.
//!
//! Nodes are abstracted behind [`LockNode`]: [`RedisLockNode`] for
//! deployments, [`MemoryLockNode`] for tests and single-process runs.

use async_trait::async_trait;
use errors::LockError;
use futures_util::future::join_all;
use metrics::counter;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const ACQUIRE_SCRIPT: &str = r#"
for i, key in ipairs(KEYS) do
    if redis.call("EXISTS", key) == 1 then
        return 0
    end
end
for i, key in ipairs(KEYS) do
    redis.call("SET", key, ARGV[1], "PX", ARGV[2])
end
return #KEYS
"#;

const RELEASE_SCRIPT: &str = r#"
local count = 0
for i, key in ipairs(KEYS) do
    if redis.call("GET", key) == ARGV[1] then
        redis.call("DEL", key)
        count = count + 1
    end
end
return count
"#;

const EXTEND_SCRIPT: &str = r#"
for i, key in ipairs(KEYS) do
    if redis.call("GET", key) ~= ARGV[1] then
        return 0
    end
end
for i, key in ipairs(KEYS) do
    redis.call("PEXPIRE", key, ARGV[2])
end
return #KEYS
"#;

/// One independent lock store. Every call is all-or-nothing over `keys`.
#[async_trait]
pub trait LockNode: Send + Sync {
    /// Sets every key to `value` with a TTL if none of them exists.
    async fn try_acquire(&self, keys: &[String], value: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Deletes the keys that still hold `value`.
    async fn release(&self, keys: &[String], value: &str) -> Result<(), LockError>;

    /// Resets the TTL if every key still holds `value`.
    async fn extend(&self, keys: &[String], value: &str, ttl: Duration) -> Result<bool, LockError>;
}

fn backend(e: &redis::RedisError) -> LockError {
    LockError::Backend {
        reason: e.to_string()
    }
}

pub struct RedisLockNode {
    connection_manager: redis::aio::ConnectionManager
}

impl RedisLockNode {
    pub async fn connect(url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(url).map_err(|e| backend(&e))?;
        let connection_manager = client
            .get_connection_manager()
            .await
            .map_err(|e| backend(&e))?;
        Ok(Self { connection_manager })
    }

    pub fn from_manager(connection_manager: redis::aio::ConnectionManager) -> Self {
        Self { connection_manager }
    }
}

#[async_trait]
impl LockNode for RedisLockNode {
    async fn try_acquire(&self, keys: &[String], value: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.connection_manager.clone();
        let script = redis::Script::new(ACQUIRE_SCRIPT);
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        let set: usize = invocation
            .arg(value)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| backend(&e))?;
        Ok(set == keys.len())
    }

    async fn release(&self, keys: &[String], value: &str) -> Result<(), LockError> {
        let mut conn = self.connection_manager.clone();
        let script = redis::Script::new(RELEASE_SCRIPT);
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        let _: usize = invocation
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| backend(&e))?;
        Ok(())
    }

    async fn extend(&self, keys: &[String], value: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.connection_manager.clone();
        let script = redis::Script::new(EXTEND_SCRIPT);
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        let extended: usize = invocation
            .arg(value)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| backend(&e))?;
        Ok(extended == keys.len())
    }
}

/// Process-local lock node.
#[derive(Default)]
pub struct MemoryLockNode {
    entries: Mutex<HashMap<String, (String, Instant)>>
}

impl MemoryLockNode {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockNode for MemoryLockNode {
    async fn try_acquire(&self, keys: &[String], value: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, (_, expires)| *expires > now);
        if keys.iter().any(|k| entries.contains_key(k)) {
            return Ok(false);
        }
        for key in keys {
            entries.insert(key.clone(), (value.to_string(), now + ttl));
        }
        Ok(true)
    }

    async fn release(&self, keys: &[String], value: &str) -> Result<(), LockError> {
        let mut entries = self.entries.lock();
        for key in keys {
            if entries.get(key).is_some_and(|(v, _)| v == value) {
                entries.remove(key);
            }
        }
        Ok(())
    }

    async fn extend(&self, keys: &[String], value: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let held = keys.iter().all(|k| {
            entries
                .get(k)
                .is_some_and(|(v, expires)| v == value && *expires > now)
        });
        if !held {
            return Ok(false);
        }
        for key in keys {
            entries.insert(key.clone(), (value.to_string(), now + ttl));
        }
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RedlockSettings {
    pub drift_factor: f64,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub retry_jitter: Duration,
    /// Extend when less than this much validity remains.
    pub automatic_extension_threshold: Duration
}

impl Default for RedlockSettings {
    fn default() -> Self {
        Self {
            drift_factor: 0.01,
            retry_count: 10,
            retry_delay: Duration::from_millis(200),
            retry_jitter: Duration::from_millis(100),
            automatic_extension_threshold: Duration::from_millis(500)
        }
    }
}

/// A held lease.
#[derive(Debug, Clone)]
pub struct Lock {
    pub resources: Vec<String>,
    pub value: String,
    pub expiration: Instant,
    pub attempts: u32
}

impl Lock {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expiration
    }
}

#[derive(Clone)]
pub struct Redlock {
    nodes: Vec<Arc<dyn LockNode>>,
    settings: RedlockSettings
}

impl Redlock {
    pub fn new(nodes: Vec<Arc<dyn LockNode>>, settings: RedlockSettings) -> Self {
        Self { nodes, settings }
    }

    pub async fn connect(urls: &[String], settings: RedlockSettings) -> Result<Self, LockError> {
        let mut nodes: Vec<Arc<dyn LockNode>> = Vec::with_capacity(urls.len());
        for url in urls {
            nodes.push(Arc::new(RedisLockNode::connect(url).await?));
        }
        Ok(Self::new(nodes, settings))
    }

    /// Single in-process node.
    pub fn in_memory() -> Self {
        Self::new(vec![Arc::new(MemoryLockNode::new())], RedlockSettings::default())
    }

    pub fn quorum(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    fn drift(&self, ttl: Duration) -> Duration {
        Duration::from_secs_f64(ttl.as_secs_f64() * self.settings.drift_factor) + Duration::from_millis(2)
    }

    fn retry_pause(&self) -> Duration {
        let jitter_ms = self.settings.retry_jitter.as_millis() as i64;
        let offset = if jitter_ms > 0 {
            rand::thread_rng().gen_range(-jitter_ms..=jitter_ms)
        } else {
            0
        };
        let base = self.settings.retry_delay.as_millis() as i64;
        Duration::from_millis((base + offset).max(0) as u64)
    }

    async fn release_everywhere(&self, resources: &[String], value: &str) {
        let results = join_all(self.nodes.iter().map(|n| n.release(resources, value))).await;
        for result in results {
            if let Err(e) = result {
                debug!(error = %e, "Lock release failed on one node");
            }
        }
    }

    /// Acquire a lease on every resource, retrying on contention.
    pub async fn acquire(&self, resources: &[String], ttl: Duration) -> Result<Lock, LockError> {
        let value = uuid::Uuid::new_v4().to_string();
        let required = self.quorum();
        let mut last_acquired = 0;
        let mut contended = false;

        for attempt in 0..=self.settings.retry_count {
            let start = Instant::now();
            let results = join_all(self.nodes.iter().map(|n| n.try_acquire(resources, &value, ttl))).await;

            let mut acquired = 0;
            for result in &results {
                match result {
                    Ok(true) => acquired += 1,
                    Ok(false) => contended = true,
                    Err(e) => debug!(error = %e, "Lock node unavailable")
                }
            }
            last_acquired = acquired;

            let drift = self.drift(ttl);
            let elapsed = start.elapsed();
            if acquired >= required && elapsed + drift < ttl {
                counter!("lock_acquired").increment(1);
                return Ok(Lock {
                    resources: resources.to_vec(),
                    value,
                    expiration: start + ttl - drift,
                    attempts: attempt + 1
                });
            }

            self.release_everywhere(resources, &value).await;
            if attempt < self.settings.retry_count {
                tokio::time::sleep(self.retry_pause()).await;
            }
        }

        counter!("lock_contended").increment(1);
        if contended {
            Err(LockError::ResourceLocked {
                resources: resources.to_vec()
            })
        } else {
            Err(LockError::Quorum {
                acquired: last_acquired,
                required
            })
        }
    }

    /// Renew the lease. Fails when fewer than a quorum of nodes still hold it.
    pub async fn extend(&self, lock: &Lock, ttl: Duration) -> Result<Lock, LockError> {
        if lock.is_expired() {
            return Err(LockError::Expired {
                resources: lock.resources.clone()
            });
        }

        let start = Instant::now();
        let results = join_all(
            self.nodes
                .iter()
                .map(|n| n.extend(&lock.resources, &lock.value, ttl))
        )
        .await;
        let extended = results.iter().filter(|r| matches!(r, Ok(true))).count();

        let drift = self.drift(ttl);
        if extended >= self.quorum() && start.elapsed() + drift < ttl {
            Ok(Lock {
                resources: lock.resources.clone(),
                value: lock.value.clone(),
                expiration: start + ttl - drift,
                attempts: lock.attempts
            })
        } else {
            Err(LockError::Expired {
                resources: lock.resources.clone()
            })
        }
    }

    /// Best effort; an unreleased lease simply expires.
    pub async fn release(&self, lock: &Lock) {
        self.release_everywhere(&lock.resources, &lock.value).await;
    }

    /// Runs `f` while holding the lock, extending the lease in the
    /// background.
    ///
    /// If an extension fails the lease is lost: the token passed to `f` is
    /// cancelled, the future returned by `f` is dropped and the call fails
    /// with [`LockError::Expired`].
    pub async fn using<T, E, F, Fut>(&self, resources: &[String], ttl: Duration, f: F) -> Result<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>
    {
        let lock = self.acquire(resources, ttl).await?;
        let current = Mutex::new(lock);
        let lost = CancellationToken::new();
        let threshold = self.settings.automatic_extension_threshold;

        let extender = async {
            loop {
                let held = current.lock().clone();
                let wake_at = held.expiration.checked_sub(threshold).unwrap_or(held.expiration);
                tokio::time::sleep_until(wake_at).await;
                match self.extend(&held, ttl).await {
                    Ok(renewed) => *current.lock() = renewed,
                    Err(e) => {
                        warn!(resources = ?held.resources, error = %e, "Lost lock lease");
                        lost.cancel();
                        break;
                    }
                }
            }
        };

        let work = f(lost.clone());
        tokio::pin!(work);
        let result = tokio::select! {
            result = &mut work => result,
            () = extender => Err(LockError::Expired {
                resources: resources.to_vec()
            }
            .into())
        };

        let held = current.lock().clone();
        self.release(&held).await;
        result
    }
}
