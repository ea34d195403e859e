//! # Storage Layer
//!
//! Persistence for the sync engine: the relational store (PostgreSQL or
//! in-memory), encrypted org secrets, external secret providers, the Redis
//! job queue and the quorum lock.

pub mod encryption;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod queue;
pub mod redis;
pub mod redlock;
pub mod secret_provider;
pub mod store;

pub use encryption::SecretCipher;
pub use memory::InMemorySyncStore;
pub use models::*;
pub use postgres::PgSyncStore;
pub use queue::{InMemoryQueueBackend, QueueBackend, QueuedJob, Reserved};
pub use redis::RedisQueueBackend;
pub use redlock::{Lock, LockNode, MemoryLockNode, RedisLockNode, Redlock, RedlockSettings};
pub use secret_provider::{GoogleCloudSecretProvider, SecretProvider};
pub use store::{
    ConnectionStore, JobStore, PermissionStore, RepoStore, SearchContextStore, SecretStore,
    SyncStore
};
