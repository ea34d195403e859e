//! Application state for the sync-trigger API.

use async_trait::async_trait;
use errors::StorageError;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use storage::{InMemorySyncStore, PgSyncStore, SyncStore};
use sync::{ConnectionManager, PermissionCacheRebuilder, RepoIndexManager};

/// Reachability check behind `GET /health`.
#[async_trait]
pub trait DatabaseHealth: Send + Sync {
    async fn ping(&self) -> Result<(), StorageError>;
}

#[async_trait]
impl DatabaseHealth for PgSyncStore {
    async fn ping(&self) -> Result<(), StorageError> {
        PgSyncStore::ping(self).await
    }
}

#[async_trait]
impl DatabaseHealth for InMemorySyncStore {
    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Shared application state for Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SyncStore>,
    pub database: Arc<dyn DatabaseHealth>,
    pub connections: Arc<ConnectionManager>,
    pub indexing: Arc<RepoIndexManager>,
    pub permission_cache: Arc<PermissionCacheRebuilder>,
    pub metrics: PrometheusHandle
}

impl AppState {
    pub fn new(
        store: Arc<dyn SyncStore>,
        database: Arc<dyn DatabaseHealth>,
        connections: Arc<ConnectionManager>,
        indexing: Arc<RepoIndexManager>,
        metrics: PrometheusHandle
    ) -> Self {
        Self {
            permission_cache: Arc::new(PermissionCacheRebuilder::new(store.clone())),
            store,
            database,
            connections,
            indexing,
            metrics
        }
    }
}
