//! # Declarative config reconciler
//!
//! Makes the database match the config file: declared connections are
//! upserted, changed ones get a sync job, undeclared declarative ones are
//! deleted, and search contexts are recomputed.
//!
//! Runs are idempotent and not locked. Two concurrent runs converge on the
//! same state, at worst enqueueing one redundant sync job.

use crate::connection_manager::ConnectionManager;
use crate::search_contexts::SearchContextSyncer;
use config::{ConfigWatchError, ConfigWatcher, ConnectionConfig, SyncConfig};
use errors::{ConfigValidationError, JobError};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storage::{Connection, SyncStore};
use tracing::{error, info, warn};

/// What one reconciliation run changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Connections whose config changed or that were created.
    pub synced: Vec<String>,
    pub deleted: Vec<String>,
    /// Declared connections left untouched because their config is invalid.
    pub invalid: Vec<String>,
    /// Connections that hit an error while being reconciled.
    pub failed: Vec<String>,
    pub contexts_synced: bool
}

fn serialized(config: &ConnectionConfig) -> Result<serde_json::Value, ConfigValidationError> {
    serde_json::to_value(config).map_err(|e| ConfigValidationError::Schema {
        reason: e.to_string()
    })
}

/// Byte-level comparison of the stored and declared config.
pub fn needs_sync(existing: Option<&Connection>, declared: &serde_json::Value) -> bool {
    match existing {
        None => true,
        Some(connection) => connection.config.to_string() != declared.to_string()
    }
}

pub struct ConfigReconciler {
    store: Arc<dyn SyncStore>,
    connections: Arc<ConnectionManager>,
    search_contexts: Arc<SearchContextSyncer>,
    org_id: i32
}

impl ConfigReconciler {
    pub fn new(
        store: Arc<dyn SyncStore>,
        connections: Arc<ConnectionManager>,
        search_contexts: Arc<SearchContextSyncer>,
        org_id: i32
    ) -> Self {
        Self {
            store,
            connections,
            search_contexts,
            org_id
        }
    }

    /// Loads and reconciles the file at `path`. A file that fails to load
    /// aborts the run before anything is written.
    pub async fn reconcile_path(&self, path: &Path) -> Result<ReconcileReport, JobError> {
        info!(path = %path.display(), "Syncing config");
        let config = config::load_config(path).await?;
        self.reconcile(&config).await
    }

    pub async fn reconcile(&self, config: &SyncConfig) -> Result<ReconcileReport, JobError> {
        let mut report = ReconcileReport::default();

        for (name, declared) in &config.connections {
            match self.reconcile_connection(name, declared).await {
                Ok(true) => report.synced.push(name.clone()),
                Ok(false) => {}
                Err(e) => {
                    error!(connection = %name, error = %e, "Failed to reconcile connection");
                    report.failed.push(name.clone());
                }
            }
        }
        for (name, reason) in &config.invalid_connections {
            warn!(connection = %name, reason = %reason, "Leaving invalid connection untouched");
            report.invalid.push(name.clone());
        }

        let declared: BTreeSet<String> = config.declared_connection_names().into_iter().collect();
        for connection in self.store.list_connections(self.org_id).await? {
            if connection.is_declarative && !declared.contains(&connection.name) {
                info!(
                    connection = %connection.name,
                    connection_id = connection.id,
                    "Deleting connection with name '{}'",
                    connection.name
                );
                self.store.delete_connection(connection.id).await?;
                report.deleted.push(connection.name);
            }
        }

        report.contexts_synced = self
            .search_contexts
            .sync(self.org_id, config.contexts.as_ref())
            .await?;

        Ok(report)
    }

    /// Returns whether a sync job was created.
    async fn reconcile_connection(&self, name: &str, declared: &ConnectionConfig) -> Result<bool, JobError> {
        let value = serialized(declared)?;
        let existing = self.store.find_connection_by_name(self.org_id, name).await?;
        let changed = needs_sync(existing.as_ref(), &value);

        let connection = match existing {
            Some(connection) if !changed && connection.is_declarative => connection,
            _ => {
                self.store
                    .upsert_declarative_connection(self.org_id, name, declared.code_host_type(), value)
                    .await?
            }
        };

        if changed {
            info!(
                connection = %name,
                connection_id = connection.id,
                "Change detected for connection '{name}'. Creating sync job."
            );
            self.connections.create_jobs(std::slice::from_ref(&connection)).await?;
        }
        Ok(changed)
    }

    /// Reconciles now and after every stable write to `path`. A run still in
    /// flight when the file changes again is abandoned.
    pub fn watch(self: &Arc<Self>, path: PathBuf) -> Result<ConfigWatcher, ConfigWatchError> {
        let mut watcher = ConfigWatcher::new(path.clone());
        let reconciler = Arc::clone(self);
        watcher.start(move |cancel| {
            let reconciler = reconciler.clone();
            let path = path.clone();
            async move {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!(path = %path.display(), "Config sync superseded by a newer change");
                    }
                    result = reconciler.reconcile_path(&path) => match result {
                        Ok(report) => info!(
                            synced = report.synced.len(),
                            deleted = report.deleted.len(),
                            invalid = report.invalid.len(),
                            failed = report.failed.len(),
                            "Config sync finished"
                        ),
                        Err(e) => error!(path = %path.display(), error = %e, "Failed to sync config")
                    }
                }
            }
        })?;
        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codehost::CodeHostDiscovery;
    use crate::connection_manager::ConnectionSyncHandler;
    use crate::credentials::CredentialResolver;
    use crate::entitlements::Entitlements;
    use config::{Settings, parse_config};
    use storage::{ConnectionStore, InMemoryQueueBackend, InMemorySyncStore, SearchContextStore};

    struct Fixture {
        store: Arc<InMemorySyncStore>,
        manager: Arc<ConnectionManager>,
        reconciler: Arc<ConfigReconciler>
    }

    fn fixture(entitlements: Entitlements) -> Fixture {
        let store = Arc::new(InMemorySyncStore::new());
        let contexts = Arc::new(SearchContextSyncer::new(store.clone(), entitlements));
        let handler = ConnectionSyncHandler::new(
            store.clone(),
            Arc::new(CodeHostDiscovery::new(Arc::new(CredentialResolver::new(store.clone())))),
            contexts.clone(),
            None
        );
        let manager = Arc::new(ConnectionManager::new(
            store.clone(),
            Arc::new(InMemoryQueueBackend::new()),
            handler,
            &Settings::default()
        ));
        let reconciler = Arc::new(ConfigReconciler::new(store.clone(), manager.clone(), contexts, 1));
        Fixture {
            store,
            manager,
            reconciler
        }
    }

    async fn pending(f: &Fixture) -> usize {
        f.manager.queue().pending_count().await.unwrap()
    }

    #[tokio::test]
    async fn test_unchanged_config_enqueues_nothing() {
        let f = fixture(Entitlements::all());
        let config = parse_config(
            r#"{ "connections": { "c1": { "type": "github", "repos": ["acme/web"] } } }"#,
            "inline"
        )
        .unwrap();

        let first = f.reconciler.reconcile(&config).await.unwrap();
        assert_eq!(first.synced, vec!["c1".to_string()]);
        assert_eq!(pending(&f).await, 1);
        let before = f.store.find_connection_by_name(1, "c1").await.unwrap().unwrap();

        let second = f.reconciler.reconcile(&config).await.unwrap();
        assert!(second.synced.is_empty());
        assert_eq!(pending(&f).await, 1);
        let after = f.store.find_connection_by_name(1, "c1").await.unwrap().unwrap();
        assert_eq!(before.updated_at, after.updated_at);

        // Reordering keys in the file is not a change.
        let reordered = parse_config(
            r#"{ "connections": { "c1": { "repos": ["acme/web"], "type": "github" } } }"#,
            "inline"
        )
        .unwrap();
        assert!(f.reconciler.reconcile(&reordered).await.unwrap().synced.is_empty());

        let changed = parse_config(
            r#"{ "connections": { "c1": { "type": "github", "repos": ["acme/web", "acme/api"] } } }"#,
            "inline"
        )
        .unwrap();
        assert_eq!(f.reconciler.reconcile(&changed).await.unwrap().synced.len(), 1);
        assert_eq!(pending(&f).await, 2);
    }

    #[tokio::test]
    async fn test_undeclared_connections_are_deleted() {
        let f = fixture(Entitlements::all());
        let both = parse_config(
            r#"{
                "connections": {
                    "c1": { "type": "git", "url": "https://example.com/a.git" },
                    "c2": { "type": "git", "url": "https://example.com/b.git" }
                },
                "contexts": { "all": { "include": ["**"] } }
            }"#,
            "inline"
        )
        .unwrap();
        f.reconciler.reconcile(&both).await.unwrap();
        assert_eq!(f.store.list_connections(1).await.unwrap().len(), 2);
        assert_eq!(f.store.list_search_contexts(1).await.unwrap().len(), 1);

        let none = parse_config(r#"{ "connections": { "c2": { "type": "git", "url": "https://example.com/b.git" } } }"#, "inline").unwrap();
        let report = f.reconciler.reconcile(&none).await.unwrap();
        assert_eq!(report.deleted, vec!["c1".to_string()]);
        assert!(f.store.find_connection_by_name(1, "c1").await.unwrap().is_none());
        assert!(f.store.find_connection_by_name(1, "c2").await.unwrap().is_some());
        assert!(f.store.list_search_contexts(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_connection_is_isolated_and_kept() {
        let f = fixture(Entitlements::all());
        let valid = parse_config(
            r#"{ "connections": {
                "good": { "type": "git", "url": "https://example.com/a.git" },
                "flaky": { "type": "git", "url": "https://example.com/b.git" }
            } }"#,
            "inline"
        )
        .unwrap();
        f.reconciler.reconcile(&valid).await.unwrap();

        // "flaky" breaks in the file; its row must survive.
        let broken = parse_config(
            r#"{ "connections": {
                "good": { "type": "git", "url": "https://example.com/a.git" },
                "flaky": { "type": "github", "token": "plaintext" }
            } }"#,
            "inline"
        )
        .unwrap();
        let report = f.reconciler.reconcile(&broken).await.unwrap();
        assert_eq!(report.invalid, vec!["flaky".to_string()]);
        assert!(report.deleted.is_empty());
        assert!(f.store.find_connection_by_name(1, "flaky").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ui_connections_survive_the_sweep() {
        let f = fixture(Entitlements::default());
        let ui = f
            .store
            .upsert_declarative_connection(1, "ui", "git", serde_json::json!({"type": "git"}))
            .await
            .unwrap();
        f.store.set_ui_owned(ui.id);

        let report = f.reconciler.reconcile(&SyncConfig::default()).await.unwrap();
        assert!(report.deleted.is_empty());
        assert!(!report.contexts_synced);
    }

    #[tokio::test]
    async fn test_invalid_file_aborts_before_writing() {
        let f = fixture(Entitlements::all());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let err = f.reconciler.reconcile_path(&path).await.unwrap_err();
        assert!(matches!(err, JobError::Config(ConfigValidationError::Parse { .. })));
        assert!(f.store.list_connections(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watch_runs_immediately() {
        let f = fixture(Entitlements::all());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{ "connections": { "c1": { "type": "git", "url": "https://example.com/a.git" } } }"#)
            .await
            .unwrap();

        let mut watcher = f.reconciler.watch(path).unwrap();
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while f.store.find_connection_by_name(1, "c1").await.unwrap().is_none() {
            assert!(tokio::time::Instant::now() < deadline, "initial sync did not run");
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        watcher.stop().await;
    }
}
