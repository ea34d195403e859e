//! Server setup and lifecycle for the sync engine.

use anyhow::Context;
use config::{ConfigWatcher, EngineConfig, GithubAppConfig, SyncConfig, load_config};
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use storage::{
    GoogleCloudSecretProvider, PgSyncStore, RedisQueueBackend, Redlock, RedlockSettings,
    SINGLE_TENANT_ORG_ID, SecretCipher, SyncStore
};
use sync::{
    AccountPermissionSyncHandler, AccountPermissionSyncer, CodeHostDiscovery, ConfigReconciler, ConnectionManager, ConnectionSyncHandler, CredentialResolver,
    Entitlements, GithubAppManager, IndexBuilder, PermissionSyncHandler, RepoCredentialProvider,
    RepoIndexHandler, RepoIndexManager, RepoPermissionSyncer, RestAccessibleRepoSource, RestCollaboratorSource,
    RestGithubAppApi, SearchContextSyncer
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::routes::create_router;
use crate::state::AppState;

const HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// The wired-up engine: stores, queues, schedulers and the HTTP API.
pub struct SyncServer {
    config: EngineConfig,
    state: Arc<AppState>,
    reconciler: Arc<ConfigReconciler>,
    permissions: Option<Arc<RepoPermissionSyncer>>,
    account_permissions: Option<Arc<AccountPermissionSyncer>>,
    shutdown: CancellationToken
}

/// Reads the declarative file once at startup for settings and apps. A broken
/// file falls back to defaults; the watcher reports it again on every change.
async fn initial_sync_config(config: &EngineConfig) -> SyncConfig {
    let Some(path) = config.config_path() else {
        return SyncConfig::default();
    };
    match load_config(path).await {
        Ok(loaded) => loaded,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Starting with default settings");
            SyncConfig::default()
        }
    }
}

impl SyncServer {
    /// Connects to Postgres and Redis and builds every engine component.
    pub async fn new(config: EngineConfig, metrics: PrometheusHandle) -> anyhow::Result<Self> {
        let pg = Arc::new(
            PgSyncStore::new(&config.database_url, config.max_db_connections)
                .await
                .context("failed to connect to Postgres")?
        );
        pg.initialize_schema()
            .await
            .context("failed to initialize database schema")?;
        let store: Arc<dyn SyncStore> = pg.clone();

        let queue_url = config
            .redis_urls
            .first()
            .context("no Redis node configured")?;
        let backend = Arc::new(
            RedisQueueBackend::new(queue_url)
                .await
                .context("failed to connect to the queue backend")?
        );
        let redlock = Arc::new(
            Redlock::connect(&config.redis_urls, RedlockSettings::default())
                .await
                .context("failed to connect to lock nodes")?
        );

        let file_config = initial_sync_config(&config).await;
        let settings = file_config.settings.clone();
        let entitlements = Entitlements::new(config.entitlements.clone());

        let mut resolver = CredentialResolver::new(store.clone()).with_cloud_provider(Arc::new(
            GoogleCloudSecretProvider::new(HTTP_CLIENT_TIMEOUT)?
        ));
        if let Some(key) = &config.encryption_key {
            resolver = resolver.with_cipher(SecretCipher::from_key_str(key)?);
        }
        let resolver = Arc::new(resolver);

        let apps = Arc::new(GithubAppManager::new(
            Arc::new(RestGithubAppApi::new(HTTP_CLIENT_TIMEOUT)?),
            resolver.clone()
        ));
        let app_configs: Vec<GithubAppConfig> = file_config.github_apps().cloned().collect();
        apps.init(&app_configs, SINGLE_TENANT_ORG_ID)
            .await
            .context("failed to initialize GitHub Apps")?;

        let credentials = Arc::new(
            RepoCredentialProvider::new(store.clone(), resolver.clone()).with_github_apps(apps)
        );
        let contexts = Arc::new(SearchContextSyncer::new(store.clone(), entitlements.clone()));

        let connections = Arc::new(ConnectionManager::new(
            store.clone(),
            backend.clone(),
            ConnectionSyncHandler::new(
                store.clone(),
                Arc::new(CodeHostDiscovery::new(resolver)),
                contexts.clone(),
                config.config_path.clone()
            ),
            &settings
        ));

        let repos_dir = config.repos_dir();
        let index_dir = config.index_dir();
        tokio::fs::create_dir_all(&repos_dir)
            .await
            .with_context(|| format!("failed to create {}", repos_dir.display()))?;
        tokio::fs::create_dir_all(&index_dir)
            .await
            .with_context(|| format!("failed to create {}", index_dir.display()))?;

        let indexing = Arc::new(RepoIndexManager::new(
            store.clone(),
            backend.clone(),
            RepoIndexHandler::new(
                store.clone(),
                credentials.clone(),
                IndexBuilder::new(config.indexer_bin.clone(), index_dir),
                redlock,
                repos_dir,
                settings.clone()
            ),
            &settings
        ));

        let permissions = config.permission_sync_enabled.then(|| {
            Arc::new(RepoPermissionSyncer::new(
                store.clone(),
                backend.clone(),
                PermissionSyncHandler::new(store.clone(), credentials.clone(), Arc::new(RestCollaboratorSource)),
                entitlements.clone(),
                &settings
            ))
        });
        let account_permissions = config.permission_sync_enabled.then(|| {
            let source = RestAccessibleRepoSource {
                github_url: config.github_auth_url.clone(),
                gitlab_url: config.gitlab_auth_url.clone()
            };
            Arc::new(AccountPermissionSyncer::new(
                store.clone(),
                backend.clone(),
                AccountPermissionSyncHandler::new(store.clone(), Arc::new(source)),
                entitlements.clone(),
                &settings
            ))
        });

        let reconciler = Arc::new(ConfigReconciler::new(
            store.clone(),
            connections.clone(),
            contexts,
            SINGLE_TENANT_ORG_ID
        ));

        let state = Arc::new(AppState::new(store, pg, connections, indexing, metrics));

        Ok(Self {
            config,
            state,
            reconciler,
            permissions,
            account_permissions,
            shutdown: CancellationToken::new()
        })
    }

    /// Starts workers and schedulers, then serves HTTP until SIGINT/SIGTERM.
    /// In-flight jobs are drained before returning.
    pub async fn run(self) -> anyhow::Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.config.host, self.config.port))?;

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        tasks.extend(self.state.connections.start(self.shutdown.clone()));
        tasks.extend(self.state.indexing.start(self.shutdown.clone()));
        if let Some(permissions) = &self.permissions {
            tasks.extend(
                permissions
                    .start(self.shutdown.clone())
                    .await
                    .context("failed to start permission syncer")?
            );
        }
        if let Some(account_permissions) = &self.account_permissions {
            tasks.extend(
                account_permissions
                    .start(self.shutdown.clone())
                    .await
                    .context("failed to start account permission syncer")?
            );
        }

        let mut watcher: Option<ConfigWatcher> = match self.config.config_path() {
            Some(path) => Some(
                self.reconciler
                    .watch(path.to_path_buf())
                    .context("failed to watch config file")?
            ),
            None => {
                tracing::info!("CONFIG_PATH not set, declarative config sync disabled");
                None
            }
        };

        let router = create_router(self.state.clone());
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind to {addr}"))?;

        tracing::info!(%addr, "Sync engine starting");

        let shutdown = self.shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                shutdown.cancel();
            })
            .await
            .context("server error")?;

        self.shutdown.cancel();
        if let Some(watcher) = watcher.as_mut() {
            watcher.stop().await;
        }
        for result in futures_util::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }

        tracing::info!("Sync engine stopped");
        Ok(())
    }

    /// Returns a reference to the application state.
    #[must_use]
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }
}

/// Signal handler for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        () = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}

/// Entry point for containerized deployments: tracing, metrics recorder and
/// config all come from the environment.
pub async fn run_from_env() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
        )
        .init();

    let metrics = observability::install_prometheus_recorder()?;
    let config = EngineConfig::from_env()?;
    SyncServer::new(config, metrics).await?.run().await
}
