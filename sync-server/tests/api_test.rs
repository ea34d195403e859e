use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use config::Settings;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{Value, json};
use std::sync::Arc;
use storage::{
    Account, ConnectionStore, InMemoryQueueBackend, InMemorySyncStore, JobStatus, JobStore, PermissionStore,
    Redlock, RepoMetadata, RepoStore, RepoUpsert
};
use sync::{
    CodeHostDiscovery, ConnectionManager, ConnectionSyncHandler, CredentialResolver, Entitlements,
    IndexBuilder, RepoCredentialProvider, RepoIndexHandler, RepoIndexManager, SearchContextSyncer
};
use sync_server::AppState;
use sync_server::routes::create_router;
use tower::ServiceExt;

struct Harness {
    store: Arc<InMemorySyncStore>,
    router: axum::Router,
    _dirs: (tempfile::TempDir, tempfile::TempDir)
}

fn harness() -> Harness {
    let store = Arc::new(InMemorySyncStore::new());
    let backend = Arc::new(InMemoryQueueBackend::new());
    let resolver = Arc::new(CredentialResolver::new(store.clone()));
    let contexts = Arc::new(SearchContextSyncer::new(store.clone(), Entitlements::all()));

    let connections = Arc::new(ConnectionManager::new(
        store.clone(),
        backend.clone(),
        ConnectionSyncHandler::new(
            store.clone(),
            Arc::new(CodeHostDiscovery::new(resolver.clone())),
            contexts,
            None
        ),
        &Settings::default()
    ));

    let repos_dir = tempfile::tempdir().unwrap();
    let index_dir = tempfile::tempdir().unwrap();
    let indexing = Arc::new(RepoIndexManager::new(
        store.clone(),
        backend,
        RepoIndexHandler::new(
            store.clone(),
            Arc::new(RepoCredentialProvider::new(store.clone(), resolver)),
            IndexBuilder::new("true", index_dir.path()),
            Arc::new(Redlock::in_memory()),
            repos_dir.path(),
            Settings::default()
        ),
        &Settings::default()
    ));

    let metrics = PrometheusBuilder::new().build_recorder().handle();
    let state = Arc::new(AppState::new(store.clone(), store.clone(), connections, indexing, metrics));

    Harness {
        store,
        router: create_router(state),
        _dirs: (repos_dir, index_dir)
    }
}

async fn post(router: &axum::Router, uri: &str, body: &str) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(
            Request::post(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap()
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn seed_repo(store: &InMemorySyncStore) -> i32 {
    let connection = store
        .upsert_declarative_connection(1, "gh", "github", json!({"type": "github", "orgs": ["acme"]}))
        .await
        .unwrap();
    store
        .replace_connection_repos(
            1,
            connection.id,
            vec![RepoUpsert {
                name: "github.com/acme/web".to_string(),
                display_name: Some("acme/web".to_string()),
                clone_url: "https://github.com/acme/web.git".to_string(),
                web_url: None,
                external_id: "1".to_string(),
                external_code_host_type: "github".to_string(),
                external_code_host_url: "https://github.com".to_string(),
                is_fork: false,
                is_archived: false,
                is_public: true,
                metadata: RepoMetadata::default()
            }]
        )
        .await
        .unwrap()[0]
}

#[tokio::test]
async fn test_health_reports_database() {
    let h = harness();
    let response = h
        .router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["database"], "connected");
}

#[tokio::test]
async fn test_metrics_is_plain_text() {
    let h = harness();
    let response = h
        .router
        .clone()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn test_sync_connection_queues_job() {
    let h = harness();
    let connection = h
        .store
        .upsert_declarative_connection(1, "gh", "github", json!({"type": "github", "orgs": ["acme"]}))
        .await
        .unwrap();

    let (status, body) = post(
        &h.router,
        "/api/sync-connection",
        &json!({ "connectionId": connection.id }).to_string()
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let jobs = h.store.list_connection_sync_jobs(connection.id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(body["jobId"], jobs[0].id.to_string());
    assert_eq!(jobs[0].status, JobStatus::Pending);
}

#[tokio::test]
async fn test_sync_connection_errors() {
    let h = harness();

    let (status, body) = post(&h.router, "/api/sync-connection", r#"{"connectionId": 999}"#).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "CONNECTION_NOT_FOUND");

    let (status, body) = post(&h.router, "/api/sync-connection", r#"{"connectionId": 1, "force": true}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");

    let (status, body) = post(&h.router, "/api/sync-connection", r#"{"connectionId": "one"}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn test_index_repo_queues_job() {
    let h = harness();
    let repo_id = seed_repo(&h.store).await;

    let (status, body) = post(&h.router, "/api/index-repo", &json!({ "repoId": repo_id }).to_string()).await;
    assert_eq!(status, StatusCode::OK);

    let jobs = h.store.list_repo_indexing_jobs(repo_id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(body["jobId"], jobs[0].id.to_string());

    let (status, body) = post(&h.router, "/api/index-repo", r#"{"repoId": 4242}"#).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "REPO_NOT_FOUND");
}

#[tokio::test]
async fn test_rebuild_permissions_grants_from_cache() {
    let h = harness();
    let repo_id = seed_repo(&h.store).await;
    h.store
        .set_repo_permission_cache(repo_id, "github", vec!["42".to_string()], chrono::Utc::now())
        .await
        .unwrap();
    for (id, provider_account_id) in [("linked", "42"), ("stranger", "7")] {
        h.store
            .upsert_account(Account {
                id: id.to_string(),
                user_id: format!("user-{id}"),
                provider: "github".to_string(),
                provider_account_id: provider_account_id.to_string(),
                access_token: None,
                permission_synced_at: None
            })
            .await
            .unwrap();
    }

    let (status, body) = post(&h.router, "/api/rebuild-permissions", r#"{"accountId": "linked"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accounts"], 1);
    assert_eq!(body["granted"], 1);
    assert_eq!(h.store.list_repo_permissions(repo_id).await.unwrap(), vec!["linked".to_string()]);

    let (status, body) = post(&h.router, "/api/rebuild-permissions", "{}").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accounts"], 2);
    assert!(body.get("granted").is_none());
    assert_eq!(h.store.list_repo_permissions(repo_id).await.unwrap(), vec!["linked".to_string()]);

    let (status, body) = post(&h.router, "/api/rebuild-permissions", r#"{"accountId": "ghost"}"#).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "ACCOUNT_NOT_FOUND");

    let (status, body) = post(&h.router, "/api/rebuild-permissions", r#"{"accountId": "linked", "all": true}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");
}
