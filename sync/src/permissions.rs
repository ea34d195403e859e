//! # Permission cache rebuild
//!
//! Fast path for granting access: every repo remembers which external
//! accounts its code host last reported as collaborators. When an account
//! is linked, those cached lists grant it repo access right away, ahead of
//! the next live permission sync.

use errors::JobError;
use std::sync::Arc;
use storage::SyncStore;
use tracing::{debug, error, info, warn};

pub struct PermissionCacheRebuilder {
    store: Arc<dyn SyncStore>
}

impl PermissionCacheRebuilder {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    /// Grants `account_id` every repo whose cached `provider` list contains
    /// `provider_account_id`. Returns the number of new permission rows.
    ///
    /// A repo with an unreadable cache is logged and skipped.
    pub async fn rebuild_from_cache(
        &self,
        account_id: &str,
        provider: &str,
        provider_account_id: &str
    ) -> Result<u64, JobError> {
        let repos = self.store.list_repos_with_permission_cache().await?;

        let mut matching = Vec::new();
        for repo in &repos {
            let cache = match repo.permitted_accounts() {
                Ok(Some(cache)) => cache,
                Ok(None) => continue,
                Err(e) => {
                    warn!(repo_id = repo.id, error = %e, "Failed to parse permission cache");
                    continue;
                }
            };
            if cache
                .get(provider)
                .is_some_and(|ids| ids.iter().any(|id| id == provider_account_id))
            {
                matching.push(repo.id);
            }
        }

        if matching.is_empty() {
            debug!(account_id, provider, "No cached permissions for account");
            return Ok(0);
        }

        let granted = self.store.grant_repo_permissions(account_id, &matching).await?;
        info!(account_id, provider, repos = matching.len(), granted, "Rebuilt permissions from cache");
        Ok(granted)
    }

    /// Rebuilds every known account. Failures are logged per account and do
    /// not stop the run. Returns how many accounts succeeded.
    pub async fn sync_all_from_cache(&self) -> Result<usize, JobError> {
        let accounts = self.store.list_accounts().await?;
        let total = accounts.len();
        let mut succeeded = 0;
        for account in accounts {
            match self
                .rebuild_from_cache(&account.id, &account.provider, &account.provider_account_id)
                .await
            {
                Ok(_) => succeeded += 1,
                Err(e) => error!(account_id = %account.id, error = %e, "Failed to rebuild permissions for account")
            }
        }
        info!(succeeded, total, "Rebuilt permissions from cache for all accounts");
        Ok(succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use storage::{
        Account, ConnectionStore, InMemorySyncStore, PermissionStore, RepoMetadata, RepoStore, RepoUpsert
    };

    fn upsert(name: &str, external_id: &str) -> RepoUpsert {
        RepoUpsert {
            name: name.to_string(),
            display_name: Some(name.to_string()),
            clone_url: format!("https://{name}.git"),
            web_url: None,
            external_id: external_id.to_string(),
            external_code_host_type: "github".to_string(),
            external_code_host_url: "https://github.com".to_string(),
            is_fork: false,
            is_archived: false,
            is_public: false,
            metadata: RepoMetadata::default()
        }
    }

    fn account(id: &str, provider_account_id: &str) -> Account {
        Account {
            id: id.to_string(),
            user_id: format!("user-{id}"),
            provider: "github".to_string(),
            provider_account_id: provider_account_id.to_string(),
            access_token: None,
            permission_synced_at: None
        }
    }

    async fn seeded() -> (Arc<InMemorySyncStore>, Vec<i32>) {
        let store = Arc::new(InMemorySyncStore::new());
        let conn = store
            .upsert_declarative_connection(1, "gh", "github", json!({"type": "github"}))
            .await
            .unwrap();
        let ids = store
            .replace_connection_repos(
                1,
                conn.id,
                vec![
                    upsert("github.com/acme/web", "1"),
                    upsert("github.com/acme/api", "2"),
                    upsert("github.com/acme/ops", "3"),
                ]
            )
            .await
            .unwrap();
        store
            .set_repo_permission_cache(ids[0], "github", vec!["100".into(), "200".into()], Utc::now())
            .await
            .unwrap();
        store
            .set_repo_permission_cache(ids[1], "github", vec!["100".into()], Utc::now())
            .await
            .unwrap();
        store.upsert_account(account("a1", "100")).await.unwrap();
        store.upsert_account(account("a2", "200")).await.unwrap();
        store.upsert_account(account("a3", "300")).await.unwrap();
        (store, ids)
    }

    #[tokio::test]
    async fn test_rebuild_grants_cached_repos_once() {
        let (store, ids) = seeded().await;
        let rebuilder = PermissionCacheRebuilder::new(store.clone());

        assert_eq!(rebuilder.rebuild_from_cache("a1", "github", "100").await.unwrap(), 2);
        // Existing rows are skipped.
        assert_eq!(rebuilder.rebuild_from_cache("a1", "github", "100").await.unwrap(), 0);

        assert_eq!(store.list_repo_permissions(ids[0]).await.unwrap(), vec!["a1".to_string()]);
        assert!(store.list_repo_permissions(ids[2]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_account_without_cached_entries_gets_nothing() {
        let (store, ids) = seeded().await;
        let rebuilder = PermissionCacheRebuilder::new(store.clone());

        assert_eq!(rebuilder.rebuild_from_cache("a3", "github", "300").await.unwrap(), 0);
        assert_eq!(rebuilder.rebuild_from_cache("a1", "gitlab", "100").await.unwrap(), 0);
        for id in ids {
            assert!(store.list_repo_permissions(id).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_sync_all_counts_successes() {
        let (store, ids) = seeded().await;
        let rebuilder = PermissionCacheRebuilder::new(store.clone());

        assert_eq!(rebuilder.sync_all_from_cache().await.unwrap(), 3);
        let mut web = store.list_repo_permissions(ids[0]).await.unwrap();
        web.sort();
        assert_eq!(web, vec!["a1".to_string(), "a2".to_string()]);
    }
}
