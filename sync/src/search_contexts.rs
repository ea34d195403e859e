//! Search contexts declared in the config file.
//!
//! Membership is recomputed from scratch on every run by glob-matching repo
//! names, so it never drifts from the current set of repos. Repos no longer
//! linked to any connection are not members, even before GC deletes them.
//! Contexts no longer declared are deleted.

use crate::entitlements::{Entitlements, SEARCH_CONTEXTS};
use crate::index::matches_any;
use config::SearchContextConfig;
use errors::JobError;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use storage::SyncStore;
use tracing::{info, warn};

pub struct SearchContextSyncer {
    store: Arc<dyn SyncStore>,
    entitlements: Entitlements
}

impl SearchContextSyncer {
    pub fn new(store: Arc<dyn SyncStore>, entitlements: Entitlements) -> Self {
        Self { store, entitlements }
    }

    /// Returns `false` when search contexts are not licensed and nothing was
    /// touched.
    pub async fn sync(
        &self,
        org_id: i32,
        contexts: Option<&BTreeMap<String, SearchContextConfig>>
    ) -> Result<bool, JobError> {
        if !self.entitlements.has(SEARCH_CONTEXTS) {
            if contexts.is_some() {
                warn!("Skipping search context sync: search contexts are not included in the current plan");
            }
            return Ok(false);
        }

        let declared = contexts.cloned().unwrap_or_default();
        if !declared.is_empty() {
            let orphaned: BTreeSet<i32> = self
                .store
                .list_orphaned_repos()
                .await?
                .into_iter()
                .map(|repo| repo.id)
                .collect();
            let repos: Vec<_> = self
                .store
                .list_repos(org_id)
                .await?
                .into_iter()
                .filter(|repo| !orphaned.contains(&repo.id))
                .collect();
            for (name, context) in &declared {
                let members: Vec<i32> = repos
                    .iter()
                    .filter(|repo| matches_any(&context.include, &repo.name))
                    .filter(|repo| {
                        context
                            .exclude
                            .as_ref()
                            .is_none_or(|exclude| !matches_any(exclude, &repo.name))
                    })
                    .map(|repo| repo.id)
                    .collect();

                let saved = self
                    .store
                    .upsert_search_context(org_id, name, context.description.clone(), members)
                    .await?;
                info!(context = %name, repos = saved.repo_ids.len(), "Synced search context");
            }
        }

        let keep: BTreeSet<&String> = declared.keys().collect();
        for stale in self.store.list_search_contexts(org_id).await? {
            if !keep.contains(&stale.name) {
                info!(context = %stale.name, id = stale.id, "Deleting search context");
                self.store.delete_search_context(stale.id).await?;
            }
        }

        Ok(true)
    }
}
