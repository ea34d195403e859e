use crate::models::{
    Account, AccountPermissionSyncJob, Connection, ConnectionSyncJob, ConnectionSyncStatus, JobUpdate, Repo,
    RepoIndexingJob, RepoIndexingJobType, RepoPermissionSyncJob, RepoUpsert, SearchContext, Secret
};
use crate::store::{
    ConnectionStore, JobStore, PermissionStore, RepoStore, Result, SearchContextStore, SecretStore,
    not_found
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use errors::StorageError;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Pool, Postgres, Row};
use tracing::info;
use uuid::Uuid;

fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::QueryError {
        backend: "Postgres".to_string(),
        reason: e.to_string()
    }
}

fn json_err(e: serde_json::Error) -> StorageError {
    StorageError::SerializationError {
        reason: e.to_string()
    }
}

fn row_to_connection(row: &PgRow) -> Result<Connection> {
    Ok(Connection {
        id: row.try_get("id").map_err(db_err)?,
        org_id: row.try_get("org_id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        connection_type: row.try_get("connection_type").map_err(db_err)?,
        config: row.try_get("config").map_err(db_err)?,
        is_declarative: row.try_get("is_declarative").map_err(db_err)?,
        sync_status: row
            .try_get::<String, _>("sync_status")
            .map_err(db_err)?
            .parse()?,
        synced_at: row.try_get("synced_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?
    })
}

fn row_to_repo(row: &PgRow) -> Result<Repo> {
    let metadata: serde_json::Value = row.try_get("metadata").map_err(db_err)?;
    Ok(Repo {
        id: row.try_get("id").map_err(db_err)?,
        org_id: row.try_get("org_id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        display_name: row.try_get("display_name").map_err(db_err)?,
        clone_url: row.try_get("clone_url").map_err(db_err)?,
        web_url: row.try_get("web_url").map_err(db_err)?,
        external_id: row.try_get("external_id").map_err(db_err)?,
        external_code_host_type: row.try_get("external_code_host_type").map_err(db_err)?,
        external_code_host_url: row.try_get("external_code_host_url").map_err(db_err)?,
        is_fork: row.try_get("is_fork").map_err(db_err)?,
        is_archived: row.try_get("is_archived").map_err(db_err)?,
        is_public: row.try_get("is_public").map_err(db_err)?,
        metadata: serde_json::from_value(metadata).map_err(json_err)?,
        cached_permitted_external_accounts: row
            .try_get("cached_permitted_external_accounts")
            .map_err(db_err)?,
        indexed_at: row.try_get("indexed_at").map_err(db_err)?,
        indexed_commit_hash: row.try_get("indexed_commit_hash").map_err(db_err)?,
        permission_synced_at: row.try_get("permission_synced_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?
    })
}

fn row_to_account(row: &PgRow) -> Result<Account> {
    Ok(Account {
        id: row.try_get("id").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        provider: row.try_get("provider").map_err(db_err)?,
        provider_account_id: row.try_get("provider_account_id").map_err(db_err)?,
        access_token: row.try_get("access_token").map_err(db_err)?,
        permission_synced_at: row.try_get("permission_synced_at").map_err(db_err)?
    })
}

fn row_to_connection_job(row: &PgRow) -> Result<ConnectionSyncJob> {
    Ok(ConnectionSyncJob {
        id: row.try_get("id").map_err(db_err)?,
        connection_id: row.try_get("connection_id").map_err(db_err)?,
        status: row.try_get::<String, _>("status").map_err(db_err)?.parse()?,
        error_message: row.try_get("error_message").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?
    })
}

fn row_to_index_job(row: &PgRow) -> Result<RepoIndexingJob> {
    Ok(RepoIndexingJob {
        id: row.try_get("id").map_err(db_err)?,
        repo_id: row.try_get("repo_id").map_err(db_err)?,
        job_type: row.try_get::<String, _>("job_type").map_err(db_err)?.parse()?,
        status: row.try_get::<String, _>("status").map_err(db_err)?.parse()?,
        error_message: row.try_get("error_message").map_err(db_err)?,
        metadata: row.try_get("metadata").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?
    })
}

fn row_to_permission_job(row: &PgRow) -> Result<RepoPermissionSyncJob> {
    Ok(RepoPermissionSyncJob {
        id: row.try_get("id").map_err(db_err)?,
        repo_id: row.try_get("repo_id").map_err(db_err)?,
        status: row.try_get::<String, _>("status").map_err(db_err)?.parse()?,
        error_message: row.try_get("error_message").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?
    })
}

fn row_to_account_job(row: &PgRow) -> Result<AccountPermissionSyncJob> {
    Ok(AccountPermissionSyncJob {
        id: row.try_get("id").map_err(db_err)?,
        account_id: row.try_get("account_id").map_err(db_err)?,
        status: row.try_get::<String, _>("status").map_err(db_err)?.parse()?,
        error_message: row.try_get("error_message").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?
    })
}

/// Postgres-backed system of record.
pub struct PgSyncStore {
    pool: Pool<Postgres>
}

impl PgSyncStore {
    pub async fn new(connection_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_url)
            .await
            .map_err(|e| StorageError::ConnectionError {
                backend: "Postgres".to_string(),
                reason: e.to_string()
            })?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn initialize_schema(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS connection (
                id SERIAL PRIMARY KEY,
                org_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                connection_type TEXT NOT NULL,
                config JSONB NOT NULL,
                is_declarative BOOLEAN NOT NULL DEFAULT FALSE,
                sync_status TEXT NOT NULL DEFAULT 'SYNC_NEEDED',
                synced_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE (org_id, name)
            )",
            "CREATE TABLE IF NOT EXISTS repo (
                id SERIAL PRIMARY KEY,
                org_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                display_name TEXT,
                clone_url TEXT NOT NULL,
                web_url TEXT,
                external_id TEXT NOT NULL,
                external_code_host_type TEXT NOT NULL,
                external_code_host_url TEXT NOT NULL,
                is_fork BOOLEAN NOT NULL DEFAULT FALSE,
                is_archived BOOLEAN NOT NULL DEFAULT FALSE,
                is_public BOOLEAN NOT NULL DEFAULT FALSE,
                metadata JSONB NOT NULL DEFAULT '{}',
                cached_permitted_external_accounts JSONB,
                indexed_at TIMESTAMPTZ,
                indexed_commit_hash TEXT,
                permission_synced_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE (external_id, external_code_host_url, org_id)
            )",
            "CREATE TABLE IF NOT EXISTS repo_to_connection (
                repo_id INTEGER NOT NULL REFERENCES repo(id) ON DELETE CASCADE,
                connection_id INTEGER NOT NULL REFERENCES connection(id) ON DELETE CASCADE,
                added_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
                PRIMARY KEY (connection_id, repo_id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_repo_to_connection_repo ON repo_to_connection(repo_id)",
            "CREATE TABLE IF NOT EXISTS search_context (
                id SERIAL PRIMARY KEY,
                org_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                UNIQUE (org_id, name)
            )",
            "CREATE TABLE IF NOT EXISTS search_context_repo (
                search_context_id INTEGER NOT NULL REFERENCES search_context(id) ON DELETE CASCADE,
                repo_id INTEGER NOT NULL REFERENCES repo(id) ON DELETE CASCADE,
                PRIMARY KEY (search_context_id, repo_id)
            )",
            "CREATE TABLE IF NOT EXISTS account (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                provider_account_id TEXT NOT NULL,
                access_token TEXT,
                permission_synced_at TIMESTAMPTZ,
                UNIQUE (provider, provider_account_id)
            )",
            "ALTER TABLE account ADD COLUMN IF NOT EXISTS access_token TEXT",
            "ALTER TABLE account ADD COLUMN IF NOT EXISTS permission_synced_at TIMESTAMPTZ",
            "CREATE TABLE IF NOT EXISTS account_to_repo_permission (
                account_id TEXT NOT NULL REFERENCES account(id) ON DELETE CASCADE,
                repo_id INTEGER NOT NULL REFERENCES repo(id) ON DELETE CASCADE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (account_id, repo_id)
            )",
            "CREATE TABLE IF NOT EXISTS connection_sync_job (
                id UUID PRIMARY KEY,
                connection_id INTEGER NOT NULL REFERENCES connection(id) ON DELETE CASCADE,
                status TEXT NOT NULL,
                error_message TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                completed_at TIMESTAMPTZ
            )",
            "CREATE TABLE IF NOT EXISTS repo_indexing_job (
                id UUID PRIMARY KEY,
                repo_id INTEGER NOT NULL REFERENCES repo(id) ON DELETE CASCADE,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                metadata JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                completed_at TIMESTAMPTZ
            )",
            "CREATE TABLE IF NOT EXISTS repo_permission_sync_job (
                id UUID PRIMARY KEY,
                repo_id INTEGER NOT NULL REFERENCES repo(id) ON DELETE CASCADE,
                status TEXT NOT NULL,
                error_message TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                completed_at TIMESTAMPTZ
            )",
            "CREATE TABLE IF NOT EXISTS account_permission_sync_job (
                id UUID PRIMARY KEY,
                account_id TEXT NOT NULL REFERENCES account(id) ON DELETE CASCADE,
                status TEXT NOT NULL,
                error_message TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                completed_at TIMESTAMPTZ
            )",
            "CREATE TABLE IF NOT EXISTS secret (
                org_id INTEGER NOT NULL,
                key TEXT NOT NULL,
                iv TEXT NOT NULL,
                encrypted_value TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (org_id, key)
            )"
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }

        info!("Sync schema initialized");
        Ok(())
    }
}

#[async_trait]
impl ConnectionStore for PgSyncStore {
    async fn get_connection(&self, id: i32) -> Result<Option<Connection>> {
        sqlx::query("SELECT * FROM connection WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(row_to_connection)
            .transpose()
    }

    async fn find_connection_by_name(&self, org_id: i32, name: &str) -> Result<Option<Connection>> {
        sqlx::query("SELECT * FROM connection WHERE org_id = $1 AND name = $2")
            .bind(org_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(row_to_connection)
            .transpose()
    }

    async fn list_connections(&self, org_id: i32) -> Result<Vec<Connection>> {
        sqlx::query("SELECT * FROM connection WHERE org_id = $1 ORDER BY id")
            .bind(org_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .iter()
            .map(row_to_connection)
            .collect()
    }

    async fn list_all_connections(&self) -> Result<Vec<Connection>> {
        sqlx::query("SELECT * FROM connection ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .iter()
            .map(row_to_connection)
            .collect()
    }

    async fn upsert_declarative_connection(
        &self,
        org_id: i32,
        name: &str,
        connection_type: &str,
        config: serde_json::Value
    ) -> Result<Connection> {
        let row = sqlx::query(
            "INSERT INTO connection (org_id, name, connection_type, config, is_declarative)
             VALUES ($1, $2, $3, $4, TRUE)
             ON CONFLICT (org_id, name) DO UPDATE SET
                connection_type = EXCLUDED.connection_type,
                config = EXCLUDED.config,
                is_declarative = TRUE,
                updated_at = now()
             RETURNING *"
        )
        .bind(org_id)
        .bind(name)
        .bind(connection_type)
        .bind(config)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row_to_connection(&row)
    }

    async fn delete_connection(&self, id: i32) -> Result<()> {
        sqlx::query("DELETE FROM connection WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_connection_sync_status(
        &self,
        id: i32,
        status: ConnectionSyncStatus,
        synced_at: Option<DateTime<Utc>>
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE connection
             SET sync_status = $2, synced_at = COALESCE($3, synced_at), updated_at = now()
             WHERE id = $1"
        )
        .bind(id)
        .bind(status.as_str())
        .bind(synced_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(not_found("Connection", id));
        }
        Ok(())
    }

    async fn list_connections_for_repo(&self, repo_id: i32) -> Result<Vec<Connection>> {
        sqlx::query(
            "SELECT c.* FROM connection c
             JOIN repo_to_connection rc ON rc.connection_id = c.id
             WHERE rc.repo_id = $1
             ORDER BY rc.added_at, c.id"
        )
        .bind(repo_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .iter()
        .map(row_to_connection)
        .collect()
    }
}

#[async_trait]
impl RepoStore for PgSyncStore {
    async fn get_repo(&self, id: i32) -> Result<Option<Repo>> {
        sqlx::query("SELECT * FROM repo WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(row_to_repo)
            .transpose()
    }

    async fn list_repos(&self, org_id: i32) -> Result<Vec<Repo>> {
        sqlx::query("SELECT * FROM repo WHERE org_id = $1 ORDER BY id")
            .bind(org_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .iter()
            .map(row_to_repo)
            .collect()
    }

    async fn list_all_repos(&self) -> Result<Vec<Repo>> {
        sqlx::query("SELECT * FROM repo ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .iter()
            .map(row_to_repo)
            .collect()
    }

    async fn list_repos_for_connection(&self, connection_id: i32) -> Result<Vec<Repo>> {
        sqlx::query(
            "SELECT r.* FROM repo r
             JOIN repo_to_connection rc ON rc.repo_id = r.id
             WHERE rc.connection_id = $1
             ORDER BY r.id"
        )
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .iter()
        .map(row_to_repo)
        .collect()
    }

    async fn list_orphaned_repos(&self) -> Result<Vec<Repo>> {
        sqlx::query(
            "SELECT * FROM repo r
             WHERE NOT EXISTS (SELECT 1 FROM repo_to_connection rc WHERE rc.repo_id = r.id)
             ORDER BY r.id"
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .iter()
        .map(row_to_repo)
        .collect()
    }

    async fn list_repos_with_permission_cache(&self) -> Result<Vec<Repo>> {
        sqlx::query("SELECT * FROM repo WHERE cached_permitted_external_accounts IS NOT NULL ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .iter()
            .map(row_to_repo)
            .collect()
    }

    async fn find_repos_by_external_ids(
        &self,
        code_host_type: &str,
        external_ids: &[String]
    ) -> Result<Vec<Repo>> {
        sqlx::query(
            "SELECT * FROM repo WHERE external_code_host_type = $1 AND external_id = ANY($2) ORDER BY id"
        )
        .bind(code_host_type)
        .bind(external_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .iter()
        .map(row_to_repo)
        .collect()
    }

    async fn replace_connection_repos(
        &self,
        org_id: i32,
        connection_id: i32,
        repos: Vec<RepoUpsert>
    ) -> Result<Vec<i32>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query("DELETE FROM repo_to_connection WHERE connection_id = $1")
            .bind(connection_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let mut ids = Vec::with_capacity(repos.len());
        for repo in repos {
            let metadata = serde_json::to_value(&repo.metadata).map_err(json_err)?;
            let id: i32 = sqlx::query_scalar(
                "INSERT INTO repo (org_id, name, display_name, clone_url, web_url, external_id,
                    external_code_host_type, external_code_host_url, is_fork, is_archived,
                    is_public, metadata)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                 ON CONFLICT (external_id, external_code_host_url, org_id) DO UPDATE SET
                    name = EXCLUDED.name,
                    display_name = EXCLUDED.display_name,
                    clone_url = EXCLUDED.clone_url,
                    web_url = EXCLUDED.web_url,
                    external_code_host_type = EXCLUDED.external_code_host_type,
                    is_fork = EXCLUDED.is_fork,
                    is_archived = EXCLUDED.is_archived,
                    is_public = EXCLUDED.is_public,
                    metadata = (repo.metadata - 'branches' - 'tags' - 'gitConfig') || EXCLUDED.metadata,
                    updated_at = now()
                 RETURNING id"
            )
            .bind(org_id)
            .bind(&repo.name)
            .bind(&repo.display_name)
            .bind(&repo.clone_url)
            .bind(&repo.web_url)
            .bind(&repo.external_id)
            .bind(&repo.external_code_host_type)
            .bind(&repo.external_code_host_url)
            .bind(repo.is_fork)
            .bind(repo.is_archived)
            .bind(repo.is_public)
            .bind(metadata)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;

            sqlx::query(
                "INSERT INTO repo_to_connection (repo_id, connection_id) VALUES ($1, $2)
                 ON CONFLICT DO NOTHING"
            )
            .bind(id)
            .bind(connection_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            ids.push(id);
        }

        tx.commit().await.map_err(db_err)?;
        Ok(ids)
    }

    async fn mark_repo_indexed(
        &self,
        repo_id: i32,
        indexed_at: DateTime<Utc>,
        commit_hash: Option<String>,
        indexed_revisions: Vec<String>
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE repo SET
                indexed_at = $2,
                indexed_commit_hash = $3,
                metadata = metadata || jsonb_build_object('indexedRevisions', $4::jsonb),
                updated_at = now()
             WHERE id = $1"
        )
        .bind(repo_id)
        .bind(indexed_at)
        .bind(commit_hash)
        .bind(serde_json::Value::from(indexed_revisions))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(not_found("Repo", repo_id));
        }
        Ok(())
    }

    async fn set_repo_permission_cache(
        &self,
        repo_id: i32,
        provider: &str,
        external_account_ids: Vec<String>,
        synced_at: DateTime<Utc>
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE repo SET
                cached_permitted_external_accounts =
                    (CASE WHEN jsonb_typeof(cached_permitted_external_accounts) = 'object'
                          THEN cached_permitted_external_accounts
                          ELSE '{}'::jsonb END)
                    || jsonb_build_object($2::text, $3::jsonb),
                permission_synced_at = $4
             WHERE id = $1"
        )
        .bind(repo_id)
        .bind(provider)
        .bind(serde_json::Value::from(external_account_ids))
        .bind(synced_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(not_found("Repo", repo_id));
        }
        Ok(())
    }

    async fn delete_repo(&self, id: i32) -> Result<()> {
        sqlx::query("DELETE FROM repo WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl SearchContextStore for PgSyncStore {
    async fn list_search_contexts(&self, org_id: i32) -> Result<Vec<SearchContext>> {
        let rows = sqlx::query(
            "SELECT sc.id, sc.org_id, sc.name, sc.description,
                    COALESCE(array_agg(scr.repo_id ORDER BY scr.repo_id)
                             FILTER (WHERE scr.repo_id IS NOT NULL), '{}') AS repo_ids
             FROM search_context sc
             LEFT JOIN search_context_repo scr ON scr.search_context_id = sc.id
             WHERE sc.org_id = $1
             GROUP BY sc.id
             ORDER BY sc.id"
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                Ok(SearchContext {
                    id: row.try_get("id").map_err(db_err)?,
                    org_id: row.try_get("org_id").map_err(db_err)?,
                    name: row.try_get("name").map_err(db_err)?,
                    description: row.try_get("description").map_err(db_err)?,
                    repo_ids: row.try_get("repo_ids").map_err(db_err)?
                })
            })
            .collect()
    }

    async fn upsert_search_context(
        &self,
        org_id: i32,
        name: &str,
        description: Option<String>,
        repo_ids: Vec<i32>
    ) -> Result<SearchContext> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let id: i32 = sqlx::query_scalar(
            "INSERT INTO search_context (org_id, name, description) VALUES ($1, $2, $3)
             ON CONFLICT (org_id, name) DO UPDATE SET description = EXCLUDED.description
             RETURNING id"
        )
        .bind(org_id)
        .bind(name)
        .bind(&description)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "DELETE FROM search_context_repo
             WHERE search_context_id = $1 AND NOT (repo_id = ANY($2))"
        )
        .bind(id)
        .bind(&repo_ids)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "INSERT INTO search_context_repo (search_context_id, repo_id)
             SELECT $1, r.id FROM repo r WHERE r.id = ANY($2)
             ON CONFLICT DO NOTHING"
        )
        .bind(id)
        .bind(&repo_ids)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let members: Vec<i32> = sqlx::query_scalar(
            "SELECT repo_id FROM search_context_repo WHERE search_context_id = $1 ORDER BY repo_id"
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        Ok(SearchContext {
            id,
            org_id,
            name: name.to_string(),
            description,
            repo_ids: members
        })
    }

    async fn delete_search_context(&self, id: i32) -> Result<()> {
        sqlx::query("DELETE FROM search_context WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl PermissionStore for PgSyncStore {
    async fn upsert_account(&self, account: Account) -> Result<()> {
        sqlx::query(
            "INSERT INTO account (id, user_id, provider, provider_account_id, access_token, permission_synced_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                provider = EXCLUDED.provider,
                provider_account_id = EXCLUDED.provider_account_id,
                access_token = COALESCE(EXCLUDED.access_token, account.access_token)"
        )
        .bind(&account.id)
        .bind(&account.user_id)
        .bind(&account.provider)
        .bind(&account.provider_account_id)
        .bind(&account.access_token)
        .bind(account.permission_synced_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_account(&self, id: &str) -> Result<Option<Account>> {
        sqlx::query("SELECT * FROM account WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(row_to_account)
            .transpose()
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        sqlx::query("SELECT * FROM account ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .iter()
            .map(row_to_account)
            .collect()
    }

    async fn find_accounts_by_provider_ids(
        &self,
        provider: &str,
        provider_account_ids: &[String]
    ) -> Result<Vec<Account>> {
        sqlx::query("SELECT * FROM account WHERE provider = $1 AND provider_account_id = ANY($2)")
            .bind(provider)
            .bind(provider_account_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .iter()
            .map(row_to_account)
            .collect()
    }

    async fn grant_repo_permissions(&self, account_id: &str, repo_ids: &[i32]) -> Result<u64> {
        let result = sqlx::query(
            "INSERT INTO account_to_repo_permission (account_id, repo_id)
             SELECT $1, r.id FROM repo r WHERE r.id = ANY($2)
             ON CONFLICT DO NOTHING"
        )
        .bind(account_id)
        .bind(repo_ids)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn replace_repo_permissions(&self, repo_id: i32, account_ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query("DELETE FROM account_to_repo_permission WHERE repo_id = $1")
            .bind(repo_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        sqlx::query(
            "INSERT INTO account_to_repo_permission (account_id, repo_id)
             SELECT a.id, $1 FROM account a WHERE a.id = ANY($2)
             ON CONFLICT DO NOTHING"
        )
        .bind(repo_id)
        .bind(account_ids)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn list_repo_permissions(&self, repo_id: i32) -> Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT account_id FROM account_to_repo_permission WHERE repo_id = $1 ORDER BY account_id"
        )
        .bind(repo_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn replace_account_permissions(&self, account_id: &str, repo_ids: &[i32]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM account WHERE id = $1 FOR UPDATE")
            .bind(account_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(not_found("Account", account_id));
        }

        sqlx::query("DELETE FROM account_to_repo_permission WHERE account_id = $1")
            .bind(account_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        sqlx::query(
            "INSERT INTO account_to_repo_permission (account_id, repo_id)
             SELECT $1, r.id FROM repo r WHERE r.id = ANY($2)
             ON CONFLICT DO NOTHING"
        )
        .bind(account_id)
        .bind(repo_ids)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn list_account_permissions(&self, account_id: &str) -> Result<Vec<i32>> {
        sqlx::query_scalar(
            "SELECT repo_id FROM account_to_repo_permission WHERE account_id = $1 ORDER BY repo_id"
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn set_account_permission_synced_at(
        &self,
        account_id: &str,
        synced_at: DateTime<Utc>
    ) -> Result<()> {
        let result = sqlx::query("UPDATE account SET permission_synced_at = $2 WHERE id = $1")
            .bind(account_id)
            .bind(synced_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(not_found("Account", account_id));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgSyncStore {
    async fn create_connection_sync_job(&self, connection_id: i32) -> Result<ConnectionSyncJob> {
        let row = sqlx::query(
            "INSERT INTO connection_sync_job (id, connection_id, status) VALUES ($1, $2, 'PENDING')
             RETURNING *"
        )
        .bind(Uuid::new_v4())
        .bind(connection_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row_to_connection_job(&row)
    }

    async fn get_connection_sync_job(&self, id: Uuid) -> Result<Option<ConnectionSyncJob>> {
        sqlx::query("SELECT * FROM connection_sync_job WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(row_to_connection_job)
            .transpose()
    }

    async fn update_connection_sync_job(&self, id: Uuid, update: JobUpdate) -> Result<ConnectionSyncJob> {
        sqlx::query(
            "UPDATE connection_sync_job SET
                status = $2,
                error_message = COALESCE($3, error_message),
                updated_at = now(),
                completed_at = CASE WHEN $4 THEN now() ELSE completed_at END
             WHERE id = $1
             RETURNING *"
        )
        .bind(id)
        .bind(update.status.as_str())
        .bind(update.error_message)
        .bind(update.status.is_terminal())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .as_ref()
        .map(row_to_connection_job)
        .transpose()?
        .ok_or_else(|| not_found("ConnectionSyncJob", id))
    }

    async fn list_connection_sync_jobs(&self, connection_id: i32) -> Result<Vec<ConnectionSyncJob>> {
        sqlx::query("SELECT * FROM connection_sync_job WHERE connection_id = $1 ORDER BY created_at DESC")
            .bind(connection_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .iter()
            .map(row_to_connection_job)
            .collect()
    }

    async fn create_repo_indexing_job(
        &self,
        repo_id: i32,
        job_type: RepoIndexingJobType
    ) -> Result<RepoIndexingJob> {
        let row = sqlx::query(
            "INSERT INTO repo_indexing_job (id, repo_id, job_type, status) VALUES ($1, $2, $3, 'PENDING')
             RETURNING *"
        )
        .bind(Uuid::new_v4())
        .bind(repo_id)
        .bind(job_type.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row_to_index_job(&row)
    }

    async fn get_repo_indexing_job(&self, id: Uuid) -> Result<Option<RepoIndexingJob>> {
        sqlx::query("SELECT * FROM repo_indexing_job WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(row_to_index_job)
            .transpose()
    }

    async fn update_repo_indexing_job(&self, id: Uuid, update: JobUpdate) -> Result<RepoIndexingJob> {
        sqlx::query(
            "UPDATE repo_indexing_job SET
                status = $2,
                error_message = COALESCE($3, error_message),
                metadata = COALESCE($5, metadata),
                updated_at = now(),
                completed_at = CASE WHEN $4 THEN now() ELSE completed_at END
             WHERE id = $1
             RETURNING *"
        )
        .bind(id)
        .bind(update.status.as_str())
        .bind(update.error_message)
        .bind(update.status.is_terminal())
        .bind(update.metadata)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .as_ref()
        .map(row_to_index_job)
        .transpose()?
        .ok_or_else(|| not_found("RepoIndexingJob", id))
    }

    async fn list_repo_indexing_jobs(&self, repo_id: i32) -> Result<Vec<RepoIndexingJob>> {
        sqlx::query("SELECT * FROM repo_indexing_job WHERE repo_id = $1 ORDER BY created_at DESC")
            .bind(repo_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .iter()
            .map(row_to_index_job)
            .collect()
    }

    async fn create_permission_sync_job(&self, repo_id: i32) -> Result<RepoPermissionSyncJob> {
        let row = sqlx::query(
            "INSERT INTO repo_permission_sync_job (id, repo_id, status) VALUES ($1, $2, 'PENDING')
             RETURNING *"
        )
        .bind(Uuid::new_v4())
        .bind(repo_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row_to_permission_job(&row)
    }

    async fn get_permission_sync_job(&self, id: Uuid) -> Result<Option<RepoPermissionSyncJob>> {
        sqlx::query("SELECT * FROM repo_permission_sync_job WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(row_to_permission_job)
            .transpose()
    }

    async fn update_permission_sync_job(
        &self,
        id: Uuid,
        update: JobUpdate
    ) -> Result<RepoPermissionSyncJob> {
        sqlx::query(
            "UPDATE repo_permission_sync_job SET
                status = $2,
                error_message = COALESCE($3, error_message),
                updated_at = now(),
                completed_at = CASE WHEN $4 THEN now() ELSE completed_at END
             WHERE id = $1
             RETURNING *"
        )
        .bind(id)
        .bind(update.status.as_str())
        .bind(update.error_message)
        .bind(update.status.is_terminal())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .as_ref()
        .map(row_to_permission_job)
        .transpose()?
        .ok_or_else(|| not_found("RepoPermissionSyncJob", id))
    }

    async fn list_permission_sync_jobs(&self, repo_id: i32) -> Result<Vec<RepoPermissionSyncJob>> {
        sqlx::query(
            "SELECT * FROM repo_permission_sync_job WHERE repo_id = $1 ORDER BY created_at DESC"
        )
        .bind(repo_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .iter()
        .map(row_to_permission_job)
        .collect()
    }

    async fn create_account_permission_sync_job(
        &self,
        account_id: &str
    ) -> Result<AccountPermissionSyncJob> {
        let row = sqlx::query(
            "INSERT INTO account_permission_sync_job (id, account_id, status) VALUES ($1, $2, 'PENDING')
             RETURNING *"
        )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row_to_account_job(&row)
    }

    async fn get_account_permission_sync_job(
        &self,
        id: Uuid
    ) -> Result<Option<AccountPermissionSyncJob>> {
        sqlx::query("SELECT * FROM account_permission_sync_job WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(row_to_account_job)
            .transpose()
    }

    async fn update_account_permission_sync_job(
        &self,
        id: Uuid,
        update: JobUpdate
    ) -> Result<AccountPermissionSyncJob> {
        sqlx::query(
            "UPDATE account_permission_sync_job SET
                status = $2,
                error_message = COALESCE($3, error_message),
                updated_at = now(),
                completed_at = CASE WHEN $4 THEN now() ELSE completed_at END
             WHERE id = $1
             RETURNING *"
        )
        .bind(id)
        .bind(update.status.as_str())
        .bind(update.error_message)
        .bind(update.status.is_terminal())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .as_ref()
        .map(row_to_account_job)
        .transpose()?
        .ok_or_else(|| not_found("AccountPermissionSyncJob", id))
    }

    async fn list_account_permission_sync_jobs(
        &self,
        account_id: &str
    ) -> Result<Vec<AccountPermissionSyncJob>> {
        sqlx::query(
            "SELECT * FROM account_permission_sync_job WHERE account_id = $1 ORDER BY created_at DESC"
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .iter()
        .map(row_to_account_job)
        .collect()
    }
}

#[async_trait]
impl SecretStore for PgSyncStore {
    async fn get_secret(&self, org_id: i32, key: &str) -> Result<Option<Secret>> {
        let row = sqlx::query("SELECT org_id, key, iv, encrypted_value FROM secret WHERE org_id = $1 AND key = $2")
            .bind(org_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(|row| {
            Ok(Secret {
                org_id: row.try_get("org_id").map_err(db_err)?,
                key: row.try_get("key").map_err(db_err)?,
                iv: row.try_get("iv").map_err(db_err)?,
                encrypted_value: row.try_get("encrypted_value").map_err(db_err)?
            })
        })
        .transpose()
    }

    async fn put_secret(&self, secret: Secret) -> Result<()> {
        sqlx::query(
            "INSERT INTO secret (org_id, key, iv, encrypted_value) VALUES ($1, $2, $3, $4)
             ON CONFLICT (org_id, key) DO UPDATE SET
                iv = EXCLUDED.iv,
                encrypted_value = EXCLUDED.encrypted_value"
        )
        .bind(secret.org_id)
        .bind(&secret.key)
        .bind(&secret.iv)
        .bind(&secret.encrypted_value)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}
