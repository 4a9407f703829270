//! Deployment record store — the durable ledger of preview attempts.
//!
//! The orchestrator only sees the `DeploymentStore` / `ProjectDirectory`
//! traits. `PgStore` backs them with Postgres; tests use an in-memory store.

use async_trait::async_trait;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;

use crate::models::preview_deployment::{DeploymentStatus, NewPreviewDeployment, PreviewDeployment};
use crate::models::project::PreviewProject;
use crate::services::{deployment_service, project_service};

pub type DbPool = Pool<AsyncPgConnection>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Another writer inserted the same (pull_request_id, commit_sha) first.
    #[error("preview deployment already exists for pull request {pull_request_id} at {commit_sha}")]
    Conflict {
        pull_request_id: i64,
        commit_sha: String,
    },
    #[error("preview deployment {0} not found")]
    NotFound(i64),
    #[error("database pool: {0}")]
    Pool(String),
    #[error("database query: {0}")]
    Query(#[from] DieselError),
}

/// A status change plus the fields that travel with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub to: DeploymentStatus,
    /// Always written; `None` clears a previous error.
    pub error_message: Option<String>,
    /// Only written when set.
    pub public_url: Option<String>,
}

impl StatusUpdate {
    pub fn to(status: DeploymentStatus) -> Self {
        Self {
            to: status,
            error_message: None,
            public_url: None,
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = Some(url.into());
        self
    }
}

#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn find_by_key(
        &self,
        pull_request_id: i64,
        commit_sha: &str,
    ) -> Result<Option<PreviewDeployment>, StoreError>;

    async fn get(&self, deployment_id: i64) -> Result<Option<PreviewDeployment>, StoreError>;

    /// Insert a `pending` row. Returns `StoreError::Conflict` when the
    /// idempotency key is already taken.
    async fn insert(&self, new_deployment: NewPreviewDeployment)
        -> Result<PreviewDeployment, StoreError>;

    /// Compare-and-set status change; `None` when the row is not in one of
    /// `update.to.predecessors()`.
    async fn transition(
        &self,
        deployment_id: i64,
        update: StatusUpdate,
    ) -> Result<Option<PreviewDeployment>, StoreError>;

    async fn set_error(&self, deployment_id: i64, message: &str) -> Result<(), StoreError>;

    async fn set_comment_id(&self, deployment_id: i64, comment_id: i64) -> Result<(), StoreError>;

    /// Newest first.
    async fn list_for_pull_request(
        &self,
        pull_request_id: i64,
    ) -> Result<Vec<PreviewDeployment>, StoreError>;

    async fn list_recent(&self, limit: i64) -> Result<Vec<PreviewDeployment>, StoreError>;

    async fn count_active(&self) -> Result<i64, StoreError>;
}

#[async_trait]
pub trait ProjectDirectory: Send + Sync {
    async fn find_by_repo(&self, github_repo: &str) -> Result<Option<PreviewProject>, StoreError>;

    async fn get_project(&self, project_id: i64) -> Result<Option<PreviewProject>, StoreError>;
}

/// Build the Postgres connection pool.
pub fn build_pool(database_url: &str, max_size: usize) -> anyhow::Result<DbPool> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    Pool::builder(manager)
        .max_size(max_size)
        .build()
        .map_err(|e| anyhow::anyhow!("diesel pool: {e}"))
}

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<Object<AsyncPgConnection>, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }
}

fn is_unique_violation(err: &DieselError) -> bool {
    matches!(
        err,
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)
    )
}

#[async_trait]
impl DeploymentStore for PgStore {
    async fn find_by_key(
        &self,
        pull_request_id: i64,
        commit_sha: &str,
    ) -> Result<Option<PreviewDeployment>, StoreError> {
        let mut conn = self.conn().await?;
        Ok(deployment_service::find_by_key(&mut conn, pull_request_id, commit_sha).await?)
    }

    async fn get(&self, deployment_id: i64) -> Result<Option<PreviewDeployment>, StoreError> {
        let mut conn = self.conn().await?;
        Ok(deployment_service::get(&mut conn, deployment_id).await?)
    }

    async fn insert(
        &self,
        new_deployment: NewPreviewDeployment,
    ) -> Result<PreviewDeployment, StoreError> {
        let mut conn = self.conn().await?;
        match deployment_service::insert(&mut conn, &new_deployment).await {
            Ok(row) => Ok(row),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict {
                pull_request_id: new_deployment.pull_request_id,
                commit_sha: new_deployment.commit_sha,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn transition(
        &self,
        deployment_id: i64,
        update: StatusUpdate,
    ) -> Result<Option<PreviewDeployment>, StoreError> {
        let mut conn = self.conn().await?;
        let row = deployment_service::transition(&mut conn, deployment_id, &update).await?;
        if row.is_some() {
            crate::metrics::deployment_status_changed(update.to.as_str());
        }
        Ok(row)
    }

    async fn set_error(&self, deployment_id: i64, message: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        Ok(deployment_service::set_error(&mut conn, deployment_id, message).await?)
    }

    async fn set_comment_id(&self, deployment_id: i64, comment_id: i64) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        Ok(deployment_service::set_comment_id(&mut conn, deployment_id, comment_id).await?)
    }

    async fn list_for_pull_request(
        &self,
        pull_request_id: i64,
    ) -> Result<Vec<PreviewDeployment>, StoreError> {
        let mut conn = self.conn().await?;
        Ok(deployment_service::list_for_pull_request(&mut conn, pull_request_id).await?)
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<PreviewDeployment>, StoreError> {
        let mut conn = self.conn().await?;
        Ok(deployment_service::list_recent(&mut conn, limit).await?)
    }

    async fn count_active(&self) -> Result<i64, StoreError> {
        let mut conn = self.conn().await?;
        Ok(deployment_service::count_active(&mut conn).await?)
    }
}

#[async_trait]
impl ProjectDirectory for PgStore {
    async fn find_by_repo(&self, github_repo: &str) -> Result<Option<PreviewProject>, StoreError> {
        let mut conn = self.conn().await?;
        Ok(project_service::find_by_repo(&mut conn, github_repo).await?)
    }

    async fn get_project(&self, project_id: i64) -> Result<Option<PreviewProject>, StoreError> {
        let mut conn = self.conn().await?;
        Ok(project_service::get(&mut conn, project_id).await?)
    }
}
