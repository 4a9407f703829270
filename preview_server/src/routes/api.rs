//! REST API for preview deployments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::preview_deployment::{PreviewDeployment, ResourcesAllocated};
use crate::store::{DeploymentStore, StoreError};

/// JSON response for a preview deployment.
#[derive(Debug, Serialize, Deserialize)]
pub struct PreviewJson {
    pub id: i64,
    pub project_id: i64,
    pub pull_request_id: i64,
    pub pr_number: i32,
    pub repo_full_name: String,
    pub namespace: String,
    pub deployment_name: String,
    pub branch: String,
    pub commit_sha: String,
    pub image_tag: String,
    pub public_url: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub resources: Option<ResourcesAllocated>,
    pub comment_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<PreviewDeployment> for PreviewJson {
    fn from(d: PreviewDeployment) -> Self {
        Self {
            resources: d.resources(),
            id: d.id,
            project_id: d.project_id,
            pull_request_id: d.pull_request_id,
            pr_number: d.pr_number,
            repo_full_name: d.repo_full_name,
            namespace: d.namespace,
            deployment_name: d.deployment_name,
            branch: d.branch,
            commit_sha: d.commit_sha,
            image_tag: d.image_tag,
            public_url: d.public_url,
            status: d.status,
            error_message: d.error_message,
            comment_id: d.comment_id,
            created_at: d.created_at,
            updated_at: d.updated_at,
        }
    }
}

/// List previews of one pull request, or the most recent ones.
pub async fn list_previews(
    store: &dyn DeploymentStore,
    pull_request_id: Option<i64>,
    limit: i64,
) -> Result<Vec<PreviewJson>, StoreError> {
    let rows = match pull_request_id {
        Some(id) => store.list_for_pull_request(id).await?,
        None => store.list_recent(limit.clamp(1, 200)).await?,
    };
    Ok(rows.into_iter().map(PreviewJson::from).collect())
}

pub async fn get_preview(
    store: &dyn DeploymentStore,
    deployment_id: i64,
) -> Result<PreviewJson, StoreError> {
    store
        .get(deployment_id)
        .await?
        .map(PreviewJson::from)
        .ok_or(StoreError::NotFound(deployment_id))
}
