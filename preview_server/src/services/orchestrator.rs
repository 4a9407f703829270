//! Preview deployment orchestration — create, teardown, refresh.
//!
//! The orchestrator is the only component that talks to the store, the
//! cluster and GitHub together. Failures never escape as errors from the
//! public operations: they are persisted on the deployment row and returned
//! in a structured outcome, so the webhook handler can always acknowledge.
//!
//! There is no application lock. The UNIQUE (pull_request_id, commit_sha)
//! constraint decides which concurrent create proceeds, and every status
//! change is a compare-and-set, so a teardown racing a create wins.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::cluster::{
    AppliedEnvironment, ClusterError, ClusterSynchronizer, EnvironmentRequest, ProjectScope,
};
use crate::config::PreviewConfig;
use crate::models::preview_deployment::{
    DeploymentStatus, NewPreviewDeployment, PreviewDeployment, ResourcesAllocated,
};
use crate::models::project::PreviewProject;
use crate::naming;
use crate::services::github_service::{render_comment, CommentTarget, PullRequestNotifier};
use crate::services::secrets_service::{self, SecretResolver, SecretsError};
use crate::store::{DeploymentStore, ProjectDirectory, StatusUpdate, StoreError};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub base_domain: String,
    pub preview_environment: String,
    pub default_resources: ResourcesAllocated,
    pub stall_after: Duration,
}

impl From<&PreviewConfig> for OrchestratorSettings {
    fn from(config: &PreviewConfig) -> Self {
        Self {
            base_domain: config.base_domain.clone(),
            preview_environment: config.preview_environment.clone(),
            default_resources: config.default_resources.clone(),
            stall_after: config.stall_after,
        }
    }
}

/// The project a pull request belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectContext {
    pub project_id: i64,
    pub team_id: i64,
    pub team_name: String,
    pub project_name: String,
    pub repository_url: String,
    pub default_branch: String,
    pub image_repository: String,
    pub base_domain: Option<String>,
}

impl From<&PreviewProject> for ProjectContext {
    fn from(project: &PreviewProject) -> Self {
        Self {
            project_id: project.id,
            team_id: project.team_id,
            team_name: project.team_name.clone(),
            project_name: project.name.clone(),
            repository_url: project.repository_url(),
            default_branch: project.default_branch.clone(),
            image_repository: project.image_repository.clone(),
            base_domain: project.base_domain.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreatePreviewRequest {
    pub project: ProjectContext,
    /// Provider-side pull request id; with `commit_sha`, the idempotency key.
    pub pull_request_id: i64,
    pub pr_number: i32,
    /// Repository name without owner.
    pub repo_name: String,
    pub repo_full_name: String,
    pub branch: String,
    pub commit_sha: String,
    /// Defaults to the commit SHA.
    pub image_tag: Option<String>,
    /// Bring back a record that was torn down (reopened PR, operator redeploy).
    pub restore_deleted: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct DeletePreviewRequest {
    pub deployment_id: i64,
}

/// Cluster names for one preview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewNames {
    pub namespace: String,
    pub deployment_name: String,
    pub public_url: String,
    pub scope: ProjectScope,
}

impl PreviewNames {
    pub fn derive(request: &CreatePreviewRequest, default_base_domain: &str) -> Self {
        let namespace = naming::generate_namespace(&request.repo_name, request.pr_number);
        let base_domain = request
            .project
            .base_domain
            .as_deref()
            .filter(|domain| !domain.is_empty())
            .unwrap_or(default_base_domain);

        Self {
            public_url: naming::generate_public_url(&namespace, base_domain),
            deployment_name: naming::generate_deployment_name(request.pr_number),
            namespace,
            scope: ProjectScope {
                namespace: naming::generate_team_namespace(&request.project.team_name),
                name: naming::generate_project_name(&request.project.project_name),
                team_name: request.project.team_name.clone(),
                repository_url: request.project.repository_url.clone(),
                default_branch: request.project.default_branch.clone(),
            },
        }
    }
}

/// Result of publishing the PR comment, reported apart from the deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NotificationOutcome {
    Posted { comment_id: i64 },
    Skipped,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentOutcome {
    pub success: bool,
    pub deployment: Option<PreviewDeployment>,
    pub public_url: Option<String>,
    pub error: Option<String>,
    /// An existing record was returned and no cluster work was done.
    pub reused: bool,
    pub notification: NotificationOutcome,
}

impl DeploymentOutcome {
    fn existing(deployment: PreviewDeployment) -> Self {
        Self {
            success: true,
            public_url: deployment.public_url.clone(),
            deployment: Some(deployment),
            error: None,
            reused: true,
            notification: NotificationOutcome::Skipped,
        }
    }

    fn failed(deployment: Option<PreviewDeployment>, error: String) -> Self {
        Self {
            success: false,
            deployment,
            public_url: None,
            error: Some(error),
            reused: false,
            notification: NotificationOutcome::Skipped,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    pub success: bool,
    pub deployment: Option<PreviewDeployment>,
    pub error: Option<String>,
}

impl DeleteOutcome {
    fn done(deployment: Option<PreviewDeployment>) -> Self {
        Self {
            success: true,
            deployment,
            error: None,
        }
    }

    fn failed(deployment: Option<PreviewDeployment>, error: String) -> Self {
        Self {
            success: false,
            deployment,
            error: Some(error),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error("resolving secrets: {0}")]
    Secrets(#[from] SecretsError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("preview deployment {0} was torn down while it was being created")]
    Superseded(i64),
    #[error("preview deployment {0} not found")]
    NotFound(i64),
    #[error("project {0} not found")]
    ProjectNotFound(i64),
}

const STALLED_MESSAGE: &str = "preview deployment interrupted before it finished";

enum Claim {
    /// Returned unchanged, no cluster work.
    Existing(PreviewDeployment),
    /// `pending` row owned by this call.
    Fresh(PreviewDeployment),
}

pub struct Orchestrator {
    store: Arc<dyn DeploymentStore>,
    projects: Arc<dyn ProjectDirectory>,
    cluster: Arc<dyn ClusterSynchronizer>,
    notifier: Arc<dyn PullRequestNotifier>,
    secrets: Arc<dyn SecretResolver>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        projects: Arc<dyn ProjectDirectory>,
        cluster: Arc<dyn ClusterSynchronizer>,
        notifier: Arc<dyn PullRequestNotifier>,
        secrets: Arc<dyn SecretResolver>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            projects,
            cluster,
            notifier,
            secrets,
            settings,
        }
    }

    /// Deploy a pull request commit as a preview environment.
    ///
    /// Redelivered events for the same (pull request, commit) return the
    /// existing record without touching the cluster, unless that record
    /// failed or its create stalled, in which case it is retried in place. A
    /// torn-down record is retried only with `restore_deleted`.
    pub async fn create_preview_deployment(&self, request: CreatePreviewRequest) -> DeploymentOutcome {
        let names = PreviewNames::derive(&request, &self.settings.base_domain);

        let deployment = match self.claim(&request, &names).await {
            Ok(Claim::Existing(existing)) => {
                tracing::info!(
                    deployment_id = existing.id,
                    status = %existing.status,
                    pr_number = request.pr_number,
                    "Preview deployment already recorded, skipping"
                );
                return DeploymentOutcome::existing(existing);
            }
            Ok(Claim::Fresh(deployment)) => deployment,
            Err(e) => {
                tracing::error!(
                    pr_number = request.pr_number,
                    commit = %request.commit_sha,
                    "Failed to record preview deployment: {e}"
                );
                return DeploymentOutcome::failed(None, e.to_string());
            }
        };

        tracing::info!(
            deployment_id = deployment.id,
            namespace = %deployment.namespace,
            pr_number = deployment.pr_number,
            commit = %deployment.commit_sha,
            "Deploying preview"
        );

        match self.materialize(&request, &names, &deployment).await {
            Ok(applied) => self.finish_success(deployment, &names, applied).await,
            Err(e) => self.finish_failure(deployment, e).await,
        }
    }

    /// Tear down one preview: `deleting`, namespace delete, `deleted`.
    ///
    /// Deleting an absent namespace or an already deleted record succeeds.
    pub async fn delete_preview_deployment(&self, request: DeletePreviewRequest) -> DeleteOutcome {
        let id = request.deployment_id;
        let current = match self.store.get(id).await {
            Ok(Some(deployment)) => deployment,
            Ok(None) => {
                tracing::debug!(deployment_id = id, "No preview deployment to tear down");
                return DeleteOutcome::done(None);
            }
            Err(e) => return DeleteOutcome::failed(None, e.to_string()),
        };

        let deleting = match self.begin_teardown(current).await {
            Ok(deployment) => deployment,
            Err(outcome) => return outcome,
        };

        if let Err(e) = self.cluster.delete_namespace(&deleting.namespace).await {
            crate::metrics::cluster_failure(e.kind().as_str());
            let message = e.to_string();
            tracing::warn!(
                deployment_id = id,
                namespace = %deleting.namespace,
                error = %message,
                "Preview teardown failed"
            );
            if let Err(store_err) = self.store.set_error(id, &message).await {
                tracing::warn!(deployment_id = id, "Failed to record teardown error: {store_err}");
            }
            return DeleteOutcome::failed(Some(deleting), message);
        }

        match self.store.transition(id, StatusUpdate::to(DeploymentStatus::Deleted)).await {
            Ok(Some(deleted)) => {
                tracing::info!(
                    deployment_id = id,
                    namespace = %deleted.namespace,
                    "Preview deployment deleted"
                );
                if deleted.comment_id.is_some() {
                    self.notify(&deleted).await;
                }
                self.record_active_count().await;
                DeleteOutcome::done(Some(deleted))
            }
            // A concurrent teardown got there first.
            Ok(None) => DeleteOutcome::done(self.store.get(id).await.ok().flatten()),
            Err(e) => DeleteOutcome::failed(Some(deleting), e.to_string()),
        }
    }

    /// Tear down every preview still active for a pull request.
    pub async fn delete_for_pull_request(&self, pull_request_id: i64) -> Vec<DeleteOutcome> {
        let deployments = match self.store.list_for_pull_request(pull_request_id).await {
            Ok(deployments) => deployments,
            Err(e) => return vec![DeleteOutcome::failed(None, e.to_string())],
        };

        let mut outcomes = Vec::new();
        for deployment in deployments.into_iter().filter(|d| d.state().is_active()) {
            let request = DeletePreviewRequest {
                deployment_id: deployment.id,
            };
            outcomes.push(self.delete_preview_deployment(request).await);
        }
        outcomes
    }

    /// Project the Environment's cluster status onto the record.
    pub async fn refresh_status(&self, deployment_id: i64) -> Result<PreviewDeployment, OrchestratorError> {
        let current = self
            .store
            .get(deployment_id)
            .await?
            .ok_or(OrchestratorError::NotFound(deployment_id))?;

        let state = current.state();
        if state == DeploymentStatus::Deleted {
            return Ok(current);
        }

        let observed = self
            .cluster
            .environment_status(&current.namespace, &current.deployment_name)
            .await?;

        // A stalled create is failed whatever the cluster shows; the next
        // refresh or retry picks up from there.
        let stalled = current.is_stalled(self.settings.stall_after);
        let update = match (state, observed) {
            (DeploymentStatus::Pending | DeploymentStatus::Deploying, _) if stalled => Some(
                StatusUpdate::to(DeploymentStatus::Failed).with_error(STALLED_MESSAGE),
            ),
            (DeploymentStatus::Deleting, None) => Some(StatusUpdate::to(DeploymentStatus::Deleted)),
            (DeploymentStatus::Running, None) => Some(
                StatusUpdate::to(DeploymentStatus::Failed)
                    .with_error("environment resource no longer exists"),
            ),
            (DeploymentStatus::Running, Some(status)) if status.is_failed() => {
                let message = status
                    .failure_message()
                    .unwrap_or_else(|| "environment reported phase Failed".to_string());
                Some(StatusUpdate::to(DeploymentStatus::Failed).with_error(message))
            }
            (DeploymentStatus::Failed, Some(status)) if status.is_serving() => Some(StatusUpdate {
                to: DeploymentStatus::Running,
                error_message: None,
                public_url: status.url,
            }),
            _ => None,
        };

        let Some(update) = update else {
            return Ok(current);
        };

        tracing::info!(
            deployment_id,
            from = %state,
            to = %update.to,
            "Preview status refreshed from cluster"
        );
        match self.store.transition(deployment_id, update).await? {
            Some(updated) => Ok(updated),
            None => Ok(self.store.get(deployment_id).await?.unwrap_or(current)),
        }
    }

    /// Operator re-trigger: run the create path again for a record.
    ///
    /// Failed, deleted and stalled records are retried. Running records and
    /// creates still within `stall_after` come back unchanged.
    pub async fn redeploy(&self, deployment_id: i64) -> Result<DeploymentOutcome, OrchestratorError> {
        let current = self
            .store
            .get(deployment_id)
            .await?
            .ok_or(OrchestratorError::NotFound(deployment_id))?;
        let project = self
            .projects
            .get_project(current.project_id)
            .await?
            .ok_or(OrchestratorError::ProjectNotFound(current.project_id))?;

        let repo_name = current
            .repo_full_name
            .rsplit('/')
            .next()
            .unwrap_or(&current.repo_full_name)
            .to_string();

        let request = CreatePreviewRequest {
            project: ProjectContext::from(&project),
            pull_request_id: current.pull_request_id,
            pr_number: current.pr_number,
            repo_name,
            repo_full_name: current.repo_full_name.clone(),
            branch: current.branch.clone(),
            commit_sha: current.commit_sha.clone(),
            image_tag: Some(current.image_tag.clone()),
            restore_deleted: true,
        };
        Ok(self.create_preview_deployment(request).await)
    }

    async fn claim(
        &self,
        request: &CreatePreviewRequest,
        names: &PreviewNames,
    ) -> Result<Claim, StoreError> {
        if let Some(existing) = self
            .store
            .find_by_key(request.pull_request_id, &request.commit_sha)
            .await?
        {
            return self.rearm(existing, request.restore_deleted).await;
        }

        // New commits on the same PR keep editing the same comment.
        let comment_id = self
            .store
            .list_for_pull_request(request.pull_request_id)
            .await?
            .into_iter()
            .find_map(|d| d.comment_id);

        let new_deployment = NewPreviewDeployment {
            project_id: request.project.project_id,
            pull_request_id: request.pull_request_id,
            pr_number: request.pr_number,
            repo_full_name: request.repo_full_name.clone(),
            namespace: names.namespace.clone(),
            deployment_name: names.deployment_name.clone(),
            branch: request.branch.clone(),
            commit_sha: request.commit_sha.clone(),
            image_tag: request
                .image_tag
                .clone()
                .unwrap_or_else(|| request.commit_sha.clone()),
            status: DeploymentStatus::Pending.as_str().to_string(),
            resources_allocated: serde_json::to_value(&self.settings.default_resources)
                .unwrap_or_default(),
            comment_id,
        };

        match self.store.insert(new_deployment).await {
            Ok(deployment) => {
                crate::metrics::deployment_status_changed(DeploymentStatus::Pending.as_str());
                Ok(Claim::Fresh(deployment))
            }
            Err(StoreError::Conflict {
                pull_request_id,
                commit_sha,
            }) => {
                tracing::info!(
                    pull_request_id,
                    commit = %commit_sha,
                    "Concurrent delivery recorded this preview first"
                );
                match self.store.find_by_key(pull_request_id, &commit_sha).await? {
                    Some(winner) => Ok(Claim::Existing(winner)),
                    None => Err(StoreError::Conflict {
                        pull_request_id,
                        commit_sha,
                    }),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn rearm(
        &self,
        existing: PreviewDeployment,
        restore_deleted: bool,
    ) -> Result<Claim, StoreError> {
        let existing = self.expire_stalled(existing).await?;
        if !existing.state().needs_redeploy(restore_deleted) {
            return Ok(Claim::Existing(existing));
        }

        tracing::info!(
            deployment_id = existing.id,
            status = %existing.status,
            "Retrying preview deployment"
        );
        match self
            .store
            .transition(existing.id, StatusUpdate::to(DeploymentStatus::Pending))
            .await?
        {
            Some(deployment) => Ok(Claim::Fresh(deployment)),
            // Another delivery re-armed it first.
            None => {
                let current = self.store.get(existing.id).await?.unwrap_or(existing);
                Ok(Claim::Existing(current))
            }
        }
    }

    /// Fail an in-flight row whose create has gone quiet, so it can be
    /// retried.
    async fn expire_stalled(&self, row: PreviewDeployment) -> Result<PreviewDeployment, StoreError> {
        if !row.is_stalled(self.settings.stall_after) {
            return Ok(row);
        }

        tracing::warn!(
            deployment_id = row.id,
            status = %row.status,
            updated_at = %row.updated_at,
            "Preview deployment stalled, marking failed"
        );
        let update = StatusUpdate::to(DeploymentStatus::Failed).with_error(STALLED_MESSAGE);
        match self.store.transition(row.id, update).await? {
            Some(failed) => Ok(failed),
            None => Ok(self.store.get(row.id).await?.unwrap_or(row)),
        }
    }

    async fn materialize(
        &self,
        request: &CreatePreviewRequest,
        names: &PreviewNames,
        deployment: &PreviewDeployment,
    ) -> Result<AppliedEnvironment, OrchestratorError> {
        self.cluster.ensure_project(&names.scope).await?;

        let secrets = self
            .secrets
            .resolve_secrets_for_environment(
                request.project.team_id,
                request.project.project_id,
                &self.settings.preview_environment,
            )
            .await?;

        let environment = EnvironmentRequest {
            namespace: deployment.namespace.clone(),
            name: deployment.deployment_name.clone(),
            project: names.scope.clone(),
            environment: self.settings.preview_environment.clone(),
            pr_number: deployment.pr_number,
            branch: deployment.branch.clone(),
            commit_sha: deployment.commit_sha.clone(),
            image: format!("{}:{}", request.project.image_repository, deployment.image_tag),
            env: secrets_service::to_env(secrets),
            resources: deployment
                .resources()
                .unwrap_or_else(|| self.settings.default_resources.clone()),
        };

        self.store
            .transition(deployment.id, StatusUpdate::to(DeploymentStatus::Deploying))
            .await?
            .ok_or(OrchestratorError::Superseded(deployment.id))?;

        match self.cluster.apply_environment(&environment).await {
            Err(ClusterError::ProjectMissing { namespace, name }) => {
                tracing::warn!(
                    %namespace,
                    project = %name,
                    "Project resource missing at apply, ensuring it again"
                );
                self.cluster.ensure_project(&names.scope).await?;
                Ok(self.cluster.apply_environment(&environment).await?)
            }
            result => Ok(result?),
        }
    }

    async fn finish_success(
        &self,
        deployment: PreviewDeployment,
        names: &PreviewNames,
        applied: AppliedEnvironment,
    ) -> DeploymentOutcome {
        let public_url = applied
            .url
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| names.public_url.clone());

        let update = StatusUpdate::to(DeploymentStatus::Running).with_url(public_url.clone());
        match self.store.transition(deployment.id, update).await {
            Ok(Some(running)) => {
                tracing::info!(
                    deployment_id = running.id,
                    namespace = %running.namespace,
                    url = %public_url,
                    phase = ?applied.phase,
                    conditions = applied.conditions.len(),
                    "Preview deployment running"
                );
                let notification = self.notify(&running).await;
                self.record_active_count().await;
                DeploymentOutcome {
                    success: true,
                    deployment: Some(running),
                    public_url: Some(public_url),
                    error: None,
                    reused: false,
                    notification,
                }
            }
            Ok(None) => self.finish_superseded(deployment).await,
            Err(e) => {
                tracing::error!(
                    deployment_id = deployment.id,
                    "Preview applied but its record could not be updated: {e}"
                );
                DeploymentOutcome::failed(
                    Some(deployment),
                    format!("preview applied but its record could not be updated: {e}"),
                )
            }
        }
    }

    async fn finish_failure(
        &self,
        deployment: PreviewDeployment,
        err: OrchestratorError,
    ) -> DeploymentOutcome {
        if let OrchestratorError::Superseded(_) = err {
            return self.finish_superseded(deployment).await;
        }
        if let OrchestratorError::Cluster(cluster_err) = &err {
            crate::metrics::cluster_failure(cluster_err.kind().as_str());
        }

        let message = err.to_string();
        tracing::error!(
            deployment_id = deployment.id,
            namespace = %deployment.namespace,
            error = %message,
            "Preview deployment failed"
        );

        let update = StatusUpdate::to(DeploymentStatus::Failed).with_error(message.clone());
        match self.store.transition(deployment.id, update).await {
            Ok(Some(failed)) => {
                let notification = self.notify(&failed).await;
                DeploymentOutcome {
                    notification,
                    ..DeploymentOutcome::failed(Some(failed), message)
                }
            }
            Ok(None) => self.finish_superseded(deployment).await,
            Err(e) => {
                tracing::error!(deployment_id = deployment.id, "Failed to record failure: {e}");
                DeploymentOutcome::failed(
                    Some(deployment),
                    format!("{message} (failure not recorded: {e})"),
                )
            }
        }
    }

    /// A teardown moved the row out from under an in-flight create. Remove
    /// whatever the create applied and finish the teardown.
    async fn finish_superseded(&self, deployment: PreviewDeployment) -> DeploymentOutcome {
        let id = deployment.id;
        let error = OrchestratorError::Superseded(id).to_string();

        let current = match self.store.get(id).await {
            Ok(current) => current,
            Err(e) => return DeploymentOutcome::failed(Some(deployment), e.to_string()),
        };
        if let Some(row) = &current {
            if !row.state().is_tearing_down() {
                return DeploymentOutcome::failed(
                    current.clone(),
                    format!("preview deployment {id} changed state to {} concurrently", row.status),
                );
            }
        }

        tracing::warn!(
            deployment_id = id,
            namespace = %deployment.namespace,
            "Preview torn down during creation, removing applied resources"
        );
        if let Err(e) = self.cluster.delete_namespace(&deployment.namespace).await {
            crate::metrics::cluster_failure(e.kind().as_str());
            tracing::warn!(namespace = %deployment.namespace, "Cleanup after teardown race failed: {e}");
            if let Err(store_err) = self.store.set_error(id, &e.to_string()).await {
                tracing::warn!(deployment_id = id, "Failed to record cleanup error: {store_err}");
            }
            return DeploymentOutcome::failed(current, error);
        }

        let current = match self.store.transition(id, StatusUpdate::to(DeploymentStatus::Deleted)).await {
            Ok(Some(deleted)) => Some(deleted),
            Ok(None) => self.store.get(id).await.ok().flatten(),
            Err(e) => {
                tracing::warn!(deployment_id = id, "Failed to mark preview deleted: {e}");
                current
            }
        };
        DeploymentOutcome::failed(current, error)
    }

    /// Move a row into `deleting`, or explain why teardown stops here.
    async fn begin_teardown(
        &self,
        current: PreviewDeployment,
    ) -> Result<PreviewDeployment, DeleteOutcome> {
        let id = current.id;
        let state = current.state();
        if state == DeploymentStatus::Deleted {
            return Err(DeleteOutcome::done(Some(current)));
        }
        if !state.can_transition_to(DeploymentStatus::Deleting) {
            // Already deleting; a previous teardown left it here.
            return Ok(current);
        }

        match self
            .store
            .transition(id, StatusUpdate::to(DeploymentStatus::Deleting))
            .await
        {
            Ok(Some(deleting)) => Ok(deleting),
            Ok(None) => match self.store.get(id).await {
                Ok(Some(row)) if row.state() == DeploymentStatus::Deleted => {
                    Err(DeleteOutcome::done(Some(row)))
                }
                Ok(Some(row)) if row.state() == DeploymentStatus::Deleting => Ok(row),
                Ok(row) => Err(DeleteOutcome::failed(
                    row,
                    format!("preview deployment {id} changed state during teardown"),
                )),
                Err(e) => Err(DeleteOutcome::failed(None, e.to_string())),
            },
            Err(e) => Err(DeleteOutcome::failed(Some(current), e.to_string())),
        }
    }

    /// Post or edit the PR comment. Never fails the caller.
    async fn notify(&self, deployment: &PreviewDeployment) -> NotificationOutcome {
        let target = CommentTarget::for_deployment(deployment);
        let body = render_comment(deployment);

        match self
            .notifier
            .publish(&target, deployment.comment_id, &body)
            .await
        {
            Ok(Some(comment_id)) => {
                if deployment.comment_id != Some(comment_id) {
                    if let Err(e) = self.store.set_comment_id(deployment.id, comment_id).await {
                        tracing::warn!(
                            deployment_id = deployment.id,
                            "Failed to remember PR comment id: {e}"
                        );
                    }
                }
                NotificationOutcome::Posted { comment_id }
            }
            Ok(None) => NotificationOutcome::Skipped,
            Err(e) => {
                crate::metrics::notification_failed();
                tracing::warn!(
                    deployment_id = deployment.id,
                    repo = %target.repo_full_name,
                    pr_number = target.pr_number,
                    "Failed to post preview comment: {e}"
                );
                NotificationOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn record_active_count(&self) {
        match self.store.count_active().await {
            Ok(count) => crate::metrics::active_previews(count),
            Err(e) => tracing::debug!("Failed to count active previews: {e}"),
        }
    }
}
