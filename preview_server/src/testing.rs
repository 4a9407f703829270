//! In-memory stand-ins for the store, the cluster and GitHub.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::cluster::crd::EnvironmentStatus;
use crate::cluster::{
    AppliedEnvironment, ClusterError, ClusterSynchronizer, EnvironmentRequest, ErrorKind,
    ProjectScope,
};
use crate::config::PreviewConfig;
use crate::dispatch::Dispatcher;
use crate::models::preview_deployment::{
    DeploymentStatus, NewPreviewDeployment, PreviewDeployment, ResourcesAllocated,
};
use crate::models::project::PreviewProject;
use crate::services::github_service::{CommentTarget, NotifyError, PullRequestNotifier};
use crate::services::orchestrator::{
    CreatePreviewRequest, Orchestrator, OrchestratorSettings, ProjectContext,
};
use crate::services::secrets_service::{
    ResolvedSecret, ResolvedSecrets, SecretResolver, SecretSource, SecretsError,
};
use crate::routes::PreviewRouterState;
use crate::store::{DeploymentStore, ProjectDirectory, StatusUpdate, StoreError};

pub const BASE_DOMAIN: &str = "preview.example.com";
pub const WEBHOOK_SECRET: &str = "test-webhook-secret";

// --- store ---

#[derive(Default)]
struct MemoryState {
    deployments: Vec<PreviewDeployment>,
    projects: Vec<PreviewProject>,
    next_id: i64,
    race_next_insert: bool,
}

impl MemoryState {
    fn push(&mut self, new: NewPreviewDeployment) -> PreviewDeployment {
        self.next_id += 1;
        let now = Utc::now();
        let row = PreviewDeployment {
            id: self.next_id,
            project_id: new.project_id,
            pull_request_id: new.pull_request_id,
            pr_number: new.pr_number,
            repo_full_name: new.repo_full_name,
            namespace: new.namespace,
            deployment_name: new.deployment_name,
            branch: new.branch,
            commit_sha: new.commit_sha,
            image_tag: new.image_tag,
            public_url: None,
            status: new.status,
            error_message: None,
            resources_allocated: new.resources_allocated,
            comment_id: new.comment_id,
            created_at: now,
            updated_at: now,
        };
        self.deployments.push(row.clone());
        row
    }

    fn find_mut(&mut self, id: i64) -> Option<&mut PreviewDeployment> {
        self.deployments.iter_mut().find(|d| d.id == id)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_project(&self, project: PreviewProject) {
        self.state.lock().unwrap().projects.push(project);
    }

    pub fn all(&self) -> Vec<PreviewDeployment> {
        self.state.lock().unwrap().deployments.clone()
    }

    pub fn row(&self, id: i64) -> PreviewDeployment {
        self.all()
            .into_iter()
            .find(|d| d.id == id)
            .expect("deployment row exists")
    }

    /// Overwrite a status without the compare-and-set.
    pub fn force_status(&self, id: i64, status: DeploymentStatus) {
        let mut state = self.state.lock().unwrap();
        if let Some(row) = state.find_mut(id) {
            row.status = status.as_str().to_string();
        }
    }

    /// Pretend the row was last written `age` ago.
    pub fn backdate(&self, id: i64, age: chrono::Duration) {
        let mut state = self.state.lock().unwrap();
        if let Some(row) = state.find_mut(id) {
            row.updated_at = Utc::now() - age;
        }
    }

    /// The next insert lands an identical row from "another writer" first
    /// and then reports the unique violation.
    pub fn race_next_insert(&self) {
        self.state.lock().unwrap().race_next_insert = true;
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn find_by_key(
        &self,
        pull_request_id: i64,
        commit_sha: &str,
    ) -> Result<Option<PreviewDeployment>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .deployments
            .iter()
            .find(|d| d.pull_request_id == pull_request_id && d.commit_sha == commit_sha)
            .cloned())
    }

    async fn get(&self, deployment_id: i64) -> Result<Option<PreviewDeployment>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.deployments.iter().find(|d| d.id == deployment_id).cloned())
    }

    async fn insert(
        &self,
        new_deployment: NewPreviewDeployment,
    ) -> Result<PreviewDeployment, StoreError> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.race_next_insert) {
            state.push(new_deployment.clone());
        }
        let taken = state.deployments.iter().any(|d| {
            d.pull_request_id == new_deployment.pull_request_id
                && d.commit_sha == new_deployment.commit_sha
        });
        if taken {
            return Err(StoreError::Conflict {
                pull_request_id: new_deployment.pull_request_id,
                commit_sha: new_deployment.commit_sha,
            });
        }
        Ok(state.push(new_deployment))
    }

    async fn transition(
        &self,
        deployment_id: i64,
        update: StatusUpdate,
    ) -> Result<Option<PreviewDeployment>, StoreError> {
        let mut state = self.state.lock().unwrap();
        let Some(row) = state.find_mut(deployment_id) else {
            return Ok(None);
        };
        if !row.state().can_transition_to(update.to) {
            return Ok(None);
        }
        row.status = update.to.as_str().to_string();
        row.error_message = update.error_message;
        if let Some(url) = update.public_url {
            row.public_url = Some(url);
        }
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn set_error(&self, deployment_id: i64, message: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let row = state
            .find_mut(deployment_id)
            .ok_or(StoreError::NotFound(deployment_id))?;
        row.error_message = Some(message.to_string());
        Ok(())
    }

    async fn set_comment_id(&self, deployment_id: i64, comment_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let row = state
            .find_mut(deployment_id)
            .ok_or(StoreError::NotFound(deployment_id))?;
        row.comment_id = Some(comment_id);
        Ok(())
    }

    async fn list_for_pull_request(
        &self,
        pull_request_id: i64,
    ) -> Result<Vec<PreviewDeployment>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<_> = state
            .deployments
            .iter()
            .filter(|d| d.pull_request_id == pull_request_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(rows)
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<PreviewDeployment>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut rows = state.deployments.clone();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        rows.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(rows)
    }

    async fn count_active(&self) -> Result<i64, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.deployments.iter().filter(|d| d.state().is_active()).count() as i64)
    }
}

#[async_trait]
impl ProjectDirectory for MemoryStore {
    async fn find_by_repo(&self, github_repo: &str) -> Result<Option<PreviewProject>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .projects
            .iter()
            .find(|p| p.active && p.github_repo == github_repo)
            .cloned())
    }

    async fn get_project(&self, project_id: i64) -> Result<Option<PreviewProject>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.projects.iter().find(|p| p.id == project_id).cloned())
    }
}

// --- cluster ---

#[derive(Default)]
pub struct ClusterState {
    /// (team namespace, project name)
    pub projects: HashSet<(String, String)>,
    pub namespaces: HashSet<String>,
    /// (namespace, name) → last applied request
    pub environments: HashMap<(String, String), EnvironmentRequest>,
    pub ensure_calls: usize,
    pub apply_calls: usize,
    pub delete_calls: usize,
    pub fail_ensure: Option<String>,
    pub fail_apply: Option<String>,
    pub fail_delete: Option<String>,
    /// Phase reported for every Environment; `Ready` when unset.
    pub phase: Option<String>,
    pub url: Option<String>,
    /// Simulated apply latency.
    pub apply_delay: Option<std::time::Duration>,
}

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
    before_apply: Mutex<Option<Hook>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }

    /// Run `hook` once, at the start of the next apply.
    pub fn before_apply(&self, hook: impl FnOnce() + Send + 'static) {
        *self.before_apply.lock().unwrap() = Some(Box::new(hook));
    }

    fn status(state: &ClusterState) -> EnvironmentStatus {
        EnvironmentStatus {
            phase: Some(state.phase.clone().unwrap_or_else(|| "Ready".to_string())),
            url: state.url.clone(),
            conditions: Vec::new(),
        }
    }
}

fn api_error(operation: &'static str, kind: ErrorKind, message: &str) -> ClusterError {
    ClusterError::Api {
        operation,
        kind,
        message: message.to_string(),
    }
}

#[async_trait]
impl ClusterSynchronizer for FakeCluster {
    async fn ensure_project(&self, scope: &ProjectScope) -> Result<(), ClusterError> {
        let mut state = self.state();
        state.ensure_calls += 1;
        if let Some(message) = &state.fail_ensure {
            return Err(api_error("create project", ErrorKind::Fatal, message));
        }
        state.namespaces.insert(scope.namespace.clone());
        state
            .projects
            .insert((scope.namespace.clone(), scope.name.clone()));
        Ok(())
    }

    async fn apply_environment(
        &self,
        request: &EnvironmentRequest,
    ) -> Result<AppliedEnvironment, ClusterError> {
        let hook = self.before_apply.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        let delay = self.state().apply_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.apply_calls += 1;
        if let Some(message) = &state.fail_apply {
            return Err(api_error("apply environment", ErrorKind::Fatal, message));
        }
        let parent = (request.project.namespace.clone(), request.project.name.clone());
        if !state.projects.contains(&parent) {
            return Err(ClusterError::ProjectMissing {
                namespace: parent.0,
                name: parent.1,
            });
        }
        state.namespaces.insert(request.namespace.clone());
        state.environments.insert(
            (request.namespace.clone(), request.name.clone()),
            request.clone(),
        );
        Ok(Self::status(&state).into())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state();
        state.delete_calls += 1;
        if let Some(message) = &state.fail_delete {
            return Err(api_error("delete namespace", ErrorKind::Transient, message));
        }
        state.namespaces.remove(name);
        state.environments.retain(|(namespace, _), _| namespace != name);
        Ok(())
    }

    async fn environment_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<EnvironmentStatus>, ClusterError> {
        let state = self.state();
        let key = (namespace.to_string(), name.to_string());
        Ok(state
            .environments
            .contains_key(&key)
            .then(|| Self::status(&state)))
    }
}

// --- GitHub ---

#[derive(Debug, Clone)]
pub struct PostedComment {
    pub target: CommentTarget,
    /// Comment id the caller asked to edit.
    pub existing: Option<i64>,
    pub body: String,
    pub comment_id: i64,
}

#[derive(Default)]
pub struct RecordingNotifier {
    comments: Mutex<Vec<PostedComment>>,
    fail: AtomicBool,
    next_id: AtomicI64,
}

impl RecordingNotifier {
    pub fn fail_all(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn posted(&self) -> Vec<PostedComment> {
        self.comments.lock().unwrap().clone()
    }
}

#[async_trait]
impl PullRequestNotifier for RecordingNotifier {
    async fn publish(
        &self,
        target: &CommentTarget,
        existing: Option<i64>,
        body: &str,
    ) -> Result<Option<i64>, NotifyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::Status {
                status: 502,
                body: "bad gateway".to_string(),
            });
        }
        let comment_id = existing.unwrap_or_else(|| 100 + self.next_id.fetch_add(1, Ordering::SeqCst));
        self.comments.lock().unwrap().push(PostedComment {
            target: target.clone(),
            existing,
            body: body.to_string(),
            comment_id,
        });
        Ok(Some(comment_id))
    }
}

// --- secrets ---

pub struct StaticSecrets(pub ResolvedSecrets);

#[async_trait]
impl SecretResolver for StaticSecrets {
    async fn resolve_secrets_for_environment(
        &self,
        _team_id: i64,
        _project_id: i64,
        _environment_id: &str,
    ) -> Result<ResolvedSecrets, SecretsError> {
        Ok(self.0.clone())
    }
}

// --- fixtures ---

pub fn project() -> PreviewProject {
    PreviewProject {
        id: 1,
        team_id: 10,
        team_name: "Platform".to_string(),
        name: "Test Repo".to_string(),
        github_repo: "acme/test-repo".to_string(),
        default_branch: "main".to_string(),
        image_repository: "ghcr.io/acme/test-repo".to_string(),
        base_domain: None,
        active: true,
        create_date: None,
        write_date: None,
    }
}

pub fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        base_domain: BASE_DOMAIN.to_string(),
        preview_environment: "development".to_string(),
        default_resources: ResourcesAllocated::default(),
        stall_after: std::time::Duration::from_secs(600),
    }
}

pub fn create_request(pr_number: i32, commit_sha: &str) -> CreatePreviewRequest {
    CreatePreviewRequest {
        project: ProjectContext::from(&project()),
        pull_request_id: 9000 + i64::from(pr_number),
        pr_number,
        repo_name: "test-repo".to_string(),
        repo_full_name: "acme/test-repo".to_string(),
        branch: "feature/test".to_string(),
        commit_sha: commit_sha.to_string(),
        image_tag: None,
        restore_deleted: false,
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub cluster: Arc<FakeCluster>,
    pub notifier: Arc<RecordingNotifier>,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn harness() -> Harness {
    harness_with_project(project())
}

pub fn harness_with_project(project: PreviewProject) -> Harness {
    let store = Arc::new(MemoryStore::new());
    store.add_project(project);
    let cluster = Arc::new(FakeCluster::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let secrets = StaticSecrets(ResolvedSecrets::from([(
        "DATABASE_URL".to_string(),
        ResolvedSecret {
            value: "postgres://preview".to_string(),
            source: SecretSource::Environment,
        },
    )]));

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        store.clone(),
        cluster.clone(),
        notifier.clone(),
        Arc::new(secrets),
        settings(),
    ));

    Harness {
        store,
        cluster,
        notifier,
        orchestrator,
    }
}

pub fn config() -> PreviewConfig {
    PreviewConfig {
        github_webhook_secret: WEBHOOK_SECRET.to_string(),
        github_token: String::new(),
        github_api_url: "https://api.github.com".to_string(),
        base_domain: BASE_DOMAIN.to_string(),
        cluster_timeout: std::time::Duration::from_secs(5),
        stall_after: std::time::Duration::from_secs(600),
        field_manager: "centrix-preview".to_string(),
        preview_environment: "development".to_string(),
        default_resources: ResourcesAllocated::default(),
        secrets_url: String::new(),
        secrets_token: String::new(),
        queue_depth: 8,
        db_pool_size: 1,
    }
}

/// Router state that runs jobs inline, so responses arrive after the work.
pub fn router_state(harness: &Harness) -> PreviewRouterState {
    PreviewRouterState {
        config: Arc::new(config()),
        store: harness.store.clone(),
        projects: harness.store.clone(),
        orchestrator: harness.orchestrator.clone(),
        dispatcher: Dispatcher::Inline(harness.orchestrator.clone()),
    }
}
