//! Cluster resource synchronizer.
//!
//! Guarantees a Project exists before any Environment that references it is
//! applied, applies Environments, and tears down preview namespaces. Every
//! operation is idempotent and bounded by a timeout; nothing here retries.
//!
//! Provider errors are mapped onto the closed [`ErrorKind`] set at this
//! boundary, so callers never inspect raw API errors.

pub mod crd;
pub mod kube_cluster;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::models::preview_deployment::ResourcesAllocated;
use crd::{
    EnvVar, Environment, EnvironmentConfig, EnvironmentSource, EnvironmentSpec, EnvironmentStatus,
    ProjectReference, ResourceCondition, ResourceLimits, LABEL_ENVIRONMENT, LABEL_MANAGED_BY,
    LABEL_PR, LABEL_PROJECT, LABEL_TEAM,
};

pub use kube_cluster::KubeCluster;

/// Value of `app.kubernetes.io/managed-by` on everything this service creates.
pub const MANAGER: &str = "centrix-preview";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Transient,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The Environment's parent Project does not exist.
    #[error("project {name} not found in namespace {namespace}")]
    ProjectMissing { namespace: String, name: String },
    #[error("{operation} timed out after {}s", timeout.as_secs())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("{operation} failed ({kind}): {message}")]
    Api {
        operation: &'static str,
        kind: ErrorKind,
        message: String,
    },
}

impl ClusterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClusterError::ProjectMissing { .. } => ErrorKind::NotFound,
            ClusterError::Timeout { .. } => ErrorKind::Transient,
            ClusterError::Api { kind, .. } => *kind,
        }
    }

    pub fn from_kube(operation: &'static str, err: kube::Error) -> Self {
        ClusterError::Api {
            operation,
            kind: classify(&err),
            message: err.to_string(),
        }
    }
}

/// Map a kube client error onto the closed error set.
pub fn classify(err: &kube::Error) -> ErrorKind {
    match err {
        kube::Error::Api(response) => classify_status(response.code),
        kube::Error::HyperError(_) | kube::Error::Service(_) => ErrorKind::Transient,
        _ => ErrorKind::Fatal,
    }
}

/// Map an HTTP status from the API server onto the closed error set.
pub fn classify_status(code: u16) -> ErrorKind {
    match code {
        404 | 410 => ErrorKind::NotFound,
        409 => ErrorKind::Conflict,
        408 | 429 | 500..=599 => ErrorKind::Transient,
        _ => ErrorKind::Fatal,
    }
}

/// Where a team's Project resource lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectScope {
    /// Team namespace holding the Project.
    pub namespace: String,
    /// Project resource name.
    pub name: String,
    pub team_name: String,
    pub repository_url: String,
    pub default_branch: String,
}

impl ProjectScope {
    pub fn reference(&self) -> ProjectReference {
        ProjectReference {
            name: self.name.clone(),
            namespace: Some(self.namespace.clone()),
        }
    }
}

/// Everything needed to materialize one preview Environment.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentRequest {
    /// Preview namespace; owns the Environment and all its workloads.
    pub namespace: String,
    /// Environment resource name.
    pub name: String,
    pub project: ProjectScope,
    /// Preview environment key, e.g. `development`.
    pub environment: String,
    pub pr_number: i32,
    pub branch: String,
    pub commit_sha: String,
    /// Fully qualified image reference.
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub resources: ResourcesAllocated,
}

impl EnvironmentRequest {
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_TEAM.to_string(), self.project.namespace.clone()),
            (LABEL_PROJECT.to_string(), self.project.name.clone()),
            (LABEL_ENVIRONMENT.to_string(), self.environment.clone()),
            (LABEL_PR.to_string(), self.pr_number.to_string()),
            (LABEL_MANAGED_BY.to_string(), MANAGER.to_string()),
        ])
    }

    /// Render the Environment resource for server-side apply.
    pub fn to_resource(&self) -> Environment {
        let mut environment = Environment::new(
            &self.name,
            EnvironmentSpec {
                project_ref: self.project.reference(),
                environment_type: self.environment.clone(),
                deployment_mode: None,
                sources: vec![EnvironmentSource {
                    name: self.project.name.clone(),
                    commit_sha: self.commit_sha.clone(),
                    branch: self.branch.clone(),
                    pr_number: Some(self.pr_number),
                }],
                config: EnvironmentConfig {
                    image: Some(self.image.clone()),
                    env_vars: self
                        .env
                        .iter()
                        .map(|(name, value)| EnvVar {
                            name: name.clone(),
                            value: value.clone(),
                        })
                        .collect(),
                    resources: Some(ResourceLimits {
                        cpu: self.resources.cpu.clone(),
                        memory: self.resources.memory.clone(),
                        max_pods: self.resources.pods,
                    }),
                },
            },
        );
        environment.metadata.namespace = Some(self.namespace.clone());
        environment.metadata.labels = Some(self.labels());
        environment
    }
}

/// What the cluster reported right after an apply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppliedEnvironment {
    pub url: Option<String>,
    pub phase: Option<String>,
    pub conditions: Vec<ResourceCondition>,
}

impl From<EnvironmentStatus> for AppliedEnvironment {
    fn from(status: EnvironmentStatus) -> Self {
        Self {
            url: status.url,
            phase: status.phase,
            conditions: status.conditions,
        }
    }
}

#[async_trait]
pub trait ClusterSynchronizer: Send + Sync {
    /// Create the team namespace and Project if absent.
    async fn ensure_project(&self, scope: &ProjectScope) -> Result<(), ClusterError>;

    /// Create the preview namespace if absent and apply the Environment.
    /// Fails with `ClusterError::ProjectMissing` when the parent is absent.
    async fn apply_environment(
        &self,
        request: &EnvironmentRequest,
    ) -> Result<AppliedEnvironment, ClusterError>;

    /// Delete a namespace and everything in it. An absent namespace succeeds.
    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError>;

    /// Current Environment status; `None` when the resource (or its
    /// namespace) no longer exists.
    async fn environment_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<EnvironmentStatus>, ClusterError>;
}
