//! `Project` and `Environment` custom resources (`catalyst.dev/v1alpha1`).
//!
//! A Project lives in its team namespace and is the parent every Environment
//! references. An Environment lives in its preview namespace; its status
//! (phase, url, conditions) is the source of truth for whether the workload
//! is serving.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label keys shared by namespaces and custom resources.
pub const LABEL_TEAM: &str = "catalyst.dev/team";
pub const LABEL_PROJECT: &str = "catalyst.dev/project";
pub const LABEL_ENVIRONMENT: &str = "catalyst.dev/environment";
pub const LABEL_PR: &str = "catalyst.dev/pr-number";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "catalyst.dev",
    version = "v1alpha1",
    kind = "Project",
    plural = "projects",
    namespaced,
    status = "ProjectStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    /// GitHub App installation ID, or `pat` for a personal access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_installation_id: Option<String>,

    pub sources: Vec<SourceConfig>,

    #[serde(default)]
    pub resources: ResourceConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    pub name: String,
    pub repository_url: String,
    pub branch: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    #[serde(default)]
    pub default_quota: QuotaSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct QuotaSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct ProjectStatus {
    #[serde(default)]
    pub conditions: Vec<ResourceCondition>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "catalyst.dev",
    version = "v1alpha1",
    kind = "Environment",
    plural = "environments",
    namespaced,
    status = "EnvironmentStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".status.url"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSpec {
    pub project_ref: ProjectReference,

    /// `development` for previews, `deployment` for long-lived environments.
    #[serde(rename = "type")]
    pub environment_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_mode: Option<String>,

    #[serde(default)]
    pub sources: Vec<EnvironmentSource>,

    #[serde(default)]
    pub config: EnvironmentConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct ProjectReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSource {
    pub name: String,
    pub commit_sha: String,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_vars: Vec<EnvVar>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceLimits>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub cpu: String,
    pub memory: String,
    pub max_pods: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct EnvironmentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub conditions: Vec<ResourceCondition>,
}

impl EnvironmentStatus {
    /// Phases the operator reports once the workload serves traffic.
    pub fn is_serving(&self) -> bool {
        matches!(self.phase.as_deref(), Some("Ready") | Some("Running"))
    }

    pub fn is_failed(&self) -> bool {
        self.phase.as_deref() == Some("Failed")
    }

    /// Message of the first condition that is not `True`, if any.
    pub fn failure_message(&self) -> Option<String> {
        self.conditions
            .iter()
            .find(|c| c.status != "True")
            .map(|c| match &c.message {
                Some(message) => format!("{}: {message}", c.type_),
                None => c.type_.clone(),
            })
    }
}

/// Mirrors `metav1.Condition`.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}
