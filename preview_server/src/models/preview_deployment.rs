//! preview.deployment — One attempt to run a pull request commit as a live
//! environment.
//!
//! Rows are never hard-deleted: teardown moves them to `deleted` so the
//! history of every attempt stays inspectable.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::preview_deployments;

/// Lifecycle of a preview deployment.
///
/// `pending → deploying → {running | failed}` on create, and
/// `running | failed → deleting → deleted` on teardown. A close that races an
/// in-flight create may also move `pending | deploying` straight to
/// `deleting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Running,
    Failed,
    Deleting,
    Deleted,
}

impl DeploymentStatus {
    pub const ALL: [DeploymentStatus; 6] = [
        DeploymentStatus::Pending,
        DeploymentStatus::Deploying,
        DeploymentStatus::Running,
        DeploymentStatus::Failed,
        DeploymentStatus::Deleting,
        DeploymentStatus::Deleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Deleting => "deleting",
            DeploymentStatus::Deleted => "deleted",
        }
    }

    /// States a row may be in for a transition into `self` to apply.
    ///
    /// `failed`/`deleted → pending` re-arms a row for another attempt under the
    /// same idempotency key. `failed ↔ running` lets a status refresh follow
    /// what the cluster reports.
    pub fn predecessors(self) -> &'static [DeploymentStatus] {
        use DeploymentStatus::*;
        match self {
            Pending => &[Failed, Deleted],
            Deploying => &[Pending],
            Running => &[Deploying, Failed],
            Failed => &[Pending, Deploying, Running],
            Deleting => &[Pending, Deploying, Running, Failed],
            Deleted => &[Deleting],
        }
    }

    pub fn can_transition_to(self, next: DeploymentStatus) -> bool {
        next.predecessors().contains(&self)
    }

    /// A new create for the same key retries instead of returning the row.
    ///
    /// Torn-down rows come back only when the caller asks for it (a reopened
    /// pull request or an operator redeploy); a late `opened` or `synchronize`
    /// delivery must not resurrect a closed preview.
    pub fn needs_redeploy(self, restore_deleted: bool) -> bool {
        match self {
            DeploymentStatus::Failed => true,
            DeploymentStatus::Deleted => restore_deleted,
            _ => false,
        }
    }

    /// A create is working on the row, or was until it was interrupted.
    pub fn is_in_flight(self) -> bool {
        matches!(self, DeploymentStatus::Pending | DeploymentStatus::Deploying)
    }

    /// Teardown on PR close applies to this row.
    pub fn is_active(self) -> bool {
        self != DeploymentStatus::Deleted
    }

    /// Teardown has started or finished; a create must not resurrect the row.
    pub fn is_tearing_down(self) -> bool {
        matches!(self, DeploymentStatus::Deleting | DeploymentStatus::Deleted)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown deployment status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for DeploymentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeploymentStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// CPU / memory / pod-count triple reserved for a preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcesAllocated {
    pub cpu: String,
    pub memory: String,
    pub pods: u32,
}

impl Default for ResourcesAllocated {
    fn default() -> Self {
        Self {
            cpu: "500m".to_string(),
            memory: "512Mi".to_string(),
            pods: 1,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = preview_deployments)]
pub struct PreviewDeployment {
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
    pub resources_allocated: serde_json::Value,
    pub comment_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PreviewDeployment {
    /// Parsed lifecycle state. Rows with an unrecognised status are treated
    /// as failed so the next create retries them.
    pub fn state(&self) -> DeploymentStatus {
        self.status.parse().unwrap_or(DeploymentStatus::Failed)
    }

    pub fn resources(&self) -> Option<ResourcesAllocated> {
        serde_json::from_value(self.resources_allocated.clone()).ok()
    }

    /// In flight, but untouched for longer than `stall_after`: the create
    /// that owned it crashed or was cancelled.
    pub fn is_stalled(&self, stall_after: Duration) -> bool {
        if !self.state().is_in_flight() {
            return false;
        }
        match chrono::Duration::from_std(stall_after) {
            Ok(limit) => Utc::now().signed_duration_since(self.updated_at) > limit,
            Err(_) => false,
        }
    }

    pub fn short_sha(&self) -> &str {
        self.commit_sha.get(..7).unwrap_or(&self.commit_sha)
    }
}

#[derive(Debug, Clone, Insertable, Deserialize)]
#[diesel(table_name = preview_deployments)]
pub struct NewPreviewDeployment {
    pub project_id: i64,
    pub pull_request_id: i64,
    pub pr_number: i32,
    pub repo_full_name: String,
    pub namespace: String,
    pub deployment_name: String,
    pub branch: String,
    pub commit_sha: String,
    pub image_tag: String,
    pub status: String,
    pub resources_allocated: serde_json::Value,
    pub comment_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeploymentStatus::*;

    #[test]
    fn create_path_transitions() {
        assert!(Pending.can_transition_to(Deploying));
        assert!(Deploying.can_transition_to(Running));
        assert!(Deploying.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Running));
        assert!(!Running.can_transition_to(Deploying));
    }

    #[test]
    fn teardown_transitions() {
        assert!(Running.can_transition_to(Deleting));
        assert!(Failed.can_transition_to(Deleting));
        assert!(Deploying.can_transition_to(Deleting));
        assert!(Deleting.can_transition_to(Deleted));
        assert!(!Running.can_transition_to(Deleted));
        assert!(!Deleting.can_transition_to(Running));
        assert!(!Deleting.can_transition_to(Failed));
    }

    #[test]
    fn rearm_only_from_terminal_failure_or_teardown() {
        assert!(Failed.can_transition_to(Pending));
        assert!(Deleted.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Pending));
        assert!(Failed.needs_redeploy(false) && Failed.needs_redeploy(true));
        assert!(!Running.needs_redeploy(true) && !Deploying.needs_redeploy(true));
    }

    #[test]
    fn deleted_rows_restore_only_on_request() {
        assert!(!Deleted.needs_redeploy(false));
        assert!(Deleted.needs_redeploy(true));
    }

    fn row(status: DeploymentStatus, age: chrono::Duration) -> PreviewDeployment {
        let now = Utc::now();
        PreviewDeployment {
            id: 1,
            project_id: 1,
            pull_request_id: 9001,
            pr_number: 1,
            repo_full_name: "acme/test-repo".to_string(),
            namespace: "pr-test-repo-1".to_string(),
            deployment_name: "preview-1".to_string(),
            branch: "main".to_string(),
            commit_sha: "abc".to_string(),
            image_tag: "abc".to_string(),
            public_url: None,
            status: status.as_str().to_string(),
            error_message: None,
            resources_allocated: serde_json::json!({}),
            comment_id: None,
            created_at: now - age,
            updated_at: now - age,
        }
    }

    #[test]
    fn stalled_only_when_in_flight_and_old() {
        let limit = Duration::from_secs(60);
        let old = chrono::Duration::minutes(5);
        assert!(row(Deploying, old).is_stalled(limit));
        assert!(row(Pending, old).is_stalled(limit));
        assert!(!row(Deploying, chrono::Duration::seconds(1)).is_stalled(limit));
        assert!(!row(Running, old).is_stalled(limit));
        assert!(!row(Failed, old).is_stalled(limit));
    }

    #[test]
    fn status_strings_round_trip() {
        for status in DeploymentStatus::ALL {
            assert_eq!(status.as_str().parse::<DeploymentStatus>().unwrap(), status);
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::json!(status.as_str())
            );
        }
        assert!("exploded".parse::<DeploymentStatus>().is_err());
    }
}
