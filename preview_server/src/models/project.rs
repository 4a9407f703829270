//! preview.project — A GitHub repo registered for preview deployments.
//!
//! Owned by the project registry; the orchestrator only reads it to route
//! webhooks and to name the team/project cluster resources.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::preview_projects;

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = preview_projects)]
pub struct PreviewProject {
    pub id: i64,
    pub team_id: i64,
    pub team_name: String,
    pub name: String,
    /// `owner/repo`, as sent in `repository.full_name`.
    pub github_repo: String,
    pub default_branch: String,
    /// Image repository without tag, e.g. `ghcr.io/acme/web`.
    pub image_repository: String,
    /// Environment-level override of the configured preview base domain.
    pub base_domain: Option<String>,
    pub active: bool,
    pub create_date: Option<DateTime<Utc>>,
    pub write_date: Option<DateTime<Utc>>,
}

impl PreviewProject {
    pub fn repository_url(&self) -> String {
        format!("https://github.com/{}.git", self.github_repo)
    }
}
