//! Preview project lookups.

use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::models::project::PreviewProject;
use crate::schema::preview_projects;

/// Find a project by its GitHub repo identifier (e.g., "acme/web").
pub async fn find_by_repo(
    conn: &mut AsyncPgConnection,
    github_repo: &str,
) -> QueryResult<Option<PreviewProject>> {
    preview_projects::table
        .filter(preview_projects::github_repo.eq(github_repo))
        .filter(preview_projects::active.eq(true))
        .first::<PreviewProject>(conn)
        .await
        .optional()
}

/// Get a project by ID.
pub async fn get(conn: &mut AsyncPgConnection, project_id: i64) -> QueryResult<Option<PreviewProject>> {
    preview_projects::table
        .find(project_id)
        .first::<PreviewProject>(conn)
        .await
        .optional()
}
