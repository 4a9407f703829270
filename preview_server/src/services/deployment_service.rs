//! Preview deployment records — Postgres queries behind `PgStore`.
//!
//! Status changes are compare-and-set: an update only lands when the row is in
//! one of the target status's predecessor states.

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::models::preview_deployment::{DeploymentStatus, NewPreviewDeployment, PreviewDeployment};
use crate::schema::preview_deployments;
use crate::store::StatusUpdate;

/// Find the record for an idempotency key.
pub async fn find_by_key(
    conn: &mut AsyncPgConnection,
    pull_request_id: i64,
    commit_sha: &str,
) -> QueryResult<Option<PreviewDeployment>> {
    preview_deployments::table
        .filter(preview_deployments::pull_request_id.eq(pull_request_id))
        .filter(preview_deployments::commit_sha.eq(commit_sha))
        .first::<PreviewDeployment>(conn)
        .await
        .optional()
}

/// Get a record by ID.
pub async fn get(
    conn: &mut AsyncPgConnection,
    deployment_id: i64,
) -> QueryResult<Option<PreviewDeployment>> {
    preview_deployments::table
        .find(deployment_id)
        .first::<PreviewDeployment>(conn)
        .await
        .optional()
}

/// Insert a new record. Fails with a unique violation when the key exists.
pub async fn insert(
    conn: &mut AsyncPgConnection,
    new_deployment: &NewPreviewDeployment,
) -> QueryResult<PreviewDeployment> {
    diesel::insert_into(preview_deployments::table)
        .values(new_deployment)
        .get_result::<PreviewDeployment>(conn)
        .await
}

/// Apply a status change if the row is in a predecessor state.
///
/// Returns `None` when the row is missing or in a state the change may not
/// leave from.
pub async fn transition(
    conn: &mut AsyncPgConnection,
    deployment_id: i64,
    update: &StatusUpdate,
) -> QueryResult<Option<PreviewDeployment>> {
    let from: Vec<&str> = update
        .to
        .predecessors()
        .iter()
        .map(|s| s.as_str())
        .collect();
    let target = preview_deployments::table
        .filter(preview_deployments::id.eq(deployment_id))
        .filter(preview_deployments::status.eq_any(from));
    let now = Utc::now();

    match &update.public_url {
        Some(url) => {
            diesel::update(target)
                .set((
                    preview_deployments::status.eq(update.to.as_str()),
                    preview_deployments::error_message.eq(update.error_message.as_deref()),
                    preview_deployments::public_url.eq(url),
                    preview_deployments::updated_at.eq(now),
                ))
                .get_result::<PreviewDeployment>(conn)
                .await
                .optional()
        }
        None => {
            diesel::update(target)
                .set((
                    preview_deployments::status.eq(update.to.as_str()),
                    preview_deployments::error_message.eq(update.error_message.as_deref()),
                    preview_deployments::updated_at.eq(now),
                ))
                .get_result::<PreviewDeployment>(conn)
                .await
                .optional()
        }
    }
}

/// Record an error message without changing status.
pub async fn set_error(
    conn: &mut AsyncPgConnection,
    deployment_id: i64,
    message: &str,
) -> QueryResult<()> {
    diesel::update(preview_deployments::table.find(deployment_id))
        .set((
            preview_deployments::error_message.eq(message),
            preview_deployments::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

/// Remember the PR comment so later updates edit it in place.
pub async fn set_comment_id(
    conn: &mut AsyncPgConnection,
    deployment_id: i64,
    comment_id: i64,
) -> QueryResult<()> {
    diesel::update(preview_deployments::table.find(deployment_id))
        .set(preview_deployments::comment_id.eq(comment_id))
        .execute(conn)
        .await?;
    Ok(())
}

/// List records for a pull request, newest first.
pub async fn list_for_pull_request(
    conn: &mut AsyncPgConnection,
    pull_request_id: i64,
) -> QueryResult<Vec<PreviewDeployment>> {
    preview_deployments::table
        .filter(preview_deployments::pull_request_id.eq(pull_request_id))
        .order(preview_deployments::id.desc())
        .load::<PreviewDeployment>(conn)
        .await
}

/// List the most recent records across all pull requests.
pub async fn list_recent(
    conn: &mut AsyncPgConnection,
    limit: i64,
) -> QueryResult<Vec<PreviewDeployment>> {
    preview_deployments::table
        .order(preview_deployments::id.desc())
        .limit(limit)
        .load::<PreviewDeployment>(conn)
        .await
}

/// Count records that still own (or may own) cluster resources.
pub async fn count_active(conn: &mut AsyncPgConnection) -> QueryResult<i64> {
    preview_deployments::table
        .filter(preview_deployments::status.ne(DeploymentStatus::Deleted.as_str()))
        .count()
        .get_result(conn)
        .await
}
