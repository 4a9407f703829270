//! Startup migration for the preview tables.

use diesel_async::AsyncPgConnection;
use diesel_async::SimpleAsyncConnection;

/// SQL migration for preview orchestrator tables. Safe to run repeatedly.
pub const MIGRATION_SQL: &str = r#"
-- ================================================================
-- Preview Environment Tables
-- ================================================================

CREATE TABLE IF NOT EXISTS preview_projects (
    id                BIGSERIAL PRIMARY KEY,
    team_id           BIGINT NOT NULL,
    team_name         VARCHAR(255) NOT NULL,
    name              VARCHAR(255) NOT NULL,
    github_repo       VARCHAR(255) NOT NULL UNIQUE,
    default_branch    VARCHAR(255) NOT NULL DEFAULT 'main',
    image_repository  VARCHAR(512) NOT NULL,
    base_domain       VARCHAR(255),
    active            BOOLEAN NOT NULL DEFAULT TRUE,
    create_date       TIMESTAMPTZ DEFAULT NOW(),
    write_date        TIMESTAMPTZ DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_preview_projects_repo ON preview_projects (github_repo);

CREATE TABLE IF NOT EXISTS preview_deployments (
    id                   BIGSERIAL PRIMARY KEY,
    project_id           BIGINT NOT NULL REFERENCES preview_projects(id) ON DELETE CASCADE,
    pull_request_id      BIGINT NOT NULL,
    pr_number            INTEGER NOT NULL,
    repo_full_name       VARCHAR(255) NOT NULL,
    namespace            VARCHAR(63) NOT NULL,
    deployment_name      VARCHAR(63) NOT NULL,
    branch               VARCHAR(255) NOT NULL,
    commit_sha           VARCHAR(64) NOT NULL,
    image_tag            VARCHAR(128) NOT NULL,
    public_url           VARCHAR(512),
    status               VARCHAR(16) NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'deploying', 'running', 'failed', 'deleting', 'deleted')),
    error_message        TEXT,
    resources_allocated  JSONB NOT NULL DEFAULT '{}'::jsonb,
    comment_id           BIGINT,
    created_at           TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at           TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT uq_preview_deployments_pr_commit UNIQUE (pull_request_id, commit_sha)
);

CREATE INDEX IF NOT EXISTS idx_preview_deployments_pr ON preview_deployments (pull_request_id);
CREATE INDEX IF NOT EXISTS idx_preview_deployments_status ON preview_deployments (status);
CREATE INDEX IF NOT EXISTS idx_preview_deployments_namespace ON preview_deployments (namespace);
CREATE INDEX IF NOT EXISTS idx_preview_deployments_created ON preview_deployments (created_at DESC);
"#;

/// Run the preview table migration.
pub async fn run_migration(conn: &mut AsyncPgConnection) -> anyhow::Result<()> {
    conn.batch_execute(MIGRATION_SQL)
        .await
        .map_err(|e| anyhow::anyhow!("preview migration failed: {e}"))?;
    Ok(())
}
