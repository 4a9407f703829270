//! Diesel table definitions for the preview orchestrator.
//!
//! Tables: preview_projects, preview_deployments.
//! `preview_deployments` carries UNIQUE (pull_request_id, commit_sha), the
//! idempotency key every create path relies on.

diesel::table! {
    preview_projects (id) {
        id -> Int8,
        team_id -> Int8,
        team_name -> Varchar,
        name -> Varchar,
        github_repo -> Varchar,
        default_branch -> Varchar,
        image_repository -> Varchar,
        base_domain -> Nullable<Varchar>,
        active -> Bool,
        create_date -> Nullable<Timestamptz>,
        write_date -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    preview_deployments (id) {
        id -> Int8,
        project_id -> Int8,
        pull_request_id -> Int8,
        pr_number -> Int4,
        repo_full_name -> Varchar,
        namespace -> Varchar,
        deployment_name -> Varchar,
        branch -> Varchar,
        commit_sha -> Varchar,
        image_tag -> Varchar,
        public_url -> Nullable<Varchar>,
        status -> Varchar,
        error_message -> Nullable<Text>,
        resources_allocated -> Jsonb,
        comment_id -> Nullable<Int8>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(preview_deployments -> preview_projects (project_id));

diesel::allow_tables_to_appear_in_same_query!(preview_projects, preview_deployments);
