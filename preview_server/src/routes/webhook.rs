//! GitHub webhook handler — pull request events drive preview deploys.

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::PreviewRouterState;
use crate::dispatch::PreviewJob;
use crate::services::github_service;
use crate::services::orchestrator::{CreatePreviewRequest, ProjectContext};

/// Body of every webhook response.
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<i32>,
}

impl WebhookResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            pr_number: None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            pr_number: None,
        }
    }

    fn for_pr(mut self, pr_number: i32) -> Self {
        self.pr_number = Some(pr_number);
        self
    }
}

type WebhookReply = (StatusCode, Json<WebhookResponse>);

fn reply(status: StatusCode, response: WebhookResponse) -> WebhookReply {
    (status, Json(response))
}

#[derive(Debug, Deserialize)]
pub struct PullRequestEvent {
    pub action: String,
    pub number: i32,
    pub pull_request: PullRequestPayload,
    pub repository: RepositoryPayload,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestPayload {
    /// Provider-wide id, stable across pushes.
    pub id: i64,
    pub head: HeadPayload,
}

#[derive(Debug, Deserialize)]
pub struct HeadPayload {
    #[serde(rename = "ref")]
    pub branch: String,
    pub sha: String,
}

#[derive(Debug, Deserialize)]
pub struct RepositoryPayload {
    pub name: String,
    pub full_name: String,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Handle an incoming GitHub webhook payload.
pub async fn handle_webhook(
    state: &PreviewRouterState,
    headers: &HeaderMap,
    body: Bytes,
) -> WebhookReply {
    let signature = header(headers, "x-hub-signature-256").unwrap_or("");
    if !github_service::validate_signature(&state.config.github_webhook_secret, &body, signature) {
        tracing::warn!("Webhook signature validation failed");
        crate::metrics::webhook_rejected();
        return reply(
            StatusCode::UNAUTHORIZED,
            WebhookResponse::failed("invalid signature"),
        );
    }

    let event_type = header(headers, "x-github-event").unwrap_or("unknown");
    let delivery = header(headers, "x-github-delivery")
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    tracing::info!(event = event_type, delivery = %delivery, "Webhook received");

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(delivery = %delivery, "Unparseable webhook payload: {e}");
            return reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                WebhookResponse::failed(format!("invalid payload: {e}")),
            );
        }
    };

    match event_type {
        "pull_request" => handle_pull_request(state, &delivery, payload).await,
        "ping" => {
            tracing::info!("Received GitHub ping webhook");
            reply(StatusCode::OK, WebhookResponse::ok("pong"))
        }
        _ => {
            tracing::debug!("Ignoring webhook event: {}", event_type);
            reply(
                StatusCode::OK,
                WebhookResponse::ok(format!("event {event_type} ignored")),
            )
        }
    }
}

async fn handle_pull_request(
    state: &PreviewRouterState,
    delivery: &str,
    payload: serde_json::Value,
) -> WebhookReply {
    let event: PullRequestEvent = match serde_json::from_value(payload) {
        Ok(event) => event,
        Err(e) => {
            tracing::error!(delivery, "Malformed pull_request payload: {e}");
            return reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                WebhookResponse::failed(format!("invalid pull_request payload: {e}")),
            );
        }
    };
    let pr_number = event.number;

    let job = match event.action.as_str() {
        "opened" | "synchronize" | "reopened" => match deploy_job(state, &event).await {
            Ok(job) => job,
            Err(response) => return reply(StatusCode::OK, response.for_pr(pr_number)),
        },
        // Rows are keyed by pull request, so teardown needs no project.
        "closed" => PreviewJob::Teardown {
            pull_request_id: event.pull_request.id,
            pr_number,
        },
        action => {
            return reply(
                StatusCode::OK,
                WebhookResponse::ok(format!("action {action} ignored")).for_pr(pr_number),
            );
        }
    };

    let message = match &job {
        PreviewJob::Deploy(_) => "preview deployment accepted",
        PreviewJob::Teardown { .. } => "preview teardown accepted",
    };
    match state.dispatcher.submit(delivery, job).await {
        Ok(()) => reply(StatusCode::OK, WebhookResponse::ok(message).for_pr(pr_number)),
        Err(e) => {
            tracing::error!(delivery, pr_number, "Failed to dispatch preview job: {e}");
            reply(
                StatusCode::OK,
                WebhookResponse::failed(e.to_string()).for_pr(pr_number),
            )
        }
    }
}

async fn deploy_job(
    state: &PreviewRouterState,
    event: &PullRequestEvent,
) -> Result<PreviewJob, WebhookResponse> {
    let repo_full_name = &event.repository.full_name;
    let project = match state.projects.find_by_repo(repo_full_name).await {
        Ok(Some(project)) => project,
        Ok(None) => {
            tracing::debug!("No project registered for repo: {}", repo_full_name);
            return Err(WebhookResponse::ok(format!(
                "repository {repo_full_name} is not registered"
            )));
        }
        Err(e) => {
            tracing::error!(repo = %repo_full_name, "Project lookup failed: {e}");
            return Err(WebhookResponse::failed(format!("project lookup failed: {e}")));
        }
    };

    Ok(PreviewJob::Deploy(CreatePreviewRequest {
        project: ProjectContext::from(&project),
        pull_request_id: event.pull_request.id,
        pr_number: event.number,
        repo_name: event.repository.name.clone(),
        repo_full_name: repo_full_name.clone(),
        branch: event.pull_request.head.branch.clone(),
        commit_sha: event.pull_request.head.sha.clone(),
        image_tag: None,
        // Only a reopen brings back a preview that a close tore down.
        restore_deleted: event.action == "reopened",
    }))
}
