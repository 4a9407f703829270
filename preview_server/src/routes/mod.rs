//! Preview orchestrator HTTP routes — webhook and operator API.

pub mod api;
pub mod webhook;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;

use crate::config::PreviewConfig;
use crate::dispatch::Dispatcher;
use crate::services::orchestrator::{DeploymentOutcome, Orchestrator, OrchestratorError};
use crate::store::{DeploymentStore, ProjectDirectory, StoreError};

/// Shared state for route handlers.
#[derive(Clone)]
pub struct PreviewRouterState {
    pub config: Arc<PreviewConfig>,
    pub store: Arc<dyn DeploymentStore>,
    pub projects: Arc<dyn ProjectDirectory>,
    pub orchestrator: Arc<Orchestrator>,
    pub dispatcher: Dispatcher,
}

/// Build the orchestrator's Axum router.
pub fn preview_router(state: PreviewRouterState) -> Router {
    Router::new()
        // Webhook
        .route("/webhook/github", post(webhook_handler))
        // Preview API
        .route("/api/previews", get(list_previews_handler))
        .route("/api/previews/{deployment_id}", get(get_preview_handler))
        .route("/api/previews/{deployment_id}/refresh", post(refresh_handler))
        .route("/api/previews/{deployment_id}/redeploy", post(redeploy_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

// ── Webhook ──

async fn webhook_handler(
    State(state): State<PreviewRouterState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<webhook::WebhookResponse>) {
    crate::metrics::webhook_received(
        headers
            .get("x-github-event")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown"),
    );

    webhook::handle_webhook(&state, &headers, body).await
}

// ── Preview API ──

#[derive(serde::Deserialize)]
pub struct ListPreviewsQuery {
    pub pull_request_id: Option<i64>,
    pub limit: Option<i64>,
}

async fn list_previews_handler(
    State(state): State<PreviewRouterState>,
    Query(query): Query<ListPreviewsQuery>,
) -> Result<Json<Vec<api::PreviewJson>>, StatusCode> {
    api::list_previews(state.store.as_ref(), query.pull_request_id, query.limit.unwrap_or(20))
        .await
        .map(Json)
        .map_err(|e| {
            tracing::error!("List previews error: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn get_preview_handler(
    State(state): State<PreviewRouterState>,
    Path(deployment_id): Path<i64>,
) -> Result<Json<api::PreviewJson>, StatusCode> {
    api::get_preview(state.store.as_ref(), deployment_id)
        .await
        .map(Json)
        .map_err(|e| match e {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            e => {
                tracing::error!(deployment_id, "Get preview error: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })
}

fn orchestrator_status(deployment_id: i64, err: OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::NotFound(_) | OrchestratorError::ProjectNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        OrchestratorError::Cluster(e) => {
            tracing::warn!(deployment_id, "Cluster error: {e}");
            StatusCode::BAD_GATEWAY
        }
        e => {
            tracing::error!(deployment_id, "Preview operation error: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn refresh_handler(
    State(state): State<PreviewRouterState>,
    Path(deployment_id): Path<i64>,
) -> Result<Json<api::PreviewJson>, StatusCode> {
    state
        .orchestrator
        .refresh_status(deployment_id)
        .await
        .map(|d| Json(d.into()))
        .map_err(|e| orchestrator_status(deployment_id, e))
}

async fn redeploy_handler(
    State(state): State<PreviewRouterState>,
    Path(deployment_id): Path<i64>,
) -> Result<Json<DeploymentOutcome>, StatusCode> {
    state
        .orchestrator
        .redeploy(deployment_id)
        .await
        .map(Json)
        .map_err(|e| orchestrator_status(deployment_id, e))
}

async fn healthz() -> &'static str {
    "ok"
}
