//! `ClusterSynchronizer` backed by the Kubernetes API.
//!
//! The client is built once in `main` and handed in; nothing here loads
//! cluster configuration on its own.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Api, Client};

use crate::naming;

use super::crd::{
    Environment, EnvironmentStatus, Project, ProjectSpec, SourceConfig, LABEL_MANAGED_BY,
    LABEL_TEAM,
};
use super::{
    AppliedEnvironment, ClusterError, ClusterSynchronizer, EnvironmentRequest, ErrorKind,
    ProjectScope, MANAGER,
};

pub struct KubeCluster {
    client: Client,
    timeout: Duration,
    field_manager: String,
}

impl KubeCluster {
    pub fn new(client: Client, timeout: Duration, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            timeout,
            field_manager: field_manager.into(),
        }
    }

    /// Run one API call under the configured timeout and classify its error.
    async fn bounded<T, F>(&self, operation: &'static str, call: F) -> Result<T, ClusterError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ClusterError::from_kube(operation, e)),
            Err(_) => Err(ClusterError::Timeout {
                operation,
                timeout: self.timeout,
            }),
        };
        crate::metrics::cluster_operation(operation, started.elapsed().as_millis() as u64);
        result
    }

    async fn ensure_namespace(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<(), ClusterError> {
        if !naming::is_valid_namespace_name(name) {
            return Err(ClusterError::Api {
                operation: "create namespace",
                kind: ErrorKind::Fatal,
                message: format!("{name:?} is not a valid DNS-1123 label"),
            });
        }

        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        };

        match self
            .bounded("create namespace", api.create(&PostParams::default(), &namespace))
            .await
        {
            Ok(_) => {
                tracing::info!(namespace = name, "Namespace created");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::Conflict => {
                tracing::debug!(namespace = name, "Namespace already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ClusterSynchronizer for KubeCluster {
    async fn ensure_project(&self, scope: &ProjectScope) -> Result<(), ClusterError> {
        let labels = BTreeMap::from([
            (LABEL_TEAM.to_string(), scope.namespace.clone()),
            (LABEL_MANAGED_BY.to_string(), MANAGER.to_string()),
        ]);
        self.ensure_namespace(&scope.namespace, labels.clone()).await?;

        let api: Api<Project> = Api::namespaced(self.client.clone(), &scope.namespace);
        if self
            .bounded("get project", api.get_opt(&scope.name))
            .await?
            .is_some()
        {
            return Ok(());
        }

        let mut project = Project::new(
            &scope.name,
            ProjectSpec {
                github_installation_id: None,
                sources: vec![SourceConfig {
                    name: scope.name.clone(),
                    repository_url: scope.repository_url.clone(),
                    branch: scope.default_branch.clone(),
                }],
                resources: Default::default(),
            },
        );
        project.metadata.namespace = Some(scope.namespace.clone());
        project.metadata.labels = Some(labels);

        match self
            .bounded("create project", api.create(&PostParams::default(), &project))
            .await
        {
            Ok(_) => {
                tracing::info!(
                    namespace = %scope.namespace,
                    project = %scope.name,
                    team = %scope.team_name,
                    "Project resource created"
                );
                Ok(())
            }
            // Lost a create race with another delivery; the parent exists.
            Err(e) if e.kind() == ErrorKind::Conflict => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn apply_environment(
        &self,
        request: &EnvironmentRequest,
    ) -> Result<AppliedEnvironment, ClusterError> {
        let projects: Api<Project> =
            Api::namespaced(self.client.clone(), &request.project.namespace);
        if self
            .bounded("get project", projects.get_opt(&request.project.name))
            .await?
            .is_none()
        {
            return Err(ClusterError::ProjectMissing {
                namespace: request.project.namespace.clone(),
                name: request.project.name.clone(),
            });
        }

        self.ensure_namespace(&request.namespace, request.labels())
            .await?;

        let api: Api<Environment> = Api::namespaced(self.client.clone(), &request.namespace);
        let params = PatchParams::apply(&self.field_manager).force();
        let environment = request.to_resource();
        let applied = self
            .bounded(
                "apply environment",
                api.patch(&request.name, &params, &Patch::Apply(&environment)),
            )
            .await?;

        tracing::info!(
            namespace = %request.namespace,
            environment = %request.name,
            image = %request.image,
            "Environment applied"
        );

        Ok(applied.status.unwrap_or_default().into())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match self
            .bounded("delete namespace", api.delete(name, &DeleteParams::background()))
            .await
        {
            Ok(_) => {
                tracing::info!(namespace = name, "Namespace deletion requested");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(namespace = name, "Namespace already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn environment_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<EnvironmentStatus>, ClusterError> {
        let api: Api<Environment> = Api::namespaced(self.client.clone(), namespace);
        let environment = self.bounded("get environment", api.get_opt(name)).await?;
        Ok(environment.map(|env| env.status.unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    use axum::body::Body;
    use axum::http::{Method, Request, Response, StatusCode};
    use serde_json::json;

    use super::*;

    type Seen = Arc<Mutex<Vec<(Method, String)>>>;

    /// A client whose API server answers every request with `status`/`body`.
    fn cluster_answering(status: StatusCode, body: serde_json::Value) -> (KubeCluster, Seen) {
        let seen = Seen::default();
        let recorded = seen.clone();
        let service = tower::service_fn(move |request: Request<kube::client::Body>| {
            recorded
                .lock()
                .unwrap()
                .push((request.method().clone(), request.uri().path().to_string()));
            let body = body.to_string();
            async move {
                Ok::<_, Infallible>(
                    Response::builder()
                        .status(status)
                        .header("content-type", "application/json")
                        .body(Body::from(body))
                        .unwrap(),
                )
            }
        });
        let client = Client::new(service, "default");
        (
            KubeCluster::new(client, Duration::from_secs(5), "centrix-preview"),
            seen,
        )
    }

    fn status_body(code: u16, reason: &str) -> serde_json::Value {
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": format!("namespaces \"pr-test-repo-7\" {reason}"),
            "reason": reason,
            "code": code
        })
    }

    #[tokio::test]
    async fn deleting_absent_namespace_is_ok() {
        let (cluster, seen) =
            cluster_answering(StatusCode::NOT_FOUND, status_body(404, "NotFound"));

        cluster.delete_namespace("pr-test-repo-7").await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[(Method::DELETE, "/api/v1/namespaces/pr-test-repo-7".to_string())]
        );
    }

    #[tokio::test]
    async fn deleting_namespace_requests_removal() {
        let (cluster, _) = cluster_answering(
            StatusCode::OK,
            json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": {"name": "pr-test-repo-7"},
                "status": {"phase": "Terminating"}
            }),
        );

        cluster.delete_namespace("pr-test-repo-7").await.unwrap();
    }

    #[tokio::test]
    async fn delete_failures_are_classified() {
        let (cluster, _) = cluster_answering(
            StatusCode::SERVICE_UNAVAILABLE,
            status_body(503, "ServiceUnavailable"),
        );

        let err = cluster.delete_namespace("pr-test-repo-7").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn invalid_namespace_names_never_reach_the_api() {
        let (cluster, seen) = cluster_answering(StatusCode::OK, json!({}));

        let err = cluster
            .ensure_namespace("PR_Invalid", BTreeMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(seen.lock().unwrap().is_empty());
    }
}
