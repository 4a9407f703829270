//! GitHub integration — webhook validation and preview PR comments.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::models::preview_deployment::{DeploymentStatus, PreviewDeployment};

type HmacSha256 = Hmac<Sha256>;

/// Marker embedded in every comment so it can be found by humans and tools.
const COMMENT_MARKER: &str = "<!-- centrix-preview -->";

/// Validate a GitHub webhook signature (X-Hub-Signature-256).
///
/// `verify_slice` compares in constant time.
pub fn validate_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        tracing::warn!("Webhook secret not configured, skipping validation");
        return true;
    }

    let sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    let sig_bytes = match hex::decode(sig) {
        Ok(b) => b,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(payload);

    mac.verify_slice(&sig_bytes).is_ok()
}

/// Compute the `sha256=` signature GitHub would send for `payload`.
#[cfg(test)]
pub fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Pull request a comment belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentTarget {
    /// `owner/repo`.
    pub repo_full_name: String,
    pub pr_number: i32,
}

impl CommentTarget {
    pub fn for_deployment(deployment: &PreviewDeployment) -> Self {
        Self {
            repo_full_name: deployment.repo_full_name.clone(),
            pr_number: deployment.pr_number,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("GitHub request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("GitHub returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[async_trait]
pub trait PullRequestNotifier: Send + Sync {
    /// Post `body` on the PR, or edit `existing_comment_id` in place.
    ///
    /// Returns the comment id, or `None` when notifications are disabled.
    async fn publish(
        &self,
        target: &CommentTarget,
        existing_comment_id: Option<i64>,
        body: &str,
    ) -> Result<Option<i64>, NotifyError>;
}

#[derive(Deserialize)]
struct CommentResponse {
    id: i64,
}

/// Posts preview comments through the GitHub REST API.
pub struct GitHubNotifier {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

impl GitHubNotifier {
    pub fn new(client: reqwest::Client, api_url: &str, token: &str) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "centrix-preview")
    }

    async fn create_comment(&self, target: &CommentTarget, body: &str) -> Result<i64, NotifyError> {
        let url = format!(
            "{}/repos/{}/issues/{}/comments",
            self.api_url, target.repo_full_name, target.pr_number
        );
        let resp = self
            .request(reqwest::Method::POST, &url)
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Status { status, body: text });
        }

        let comment: CommentResponse = resp.json().await?;
        Ok(comment.id)
    }

    /// `Ok(false)` when the comment no longer exists.
    async fn update_comment(
        &self,
        target: &CommentTarget,
        comment_id: i64,
        body: &str,
    ) -> Result<bool, NotifyError> {
        let url = format!(
            "{}/repos/{}/issues/comments/{comment_id}",
            self.api_url, target.repo_full_name
        );
        let resp = self
            .request(reqwest::Method::PATCH, &url)
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            s => {
                let text = resp.text().await.unwrap_or_default();
                Err(NotifyError::Status {
                    status: s.as_u16(),
                    body: text,
                })
            }
        }
    }
}

#[async_trait]
impl PullRequestNotifier for GitHubNotifier {
    async fn publish(
        &self,
        target: &CommentTarget,
        existing_comment_id: Option<i64>,
        body: &str,
    ) -> Result<Option<i64>, NotifyError> {
        if self.token.is_empty() {
            tracing::debug!("GitHub token not set, skipping PR comment");
            return Ok(None);
        }

        if let Some(comment_id) = existing_comment_id {
            if self.update_comment(target, comment_id, body).await? {
                return Ok(Some(comment_id));
            }
            tracing::info!(
                comment_id,
                repo = %target.repo_full_name,
                "Preview comment was deleted, posting a new one"
            );
        }

        self.create_comment(target, body).await.map(Some)
    }
}

/// Render the PR comment for a deployment's current state.
pub fn render_comment(deployment: &PreviewDeployment) -> String {
    let state = deployment.state();
    let headline = match state {
        DeploymentStatus::Pending | DeploymentStatus::Deploying => "Preview environment is deploying",
        DeploymentStatus::Running => "Preview environment is ready",
        DeploymentStatus::Failed => "Preview environment failed to deploy",
        DeploymentStatus::Deleting | DeploymentStatus::Deleted => "Preview environment was removed",
    };

    let mut body = format!("{COMMENT_MARKER}\n### {headline}\n\n| | |\n|---|---|\n");
    body.push_str(&format!("| Status | `{state}` |\n"));
    if let Some(url) = deployment.public_url.as_deref() {
        if state == DeploymentStatus::Running {
            body.push_str(&format!("| URL | {url} |\n"));
        }
    }
    body.push_str(&format!("| Commit | `{}` |\n", deployment.short_sha()));
    body.push_str(&format!("| Branch | `{}` |\n", deployment.branch));
    body.push_str(&format!("| Namespace | `{}` |\n", deployment.namespace));

    if state == DeploymentStatus::Failed {
        if let Some(error) = deployment.error_message.as_deref() {
            body.push_str(&format!("\n<details><summary>Error</summary>\n\n```\n{error}\n```\n</details>\n"));
        }
    }

    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn deployment(status: DeploymentStatus) -> PreviewDeployment {
        PreviewDeployment {
            id: 1,
            project_id: 1,
            pull_request_id: 9001,
            pr_number: 123,
            repo_full_name: "acme/test-repo".into(),
            namespace: "pr-test-repo-123".into(),
            deployment_name: "preview-123".into(),
            branch: "feature/test".into(),
            commit_sha: "abc123def4567890".into(),
            image_tag: "abc123def4567890".into(),
            public_url: Some("https://pr-test-repo-123.preview.example.com".into()),
            status: status.as_str().into(),
            error_message: Some("quota exceeded".into()),
            resources_allocated: json!({"cpu": "500m", "memory": "512Mi", "pods": 1}),
            comment_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn target() -> CommentTarget {
        CommentTarget {
            repo_full_name: "acme/test-repo".into(),
            pr_number: 123,
        }
    }

    #[test]
    fn accepts_valid_signature() {
        let body = br#"{"action":"opened"}"#;
        let signature = sign("topsecret", body);
        assert!(signature.starts_with("sha256="));
        assert!(validate_signature("topsecret", body, &signature));
    }

    #[test]
    fn rejects_tampered_or_malformed_signature() {
        let body = br#"{"action":"opened"}"#;
        let signature = sign("topsecret", body);
        assert!(!validate_signature("topsecret", br#"{"action":"closed"}"#, &signature));
        assert!(!validate_signature("other", body, &signature));
        assert!(!validate_signature("topsecret", body, "sha256=not-hex"));
        assert!(!validate_signature("topsecret", body, ""));
    }

    #[test]
    fn empty_secret_skips_validation() {
        assert!(validate_signature("", b"anything", ""));
    }

    #[test]
    fn renders_running_comment_with_url() {
        let body = render_comment(&deployment(DeploymentStatus::Running));
        assert!(body.contains("Preview environment is ready"));
        assert!(body.contains("https://pr-test-repo-123.preview.example.com"));
        assert!(body.contains("`abc123d`"));
        assert!(!body.contains("quota exceeded"));
    }

    #[test]
    fn renders_failure_details() {
        let body = render_comment(&deployment(DeploymentStatus::Failed));
        assert!(body.contains("failed to deploy"));
        assert!(body.contains("quota exceeded"));
        assert!(!body.contains("| URL |"));
    }

    #[tokio::test]
    async fn posts_new_comment() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/acme/test-repo/issues/123/comments"))
            .and(body_json(json!({"body": "hello"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 42})))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = GitHubNotifier::new(reqwest::Client::new(), &server.uri(), "token");
        let id = notifier.publish(&target(), None, "hello").await.unwrap();
        assert_eq!(id, Some(42));
    }

    #[tokio::test]
    async fn edits_existing_comment_in_place() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/repos/acme/test-repo/issues/comments/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 42})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 99})))
            .expect(0)
            .mount(&server)
            .await;

        let notifier = GitHubNotifier::new(reqwest::Client::new(), &server.uri(), "token");
        let id = notifier.publish(&target(), Some(42), "updated").await.unwrap();
        assert_eq!(id, Some(42));
    }

    #[tokio::test]
    async fn reposts_when_existing_comment_is_gone() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/repos/acme/test-repo/issues/comments/42"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/repos/acme/test-repo/issues/123/comments"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 77})))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = GitHubNotifier::new(reqwest::Client::new(), &server.uri(), "token");
        let id = notifier.publish(&target(), Some(42), "again").await.unwrap();
        assert_eq!(id, Some(77));
    }

    #[tokio::test]
    async fn surfaces_api_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let notifier = GitHubNotifier::new(reqwest::Client::new(), &server.uri(), "token");
        let err = notifier.publish(&target(), None, "x").await.unwrap_err();
        assert!(matches!(err, NotifyError::Status { status: 403, .. }));
    }

    #[tokio::test]
    async fn skips_without_token() {
        let notifier = GitHubNotifier::new(reqwest::Client::new(), "http://127.0.0.1:9", "");
        assert_eq!(notifier.publish(&target(), None, "x").await.unwrap(), None);
    }
}
