//! Resolved secrets for an environment, consumed from the secrets service.
//!
//! Precedence (team < project < environment) and encryption live in that
//! service; this side only receives the final name → value map and injects it
//! into the applied workload.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretSource {
    Team,
    Project,
    Environment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSecret {
    pub value: String,
    pub source: SecretSource,
}

pub type ResolvedSecrets = BTreeMap<String, ResolvedSecret>;

#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("secrets request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("secrets service returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve_secrets_for_environment(
        &self,
        team_id: i64,
        project_id: i64,
        environment_id: &str,
    ) -> Result<ResolvedSecrets, SecretsError>;
}

/// Flatten resolved secrets into plain environment variables.
pub fn to_env(secrets: ResolvedSecrets) -> BTreeMap<String, String> {
    secrets
        .into_iter()
        .map(|(name, secret)| (name, secret.value))
        .collect()
}

/// Used when no secrets service is configured.
pub struct NoSecrets;

#[async_trait]
impl SecretResolver for NoSecrets {
    async fn resolve_secrets_for_environment(
        &self,
        _team_id: i64,
        _project_id: i64,
        _environment_id: &str,
    ) -> Result<ResolvedSecrets, SecretsError> {
        Ok(ResolvedSecrets::new())
    }
}

/// HTTP client for the secrets service.
pub struct HttpSecretResolver {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpSecretResolver {
    pub fn new(client: reqwest::Client, base_url: &str, token: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }
}

#[async_trait]
impl SecretResolver for HttpSecretResolver {
    async fn resolve_secrets_for_environment(
        &self,
        team_id: i64,
        project_id: i64,
        environment_id: &str,
    ) -> Result<ResolvedSecrets, SecretsError> {
        let url = format!(
            "{}/teams/{team_id}/projects/{project_id}/environments/{environment_id}/secrets",
            self.base_url
        );

        let mut request = self.client.get(&url).header("Accept", "application/json");
        if !self.token.is_empty() {
            request = request.bearer_auth(&self.token);
        }
        let resp = request.send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(SecretsError::Status { status, body });
        }

        let secrets: ResolvedSecrets = resp.json().await?;
        tracing::debug!(
            team_id,
            project_id,
            environment = environment_id,
            count = secrets.len(),
            environment_scoped = secrets
                .values()
                .filter(|s| s.source == SecretSource::Environment)
                .count(),
            "Resolved environment secrets"
        );
        Ok(secrets)
    }
}
