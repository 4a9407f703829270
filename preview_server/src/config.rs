//! Preview orchestrator configuration — loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::models::preview_deployment::ResourcesAllocated;

#[derive(Clone, Debug)]
pub struct PreviewConfig {
    /// GitHub webhook secret for HMAC validation.
    pub github_webhook_secret: String,
    /// GitHub token for PR comments.
    pub github_token: String,
    /// GitHub REST API base URL.
    pub github_api_url: String,
    /// Default base domain for preview URLs; projects may override it.
    pub base_domain: String,
    /// Upper bound for each cluster API call.
    pub cluster_timeout: Duration,
    /// A `pending`/`deploying` row untouched this long lost its create and
    /// may be retried.
    pub stall_after: Duration,
    /// Field manager used for server-side apply.
    pub field_manager: String,
    /// Environment key passed to the secrets service and set on Environments.
    pub preview_environment: String,
    /// Resource limits applied to every preview.
    pub default_resources: ResourcesAllocated,
    /// Secrets service base URL; secrets are not injected when empty.
    pub secrets_url: String,
    /// Bearer token for the secrets service.
    pub secrets_token: String,
    /// Webhook jobs buffered before the handler waits for the worker.
    pub queue_depth: usize,
    /// Maximum database connections.
    pub db_pool_size: usize,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl PreviewConfig {
    pub fn from_env() -> Self {
        let github_webhook_secret = env_string("PREVIEW_WEBHOOK_SECRET", "");
        let github_token = env_string("PREVIEW_GITHUB_TOKEN", "");
        let github_api_url = env_string("PREVIEW_GITHUB_API_URL", "https://api.github.com");
        let base_domain = env_string("PREVIEW_BASE_DOMAIN", "preview.localhost");
        let cluster_timeout = Duration::from_secs(env_or("PREVIEW_CLUSTER_TIMEOUT_SECS", 30));
        let stall_after = Duration::from_secs(env_or("PREVIEW_STALL_AFTER_SECS", 600));
        let field_manager = env_string("PREVIEW_FIELD_MANAGER", "centrix-preview");
        let preview_environment = env_string("PREVIEW_ENVIRONMENT", "development");
        let defaults = ResourcesAllocated::default();
        let default_resources = ResourcesAllocated {
            cpu: env_string("PREVIEW_DEFAULT_CPU", &defaults.cpu),
            memory: env_string("PREVIEW_DEFAULT_MEMORY", &defaults.memory),
            pods: env_or("PREVIEW_DEFAULT_PODS", defaults.pods),
        };
        let secrets_url = env_string("PREVIEW_SECRETS_URL", "");
        let secrets_token = env_string("PREVIEW_SECRETS_TOKEN", "");
        let queue_depth = env_or("PREVIEW_QUEUE_DEPTH", 256);
        let db_pool_size = env_or("PREVIEW_DB_POOL_SIZE", 10);

        if github_webhook_secret.is_empty() {
            tracing::warn!("PREVIEW_WEBHOOK_SECRET not set -- webhook signature validation disabled");
        }
        if github_token.is_empty() {
            tracing::warn!("PREVIEW_GITHUB_TOKEN not set -- PR comments disabled");
        }
        if secrets_url.is_empty() {
            tracing::warn!("PREVIEW_SECRETS_URL not set -- previews run without injected secrets");
        }

        Self {
            github_webhook_secret,
            github_token,
            github_api_url,
            base_domain,
            cluster_timeout,
            stall_after,
            field_manager,
            preview_environment,
            default_resources,
            secrets_url,
            secrets_token,
            queue_depth,
            db_pool_size,
        }
    }
}
