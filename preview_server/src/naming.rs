//! Cluster object names — DNS-1123 labels derived from free-text input.
//!
//! Every name produced here is lowercase, uses only `[a-z0-9-]`, never starts
//! or ends with `-`, never contains `--`, and fits in 63 characters. Names are
//! deterministic: redelivered webhooks must land on the same namespace.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

/// Kubernetes limit for namespace and object names.
pub const MAX_NAME_LEN: usize = 63;

/// Length of the hex fingerprint appended to truncated names.
pub const FINGERPRINT_LEN: usize = 5;

const TRUNCATED_LEN: usize = MAX_NAME_LEN - 1 - FINGERPRINT_LEN;

static INVALID_CHARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9-]+").unwrap());
static HYPHEN_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-{2,}").unwrap());
static DNS_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Sanitize a single name component. No length limit is applied.
pub fn sanitize_component(raw: &str) -> String {
    let lower = raw.to_lowercase();
    let replaced = INVALID_CHARS.replace_all(&lower, "-");
    let collapsed = HYPHEN_RUNS.replace_all(&replaced, "-");
    collapsed.trim_matches('-').to_string()
}

/// First five hex characters of the SHA-256 of `input`.
pub fn fingerprint(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(FINGERPRINT_LEN);
    hex
}

/// Join sanitized components with `-`, truncating and fingerprinting the
/// result when it would exceed 63 characters.
///
/// The fingerprint is taken over the untruncated joined string, so inputs
/// sharing a 57-character prefix still produce different names.
pub fn generate_namespace_with_hash<S: AsRef<str>>(components: &[S]) -> String {
    let full = components
        .iter()
        .map(|c| sanitize_component(c.as_ref()))
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    if full.len() <= MAX_NAME_LEN {
        return full;
    }

    let hash = fingerprint(&full);
    // Sanitized output is ASCII, byte slicing is safe.
    let truncated = full[..TRUNCATED_LEN].trim_end_matches('-');
    format!("{truncated}-{hash}")
}

/// Namespace for a pull request preview: `pr-{repo}-{number}`.
pub fn generate_namespace(repo_name: &str, pr_number: i32) -> String {
    generate_namespace_with_hash(&["pr", repo_name, pr_number.to_string().as_str()])
}

/// Name of the Environment resource inside a preview namespace.
pub fn generate_deployment_name(pr_number: i32) -> String {
    generate_namespace_with_hash(&["preview", pr_number.to_string().as_str()])
}

/// Team namespace, holds the team's Project resources.
pub fn generate_team_namespace(team_name: &str) -> String {
    generate_namespace_with_hash(&[team_name])
}

/// Project resource name, unique within its team namespace.
pub fn generate_project_name(project_name: &str) -> String {
    generate_namespace_with_hash(&[project_name])
}

/// Public URL of a preview: `https://{namespace}.{base_domain}`.
pub fn generate_public_url(namespace: &str, base_domain: &str) -> String {
    let domain = base_domain.trim().trim_matches('.');
    format!("https://{namespace}.{domain}")
}

/// DNS-1123 label check, including the 63 character limit.
pub fn is_valid_namespace_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_NAME_LEN && DNS_LABEL.is_match(name)
}
