//! Preview services — persistence queries, orchestration, GitHub and secrets clients.

pub mod deployment_service;
pub mod github_service;
pub mod orchestrator;
pub mod project_service;
pub mod secrets_service;
