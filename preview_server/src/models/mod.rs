//! Preview orchestrator data models.

pub mod preview_deployment;
pub mod project;
