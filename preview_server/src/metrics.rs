//! Prometheus metrics for preview orchestration.

use metrics::{counter, gauge, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a webhook received event.
pub fn webhook_received(event_type: &str) {
    counter!("preview_webhooks_received_total", "event" => event_type.to_string()).increment(1);
}

/// Record a rejected webhook signature.
pub fn webhook_rejected() {
    counter!("preview_webhooks_rejected_total").increment(1);
}

/// Record a deployment state transition.
pub fn deployment_status_changed(status: &str) {
    counter!("preview_deployments_total", "status" => status.to_string()).increment(1);
}

/// Record a cluster API call duration.
pub fn cluster_operation(operation: &str, duration_ms: u64) {
    histogram!("preview_cluster_operation_ms", "operation" => operation.to_string())
        .record(duration_ms as f64);
}

/// Record a failed cluster operation by error kind.
pub fn cluster_failure(kind: &str) {
    counter!("preview_cluster_failures_total", "kind" => kind.to_string()).increment(1);
}

/// Record a PR comment that could not be posted.
pub fn notification_failed() {
    counter!("preview_notification_failures_total").increment(1);
}

/// Set current count of previews that have not been torn down.
pub fn active_previews(count: i64) {
    gauge!("preview_active_deployments").set(count as f64);
}
