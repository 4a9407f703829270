//! Hand-off from the webhook handler to the orchestrator.
//!
//! Production uses `Background`: jobs go through a bounded queue to a worker
//! that spawns one task per job, so the handler acknowledges immediately.
//! When the queue closes the worker waits for its running jobs before it
//! returns, so awaiting its handle drains everything accepted.
//! `Inline` awaits orchestration in the request, for tests.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::services::orchestrator::{CreatePreviewRequest, Orchestrator};

#[derive(Debug, Clone)]
pub enum PreviewJob {
    Deploy(CreatePreviewRequest),
    /// Tear down every active preview of a pull request.
    Teardown { pull_request_id: i64, pr_number: i32 },
}

impl PreviewJob {
    pub fn pr_number(&self) -> i32 {
        match self {
            PreviewJob::Deploy(request) => request.pr_number,
            PreviewJob::Teardown { pr_number, .. } => *pr_number,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("preview job queue is closed")]
    Closed,
}

#[derive(Debug)]
pub struct QueuedJob {
    delivery: String,
    job: PreviewJob,
}

#[derive(Clone)]
pub enum Dispatcher {
    Background(mpsc::Sender<QueuedJob>),
    Inline(Arc<Orchestrator>),
}

impl Dispatcher {
    /// Start the worker. It exits once every sender is dropped and every
    /// job it started has finished.
    pub fn spawn_background(orchestrator: Arc<Orchestrator>, depth: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let worker = tokio::spawn(run_worker(orchestrator, rx));
        (Dispatcher::Background(tx), worker)
    }

    /// Hand a job over. Waits for queue space when the queue is full.
    pub async fn submit(&self, delivery: &str, job: PreviewJob) -> Result<(), DispatchError> {
        match self {
            Dispatcher::Background(tx) => tx
                .send(QueuedJob {
                    delivery: delivery.to_string(),
                    job,
                })
                .await
                .map_err(|_| DispatchError::Closed),
            Dispatcher::Inline(orchestrator) => {
                execute(orchestrator, delivery, job).await;
                Ok(())
            }
        }
    }
}

async fn run_worker(orchestrator: Arc<Orchestrator>, mut rx: mpsc::Receiver<QueuedJob>) {
    let mut jobs = JoinSet::new();
    loop {
        tokio::select! {
            queued = rx.recv() => match queued {
                Some(QueuedJob { delivery, job }) => {
                    let orchestrator = orchestrator.clone();
                    jobs.spawn(async move {
                        execute(&orchestrator, &delivery, job).await;
                    });
                }
                None => break,
            },
            Some(joined) = jobs.join_next(), if !jobs.is_empty() => reap(joined),
        }
    }

    tracing::info!(in_flight = jobs.len(), "Preview job queue closed, finishing running jobs");
    while let Some(joined) = jobs.join_next().await {
        reap(joined);
    }
    tracing::info!("Preview worker exiting");
}

fn reap(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!("Preview job task failed: {e}");
    }
}

/// Run one job to completion and log how it ended.
async fn execute(orchestrator: &Orchestrator, delivery: &str, job: PreviewJob) {
    let pr_number = job.pr_number();
    match job {
        PreviewJob::Deploy(request) => {
            let outcome = orchestrator.create_preview_deployment(request).await;
            if outcome.success {
                tracing::info!(
                    delivery,
                    pr_number,
                    reused = outcome.reused,
                    url = ?outcome.public_url,
                    "Preview deploy finished"
                );
            } else {
                tracing::warn!(
                    delivery,
                    pr_number,
                    error = ?outcome.error,
                    "Preview deploy did not succeed"
                );
            }
        }
        PreviewJob::Teardown {
            pull_request_id, ..
        } => {
            let outcomes = orchestrator.delete_for_pull_request(pull_request_id).await;
            let failed = outcomes.iter().filter(|o| !o.success).count();
            if failed == 0 {
                tracing::info!(delivery, pr_number, removed = outcomes.len(), "Preview teardown finished");
            } else {
                tracing::warn!(delivery, pr_number, failed, "Preview teardown incomplete");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::models::preview_deployment::DeploymentStatus;
    use crate::testing::{create_request, harness};

    #[tokio::test]
    async fn background_worker_runs_jobs() {
        let h = harness();
        let (dispatcher, worker) = Dispatcher::spawn_background(h.orchestrator.clone(), 4);

        dispatcher
            .submit("delivery-1", PreviewJob::Deploy(create_request(123, "abc123")))
            .await
            .unwrap();

        let mut running = false;
        for _ in 0..100 {
            if h.store.all().first().is_some_and(|d| d.state() == DeploymentStatus::Running) {
                running = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(running, "deploy job never completed");

        drop(dispatcher);
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker exits when the queue closes")
            .unwrap();
    }

    #[tokio::test]
    async fn worker_finishes_running_jobs_before_exiting() {
        let h = harness();
        h.cluster.state().apply_delay = Some(Duration::from_millis(100));
        let (dispatcher, worker) = Dispatcher::spawn_background(h.orchestrator.clone(), 4);

        dispatcher
            .submit("delivery-1", PreviewJob::Deploy(create_request(124, "abc124")))
            .await
            .unwrap();
        drop(dispatcher);

        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("worker drains within the timeout")
            .unwrap();
        let rows = h.store.all();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state(), DeploymentStatus::Running);
    }

    #[tokio::test]
    async fn inline_dispatch_completes_before_returning() {
        let h = harness();
        let dispatcher = Dispatcher::Inline(h.orchestrator.clone());
        let request = create_request(5, "abc");
        let pull_request_id = request.pull_request_id;

        dispatcher
            .submit("d", PreviewJob::Deploy(request))
            .await
            .unwrap();
        assert_eq!(h.store.all()[0].state(), DeploymentStatus::Running);

        dispatcher
            .submit(
                "d",
                PreviewJob::Teardown {
                    pull_request_id,
                    pr_number: 5,
                },
            )
            .await
            .unwrap();
        assert_eq!(h.store.all()[0].state(), DeploymentStatus::Deleted);
    }

    #[tokio::test]
    async fn closed_queue_is_reported() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = Dispatcher::Background(tx)
            .submit(
                "d",
                PreviewJob::Teardown {
                    pull_request_id: 1,
                    pr_number: 1,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Closed));
    }
}
