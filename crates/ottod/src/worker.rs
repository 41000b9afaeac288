//! Worker pool.
//!
//! Each worker pulls one ready run from the scheduler and drives it to
//! completion or suspension on a blocking thread; within a run steps are
//! strictly sequential. Suspended runs give the slot back and are
//! re-enqueued by the HITL endpoint, the approval sweeper, or a human
//! resume.

use otto_common::executor::ExecOutcome;
use otto_common::services::Services;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const IDLE_POLL: Duration = Duration::from_millis(100);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Spawn the worker pool plus the approval-timeout sweeper. Returns join
/// handles; set `shutdown` to drain.
pub fn spawn(
    services: Arc<Services>,
    shutdown: Arc<AtomicBool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();
    for worker_id in 0..services.config.orchestrator.workers.max(1) {
        let services = services.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            worker_loop(worker_id, services, shutdown).await;
        }));
    }
    let sweeper_services = services.clone();
    let sweeper_shutdown = shutdown.clone();
    handles.push(tokio::spawn(async move {
        sweeper_loop(sweeper_services, sweeper_shutdown).await;
    }));
    handles
}

async fn worker_loop(worker_id: usize, services: Arc<Services>, shutdown: Arc<AtomicBool>) {
    tracing::info!(worker_id, "worker started");
    while !shutdown.load(Ordering::Relaxed) {
        let Some(item) = services.scheduler.acquire() else {
            tokio::time::sleep(IDLE_POLL).await;
            continue;
        };
        let run_id = item.run_id;
        let executor = services.executor();
        let result =
            tokio::task::spawn_blocking(move || executor.advance(run_id)).await;
        services.scheduler.release(&item.queue);
        match result {
            Ok(Ok(outcome)) => log_outcome(worker_id, run_id, &outcome),
            Ok(Err(e)) => tracing::error!(worker_id, run_id, "run errored: {e:#}"),
            Err(e) => tracing::error!(worker_id, run_id, "worker join error: {e}"),
        }
    }
    tracing::info!(worker_id, "worker stopped");
}

fn log_outcome(worker_id: usize, run_id: i64, outcome: &ExecOutcome) {
    match outcome {
        ExecOutcome::Completed => tracing::info!(worker_id, run_id, "run completed"),
        ExecOutcome::Failed(e) => {
            tracing::warn!(worker_id, run_id, code = e.code.as_str(), "run failed")
        }
        ExecOutcome::Suspended(reason) => {
            tracing::info!(worker_id, run_id, ?reason, "run suspended")
        }
        ExecOutcome::Cancelled => tracing::info!(worker_id, run_id, "run cancelled"),
    }
}

/// Applies `auto_action` to timed-out approvals and re-enqueues those runs.
async fn sweeper_loop(services: Arc<Services>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Relaxed) {
        tokio::time::sleep(SWEEP_INTERVAL).await;
        let expired = match services.sweep_approval_timeouts(chrono::Utc::now()) {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!("approval sweep failed: {e:#}");
                continue;
            }
        };
        for run_id in expired {
            match services.store.get_run(run_id) {
                Ok(Some(run)) => {
                    if let Err(e) = services.scheduler.enqueue(&run.queue, run_id, run.priority) {
                        tracing::error!(run_id, "re-enqueue after timeout failed: {e}");
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::error!(run_id, "load after timeout failed: {e:#}"),
            }
        }
    }
}
