//! Metrics snapshots.
//!
//! Read-only rolling aggregates over the run store: 24h and 7d windows plus
//! a top-K failure-cluster list keyed by error code. Writes happen only as a
//! side effect of executor/verifier/monitor transitions; this module never
//! mutates anything.

use crate::run::{RunState, StepStatus};
use crate::store::RunStore;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How many failure clusters the snapshot reports.
const FAILURE_CLUSTER_TOP_K: usize = 5;

/// Aggregates over one rolling window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub total_runs: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// completed / finished, in [0, 1]; 1.0 when nothing finished.
    pub success_rate: f64,
    pub median_duration_ms: u64,
    pub p95_duration_ms: u64,
    pub approvals_required: u64,
    pub approvals_granted: u64,
    /// (PASS + RETRY) / executed verifier-and-action steps.
    pub verifier_pass_rate: f64,
    pub schema_captures: u64,
    pub web_upload_success: u64,
    pub os_capability_misses: u64,
    pub l4_autoruns: u64,
    pub policy_blocks: u64,
    pub deviation_stops: u64,
    pub patches_proposed: u64,
    pub patches_auto_adopted: u64,
    /// RETRY steps / executed steps.
    pub retry_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureCluster {
    pub code: String,
    pub count: u64,
}

/// One full snapshot, served by `GET /metrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub window_24h: WindowStats,
    pub window_7d: WindowStats,
    pub queue_depth_peak: u64,
    pub failure_clusters: Vec<FailureCluster>,
}

/// Compute a snapshot. `queue_depth_peak` comes from the scheduler since it
/// is process state, not store state.
pub fn snapshot(store: &RunStore, queue_depth_peak: u64, now: DateTime<Utc>) -> Result<MetricsSnapshot> {
    let day = now - Duration::hours(24);
    let week = now - Duration::days(7);
    Ok(MetricsSnapshot {
        generated_at: now,
        window_24h: window_stats(store, day)?,
        window_7d: window_stats(store, week)?,
        queue_depth_peak,
        failure_clusters: failure_clusters(store, day)?,
    })
}

fn window_stats(store: &RunStore, since: DateTime<Utc>) -> Result<WindowStats> {
    let runs = store.runs_since(since)?;
    let total_runs = runs.len() as u64;
    let completed = runs.iter().filter(|r| r.state == RunState::Completed).count() as u64;
    let failed = runs.iter().filter(|r| r.state == RunState::Failed).count() as u64;
    let cancelled = runs.iter().filter(|r| r.state == RunState::Cancelled).count() as u64;
    let finished = completed + failed + cancelled;
    let success_rate = if finished == 0 {
        1.0
    } else {
        completed as f64 / finished as f64
    };

    let mut durations: Vec<u64> = runs
        .iter()
        .filter_map(|r| match (r.started_at, r.finished_at) {
            (Some(s), Some(f)) => Some((f - s).num_milliseconds().max(0) as u64),
            _ => None,
        })
        .collect();
    durations.sort_unstable();
    let median_duration_ms = percentile(&durations, 50);
    let p95_duration_ms = percentile(&durations, 95);

    let approvals = store.approvals_since(since)?;
    let approvals_required = approvals.len() as u64;
    let approvals_granted = approvals
        .iter()
        .filter(|a| a.decision.as_deref() == Some("approve"))
        .count() as u64;

    let steps = store.step_statuses_since(since)?;
    let executed: u64 = steps
        .iter()
        .filter(|(s, _)| *s != StepStatus::Skipped)
        .count() as u64;
    let passing: u64 = steps
        .iter()
        .filter(|(s, _)| s.counts_as_pass())
        .count() as u64;
    let retried: u64 = steps
        .iter()
        .filter(|(s, _)| *s == StepStatus::Retry)
        .count() as u64;
    let verifier_pass_rate = if executed == 0 {
        1.0
    } else {
        passing as f64 / executed as f64
    };
    let retry_rate = if executed == 0 {
        0.0
    } else {
        retried as f64 / executed as f64
    };

    let os_capability_misses = store
        .error_codes_since(since)?
        .iter()
        .filter(|c| c.as_str() == "OS_CAPABILITY_MISS")
        .count() as u64;

    Ok(WindowStats {
        total_runs,
        completed,
        failed,
        cancelled,
        success_rate,
        median_duration_ms,
        p95_duration_ms,
        approvals_required,
        approvals_granted,
        verifier_pass_rate,
        schema_captures: store.evidence_count_since(crate::run::EvidenceKind::DomSchema, since)?,
        web_upload_success: store.steps_output_like_since("uploaded", since)?,
        os_capability_misses,
        l4_autoruns: store.audit_count_since("l4_autorun", since)?,
        policy_blocks: store.policy_blocks_since(since)?,
        deviation_stops: store.audit_count_since("l4_handoff", since)?,
        patches_proposed: store.audit_count_since("patch_proposed", since)?,
        patches_auto_adopted: store.audit_count_since("patch_adopted", since)?,
        retry_rate,
    })
}

fn failure_clusters(store: &RunStore, since: DateTime<Utc>) -> Result<Vec<FailureCluster>> {
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for code in store.error_codes_since(since)? {
        *counts.entry(code).or_insert(0) += 1;
    }
    let mut clusters: Vec<FailureCluster> = counts
        .into_iter()
        .map(|(code, count)| FailureCluster { code, count })
        .collect();
    clusters.sort_by(|a, b| b.count.cmp(&a.count).then(a.code.cmp(&b.code)));
    clusters.truncate(FAILURE_CLUSTER_TOP_K);
    Ok(clusters)
}

fn percentile(sorted: &[u64], p: usize) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (sorted.len() * p).div_ceil(100);
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, StepError};
    use crate::manifest::Manifest;
    use crate::plan::Plan;
    use crate::run::{StepResult, StepStatus};
    use std::collections::BTreeMap as Map;
    use tempfile::TempDir;

    fn store() -> (TempDir, RunStore) {
        let dir = TempDir::new().unwrap();
        let store = RunStore::open_at(dir.path().join("runs.db")).unwrap();
        (dir, store)
    }

    fn manifest() -> Manifest {
        Manifest::derive(
            &Plan::from_yaml_str(
                "dsl_version: \"1.1\"\nname: m\nsteps:\n  - policy_guard:\n",
            )
            .unwrap(),
        )
    }

    fn finished_run(store: &RunStore, state: RunState) -> i64 {
        let run = store
            .create_run("m", "ref", "plan: {}", &manifest(), &Map::new(), "default", 5)
            .unwrap();
        store.transition(run.run_id, RunState::Running).unwrap();
        store.transition(run.run_id, state).unwrap();
        run.run_id
    }

    #[test]
    fn test_success_rate_and_counts() {
        let (_dir, store) = store();
        finished_run(&store, RunState::Completed);
        finished_run(&store, RunState::Completed);
        finished_run(&store, RunState::Failed);
        let snap = snapshot(&store, 3, Utc::now()).unwrap();
        assert_eq!(snap.window_24h.total_runs, 3);
        assert_eq!(snap.window_24h.completed, 2);
        assert_eq!(snap.window_24h.failed, 1);
        assert!((snap.window_24h.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(snap.queue_depth_peak, 3);
        // The 7d window includes everything in the 24h window.
        assert_eq!(snap.window_7d.total_runs, 3);
    }

    #[test]
    fn test_verifier_and_retry_rates() {
        let (_dir, store) = store();
        let run_id = finished_run(&store, RunState::Completed);
        for (i, status) in [
            StepStatus::Pass,
            StepStatus::Retry,
            StepStatus::Fail,
            StepStatus::Skipped,
        ]
        .iter()
        .enumerate()
        {
            store
                .record_step(
                    run_id,
                    &StepResult {
                        step_index: i,
                        status: *status,
                        started_at: Utc::now(),
                        duration_ms: 10,
                        output: serde_json::json!({}),
                        recovery_actions: vec![],
                        evidence: vec![],
                        error: None,
                    },
                )
                .unwrap();
        }
        let snap = snapshot(&store, 0, Utc::now()).unwrap();
        // 3 executed (skipped excluded), 2 counting as pass, 1 retried.
        assert!((snap.window_24h.verifier_pass_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((snap.window_24h.retry_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_failure_clusters_ranked() {
        let (_dir, store) = store();
        let run_id = finished_run(&store, RunState::Failed);
        let codes = [
            ErrorCode::WebElementNotFound,
            ErrorCode::WebElementNotFound,
            ErrorCode::Timeout,
        ];
        for (i, code) in codes.iter().enumerate() {
            store
                .record_step(
                    run_id,
                    &StepResult {
                        step_index: i,
                        status: StepStatus::Fail,
                        started_at: Utc::now(),
                        duration_ms: 5,
                        output: serde_json::json!({}),
                        recovery_actions: vec![],
                        evidence: vec![],
                        error: Some(StepError::new(*code, "x")),
                    },
                )
                .unwrap();
        }
        let snap = snapshot(&store, 0, Utc::now()).unwrap();
        assert_eq!(snap.failure_clusters[0].code, "WEB_ELEMENT_NOT_FOUND");
        assert_eq!(snap.failure_clusters[0].count, 2);
    }

    #[test]
    fn test_counter_sources() {
        let (_dir, store) = store();
        let run_id = finished_run(&store, RunState::Completed);
        store
            .append_audit(Some(run_id), "l4_autorun", serde_json::json!({}))
            .unwrap();
        store
            .append_audit(Some(run_id), "l4_handoff", serde_json::json!({}))
            .unwrap();
        store
            .append_audit(Some(run_id), "patch_proposed", serde_json::json!({}))
            .unwrap();
        store
            .append_audit(Some(run_id), "patch_adopted", serde_json::json!({}))
            .unwrap();
        let snap = snapshot(&store, 0, Utc::now()).unwrap();
        assert_eq!(snap.window_24h.l4_autoruns, 1);
        assert_eq!(snap.window_24h.deviation_stops, 1);
        assert_eq!(snap.window_24h.patches_proposed, 1);
        assert_eq!(snap.window_24h.patches_auto_adopted, 1);
    }

    #[test]
    fn test_percentile_edges() {
        assert_eq!(percentile(&[], 95), 0);
        assert_eq!(percentile(&[10], 50), 10);
        let v: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&v, 50), 50);
        assert_eq!(percentile(&v, 95), 95);
    }
}
