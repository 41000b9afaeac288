//! Run, step result, deviation and patch types.
//!
//! A Run is one execution of a plan. Once queued the executor owns it
//! exclusively; the run store owns persistence. Cyclic references are
//! avoided by keying everything off the numeric `run_id`.

use crate::error::StepError;
use crate::manifest::Manifest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Run lifecycle states.
///
/// `QUEUED → RUNNING → (WAITING_APPROVAL → RUNNING)* → (PAUSED → RUNNING)*
/// → COMPLETED | FAILED | CANCELLED`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Queued,
    Running,
    Paused,
    WaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Queued => "QUEUED",
            RunState::Running => "RUNNING",
            RunState::Paused => "PAUSED",
            RunState::WaitingApproval => "WAITING_APPROVAL",
            RunState::Completed => "COMPLETED",
            RunState::Failed => "FAILED",
            RunState::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<RunState> {
        Some(match s {
            "QUEUED" => RunState::Queued,
            "RUNNING" => RunState::Running,
            "PAUSED" => RunState::Paused,
            "WAITING_APPROVAL" => RunState::WaitingApproval,
            "COMPLETED" => RunState::Completed,
            "FAILED" => RunState::Failed,
            "CANCELLED" => RunState::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }

    /// Legal state-machine transitions. Cancellation is reachable from any
    /// non-terminal state.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        if *self == next {
            return false;
        }
        if next == RunState::Cancelled {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (RunState::Queued, RunState::Running)
                | (RunState::Queued, RunState::Failed)
                | (RunState::Running, RunState::WaitingApproval)
                | (RunState::Running, RunState::Paused)
                | (RunState::Running, RunState::Completed)
                | (RunState::Running, RunState::Failed)
                | (RunState::WaitingApproval, RunState::Running)
                | (RunState::WaitingApproval, RunState::Failed)
                | (RunState::Paused, RunState::Running)
                | (RunState::Paused, RunState::Failed)
        )
    }
}

/// Terminal status of one step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pass,
    Fail,
    Retry,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pass => "PASS",
            StepStatus::Fail => "FAIL",
            StepStatus::Retry => "RETRY",
            StepStatus::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> Option<StepStatus> {
        Some(match s {
            "PASS" => StepStatus::Pass,
            "FAIL" => StepStatus::Fail,
            "RETRY" => StepStatus::Retry,
            "SKIPPED" => StepStatus::Skipped,
            _ => return None,
        })
    }

    /// RETRY counts as pass for success metrics.
    pub fn counts_as_pass(&self) -> bool {
        matches!(self, StepStatus::Pass | StepStatus::Retry)
    }
}

/// Structured note left by a self-recovery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryNote {
    pub action: String,
    pub detail: String,
}

/// Evidence artifact kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Screenshot,
    DomSchema,
}

impl EvidenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceKind::Screenshot => "screenshot",
            EvidenceKind::DomSchema => "dom_schema",
        }
    }
}

/// Content address of one evidence artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRef {
    pub run_id: i64,
    pub step_index: usize,
    pub kind: EvidenceKind,
    pub path: String,
}

/// Result of one executed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: usize,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Action-defined output fields (`found`, `paths`, `page_count`, ...),
    /// already masked.
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recovery_actions: Vec<RecoveryNote>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<EvidenceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

impl StepResult {
    pub fn skipped(step_index: usize, started_at: DateTime<Utc>) -> Self {
        Self {
            step_index,
            status: StepStatus::Skipped,
            started_at,
            duration_ms: 0,
            output: serde_json::json!({}),
            recovery_actions: Vec::new(),
            evidence: Vec::new(),
            error: None,
        }
    }
}

/// One execution of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: i64,
    /// Opaque id for the external, masked view.
    pub public_id: String,
    pub plan_name: String,
    /// Where the plan came from (file path or trigger id).
    pub plan_ref: String,
    /// Variables after resolution, secrets masked.
    pub variables_resolved: BTreeMap<String, serde_json::Value>,
    pub manifest: Manifest,
    pub state: RunState,
    pub queue: String,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_results: Vec<StepResult>,
}

/// Kinds of observed deviation between expected and actual step behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviationKind {
    VerifierFail,
    DomainDrift,
    DownloadFail,
    RetryCap,
    UnexpectedElement,
    Timing,
}

impl DeviationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviationKind::VerifierFail => "VERIFIER_FAIL",
            DeviationKind::DomainDrift => "DOMAIN_DRIFT",
            DeviationKind::DownloadFail => "DOWNLOAD_FAIL",
            DeviationKind::RetryCap => "RETRY_CAP",
            DeviationKind::UnexpectedElement => "UNEXPECTED_ELEMENT",
            DeviationKind::Timing => "TIMING",
        }
    }

    pub fn parse(s: &str) -> Option<DeviationKind> {
        Some(match s {
            "VERIFIER_FAIL" => DeviationKind::VerifierFail,
            "DOMAIN_DRIFT" => DeviationKind::DomainDrift,
            "DOWNLOAD_FAIL" => DeviationKind::DownloadFail,
            "RETRY_CAP" => DeviationKind::RetryCap,
            "UNEXPECTED_ELEMENT" => DeviationKind::UnexpectedElement,
            "TIMING" => DeviationKind::Timing,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

/// One scored deviation observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deviation {
    pub run_id: i64,
    pub step_index: usize,
    pub kind: DeviationKind,
    pub severity: Severity,
    pub score: u32,
    pub reason: String,
}

/// Planner-L2 patch kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchKind {
    ReplaceText,
    FallbackSearch,
    WaitTuning,
    AddStep,
}

impl PatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchKind::ReplaceText => "replace_text",
            PatchKind::FallbackSearch => "fallback_search",
            PatchKind::WaitTuning => "wait_tuning",
            PatchKind::AddStep => "add_step",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// A differential patch proposal for the remainder of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    pub kind: PatchKind,
    pub step_index: usize,
    pub payload: serde_json::Value,
    pub confidence: f64,
    pub risk_level: RiskLevel,
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_happy_path() {
        assert!(RunState::Queued.can_transition_to(RunState::Running));
        assert!(RunState::Running.can_transition_to(RunState::WaitingApproval));
        assert!(RunState::WaitingApproval.can_transition_to(RunState::Running));
        assert!(RunState::Running.can_transition_to(RunState::Paused));
        assert!(RunState::Paused.can_transition_to(RunState::Running));
        assert!(RunState::Running.can_transition_to(RunState::Completed));
    }

    #[test]
    fn test_policy_block_path() {
        // S2: a blocked run goes QUEUED -> FAILED without entering RUNNING.
        assert!(RunState::Queued.can_transition_to(RunState::Failed));
        assert!(!RunState::Queued.can_transition_to(RunState::Completed));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [RunState::Completed, RunState::Failed, RunState::Cancelled] {
            assert!(terminal.is_terminal());
            for next in [
                RunState::Queued,
                RunState::Running,
                RunState::Paused,
                RunState::WaitingApproval,
                RunState::Completed,
                RunState::Failed,
                RunState::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal:?} -> {next:?}");
            }
        }
    }

    #[test]
    fn test_cancel_from_any_live_state() {
        for live in [
            RunState::Queued,
            RunState::Running,
            RunState::Paused,
            RunState::WaitingApproval,
        ] {
            assert!(live.can_transition_to(RunState::Cancelled));
        }
    }

    #[test]
    fn test_state_string_roundtrip() {
        for state in [
            RunState::Queued,
            RunState::Running,
            RunState::Paused,
            RunState::WaitingApproval,
            RunState::Completed,
            RunState::Failed,
            RunState::Cancelled,
        ] {
            assert_eq!(RunState::parse(state.as_str()), Some(state));
        }
        assert_eq!(RunState::parse("BOGUS"), None);
    }

    #[test]
    fn test_retry_counts_as_pass() {
        assert!(StepStatus::Retry.counts_as_pass());
        assert!(StepStatus::Pass.counts_as_pass());
        assert!(!StepStatus::Fail.counts_as_pass());
        assert!(!StepStatus::Skipped.counts_as_pass());
    }

    #[test]
    fn test_skipped_result_has_zero_duration() {
        let r = StepResult::skipped(4, Utc::now());
        assert_eq!(r.duration_ms, 0);
        assert_eq!(r.status, StepStatus::Skipped);
    }
}
