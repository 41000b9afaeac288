//! L4 autopilot monitor.
//!
//! Watches deviations during an autopilot run and triggers safe-fail when
//! the weighted score reaches the threshold or a single high-severity
//! deviation fires. The monitor only observes and requests state
//! transitions; it never mutates step outputs.

use crate::policy::PenaltyWeights;
use crate::run::{Deviation, DeviationKind, Severity};

/// What the executor should do after an observation.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorAction {
    Continue,
    /// Pause the run, checkpoint, create a HITL handoff.
    SafeFail { total_score: u32, reason: String },
}

/// Per-run deviation tracker. Constructed once per run when autopilot is
/// active; inactive monitors record deviations but never safe-fail.
#[derive(Debug)]
pub struct L4Monitor {
    active: bool,
    threshold: u32,
    weights: PenaltyWeights,
    total_score: u32,
    observed: Vec<Deviation>,
}

impl L4Monitor {
    pub fn new(active: bool, threshold: u32, weights: PenaltyWeights) -> Self {
        Self {
            active,
            threshold,
            weights,
            total_score: 0,
            observed: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn total_score(&self) -> u32 {
        self.total_score
    }

    pub fn observed(&self) -> &[Deviation] {
        &self.observed
    }

    fn weight(&self, kind: DeviationKind) -> u32 {
        match kind {
            DeviationKind::VerifierFail => self.weights.verifier_fail,
            DeviationKind::UnexpectedElement => self.weights.unexpected_element,
            DeviationKind::Timing => self.weights.timing,
            DeviationKind::DomainDrift => self.weights.domain_drift,
            DeviationKind::DownloadFail => self.weights.download_fail,
            DeviationKind::RetryCap => self.weights.retry_cap,
        }
    }

    fn severity(kind: DeviationKind) -> Severity {
        match kind {
            DeviationKind::DomainDrift | DeviationKind::DownloadFail => Severity::High,
            DeviationKind::VerifierFail | DeviationKind::UnexpectedElement => Severity::Medium,
            DeviationKind::Timing | DeviationKind::RetryCap => Severity::Low,
        }
    }

    /// Record one deviation and decide whether to safe-fail.
    pub fn observe(
        &mut self,
        run_id: i64,
        step_index: usize,
        kind: DeviationKind,
        reason: impl Into<String>,
    ) -> (Deviation, MonitorAction) {
        let score = self.weight(kind);
        let severity = Self::severity(kind);
        let deviation = Deviation {
            run_id,
            step_index,
            kind,
            severity,
            score,
            reason: reason.into(),
        };
        self.total_score += score;
        self.observed.push(deviation.clone());

        if !self.active {
            return (deviation, MonitorAction::Continue);
        }
        if severity == Severity::High || self.total_score >= self.threshold {
            tracing::warn!(
                run_id,
                step_index,
                kind = kind.as_str(),
                total = self.total_score,
                "deviation threshold reached, safe-fail"
            );
            return (
                deviation.clone(),
                MonitorAction::SafeFail {
                    total_score: self.total_score,
                    reason: format!(
                        "{} at step {step_index} pushed deviation score to {} (threshold {})",
                        kind.as_str(),
                        self.total_score,
                        self.threshold
                    ),
                },
            );
        }
        (deviation, MonitorAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(active: bool) -> L4Monitor {
        L4Monitor::new(active, 3, PenaltyWeights::default())
    }

    #[test]
    fn test_score_accumulates_to_threshold() {
        let mut m = monitor(true);
        // UNEXPECTED_ELEMENT weighs 2: first one continues, second (4 >= 3)
        // safe-fails.
        let (_, a1) = m.observe(1, 2, DeviationKind::UnexpectedElement, "modal");
        assert_eq!(a1, MonitorAction::Continue);
        let (_, a2) = m.observe(1, 4, DeviationKind::UnexpectedElement, "modal again");
        assert!(matches!(a2, MonitorAction::SafeFail { total_score: 4, .. }));
    }

    #[test]
    fn test_high_severity_fires_immediately() {
        let mut m = monitor(true);
        let (dev, action) = m.observe(1, 0, DeviationKind::DomainDrift, "landed on other host");
        assert_eq!(dev.severity, Severity::High);
        assert!(matches!(action, MonitorAction::SafeFail { .. }));
    }

    #[test]
    fn test_low_weight_kinds_accumulate_slowly() {
        let mut m = monitor(true);
        let (_, a1) = m.observe(1, 0, DeviationKind::Timing, "slow");
        let (_, a2) = m.observe(1, 1, DeviationKind::RetryCap, "retries exhausted");
        assert_eq!(a1, MonitorAction::Continue);
        assert_eq!(a2, MonitorAction::Continue);
        let (_, a3) = m.observe(1, 2, DeviationKind::Timing, "slow again");
        assert!(matches!(a3, MonitorAction::SafeFail { total_score: 3, .. }));
    }

    #[test]
    fn test_inactive_monitor_records_but_never_stops() {
        let mut m = monitor(false);
        for i in 0..5 {
            let (_, action) = m.observe(1, i, DeviationKind::DomainDrift, "drift");
            assert_eq!(action, MonitorAction::Continue);
        }
        assert_eq!(m.observed().len(), 5);
        assert!(m.total_score() >= 3);
    }

    #[test]
    fn test_custom_weights() {
        let weights = PenaltyWeights {
            verifier_fail: 1,
            unexpected_element: 1,
            timing: 1,
            domain_drift: 1,
            download_fail: 1,
            retry_cap: 1,
        };
        let mut m = L4Monitor::new(true, 10, weights);
        let (_, action) = m.observe(1, 0, DeviationKind::VerifierFail, "miss");
        assert_eq!(action, MonitorAction::Continue);
        assert_eq!(m.total_score(), 1);
    }
}
