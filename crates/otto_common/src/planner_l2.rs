//! Planner-L2: differential patch proposals.
//!
//! On a step failure the planner looks at the error and the current DOM
//! schema and proposes at most one small patch: a text replacement, a
//! fallback search, or a timeout widening. Patches apply to an in-memory
//! copy of the plan for the remainder of the run; the template file on disk
//! is never modified.
//!
//! Application refuses any patch that would grow the plan's risk set.

use crate::error::{ErrorCode, StepError};
use crate::manifest::Manifest;
use crate::plan::{Action, Plan, Step};
use crate::policy::AdoptPolicy;
use crate::run::{Patch, PatchKind, RiskLevel};
use crate::web_engine::DomSchema;
use chrono::Utc;

/// Timeout cap for wait_tuning proposals.
const WAIT_TUNING_CAP_MS: u64 = 30_000;
/// Default timeout assumed when the failing step declared none.
const WAIT_TUNING_BASE_MS: u64 = 5_000;
/// Maximum synonyms recorded in a fallback_search patch.
const FALLBACK_SYNONYM_LIMIT: usize = 4;

/// Bounded, read-only synonym groups for UI label recovery. Loaded once;
/// never expanded at runtime.
const SYNONYM_GROUPS: &[&[&str]] = &[
    &["送信", "確定", "送る", "submit", "send", "ok"],
    &["キャンセル", "cancel", "戻る", "back", "close"],
    &["保存", "save", "apply", "適用"],
    &["次へ", "next", "continue", "続行", "proceed"],
    &["ログイン", "login", "log in", "sign in", "サインイン"],
    &["アップロード", "upload", "choose file", "ファイルを選択"],
    &["検索", "search", "find", "lookup"],
];

/// Synonyms of a label, from the built-in table.
pub fn synonyms_of(text: &str) -> Vec<&'static str> {
    let lower = text.to_lowercase();
    for group in SYNONYM_GROUPS {
        if group.iter().any(|s| s.to_lowercase() == lower) {
            return group
                .iter()
                .copied()
                .filter(|s| s.to_lowercase() != lower)
                .collect();
        }
    }
    Vec::new()
}

/// Propose at most one patch for a failing step.
pub fn propose(step: &Step, error: &StepError, schema: Option<&DomSchema>) -> Option<Patch> {
    match error.code {
        ErrorCode::WebElementNotFound => propose_for_missing_element(step, schema),
        ErrorCode::Timeout | ErrorCode::VerifierTimeout | ErrorCode::DownloadTimeout => {
            propose_wait_tuning(step)
        }
        _ => None,
    }
}

fn failing_label(step: &Step) -> Option<(&str, Option<&str>)> {
    match &step.action {
        Action::ClickByText(p) => Some((p.text.as_str(), p.role.as_deref())),
        Action::FillByLabel(p) => Some((p.label.as_str(), None)),
        Action::WaitForElement(p) => p.text.as_deref().map(|t| (t, None)),
        Action::AssertElement(p) => p.text.as_deref().map(|t| (t, None)),
        _ => None,
    }
}

fn propose_for_missing_element(step: &Step, schema: Option<&DomSchema>) -> Option<Patch> {
    let (target, role) = failing_label(step)?;
    let schema = schema?;

    // replace_text: a schema element whose text is a known synonym of the
    // target, with the role preserved when the step names one.
    let candidates = synonyms_of(target);
    let mut best: Option<(&str, f64)> = None;
    for element in &schema.elements {
        if let Some(required_role) = role {
            if element.role.as_deref() != Some(required_role) {
                continue;
            }
        }
        let Some(text) = element.text.as_deref() else {
            continue;
        };
        let strength = match_strength(text, &candidates);
        if strength > 0.0 && best.map(|(_, s)| strength > s).unwrap_or(true) {
            best = Some((text, strength));
        }
    }
    if let Some((replacement, confidence)) = best {
        return Some(Patch {
            kind: PatchKind::ReplaceText,
            step_index: step.index,
            payload: serde_json::json!({
                "from": target,
                "to": replacement,
                "role_preserved": role.is_some(),
            }),
            confidence,
            // Role-preserving text replacement is always low risk.
            risk_level: RiskLevel::Low,
            generated_at: Utc::now(),
        });
    }

    // fallback_search: record the goal phrase and a bounded synonym list
    // for a single broadened retry.
    let synonyms: Vec<&str> = candidates.into_iter().take(FALLBACK_SYNONYM_LIMIT).collect();
    Some(Patch {
        kind: PatchKind::FallbackSearch,
        step_index: step.index,
        payload: serde_json::json!({
            "goal": target,
            "synonyms": synonyms,
            "attempts": 1,
        }),
        confidence: 0.6,
        risk_level: RiskLevel::Low,
        generated_at: Utc::now(),
    })
}

/// Monotonically increasing in match strength: exact synonym beats
/// case-folded beats substring.
fn match_strength(text: &str, synonyms: &[&str]) -> f64 {
    if synonyms.contains(&text) {
        return 0.9;
    }
    let lower = text.to_lowercase();
    if synonyms.iter().any(|s| s.to_lowercase() == lower) {
        return 0.85;
    }
    if synonyms
        .iter()
        .any(|s| lower.contains(&s.to_lowercase()) || s.to_lowercase().contains(&lower))
    {
        return 0.7;
    }
    0.0
}

fn propose_wait_tuning(step: &Step) -> Option<Patch> {
    let old = step
        .timeout_ms
        .or(match &step.action {
            Action::WaitForElement(p) => p.timeout_ms,
            Action::WaitForDownload(p) => p.timeout_ms,
            _ => None,
        })
        .unwrap_or(WAIT_TUNING_BASE_MS);
    let new = (old * 2).min(WAIT_TUNING_CAP_MS);
    if new == old {
        return None;
    }
    Some(Patch {
        kind: PatchKind::WaitTuning,
        step_index: step.index,
        payload: serde_json::json!({
            "old_timeout_ms": old,
            "new_timeout_ms": new,
        }),
        confidence: 0.9,
        risk_level: RiskLevel::Low,
        generated_at: Utc::now(),
    })
}

/// Apply a patch, producing the plan for the remainder of the run.
///
/// Refused when the patched plan's risk set grows or when the patch kind
/// cannot be applied structurally (`add_step` is never applied).
pub fn apply(plan: &Plan, patch: &Patch) -> Result<Plan, StepError> {
    let mut patched = plan.clone();
    let step = patched
        .steps
        .get_mut(patch.step_index)
        .ok_or_else(|| StepError::new(ErrorCode::Internal, "patch targets missing step"))?;

    match patch.kind {
        PatchKind::ReplaceText => {
            let to = patch.payload["to"]
                .as_str()
                .ok_or_else(|| StepError::new(ErrorCode::Internal, "replace_text without 'to'"))?
                .to_string();
            match &mut step.action {
                Action::ClickByText(p) => p.text = to,
                Action::FillByLabel(p) => p.label = to,
                Action::WaitForElement(p) => p.text = Some(to),
                Action::AssertElement(p) => p.text = Some(to),
                _ => {
                    return Err(StepError::new(
                        ErrorCode::Internal,
                        "replace_text does not apply to this action",
                    ))
                }
            }
        }
        PatchKind::WaitTuning => {
            let new = patch.payload["new_timeout_ms"].as_u64().ok_or_else(|| {
                StepError::new(ErrorCode::Internal, "wait_tuning without new_timeout_ms")
            })?;
            step.timeout_ms = Some(new);
            if let Action::WaitForElement(p) = &mut step.action {
                p.timeout_ms = Some(new);
            }
            if let Action::WaitForDownload(p) = &mut step.action {
                p.timeout_ms = Some(new);
            }
        }
        // The payload drives the executor's single broadened retry; the
        // plan itself is unchanged.
        PatchKind::FallbackSearch => {}
        PatchKind::AddStep => {
            return Err(StepError::new(
                ErrorCode::Internal,
                "add_step patches are never applied",
            ))
        }
    }

    // Patch safety: the rewritten plan's risk set must not grow.
    let before = Manifest::derive(plan).risk_flags;
    let after = Manifest::derive(&patched).risk_flags;
    if !after.is_subset(&before) {
        let grown: Vec<&str> = after.difference(&before).map(|f| f.as_str()).collect();
        return Err(StepError::new(
            ErrorCode::PolicyBlocked,
            format!("patch refused: it would add risk(s) {}", grown.join(", ")),
        ));
    }

    Ok(patched)
}

/// Everything the adoption decision needs besides the policy itself.
#[derive(Debug, Clone, Copy)]
pub struct AdoptionContext {
    pub autopilot_enabled: bool,
    pub policy_window_ok: bool,
    pub auto_changes_so_far: u32,
}

/// Auto-adopt only when every condition holds; otherwise the patch is
/// surfaced as a proposal awaiting human approval.
pub fn should_auto_adopt(policy: &AdoptPolicy, patch: &Patch, ctx: &AdoptionContext) -> bool {
    policy.low_risk_auto
        && ctx.autopilot_enabled
        && ctx.policy_window_ok
        && patch.risk_level == RiskLevel::Low
        && patch.confidence >= policy.min_confidence
        && ctx.auto_changes_so_far < policy.max_auto_changes
}
