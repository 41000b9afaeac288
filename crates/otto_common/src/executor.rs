//! Step executor.
//!
//! Runs one plan to completion or suspension on the calling thread. Per
//! step: evaluate `when`, substitute expressions (secrets last, masked on
//! the way out), dispatch to the OS/web adapters, capture evidence, run the
//! verifier for assertion steps, apply the retry policy, commit the result.
//!
//! Suspension points (HITL approval, L4 safe-fail, external pause,
//! cancellation) always persist a checkpoint before returning the worker.

use crate::audit::PolicyAuditLog;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::EvidenceSettings;
use crate::error::{ErrorCode, StepError};
use crate::evidence::EvidenceVault;
use crate::expr::{self, ExprContext, WhenExpr};
use crate::manifest::{Capability, Manifest};
use crate::monitor::L4Monitor;
use crate::os_adapter::OsAdapter;
use crate::plan::{Action, AutoAction, Plan, RetrySpec, Step, StringList};
use crate::planner_l2::{self, AdoptionContext};
use crate::policy::{self, PolicyConfig, SignatureStatus};
use crate::run::{DeviationKind, RecoveryNote, RunState, StepResult, StepStatus};
use crate::secrets::{Masker, SecretsResolver};
use crate::store::RunStore;
use crate::verifier::{self, VerifierOutcome};
use crate::web_engine::{Target, WebBatch, WebEngine, WebOp};
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Why a run suspended without reaching a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub enum SuspendReason {
    Approval { step_index: usize },
    SafeFail { reason: String },
    UserPause,
}

/// Outcome of one executor invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    Completed,
    Failed(StepError),
    Suspended(SuspendReason),
    Cancelled,
}

/// Everything the executor needs; constructed once and shared by workers.
pub struct Executor {
    pub store: Arc<RunStore>,
    pub checkpoints: Arc<CheckpointStore>,
    pub vault: Arc<EvidenceVault>,
    pub audit: Arc<PolicyAuditLog>,
    pub secrets: Arc<SecretsResolver>,
    pub os: Arc<dyn OsAdapter>,
    pub web: Arc<dyn WebEngine>,
    /// Serializes engine access when the engine declares concurrency 1.
    pub web_gate: Arc<std::sync::Mutex<()>>,
    pub policy: PolicyConfig,
    pub evidence: EvidenceSettings,
    pub checkpoint_every: usize,
    pub work_dir: PathBuf,
}

struct RunCtx {
    run_id: i64,
    plan: Plan,
    manifest: Manifest,
    variables: BTreeMap<String, serde_json::Value>,
    outputs: BTreeMap<usize, serde_json::Value>,
    masker: Masker,
    monitor: L4Monitor,
    auto_changes: u32,
    allowlist: Option<Vec<String>>,
}

impl Executor {
    /// Drive a run from whatever state it is in: fresh start for QUEUED,
    /// checkpoint resume for WAITING_APPROVAL/PAUSED.
    pub fn advance(&self, run_id: i64) -> anyhow::Result<ExecOutcome> {
        match self.store.state(run_id)? {
            RunState::Queued => self.run(run_id),
            RunState::WaitingApproval | RunState::Paused => self.resume(run_id),
            RunState::Cancelled => Ok(ExecOutcome::Cancelled),
            other => anyhow::bail!("run {run_id} is {} and cannot be driven", other.as_str()),
        }
    }

    /// Execute a queued run from the top.
    pub fn run(&self, run_id: i64) -> anyhow::Result<ExecOutcome> {
        let mut ctx = self.load_ctx(run_id, None)?;
        self.store.transition(run_id, RunState::Running)?;
        if ctx.monitor.is_active() {
            let _ = self
                .store
                .append_audit(Some(run_id), "l4_autorun", serde_json::json!({}));
        }
        Ok(self.execute_from(&mut ctx, 0))
    }

    /// Resume a suspended run from its checkpoint.
    pub fn resume(&self, run_id: i64) -> anyhow::Result<ExecOutcome> {
        let checkpoint = self
            .checkpoints
            .load(run_id)?
            .ok_or_else(|| anyhow::anyhow!("no checkpoint for run {run_id}"))?;
        let next = checkpoint.next_step_index;
        let mut ctx = self.load_ctx(run_id, Some(checkpoint))?;
        self.store.transition(run_id, RunState::Running)?;
        Ok(self.execute_from(&mut ctx, next))
    }

    fn load_ctx(&self, run_id: i64, checkpoint: Option<Checkpoint>) -> anyhow::Result<RunCtx> {
        let run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| anyhow::anyhow!("run {run_id} not found"))?;
        let plan = Plan::from_yaml_str(&self.store.plan_yaml(run_id)?)?;
        let manifest = run.manifest.clone();

        // L4 is active only when the policy says autopilot and the gate is
        // green right now.
        let capabilities = self
            .os
            .capabilities()
            .into_iter()
            .map(|(c, d)| (c, d.available))
            .collect();
        let decision = policy::evaluate(
            &self.policy,
            &manifest,
            SignatureStatus::NotSigned,
            &capabilities,
            Utc::now(),
        );
        let autopilot = policy::autopilot_permitted(&self.policy, &decision);
        let monitor = L4Monitor::new(
            autopilot,
            self.policy.deviation_threshold,
            self.policy.penalties.clone(),
        );

        let allowlist = {
            let mut hosts = manifest.target_domains.clone();
            hosts.extend(self.policy.allow_domains.iter().cloned());
            if hosts.is_empty() {
                None
            } else {
                Some(hosts)
            }
        };

        let (variables, outputs) = match checkpoint {
            Some(cp) => (cp.variables, cp.step_outputs),
            None => (plan.variables.clone(), BTreeMap::new()),
        };

        Ok(RunCtx {
            run_id,
            plan,
            manifest,
            variables,
            outputs,
            masker: Masker::default(),
            monitor,
            auto_changes: 0,
            allowlist,
        })
    }

    fn execute_from(&self, ctx: &mut RunCtx, start_index: usize) -> ExecOutcome {
        let retry = ctx.plan.retry_spec();
        let mut completed_since_checkpoint = 0usize;
        let mut index = start_index;

        while index < ctx.plan.steps.len() {
            // Cancellation and external pause are honored at step
            // boundaries, with a checkpoint either way.
            match self.store.state(ctx.run_id) {
                Ok(RunState::Cancelled) => {
                    self.save_checkpoint(ctx, index);
                    return ExecOutcome::Cancelled;
                }
                Ok(RunState::Paused) => {
                    self.save_checkpoint(ctx, index);
                    return ExecOutcome::Suspended(SuspendReason::UserPause);
                }
                _ => {}
            }

            let step = ctx.plan.steps[index].clone();
            match self.execute_step(ctx, &step, &retry) {
                StepFlow::Advance => {
                    completed_since_checkpoint += 1;
                    if self.checkpoint_every > 0 && completed_since_checkpoint >= self.checkpoint_every
                    {
                        self.save_checkpoint(ctx, index + 1);
                        completed_since_checkpoint = 0;
                    }
                    index += 1;
                }
                StepFlow::Suspend(reason) => return ExecOutcome::Suspended(reason),
                StepFlow::Abort(error) => {
                    let _ = self.store.transition(ctx.run_id, RunState::Failed);
                    let _ = self.audit.append(
                        "run_failed",
                        Some(ctx.run_id),
                        json!({"code": error.code.as_str(), "step": error.step_index}),
                    );
                    return ExecOutcome::Failed(error);
                }
            }
        }

        if let Err(e) = self.store.transition(ctx.run_id, RunState::Completed) {
            tracing::error!(run_id = ctx.run_id, "completion transition failed: {e}");
        }
        let _ = self.checkpoints.invalidate(ctx.run_id);
        let _ = self
            .audit
            .append("run_completed", Some(ctx.run_id), json!({}));
        ExecOutcome::Completed
    }

    fn execute_step(&self, ctx: &mut RunCtx, step: &Step, retry: &RetrySpec) -> StepFlow {
        let started_at = Utc::now();
        let timer = Instant::now();
        let run_id = ctx.run_id;

        // (1) `when`
        if let Some(when_src) = &step.when {
            match self.eval_when(ctx, when_src) {
                Ok(true) => {}
                Ok(false) => {
                    let result = StepResult::skipped(step.index, started_at);
                    if let Err(e) = self.store.record_step(run_id, &result) {
                        tracing::error!(run_id, "record skipped step: {e}");
                    }
                    return StepFlow::Advance;
                }
                Err(e) => {
                    let error = StepError::new(ErrorCode::ValidationFailed, e.to_string())
                        .at_step(step.index);
                    return self.fail_step(ctx, step, started_at, timer, Vec::new(), error);
                }
            }
        }

        // (2) substitution, secrets last and masked on output
        let mut action = step.action.clone();
        if let Err(e) = self.substitute_action(ctx, &mut action) {
            let error =
                StepError::new(ErrorCode::ValidationFailed, e.to_string()).at_step(step.index);
            return self.fail_step(ctx, step, started_at, timer, Vec::new(), error);
        }

        // HITL and policy_guard are control steps, not adapter calls.
        if let Action::HumanConfirm(params) = &action {
            return self.handle_human_confirm(ctx, step, params.clone(), started_at, timer);
        }
        if let Action::PolicyGuard(_) = &action {
            return self.handle_policy_guard(ctx, step, started_at, timer);
        }

        // (5) verification actions go through the verifier.
        if action.is_assertion() {
            return self.handle_assertion(ctx, step, &action, started_at, timer);
        }

        // (3)+(6) adapter dispatch with retries and one-shot recovery.
        let mut recovery: Vec<RecoveryNote> = Vec::new();
        let mut attempts: u32 = 0;
        let mut recovered = false;
        let mut broaden = false;
        let mut patched_once = false;
        let max_attempts = retry.max_attempts.max(1);

        loop {
            attempts += 1;
            match self.perform(ctx, step, &action, broaden) {
                Ok(output) => {
                    if let Some(flow) =
                        self.observe_success(ctx, step, &output, timer.elapsed().as_millis() as u64)
                    {
                        return flow;
                    }
                    let status = if attempts > 1 {
                        StepStatus::Retry
                    } else {
                        StepStatus::Pass
                    };
                    return self.commit_step(
                        ctx, step, status, started_at, timer, output, recovery, None,
                    );
                }
                Err(error) => {
                    // Deterministic self-recovery, at most once per step.
                    if !recovered {
                        if let Some(note) = self.try_recovery(ctx, step, &mut action, &error) {
                            recovery.push(note);
                            recovered = true;
                            if action.is_web() {
                                broaden = true;
                            }
                            continue;
                        }
                    }
                    if error.retryable() && attempts < max_attempts {
                        let backoff = retry.backoff_ms.saturating_mul(1 << (attempts - 1).min(16));
                        std::thread::sleep(std::time::Duration::from_millis(backoff));
                        continue;
                    }
                    if error.retryable() && attempts >= max_attempts {
                        self.report_deviation(
                            ctx,
                            step.index,
                            DeviationKind::RetryCap,
                            format!("{} after {attempts} attempts", error.code),
                        );
                        if let Some(flow) = self.check_monitor(ctx, step.index) {
                            return flow;
                        }
                    }
                    if matches!(
                        error.code,
                        ErrorCode::DownloadTimeout | ErrorCode::DownloadIncomplete
                    ) {
                        self.report_deviation(
                            ctx,
                            step.index,
                            DeviationKind::DownloadFail,
                            error.message.clone(),
                        );
                        if let Some(flow) = self.check_monitor(ctx, step.index) {
                            return flow;
                        }
                    }

                    // Planner-L2: at most one adopted patch per failure.
                    if !patched_once {
                        if let Some(flow) = self.try_patch(ctx, step, &error, &mut patched_once) {
                            match flow {
                                PatchFlow::RetryStep => {
                                    // Re-read the possibly patched action.
                                    let mut patched_action =
                                        ctx.plan.steps[step.index].action.clone();
                                    if self.substitute_action(ctx, &mut patched_action).is_ok() {
                                        action = patched_action;
                                    }
                                    broaden = true;
                                    continue;
                                }
                            }
                        }
                    }

                    return self.fail_step(
                        ctx,
                        step,
                        started_at,
                        timer,
                        recovery,
                        error.at_step(step.index),
                    );
                }
            }
        }
    }

    // -- control steps ------------------------------------------------------

    fn handle_human_confirm(
        &self,
        ctx: &mut RunCtx,
        step: &Step,
        params: crate::plan::HumanConfirmParams,
        started_at: chrono::DateTime<Utc>,
        timer: Instant,
    ) -> StepFlow {
        let run_id = ctx.run_id;
        // A decided approval for this step means we are resuming.
        match self.store.latest_approval(run_id, step.index) {
            Ok(Some(record)) if record.decided_at.is_some() => {
                let decision = record.decision.as_deref().unwrap_or("deny");
                match decision {
                    "approve" => {
                        if let Some(required) = &step.required_role {
                            if record.approver_role.as_deref() != Some(required.as_str()) {
                                let error = StepError::new(
                                    ErrorCode::ApprovalDenied,
                                    format!(
                                        "approver role '{}' does not satisfy required role '{required}'",
                                        record.approver_role.as_deref().unwrap_or("none")
                                    ),
                                )
                                .at_step(step.index);
                                return self.fail_step(ctx, step, started_at, timer, Vec::new(), error);
                            }
                        }
                        let output = json!({
                            "approved": true,
                            "approver_role": record.approver_role,
                        });
                        self.commit_step(
                            ctx,
                            step,
                            StepStatus::Pass,
                            started_at,
                            timer,
                            output,
                            Vec::new(),
                            None,
                        )
                    }
                    "timeout" => match record.auto_action {
                        AutoAction::Approve => {
                            let output = json!({"approved": true, "auto": true});
                            self.commit_step(
                                ctx,
                                step,
                                StepStatus::Pass,
                                started_at,
                                timer,
                                output,
                                Vec::new(),
                                None,
                            )
                        }
                        AutoAction::Deny => {
                            let error = StepError::new(
                                ErrorCode::ApprovalTimeout,
                                format!("approval timed out after {:?} minutes", record.timeout_minutes),
                            )
                            .at_step(step.index);
                            self.fail_step(ctx, step, started_at, timer, Vec::new(), error)
                        }
                    },
                    _ => {
                        let error = StepError::new(
                            ErrorCode::ApprovalDenied,
                            "approval was denied".to_string(),
                        )
                        .at_step(step.index);
                        self.fail_step(ctx, step, started_at, timer, Vec::new(), error)
                    }
                }
            }
            _ => {
                // First arrival: request approval and suspend.
                if let Err(e) = self.store.create_approval(
                    run_id,
                    step.index,
                    &params.message,
                    step.required_role.as_deref(),
                    params.timeout_minutes,
                    params.auto_action,
                ) {
                    let error = StepError::new(ErrorCode::Internal, e.to_string()).at_step(step.index);
                    return self.fail_step(ctx, step, started_at, timer, Vec::new(), error);
                }
                self.save_checkpoint(ctx, step.index);
                if let Err(e) = self.store.transition(run_id, RunState::WaitingApproval) {
                    tracing::error!(run_id, "transition to WAITING_APPROVAL failed: {e}");
                }
                let _ = self.audit.append(
                    "approval_requested",
                    Some(run_id),
                    json!({
                        "step": step.index,
                        "message": params.message,
                        "required_role": step.required_role,
                        "timeout_minutes": params.timeout_minutes,
                    }),
                );
                StepFlow::Suspend(SuspendReason::Approval {
                    step_index: step.index,
                })
            }
        }
    }

    fn handle_policy_guard(
        &self,
        ctx: &mut RunCtx,
        step: &Step,
        started_at: chrono::DateTime<Utc>,
        timer: Instant,
    ) -> StepFlow {
        let capabilities = self
            .os
            .capabilities()
            .into_iter()
            .map(|(c, d)| (c, d.available))
            .collect();
        let decision = policy::evaluate(
            &self.policy,
            &ctx.manifest,
            SignatureStatus::NotSigned,
            &capabilities,
            Utc::now(),
        );
        let _ = self.store.record_policy_decision(ctx.run_id, &decision);
        let _ = self.audit.append(
            "policy_guard",
            Some(ctx.run_id),
            json!({"allowed": decision.allowed, "step": step.index}),
        );
        let output = json!({
            "checks": decision.checks,
            "allowed": decision.allowed,
        });
        if decision.allowed {
            self.commit_step(
                ctx,
                step,
                StepStatus::Pass,
                started_at,
                timer,
                output,
                Vec::new(),
                None,
            )
        } else {
            let reasons: Vec<String> = decision
                .blocked_reasons()
                .iter()
                .map(|c| c.reason_code.clone())
                .collect();
            let error = StepError::new(
                ErrorCode::PolicyBlocked,
                format!("policy guard blocked: {}", reasons.join(", ")),
            )
            .at_step(step.index);
            self.fail_step(ctx, step, started_at, timer, Vec::new(), error)
        }
    }

    fn handle_assertion(
        &self,
        ctx: &mut RunCtx,
        step: &Step,
        action: &Action,
        started_at: chrono::DateTime<Utc>,
        timer: Instant,
    ) -> StepFlow {
        let verdict = verifier::verify(action, step.timeout_ms, self.web.as_ref(), self.os.as_ref());
        match verdict.outcome {
            VerifierOutcome::Pass => self.commit_step(
                ctx,
                step,
                StepStatus::Pass,
                started_at,
                timer,
                json!({"verified": true, "detail": verdict.detail}),
                Vec::new(),
                None,
            ),
            VerifierOutcome::Retry => {
                // Second-try success is a timing deviation worth recording.
                self.report_deviation(
                    ctx,
                    step.index,
                    DeviationKind::Timing,
                    format!("verifier needed extended retry: {}", verdict.detail),
                );
                if let Some(flow) = self.check_monitor(ctx, step.index) {
                    return flow;
                }
                self.commit_step(
                    ctx,
                    step,
                    StepStatus::Retry,
                    started_at,
                    timer,
                    json!({"verified": true, "detail": verdict.detail, "retried": true}),
                    Vec::new(),
                    None,
                )
            }
            VerifierOutcome::Fail => {
                let error = verdict
                    .error
                    .unwrap_or_else(|| StepError::new(ErrorCode::VerifierFail, "verifier failed"))
                    .at_step(step.index);
                self.report_deviation(
                    ctx,
                    step.index,
                    DeviationKind::VerifierFail,
                    error.message.clone(),
                );
                if let Some(flow) = self.check_monitor(ctx, step.index) {
                    return flow;
                }
                // Verifier FAIL aborts the run.
                self.fail_step(ctx, step, started_at, timer, Vec::new(), error)
            }
        }
    }

    // -- dispatch -----------------------------------------------------------

    fn perform(
        &self,
        ctx: &mut RunCtx,
        step: &Step,
        action: &Action,
        broaden: bool,
    ) -> Result<serde_json::Value, StepError> {
        match action {
            Action::FindFiles(p) => {
                let roots: Vec<PathBuf> = p.roots.iter().map(PathBuf::from).collect();
                let limit = p.limit.unwrap_or(100) as usize;
                let paths = self.os.find_files(&p.query, &roots, limit)?;
                if paths.is_empty() {
                    return Err(StepError::new(
                        ErrorCode::FileNotFound,
                        format!("no files matching '{}'", p.query),
                    ));
                }
                Ok(json!({
                    "found": paths.len(),
                    "paths": paths.iter().map(|p| p.to_string_lossy()).collect::<Vec<_>>(),
                }))
            }
            Action::Rename(p) => {
                let renamed = self.os.rename(Path::new(&p.path), &p.pattern)?;
                Ok(json!({"path": renamed.to_string_lossy()}))
            }
            Action::MoveTo(p) => {
                let outcome =
                    self.os
                        .move_to(Path::new(&p.path), Path::new(&p.dest), p.overwrite_if_exists)?;
                Ok(json!({
                    "path": outcome.path.to_string_lossy(),
                    "created_dir": outcome.created_dir,
                }))
            }
            Action::PdfMerge(p) => {
                let inputs = string_list_paths(&p.inputs);
                let output = p
                    .output
                    .as_ref()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| {
                        self.work_dir
                            .join(format!("run_{}_step_{}_merged.pdf", ctx.run_id, step.index))
                    });
                let outcome = self.os.pdf_merge(&inputs, &output)?;
                Ok(json!({
                    "path": outcome.path.to_string_lossy(),
                    "page_count": outcome.page_count,
                }))
            }
            Action::PdfExtractPages(p) => {
                let output = p
                    .output
                    .as_ref()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| {
                        self.work_dir
                            .join(format!("run_{}_step_{}_extract.pdf", ctx.run_id, step.index))
                    });
                let outcome = self
                    .os
                    .pdf_extract_pages(Path::new(&p.path), &p.ranges, &output)?;
                Ok(json!({
                    "path": outcome.path.to_string_lossy(),
                    "page_count": outcome.page_count,
                }))
            }
            Action::ComposeMail(p) => {
                let draft_id = self.os.compose_mail(&p.to, &p.subject, &p.body)?;
                Ok(json!({"draft_id": draft_id}))
            }
            Action::AttachFiles(p) => {
                let draft_id = p
                    .draft_id
                    .clone()
                    .or_else(|| latest_draft(&ctx.outputs))
                    .ok_or_else(|| {
                        StepError::new(ErrorCode::Internal, "no draft to attach files to")
                    })?;
                let files = string_list_paths(&p.files);
                self.os.attach_files(&draft_id, &files)?;
                Ok(json!({"draft_id": draft_id, "attached": files.len()}))
            }
            Action::SaveDraft(p) => {
                let draft_id = p
                    .draft_id
                    .clone()
                    .or_else(|| latest_draft(&ctx.outputs))
                    .ok_or_else(|| StepError::new(ErrorCode::Internal, "no draft to save"))?;
                let saved = self.os.save_draft(&draft_id)?;
                Ok(json!({"draft_id": saved}))
            }
            Action::OpenBrowser(p) => self.web_single(
                ctx,
                WebOp::Open {
                    url: p.url.clone(),
                    context: p.context.clone(),
                },
            ),
            Action::FillByLabel(p) => self.web_single(
                ctx,
                WebOp::Fill {
                    target: Target::Label(p.label.clone()),
                    text: p.text.clone(),
                    frame: p.frame.clone(),
                },
            ),
            Action::ClickByText(p) => self.web_single(
                ctx,
                WebOp::Click {
                    target: Target::Text(p.text.clone()),
                    role: p.role.clone(),
                    frame: p.frame.clone(),
                    broaden,
                },
            ),
            Action::UploadFile(p) => {
                let target = p
                    .selector
                    .clone()
                    .map(Target::Selector)
                    .or_else(|| p.label.clone().map(Target::Label))
                    .ok_or_else(|| {
                        StepError::new(ErrorCode::Internal, "upload_file without target")
                    })?;
                self.web_single(
                    ctx,
                    WebOp::Upload {
                        target,
                        path: p.path.clone(),
                    },
                )
            }
            Action::DownloadFile(p) => {
                let op = match (&p.url, &p.click_text) {
                    (Some(url), _) => WebOp::Open {
                        url: url.clone(),
                        context: None,
                    },
                    (None, Some(text)) => WebOp::Click {
                        target: Target::Text(text.clone()),
                        role: None,
                        frame: None,
                        broaden,
                    },
                    (None, None) => {
                        return Err(StepError::new(
                            ErrorCode::Internal,
                            "download_file without url or click_text",
                        ))
                    }
                };
                let mut result = self.web_single(ctx, op)?;
                if let Some(obj) = result.as_object_mut() {
                    obj.insert("to".to_string(), json!(p.to));
                    obj.insert("started".to_string(), json!(true));
                }
                Ok(result)
            }
            Action::WaitForDownload(p) => self.web_single(
                ctx,
                WebOp::WaitForDownload {
                    to: p.to.clone(),
                    timeout_ms: p.timeout_ms.or(step.timeout_ms).unwrap_or(10_000),
                },
            ),
            Action::CaptureScreenSchema(p) => self.web_single(
                ctx,
                WebOp::CaptureDomSchema {
                    target: p.target.clone(),
                },
            ),
            // Handled before dispatch.
            Action::HumanConfirm(_)
            | Action::PolicyGuard(_)
            | Action::WaitForElement(_)
            | Action::AssertElement(_)
            | Action::AssertText(_)
            | Action::AssertFileExists(_)
            | Action::AssertPdfPages(_) => Err(StepError::new(
                ErrorCode::Internal,
                format!("'{}' reached adapter dispatch", action.name()),
            )),
        }
    }

    fn web_single(&self, ctx: &RunCtx, op: WebOp) -> Result<serde_json::Value, StepError> {
        let batch = WebBatch::one(op);
        if let Some(allowlist) = &ctx.allowlist {
            batch.check_hosts(allowlist)?;
        }
        // The engine is a capability singleton; honor its declared
        // concurrency.
        let _gate = (self.web.concurrency() <= 1)
            .then(|| self.web_gate.lock().unwrap_or_else(|e| e.into_inner()));
        let results = self.web.execute(&batch)?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| StepError::new(ErrorCode::Internal, "engine returned no result"))
    }

    // -- recovery, patches, deviations --------------------------------------

    /// Deterministic self-recovery. Returns a note when a recovery was
    /// applied and the step should be retried immediately.
    fn try_recovery(
        &self,
        ctx: &mut RunCtx,
        step: &Step,
        action: &mut Action,
        error: &StepError,
    ) -> Option<RecoveryNote> {
        match (action, error.code) {
            // File search: widen each root one level up and retry once.
            (Action::FindFiles(p), ErrorCode::FileNotFound) => {
                let mut widened = false;
                for root in p.roots.iter_mut() {
                    let path = PathBuf::from(&*root);
                    if let Some(parent) = path.parent() {
                        if !parent.as_os_str().is_empty() {
                            *root = parent.to_string_lossy().to_string();
                            widened = true;
                        }
                    }
                }
                if !widened {
                    return None;
                }
                tracing::info!(run_id = ctx.run_id, step = step.index, "find_files widened search");
                Some(RecoveryNote {
                    action: "widen_search".to_string(),
                    detail: format!("widened roots to {:?}", p.roots),
                })
            }
            // Move: create the missing destination directory and retry once.
            (Action::MoveTo(p), ErrorCode::FileNotFound) => {
                let dest = PathBuf::from(&p.dest);
                let dir = if dest.extension().is_some() {
                    dest.parent()?.to_path_buf()
                } else {
                    dest
                };
                self.os.create_dir(&dir).ok()?;
                Some(RecoveryNote {
                    action: "create_dest_dir".to_string(),
                    detail: format!("created {}", dir.display()),
                })
            }
            // Web label miss: one retry with the synonym table and
            // placeholder/aria fallback (broadened matching).
            (Action::ClickByText(_), ErrorCode::WebElementNotFound)
            | (Action::FillByLabel(_), ErrorCode::WebElementNotFound) => Some(RecoveryNote {
                action: "label_fallback".to_string(),
                detail: "retrying with synonym and aria/placeholder matching".to_string(),
            }),
            _ => None,
        }
    }

    fn try_patch(
        &self,
        ctx: &mut RunCtx,
        step: &Step,
        error: &StepError,
        patched_once: &mut bool,
    ) -> Option<PatchFlow> {
        let schema = if step.action.is_web() {
            self.capture_schema_best_effort()
        } else {
            None
        };
        let patch = planner_l2::propose(&ctx.plan.steps[step.index], error, schema.as_ref())?;
        let _ = self.audit.append(
            "patch_proposed",
            Some(ctx.run_id),
            json!({
                "kind": patch.kind.as_str(),
                "step": step.index,
                "confidence": patch.confidence,
                "payload": patch.payload,
            }),
        );
        let _ = self.store.append_audit(
            Some(ctx.run_id),
            "patch_proposed",
            json!({"kind": patch.kind.as_str(), "step": step.index}),
        );
        let window_ok = match &self.policy.window {
            Some(w) => policy::in_window(w, Utc::now()).unwrap_or(false),
            None => true,
        };
        let adoption = AdoptionContext {
            autopilot_enabled: ctx.monitor.is_active(),
            policy_window_ok: window_ok,
            auto_changes_so_far: ctx.auto_changes,
        };
        if !planner_l2::should_auto_adopt(&self.policy.adopt_policy, &patch, &adoption) {
            let _ = self.store.append_audit(
                Some(ctx.run_id),
                "patch_proposal_pending",
                json!({"kind": patch.kind.as_str(), "step": step.index}),
            );
            return None;
        }
        match planner_l2::apply(&ctx.plan, &patch) {
            Ok(patched_plan) => {
                ctx.plan = patched_plan;
                ctx.auto_changes += 1;
                *patched_once = true;
                let _ = self.audit.append(
                    "patch_adopted",
                    Some(ctx.run_id),
                    json!({"kind": patch.kind.as_str(), "step": step.index}),
                );
                let _ = self.store.append_audit(
                    Some(ctx.run_id),
                    "patch_adopted",
                    json!({"kind": patch.kind.as_str(), "step": step.index}),
                );
                Some(PatchFlow::RetryStep)
            }
            Err(refused) => {
                let _ = self.audit.append(
                    "patch_refused",
                    Some(ctx.run_id),
                    json!({"reason": refused.message}),
                );
                None
            }
        }
    }

    fn capture_schema_best_effort(&self) -> Option<crate::web_engine::DomSchema> {
        let results = self
            .web
            .execute(&WebBatch::one(WebOp::CaptureDomSchema { target: None }))
            .ok()?;
        let value = results.into_iter().next()?;
        let schema = value.get("schema").cloned().unwrap_or(value);
        serde_json::from_value(schema).ok()
    }

    /// Post-success observation: unexpected elements, domain drift, slow
    /// steps. Returns a flow when the monitor safe-fails.
    fn observe_success(
        &self,
        ctx: &mut RunCtx,
        step: &Step,
        output: &serde_json::Value,
        elapsed_ms: u64,
    ) -> Option<StepFlow> {
        if output.get("unexpected_element").and_then(|v| v.as_bool()) == Some(true) {
            self.report_deviation(
                ctx,
                step.index,
                DeviationKind::UnexpectedElement,
                "engine reported an unexpected element".to_string(),
            );
            if let Some(flow) = self.check_monitor(ctx, step.index) {
                return Some(flow);
            }
        }
        if let Some(url) = output.get("url").and_then(|v| v.as_str()) {
            if let Some(host) = crate::manifest::host_of(url) {
                let declared = &ctx.manifest.target_domains;
                if !declared.is_empty()
                    && !declared.iter().any(|d| policy::domain_matches(&host, d))
                {
                    self.report_deviation(
                        ctx,
                        step.index,
                        DeviationKind::DomainDrift,
                        format!("navigated to undeclared host '{host}'"),
                    );
                    if let Some(flow) = self.check_monitor(ctx, step.index) {
                        return Some(flow);
                    }
                }
            }
        }
        if let Some(timeout) = step.timeout_ms {
            if elapsed_ms > timeout {
                self.report_deviation(
                    ctx,
                    step.index,
                    DeviationKind::Timing,
                    format!("step took {elapsed_ms}ms against a {timeout}ms budget"),
                );
                if let Some(flow) = self.check_monitor(ctx, step.index) {
                    return Some(flow);
                }
            }
        }
        None
    }

    fn report_deviation(
        &self,
        ctx: &mut RunCtx,
        step_index: usize,
        kind: DeviationKind,
        reason: String,
    ) {
        let (deviation, _) = ctx.monitor.observe(ctx.run_id, step_index, kind, reason);
        if let Err(e) = self.store.record_deviation(&deviation) {
            tracing::error!(run_id = ctx.run_id, "record deviation: {e}");
        }
    }

    /// After a deviation: did the monitor just cross into safe-fail?
    fn check_monitor(&self, ctx: &mut RunCtx, step_index: usize) -> Option<StepFlow> {
        if !ctx.monitor.is_active() {
            return None;
        }
        let score = ctx.monitor.total_score();
        let last_high = ctx
            .monitor
            .observed()
            .last()
            .map(|d| d.severity == crate::run::Severity::High)
            .unwrap_or(false);
        if score < self.policy.deviation_threshold && !last_high {
            return None;
        }
        let reason = format!("deviation score {score} at step {step_index}");
        self.save_checkpoint(ctx, step_index);
        if let Err(e) = self.store.transition(ctx.run_id, RunState::Paused) {
            tracing::error!(run_id = ctx.run_id, "safe-fail pause failed: {e}");
        }
        let _ = self.audit.append(
            "l4_handoff",
            Some(ctx.run_id),
            json!({"reason": reason, "score": score}),
        );
        let _ = self.store.append_audit(
            Some(ctx.run_id),
            "l4_handoff",
            json!({"reason": reason, "score": score}),
        );
        let _ = self.store.append_audit(
            Some(ctx.run_id),
            "notification",
            json!({"event": "deviation_stop", "run_id": ctx.run_id}),
        );
        Some(StepFlow::Suspend(SuspendReason::SafeFail { reason }))
    }

    // -- plumbing -----------------------------------------------------------

    fn eval_when(&self, ctx: &mut RunCtx, src: &str) -> anyhow::Result<bool> {
        let parsed = WhenExpr::parse(src)?;
        let resolver = self.secrets.clone();
        let masker = &mut ctx.masker;
        let mut secret_fn = move |service: Option<&str>, key: &str| -> anyhow::Result<String> {
            let secret = resolver.resolve(service, key, masker)?;
            Ok(secret.expose().to_string())
        };
        let mut ectx = ExprContext {
            variables: &ctx.variables,
            step_outputs: &ctx.outputs,
            secrets: &mut secret_fn,
        };
        parsed.eval(&mut ectx)
    }

    fn substitute_action(&self, ctx: &mut RunCtx, action: &mut Action) -> anyhow::Result<()> {
        let resolver = self.secrets.clone();
        let masker = &mut ctx.masker;
        let mut secret_fn = move |service: Option<&str>, key: &str| -> anyhow::Result<String> {
            let secret = resolver.resolve(service, key, masker)?;
            Ok(secret.expose().to_string())
        };
        let mut ectx = ExprContext {
            variables: &ctx.variables,
            step_outputs: &ctx.outputs,
            secrets: &mut secret_fn,
        };

        // Whole-value list expressions expand before scalar interpolation.
        expand_string_lists(action, &mut ectx)?;

        let mut first_err: Option<anyhow::Error> = None;
        action.visit_strings_mut(&mut |s| {
            if first_err.is_some() || !s.contains("{{") {
                return;
            }
            match expr::substitute_string(s, &mut ectx) {
                Ok(replaced) => *s = replaced,
                Err(e) => first_err = Some(e),
            }
        });
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn save_checkpoint(&self, ctx: &RunCtx, next_step_index: usize) {
        // Outputs are masked before they hit disk; secrets re-resolve from
        // their expressions on resume.
        let step_outputs = ctx
            .outputs
            .iter()
            .map(|(i, v)| (*i, ctx.masker.mask_json(v)))
            .collect();
        let mut engine_contexts = BTreeMap::new();
        if let Some(snapshot) = self.web.context_snapshot() {
            engine_contexts.insert("web".to_string(), snapshot);
        }
        let checkpoint = Checkpoint {
            run_id: ctx.run_id,
            next_step_index,
            variables: ctx.variables.clone(),
            step_outputs,
            engine_contexts,
            written_at: Utc::now(),
        };
        if let Err(e) = self.checkpoints.save(&checkpoint) {
            tracing::error!(run_id = ctx.run_id, "checkpoint save failed: {e}");
        }
    }

    fn capture_evidence(
        &self,
        ctx: &mut RunCtx,
        step: &Step,
    ) -> Vec<crate::run::EvidenceRef> {
        let mut refs = Vec::new();
        if self.evidence.screenshots {
            let caps = self.os.capabilities();
            let available = caps
                .get(&Capability::Screenshot)
                .map(|d| d.available)
                .unwrap_or(false);
            if available {
                match self.vault.reserve_screenshot(ctx.run_id, step.index) {
                    Ok((path, evref)) => match self.os.take_screenshot(&path) {
                        Ok(()) => {
                            if self.store.record_evidence(&evref).is_ok() {
                                refs.push(evref);
                            }
                        }
                        Err(e) => tracing::debug!("screenshot skipped: {e}"),
                    },
                    Err(e) => tracing::debug!("screenshot reserve skipped: {e}"),
                }
            }
        }
        if self.evidence.schemas && step.action.is_web() {
            if let Some(schema) = self.capture_schema_best_effort() {
                match self.vault.write_schema(ctx.run_id, step.index, &schema) {
                    Ok(evref) => {
                        if self.store.record_evidence(&evref).is_ok() {
                            refs.push(evref);
                        }
                    }
                    Err(e) => tracing::debug!("schema evidence skipped: {e}"),
                }
            }
        }
        refs
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_step(
        &self,
        ctx: &mut RunCtx,
        step: &Step,
        status: StepStatus,
        started_at: chrono::DateTime<Utc>,
        timer: Instant,
        output: serde_json::Value,
        recovery: Vec<RecoveryNote>,
        error: Option<StepError>,
    ) -> StepFlow {
        // Evidence first, terminal status second.
        let evidence = self.capture_evidence(ctx, step);
        let masked_output = ctx.masker.mask_json(&output);
        let result = StepResult {
            step_index: step.index,
            status,
            started_at,
            duration_ms: timer.elapsed().as_millis() as u64,
            output: masked_output,
            recovery_actions: recovery,
            evidence,
            error,
        };
        if let Err(e) = self.store.record_step(ctx.run_id, &result) {
            tracing::error!(run_id = ctx.run_id, "record step failed: {e}");
        }
        // Raw output stays in memory for later substitutions.
        ctx.outputs.insert(step.index, output);
        StepFlow::Advance
    }

    fn fail_step(
        &self,
        ctx: &mut RunCtx,
        step: &Step,
        started_at: chrono::DateTime<Utc>,
        timer: Instant,
        recovery: Vec<RecoveryNote>,
        error: StepError,
    ) -> StepFlow {
        let evidence = self.capture_evidence(ctx, step);
        let masked_error = StepError {
            code: error.code,
            message: ctx.masker.mask(&error.message),
            hints: error.hints.clone(),
            step_index: error.step_index,
        };
        let result = StepResult {
            step_index: step.index,
            status: StepStatus::Fail,
            started_at,
            duration_ms: timer.elapsed().as_millis() as u64,
            output: json!({}),
            recovery_actions: recovery,
            evidence,
            error: Some(masked_error.clone()),
        };
        if let Err(e) = self.store.record_step(ctx.run_id, &result) {
            tracing::error!(run_id = ctx.run_id, "record failed step: {e}");
        }
        StepFlow::Abort(masked_error)
    }
}

/// Control flow result of one step.
enum StepFlow {
    Advance,
    Suspend(SuspendReason),
    Abort(StepError),
}

enum PatchFlow {
    RetryStep,
}

fn string_list_paths(list: &StringList) -> Vec<PathBuf> {
    list.iter().map(PathBuf::from).collect()
}

fn latest_draft(outputs: &BTreeMap<usize, serde_json::Value>) -> Option<String> {
    outputs
        .values()
        .rev()
        .find_map(|v| v.get("draft_id").and_then(|d| d.as_str()).map(String::from))
}

/// Expand `StringList::One` whole-value expressions (e.g. the step-output
/// array `{{steps[0].paths}}`) into explicit lists.
fn expand_string_lists(action: &mut Action, ectx: &mut ExprContext<'_>) -> anyhow::Result<()> {
    let lists: Vec<&mut StringList> = match action {
        Action::PdfMerge(p) => vec![&mut p.inputs],
        Action::AttachFiles(p) => vec![&mut p.files],
        _ => Vec::new(),
    };
    for list in lists {
        if let StringList::One(s) = list {
            if s.contains("{{") {
                let value = expr::substitute_value(s, ectx)?;
                match value {
                    serde_json::Value::Array(items) => {
                        let strings: Vec<String> = items
                            .into_iter()
                            .map(|v| match v {
                                serde_json::Value::String(s) => s,
                                other => other.to_string(),
                            })
                            .collect();
                        *list = StringList::Many(strings);
                    }
                    serde_json::Value::String(s2) => *list = StringList::One(s2),
                    other => *list = StringList::One(other.to_string()),
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::PolicyAuditLog;
    use crate::checkpoint::CheckpointStore;
    use crate::config::EvidenceSettings;
    use crate::evidence::EvidenceVault;
    use crate::manifest::Manifest;
    use crate::secrets::{EnvBackend, SecretsResolver};
    use crate::testutil::{FakeOsAdapter, FakeWebEngine};
    use tempfile::TempDir;

    fn executor(
        dir: &TempDir,
        os: Arc<FakeOsAdapter>,
        web: Arc<FakeWebEngine>,
        policy: PolicyConfig,
    ) -> Executor {
        Executor {
            store: Arc::new(crate::store::RunStore::open_at(dir.path().join("runs.db")).unwrap()),
            checkpoints: Arc::new(CheckpointStore::new(dir.path().join("checkpoints"))),
            vault: Arc::new(EvidenceVault::new(dir.path())),
            audit: Arc::new(PolicyAuditLog::new(dir.path())),
            secrets: Arc::new(SecretsResolver::new(vec![Box::new(EnvBackend)])),
            os,
            web,
            web_gate: Arc::new(std::sync::Mutex::new(())),
            policy,
            evidence: EvidenceSettings {
                screenshots: false,
                schemas: false,
            },
            checkpoint_every: 5,
            work_dir: dir.path().join("work"),
        }
    }

    fn queue_run(exec: &Executor, plan_text: &str) -> i64 {
        let plan = Plan::from_yaml_str(plan_text).unwrap();
        let manifest = Manifest::derive(&plan);
        let run = exec
            .store
            .create_run(
                &plan.name,
                "test",
                &plan.to_yaml().unwrap(),
                &manifest,
                &plan.variables,
                "default",
                5,
            )
            .unwrap();
        run.run_id
    }

    #[test]
    fn test_when_false_skips_with_zero_duration() {
        let dir = TempDir::new().unwrap();
        let exec = executor(
            &dir,
            Arc::new(FakeOsAdapter::new()),
            Arc::new(FakeWebEngine::default()),
            PolicyConfig::default(),
        );
        let run_id = queue_run(
            &exec,
            r#"
dsl_version: "1.1"
name: skippy
variables:
  flag: 0
steps:
  - policy_guard: {}
  - compose_mail:
      to: ["a@b"]
      subject: s
      body: b
      when: "{{flag}} == 1"
"#,
        );
        assert_eq!(exec.run(run_id).unwrap(), ExecOutcome::Completed);
        let run = exec.store.get_run(run_id).unwrap().unwrap();
        let skipped = &run.step_results[1];
        assert_eq!(skipped.status, StepStatus::Skipped);
        assert_eq!(skipped.duration_ms, 0);
    }

    #[test]
    fn test_find_files_recovery_widens_one_level() {
        let dir = TempDir::new().unwrap();
        let os = Arc::new(FakeOsAdapter::new());
        os.write_pdf(&dir.path().join("inbox/report.pdf"), 2);
        std::fs::create_dir_all(dir.path().join("inbox/empty")).unwrap();
        let exec = executor(
            &dir,
            os,
            Arc::new(FakeWebEngine::default()),
            PolicyConfig::default(),
        );
        let run_id = queue_run(
            &exec,
            &format!(
                r#"
dsl_version: "1.1"
name: widen
steps:
  - find_files:
      query: "*.pdf"
      roots: ["{}"]
"#,
                dir.path().join("inbox/empty").display()
            ),
        );
        assert_eq!(exec.run(run_id).unwrap(), ExecOutcome::Completed);
        let run = exec.store.get_run(run_id).unwrap().unwrap();
        let step = &run.step_results[0];
        assert_eq!(step.status, StepStatus::Retry);
        assert_eq!(step.output["found"], 1);
        assert_eq!(step.recovery_actions[0].action, "widen_search");
    }

    #[test]
    fn test_retry_policy_on_retryable_error() {
        let dir = TempDir::new().unwrap();
        let os = Arc::new(FakeOsAdapter::new());
        os.fail_times("compose_mail", 1, ErrorCode::Timeout);
        let exec = executor(
            &dir,
            os,
            Arc::new(FakeWebEngine::default()),
            PolicyConfig::default(),
        );
        let run_id = queue_run(
            &exec,
            r#"
dsl_version: "1.1"
name: retry
execution:
  retry:
    max_attempts: 2
    backoff_ms: 5
steps:
  - compose_mail:
      to: ["a@b"]
      subject: s
      body: b
"#,
        );
        assert_eq!(exec.run(run_id).unwrap(), ExecOutcome::Completed);
        let run = exec.store.get_run(run_id).unwrap().unwrap();
        assert_eq!(run.step_results[0].status, StepStatus::Retry);
    }

    #[test]
    fn test_non_retryable_error_fails_run() {
        let dir = TempDir::new().unwrap();
        let os = Arc::new(FakeOsAdapter::new());
        os.fail_times("compose_mail", 5, ErrorCode::OsCapabilityMiss);
        let exec = executor(
            &dir,
            os,
            Arc::new(FakeWebEngine::default()),
            PolicyConfig::default(),
        );
        let run_id = queue_run(
            &exec,
            r#"
dsl_version: "1.1"
name: nope
steps:
  - compose_mail:
      to: ["a@b"]
      subject: s
      body: b
  - policy_guard: {}
"#,
        );
        match exec.run(run_id).unwrap() {
            ExecOutcome::Failed(error) => {
                assert_eq!(error.code, ErrorCode::OsCapabilityMiss);
                assert_eq!(error.step_index, Some(0));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        let run = exec.store.get_run(run_id).unwrap().unwrap();
        assert_eq!(run.state, RunState::Failed);
        // The second step never ran.
        assert_eq!(run.step_results.len(), 1);
    }

    #[test]
    fn test_cancelled_run_is_not_driven() {
        let dir = TempDir::new().unwrap();
        let exec = executor(
            &dir,
            Arc::new(FakeOsAdapter::new()),
            Arc::new(FakeWebEngine::default()),
            PolicyConfig::default(),
        );
        let run_id = queue_run(
            &exec,
            "dsl_version: \"1.1\"\nname: c\nsteps:\n  - policy_guard: {}\n",
        );
        exec.store.transition(run_id, RunState::Cancelled).unwrap();
        assert_eq!(exec.advance(run_id).unwrap(), ExecOutcome::Cancelled);
        let run = exec.store.get_run(run_id).unwrap().unwrap();
        assert!(run.step_results.is_empty());
    }

    #[test]
    fn test_checkpoint_written_every_n_steps() {
        let dir = TempDir::new().unwrap();
        let os = Arc::new(FakeOsAdapter::new());
        os.write_pdf(&dir.path().join("in/a.pdf"), 1);
        let mut exec = executor(
            &dir,
            os,
            Arc::new(FakeWebEngine::default()),
            PolicyConfig::default(),
        );
        exec.checkpoint_every = 2;
        let run_id = queue_run(
            &exec,
            &format!(
                r#"
dsl_version: "1.1"
name: long
steps:
  - find_files:
      query: "*.pdf"
      roots: ["{root}"]
  - find_files:
      query: "*.pdf"
      roots: ["{root}"]
  - human_confirm:
      message: "hold"
      timeout_minutes: 5
"#,
                root = dir.path().join("in").display()
            ),
        );
        let outcome = exec.run(run_id).unwrap();
        assert!(matches!(
            outcome,
            ExecOutcome::Suspended(SuspendReason::Approval { step_index: 2 })
        ));
        // The suspension checkpoint points at the confirm step.
        let cp = exec.checkpoints.load(run_id).unwrap().unwrap();
        assert_eq!(cp.next_step_index, 2);
        assert!(cp.step_outputs.contains_key(&0));
        assert!(cp.step_outputs.contains_key(&1));
    }
}
