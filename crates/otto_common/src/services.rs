//! Process-wide services.
//!
//! One [`Services`] object is constructed at startup and shared by workers,
//! triggers, the HTTP facade and the CLI. Tests build it over fake adapters
//! and a temp directory; nothing in here is global state.

use crate::audit::PolicyAuditLog;
use crate::checkpoint::CheckpointStore;
use crate::config::ConfigSet;
use crate::error::StepError;
use crate::evidence::EvidenceVault;
use crate::executor::Executor;
use crate::manifest::Manifest;
use crate::os_adapter::OsAdapter;
use crate::plan::Plan;
use crate::policy::{self, PolicyDecision, SignatureStatus};
use crate::queue::Scheduler;
use crate::run::{Run, RunState};
use crate::secrets::SecretsResolver;
use crate::signing::{verify_plan, SignatureError};
use crate::store::RunStore;
use crate::validator::{self, ValidationError};
use crate::web_engine::WebEngine;
use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Why a submission did not enqueue.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    Signature(#[from] SignatureError),
    #[error("queue full: {0}")]
    QueueFull(StepError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Result of submitting a plan: the persisted run and the policy decision.
/// `enqueued` is false when the policy gate blocked the run.
#[derive(Debug)]
pub struct Submission {
    pub run: Run,
    pub decision: PolicyDecision,
    pub enqueued: bool,
}

pub struct Services {
    pub config: ConfigSet,
    pub store: Arc<RunStore>,
    pub scheduler: Arc<Scheduler>,
    pub secrets: Arc<SecretsResolver>,
    pub os: Arc<dyn OsAdapter>,
    pub web: Arc<dyn WebEngine>,
    pub audit: Arc<PolicyAuditLog>,
    pub checkpoints: Arc<CheckpointStore>,
    pub vault: Arc<EvidenceVault>,
    web_gate: Arc<std::sync::Mutex<()>>,
}

impl Services {
    /// Wire everything over the given adapters.
    pub fn new(
        config: ConfigSet,
        os: Arc<dyn OsAdapter>,
        web: Arc<dyn WebEngine>,
    ) -> Result<Self> {
        let store = Arc::new(RunStore::open_at(config.run_store_path())?);
        let scheduler = Arc::new(Scheduler::new(config.orchestrator.queue_configs()));
        let secrets = Arc::new(SecretsResolver::standard(&config.data_dir.join("secrets")));
        let audit = Arc::new(PolicyAuditLog::new(&config.data_dir));
        let checkpoints = Arc::new(CheckpointStore::new(config.checkpoint_dir()));
        let vault = Arc::new(EvidenceVault::new(&config.data_dir));
        Ok(Self {
            config,
            store,
            scheduler,
            secrets,
            os,
            web,
            audit,
            checkpoints,
            vault,
            web_gate: Arc::new(std::sync::Mutex::new(())),
        })
    }

    /// The executor view over these services.
    pub fn executor(&self) -> Executor {
        Executor {
            store: self.store.clone(),
            checkpoints: self.checkpoints.clone(),
            vault: self.vault.clone(),
            audit: self.audit.clone(),
            secrets: self.secrets.clone(),
            os: self.os.clone(),
            web: self.web.clone(),
            web_gate: self.web_gate.clone(),
            policy: self.config.policy.clone(),
            evidence: self.config.orchestrator.evidence,
            checkpoint_every: self.config.orchestrator.checkpoint_every,
            work_dir: self.config.data_dir.join("artifacts/work"),
        }
    }

    /// Validate, gate and enqueue a plan: the Trigger → Validate → Manifest
    /// → Sign → Policy → queue front half of the pipeline.
    pub fn submit(
        &self,
        mut plan: Plan,
        plan_ref: &str,
        variable_overrides: BTreeMap<String, serde_json::Value>,
    ) -> Result<Submission, SubmitError> {
        plan.variables.extend(variable_overrides);
        validator::validate(&plan)?;

        let manifest = Manifest::derive(&plan);

        // Signature: verify when present; a bad signature is fatal when the
        // policy requires one, otherwise it downgrades to unsigned.
        let verified;
        let sig_error;
        let signature_status = if plan.signature.is_some() {
            match verify_plan(
                &plan,
                &self.config.trust_store,
                self.config.policy.min_trust_level,
                Utc::now(),
            ) {
                Ok(v) => {
                    verified = v;
                    SignatureStatus::Verified(&verified)
                }
                Err(e) if self.config.policy.require_signed_templates => return Err(e.into()),
                Err(e) => {
                    tracing::warn!("signature ignored: {e}");
                    sig_error = e;
                    SignatureStatus::Failed(&sig_error)
                }
            }
        } else {
            SignatureStatus::NotSigned
        };

        // Capability availability; PERMISSIONS_STRICT turns missing host
        // permissions into hard capability misses.
        let mut capabilities: BTreeMap<_, _> = self
            .os
            .capabilities()
            .into_iter()
            .map(|(c, d)| (c, d.available))
            .collect();
        let issues = self.os.check_permissions();
        for issue in &issues {
            if crate::config::permissions_strict() {
                capabilities.insert(issue.capability, false);
            } else {
                tracing::warn!(
                    capability = issue.capability.as_str(),
                    "missing host permission: {}",
                    issue.detail
                );
            }
        }

        let decision = policy::evaluate(
            &self.config.policy,
            &manifest,
            signature_status,
            &capabilities,
            Utc::now(),
        );

        let queue = plan.queue().to_string();
        let priority = plan.priority();
        let plan_yaml = plan.to_yaml().map_err(SubmitError::Internal)?;
        let run = self
            .store
            .create_run(
                &plan.name,
                plan_ref,
                &plan_yaml,
                &manifest,
                &plan.variables,
                &queue,
                priority,
            )
            .map_err(SubmitError::Internal)?;
        self.store
            .record_policy_decision(run.run_id, &decision)
            .map_err(SubmitError::Internal)?;
        let _ = self.audit.append(
            "policy_decision",
            Some(run.run_id),
            json!({
                "allowed": decision.allowed,
                "checks": decision.checks,
                "plan": plan.name,
            }),
        );

        if !decision.allowed {
            self.store
                .transition(run.run_id, RunState::Failed)
                .map_err(SubmitError::Internal)?;
            let _ = self.audit.append(
                "policy_blocked",
                Some(run.run_id),
                json!({"reasons": decision
                    .blocked_reasons()
                    .iter()
                    .map(|c| c.reason_code.clone())
                    .collect::<Vec<_>>()}),
            );
            return Ok(Submission {
                run,
                decision,
                enqueued: false,
            });
        }

        if let Err(full) = self.scheduler.enqueue(&queue, run.run_id, priority) {
            self.store
                .transition(run.run_id, RunState::Failed)
                .map_err(SubmitError::Internal)?;
            let _ = self.audit.append(
                "queue_full",
                Some(run.run_id),
                json!({"queue": queue}),
            );
            return Err(SubmitError::QueueFull(full));
        }

        Ok(Submission {
            run,
            decision,
            enqueued: true,
        })
    }

    /// Record a HITL decision for the run's pending approval. The caller
    /// re-enqueues the run to resume it.
    pub fn decide_hitl(
        &self,
        run_id: i64,
        approve: bool,
        approver_role: Option<&str>,
    ) -> Result<()> {
        let pending = self
            .store
            .pending_approval(run_id)?
            .ok_or_else(|| anyhow::anyhow!("run {run_id} has no pending approval"))?;
        let decision = if approve { "approve" } else { "deny" };
        self.store
            .decide_approval(pending.id, decision, approver_role)?;
        let _ = self.audit.append(
            "approval_decided",
            Some(run_id),
            json!({"decision": decision, "approver_role": approver_role}),
        );
        Ok(())
    }

    /// Apply `auto_action` to approvals whose timeout elapsed. Returns the
    /// run ids that should be resumed.
    pub fn sweep_approval_timeouts(&self, now: chrono::DateTime<Utc>) -> Result<Vec<i64>> {
        let mut to_resume = Vec::new();
        for run in self.store.list_runs(Some(RunState::WaitingApproval), 256)? {
            let Some(pending) = self.store.pending_approval(run.run_id)? else {
                continue;
            };
            let Some(minutes) = pending.timeout_minutes else {
                continue;
            };
            let deadline = pending.requested_at + chrono::Duration::minutes(minutes as i64);
            if now >= deadline {
                self.store.decide_approval(pending.id, "timeout", None)?;
                let _ = self.audit.append(
                    "approval_timeout",
                    Some(run.run_id),
                    json!({"auto_action": pending.auto_action}),
                );
                to_resume.push(run.run_id);
            }
        }
        Ok(to_resume)
    }

    /// Request an explicit pause; the executor suspends with a checkpoint
    /// at the next step boundary.
    pub fn pause(&self, run_id: i64) -> Result<()> {
        self.store.transition(run_id, RunState::Paused)?;
        let _ = self.audit.append("run_paused", Some(run_id), json!({}));
        Ok(())
    }

    /// Request cancellation; the executor stops at the next step boundary.
    pub fn cancel(&self, run_id: i64) -> Result<()> {
        self.store.transition(run_id, RunState::Cancelled)?;
        let _ = self
            .audit
            .append("run_cancelled", Some(run_id), json!({}));
        Ok(())
    }

    /// Exit-code mapping for the CLI.
    pub fn exit_code_for(error: &SubmitError) -> i32 {
        match error {
            SubmitError::Validation(_) => 2,
            SubmitError::Signature(_) => 3,
            SubmitError::QueueFull(_) => 5,
            SubmitError::Internal(_) => 6,
        }
    }
}
