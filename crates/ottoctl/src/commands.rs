//! Command implementations.
//!
//! Each command returns the process exit code: 0 success, 2 validation
//! failure, 3 policy block, 4 approval required/denied, 5 execution
//! failure, 6 I/O error.

use chrono::Utc;
use otto_common::checkpoint::atomic_write;
use otto_common::config::ConfigSet;
use otto_common::error::ErrorCode;
use otto_common::executor::{ExecOutcome, SuspendReason};
use otto_common::manifest::Manifest;
use otto_common::os_adapter::OsAdapter;
use otto_common::plan::Plan;
use otto_common::policy::{self, SignatureStatus};
use otto_common::run::RunState;
use otto_common::services::{Services, SubmitError};
use otto_common::signing::{load_signing_key, sign_plan, verify_plan};
use otto_common::store::RunStore;
use otto_common::validator;
use owo_colors::OwoColorize;
use std::collections::BTreeMap;
use std::path::Path;

pub const EXIT_OK: i32 = 0;
pub const EXIT_VALIDATION: i32 = 2;
pub const EXIT_POLICY: i32 = 3;
pub const EXIT_APPROVAL: i32 = 4;
pub const EXIT_EXECUTION: i32 = 5;
pub const EXIT_IO: i32 = 6;

fn load_plan(file: &Path) -> Result<Plan, i32> {
    if !file.exists() {
        eprintln!("{} {} does not exist", "error:".red(), file.display());
        return Err(EXIT_IO);
    }
    match Plan::from_file(file) {
        Ok(plan) => Ok(plan),
        Err(e) => {
            eprintln!("{} {e:#}", "invalid plan:".red());
            Err(EXIT_VALIDATION)
        }
    }
}

pub fn templates(dir: &Path) -> i32 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        eprintln!("{} cannot read {}", "error:".red(), dir.display());
        return EXIT_IO;
    };
    let mut found = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);
        if !is_yaml {
            continue;
        }
        found += 1;
        match Plan::from_file(&path) {
            Ok(plan) => {
                let manifest = Manifest::derive(&plan);
                let risks: Vec<&str> =
                    manifest.risk_flags.iter().map(|f| f.as_str()).collect();
                let signed = if plan.signature.is_some() {
                    "signed".green().to_string()
                } else {
                    "unsigned".yellow().to_string()
                };
                println!(
                    "{:<30} {:<10} steps={:<3} risks=[{}]",
                    plan.name,
                    signed,
                    plan.steps.len(),
                    risks.join(",")
                );
            }
            Err(e) => println!(
                "{:<30} {}",
                path.file_name().unwrap_or_default().to_string_lossy(),
                format!("unreadable: {e}").red()
            ),
        }
    }
    if found == 0 {
        println!("no templates under {}", dir.display());
    }
    EXIT_OK
}

pub fn validate(file: &Path) -> i32 {
    let plan = match load_plan(file) {
        Ok(p) => p,
        Err(code) => return code,
    };
    match validator::validate(&plan) {
        Ok(()) => {
            println!("{} {} ({} steps)", "valid:".green(), plan.name, plan.steps.len());
            EXIT_OK
        }
        Err(err) => {
            eprintln!("{} {} issue(s):", "invalid:".red(), err.issues.len());
            for issue in &err.issues {
                eprintln!("  {issue}");
            }
            EXIT_VALIDATION
        }
    }
}

fn parse_vars(vars: &[String]) -> Result<BTreeMap<String, serde_json::Value>, i32> {
    let mut out = BTreeMap::new();
    for pair in vars {
        let Some((key, value)) = pair.split_once('=') else {
            eprintln!("{} --var must be key=value, got '{pair}'", "error:".red());
            return Err(EXIT_VALIDATION);
        };
        out.insert(key.to_string(), serde_json::json!(value));
    }
    Ok(out)
}

pub fn run(
    services: &Services,
    file: &Path,
    auto_approve: bool,
    vars: &[String],
    role: Option<&str>,
) -> i32 {
    let plan = match load_plan(file) {
        Ok(p) => p,
        Err(code) => return code,
    };
    let overrides = match parse_vars(vars) {
        Ok(v) => v,
        Err(code) => return code,
    };

    // Risky manifests need an explicit go-ahead before anything executes.
    let manifest = Manifest::derive(&plan);
    let destructive = manifest.destructive_risks();
    if !destructive.is_empty() && !auto_approve {
        let risks: Vec<&str> = destructive.iter().map(|f| f.as_str()).collect();
        eprintln!(
            "{} plan raises [{}]; re-run with --auto-approve to accept",
            "approval required:".yellow(),
            risks.join(", ")
        );
        return EXIT_APPROVAL;
    }

    let submission = match services.submit(plan, &file.to_string_lossy(), overrides) {
        Ok(s) => s,
        Err(SubmitError::Validation(err)) => {
            eprintln!("{} {} issue(s):", "invalid:".red(), err.issues.len());
            for issue in &err.issues {
                eprintln!("  {issue}");
            }
            return EXIT_VALIDATION;
        }
        Err(SubmitError::Signature(err)) => {
            eprintln!("{} {err}", "signature:".red());
            return EXIT_POLICY;
        }
        Err(SubmitError::QueueFull(err)) => {
            eprintln!("{} {err}", "queue:".red());
            return EXIT_EXECUTION;
        }
        Err(SubmitError::Internal(err)) => {
            eprintln!("{} {err:#}", "error:".red());
            return EXIT_IO;
        }
    };

    if !submission.enqueued {
        eprintln!("{} run {} blocked:", "policy:".red(), submission.run.run_id);
        for check in submission.decision.blocked_reasons() {
            eprintln!("  {} {}: {}", check.check.as_str(), check.reason_code.red(), check.detail);
        }
        return EXIT_POLICY;
    }

    let run_id = submission.run.run_id;
    println!("run {} ({}) queued", run_id, submission.run.public_id);

    // Foreground mode: this process is the worker.
    let executor = services.executor();
    loop {
        let Some(item) = services.scheduler.acquire() else {
            eprintln!("{} nothing ready to execute", "error:".red());
            return EXIT_EXECUTION;
        };
        let outcome = executor.advance(item.run_id);
        services.scheduler.release(&item.queue);
        match outcome {
            Ok(ExecOutcome::Completed) => {
                println!("{} run {run_id} completed", "ok:".green());
                return EXIT_OK;
            }
            Ok(ExecOutcome::Failed(error)) => {
                print_error_card(&error, &submission.run.public_id);
                return match error.code {
                    ErrorCode::ApprovalDenied | ErrorCode::ApprovalTimeout => EXIT_APPROVAL,
                    ErrorCode::PolicyBlocked => EXIT_POLICY,
                    _ => EXIT_EXECUTION,
                };
            }
            Ok(ExecOutcome::Suspended(SuspendReason::Approval { step_index })) => {
                if !auto_approve {
                    eprintln!(
                        "{} step {step_index} is waiting for approval; decide via POST /hitl/{run_id}",
                        "waiting:".yellow()
                    );
                    return EXIT_APPROVAL;
                }
                let approver = match services.store.pending_approval(run_id) {
                    Ok(Some(pending)) => role
                        .map(String::from)
                        .or(pending.required_role),
                    _ => role.map(String::from),
                };
                if let Err(e) = services.decide_hitl(run_id, true, approver.as_deref()) {
                    eprintln!("{} {e:#}", "error:".red());
                    return EXIT_EXECUTION;
                }
                println!("{} step {step_index} auto-approved", "hitl:".yellow());
                if services
                    .scheduler
                    .enqueue(&item.queue, run_id, submission.run.priority)
                    .is_err()
                {
                    return EXIT_EXECUTION;
                }
            }
            Ok(ExecOutcome::Suspended(SuspendReason::SafeFail { reason })) => {
                eprintln!("{} {reason}", "autopilot safe-fail:".yellow());
                eprintln!("run {run_id} is paused; resume after review");
                return EXIT_EXECUTION;
            }
            Ok(ExecOutcome::Suspended(SuspendReason::UserPause)) => {
                println!("run {run_id} paused");
                return EXIT_OK;
            }
            Ok(ExecOutcome::Cancelled) => {
                println!("run {run_id} cancelled");
                return EXIT_EXECUTION;
            }
            Err(e) => {
                eprintln!("{} {e:#}", "error:".red());
                return EXIT_EXECUTION;
            }
        }
    }
}

fn print_error_card(error: &otto_common::StepError, public_id: &str) {
    eprintln!("{}", "run failed".red().bold());
    eprintln!("  cause: {} {}", error.code.as_str().red(), error.message);
    if let Some(step) = error.step_index {
        eprintln!("  step:  {step}");
    }
    for hint in &error.hints {
        eprintln!("  hint:  {hint}");
    }
    eprintln!("  record: /runs/{public_id}");
}

pub fn list(data_dir: &Path, state: Option<&str>, limit: usize) -> i32 {
    let Some(store) = RunStore::open_readonly(data_dir.join("runs.db")) else {
        println!("no run store at {}", data_dir.display());
        return EXIT_OK;
    };
    let state = match state {
        Some(s) => match RunState::parse(&s.to_uppercase()) {
            Some(parsed) => Some(parsed),
            None => {
                eprintln!("{} unknown state '{s}'", "error:".red());
                return EXIT_VALIDATION;
            }
        },
        None => None,
    };
    match store.list_runs(state, limit) {
        Ok(runs) => {
            for run in runs {
                println!(
                    "{:>5}  {:<18} {:<16} queue={:<10} p{} {}",
                    run.run_id,
                    run.state.as_str(),
                    run.created_at.format("%Y-%m-%d %H:%M"),
                    run.queue,
                    run.priority,
                    run.plan_name,
                );
            }
            EXIT_OK
        }
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red());
            EXIT_IO
        }
    }
}

pub fn show(data_dir: &Path, run_id: i64) -> i32 {
    let Some(store) = RunStore::open_readonly(data_dir.join("runs.db")) else {
        eprintln!("{} no run store at {}", "error:".red(), data_dir.display());
        return EXIT_IO;
    };
    let run = match store.get_run(run_id) {
        Ok(Some(run)) => run,
        Ok(None) => {
            eprintln!("{} run {run_id} not found", "error:".red());
            return EXIT_IO;
        }
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red());
            return EXIT_IO;
        }
    };
    println!("run {} ({})", run.run_id, run.public_id);
    println!("  plan:     {} [{}]", run.plan_name, run.plan_ref);
    println!("  state:    {}", run.state.as_str());
    println!("  queue:    {} (priority {})", run.queue, run.priority);
    let risks: Vec<&str> = run.manifest.risk_flags.iter().map(|f| f.as_str()).collect();
    println!("  risks:    [{}]", risks.join(", "));
    println!("  created:  {}", run.created_at.to_rfc3339());
    if let Some(t) = run.finished_at {
        println!("  finished: {}", t.to_rfc3339());
    }
    for step in &run.step_results {
        let status = match step.status.as_str() {
            "PASS" => step.status.as_str().green().to_string(),
            "RETRY" => step.status.as_str().yellow().to_string(),
            "FAIL" => step.status.as_str().red().to_string(),
            other => other.to_string(),
        };
        println!(
            "  step {:>2}  {:<8} {:>6}ms {}",
            step.step_index,
            status,
            step.duration_ms,
            step
                .recovery_actions
                .iter()
                .map(|r| r.action.as_str())
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    match store.deviations(run_id) {
        Ok(deviations) if !deviations.is_empty() => {
            println!("  deviations:");
            for d in deviations {
                println!(
                    "    step {:>2}  {:<20} {:<6} +{} {}",
                    d.step_index,
                    d.kind.as_str(),
                    d.severity.as_str(),
                    d.score,
                    d.reason
                );
            }
        }
        _ => {}
    }
    let audit = otto_common::audit::PolicyAuditLog::new(data_dir);
    let trail = audit.for_run(run_id);
    if !trail.is_empty() {
        println!("  audit:");
        for entry in trail {
            println!("    {}  {}", entry.timestamp.format("%H:%M:%S"), entry.kind);
        }
    }
    if let Some(first_error) = run.step_results.iter().find_map(|s| s.error.as_ref()) {
        print_error_card(first_error, &run.public_id);
    }
    EXIT_OK
}

pub fn sign(file: &Path, key_id: &str, key_path: &Path) -> i32 {
    let plan = match load_plan(file) {
        Ok(p) => p,
        Err(code) => return code,
    };
    let key = match load_signing_key(key_path) {
        Ok(k) => k,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red());
            return EXIT_IO;
        }
    };
    let signed = match sign_plan(&plan, key_id, &key) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red());
            return EXIT_EXECUTION;
        }
    };
    let yaml = match signed.to_yaml() {
        Ok(y) => y,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red());
            return EXIT_EXECUTION;
        }
    };
    if let Err(e) = atomic_write(file, yaml.as_bytes()) {
        eprintln!("{} {e:#}", "error:".red());
        return EXIT_IO;
    }
    println!("{} {} signed with key '{key_id}'", "ok:".green(), file.display());
    EXIT_OK
}

pub fn policy_test(config: &ConfigSet, file: &Path) -> i32 {
    let plan = match load_plan(file) {
        Ok(p) => p,
        Err(code) => return code,
    };
    if let Err(err) = validator::validate(&plan) {
        eprintln!("{} {} issue(s)", "invalid:".red(), err.issues.len());
        return EXIT_VALIDATION;
    }
    let manifest = Manifest::derive(&plan);

    let verified;
    let sig_error;
    let signature = if plan.signature.is_some() {
        match verify_plan(
            &plan,
            &config.trust_store,
            config.policy.min_trust_level,
            Utc::now(),
        ) {
            Ok(v) => {
                verified = v;
                SignatureStatus::Verified(&verified)
            }
            Err(e) => {
                sig_error = e;
                SignatureStatus::Failed(&sig_error)
            }
        }
    } else {
        SignatureStatus::NotSigned
    };

    let capabilities = otto_common::os_adapter::LocalOsAdapter
        .capabilities()
        .into_iter()
        .map(|(c, d)| (c, d.available))
        .collect();
    let decision = policy::evaluate(&config.policy, &manifest, signature, &capabilities, Utc::now());

    println!("policy decision for '{}':", plan.name);
    for check in &decision.checks {
        let mark = if check.allowed {
            "allow".green().to_string()
        } else {
            "block".red().to_string()
        };
        println!(
            "  {:<12} {} [{}] {}",
            check.check.as_str(),
            mark,
            check.reason_code,
            check.detail
        );
    }
    if decision.allowed {
        println!("{}", "allowed".green());
        EXIT_OK
    } else {
        println!("{}", "blocked".red());
        EXIT_POLICY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otto_common::os_adapter::OsAdapter;
    use tempfile::TempDir;

    #[test]
    fn test_parse_vars() {
        let vars = parse_vars(&["a=1".to_string(), "b=x=y".to_string()]).unwrap();
        assert_eq!(vars["a"], serde_json::json!("1"));
        assert_eq!(vars["b"], serde_json::json!("x=y"));
        assert!(parse_vars(&["broken".to_string()]).is_err());
    }

    #[test]
    fn test_validate_exit_codes() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.yaml");
        std::fs::write(
            &good,
            "dsl_version: \"1.1\"\nname: g\nsteps:\n  - policy_guard:\n",
        )
        .unwrap();
        assert_eq!(validate(&good), EXIT_OK);

        let bad = dir.path().join("bad.yaml");
        std::fs::write(
            &bad,
            "dsl_version: \"1.1\"\nname: b\nsteps:\n  - pdf_merge:\n      inputs: \"{{steps[3].paths}}\"\n",
        )
        .unwrap();
        assert_eq!(validate(&bad), EXIT_VALIDATION);

        assert_eq!(validate(&dir.path().join("missing.yaml")), EXIT_IO);
    }

    #[test]
    fn test_sign_then_policy_test_roundtrip() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plan.yaml");
        std::fs::write(
            &file,
            "dsl_version: \"1.1\"\nname: s\nsteps:\n  - policy_guard:\n",
        )
        .unwrap();
        let key_path = dir.path().join("dev.key");
        std::fs::write(&key_path, hex::encode([9u8; 32])).unwrap();
        assert_eq!(sign(&file, "dev-key", &key_path), EXIT_OK);
        let signed = Plan::from_file(&file).unwrap();
        assert!(signed.signature.is_some());

        // Default policy does not require signatures, so the gate passes
        // even though the key is not in the (empty) trust store.
        let config = ConfigSet::defaults_at(dir.path());
        assert_eq!(policy_test(&config, &file), EXIT_OK);
    }

    #[test]
    fn test_policy_test_blocks_domain() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("web.yaml");
        std::fs::write(
            &file,
            "dsl_version: \"1.1\"\nname: w\nsteps:\n  - open_browser:\n      url: \"https://evil.example.com\"\n",
        )
        .unwrap();
        let mut config = ConfigSet::defaults_at(dir.path());
        config.policy.allow_domains = vec!["partner.example.com".to_string()];
        // Webx capability is unavailable on the local adapter too, but the
        // domain check alone already blocks.
        assert_eq!(policy_test(&config, &file), EXIT_POLICY);
    }
}
