//! Run store.
//!
//! SQLite persistence for runs, steps, evidence, policy decisions,
//! deviations, approvals and the audit trail. WAL mode, one connection
//! behind a mutex: writes are serialized, which matches the per-run
//! serialization the execution model requires anyway.
//!
//! A step's final status row is written only after its evidence rows are
//! persisted; the executor relies on that ordering, the store enforces the
//! write-once rule for evidence.

use crate::error::StepError;
use crate::manifest::Manifest;
use crate::plan::AutoAction;
use crate::policy::PolicyDecision;
use crate::run::{
    Deviation, DeviationKind, EvidenceKind, EvidenceRef, Run, RunState, Severity, StepResult,
    StepStatus,
};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

/// Persisted approval record for a HITL step.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ApprovalRecord {
    pub id: i64,
    pub run_id: i64,
    pub step_index: usize,
    pub message: String,
    pub required_role: Option<String>,
    pub timeout_minutes: Option<u64>,
    pub auto_action: AutoAction,
    pub requested_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decision: Option<String>,
    pub approver_role: Option<String>,
}

/// One audit trail entry.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub run_id: Option<i64>,
    pub kind: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// SQLite-backed run store.
pub struct RunStore {
    conn: Mutex<Connection>,
}

impl RunStore {
    /// Open or create the store, applying the schema.
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Read-only open for CLI inspection. None when the store does not exist.
    pub fn open_readonly<P: AsRef<Path>>(path: P) -> Option<Self> {
        if !path.as_ref().exists() {
            return None;
        }
        let conn = Connection::open_with_flags(
            path.as_ref(),
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )
        .ok()?;
        Some(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means another thread panicked mid-write; the
        // connection itself is still usable for the next statement.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -- runs ---------------------------------------------------------------

    /// Create a run in QUEUED state, returning it with ids assigned. The
    /// plan YAML is kept alongside so workers and resume never depend on
    /// the template file staying in place.
    pub fn create_run(
        &self,
        plan_name: &str,
        plan_ref: &str,
        plan_yaml: &str,
        manifest: &Manifest,
        variables_masked: &BTreeMap<String, serde_json::Value>,
        queue: &str,
        priority: u8,
    ) -> Result<Run> {
        let conn = self.lock();
        let public_id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO runs (public_id, plan_name, plan_ref, plan_yaml, queue, priority, state,
                               manifest, variables, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                public_id,
                plan_name,
                plan_ref,
                plan_yaml,
                queue,
                priority,
                RunState::Queued.as_str(),
                serde_json::to_string(manifest)?,
                serde_json::to_string(variables_masked)?,
                created_at.to_rfc3339(),
            ],
        )?;
        let run_id = conn.last_insert_rowid();
        Ok(Run {
            run_id,
            public_id,
            plan_name: plan_name.to_string(),
            plan_ref: plan_ref.to_string(),
            variables_resolved: variables_masked.clone(),
            manifest: manifest.clone(),
            state: RunState::Queued,
            queue: queue.to_string(),
            priority,
            created_at,
            started_at: None,
            finished_at: None,
            step_results: Vec::new(),
        })
    }

    /// The stored plan YAML for a run.
    pub fn plan_yaml(&self, run_id: i64) -> Result<String> {
        let conn = self.lock();
        conn.query_row(
            "SELECT plan_yaml FROM runs WHERE run_id = ?1",
            params![run_id],
            |r| r.get(0),
        )
        .with_context(|| format!("run {run_id} not found"))
    }

    pub fn state(&self, run_id: i64) -> Result<RunState> {
        let conn = self.lock();
        let state: String = conn
            .query_row("SELECT state FROM runs WHERE run_id = ?1", params![run_id], |r| {
                r.get(0)
            })
            .with_context(|| format!("run {run_id} not found"))?;
        RunState::parse(&state).ok_or_else(|| anyhow!("corrupt state '{state}'"))
    }

    /// Transition a run, enforcing the state machine. Stamps `started_at`
    /// on the first move to RUNNING and `finished_at` on terminal states.
    pub fn transition(&self, run_id: i64, next: RunState) -> Result<()> {
        let current = self.state(run_id)?;
        if !current.can_transition_to(next) {
            bail!(
                "illegal transition {} -> {} for run {run_id}",
                current.as_str(),
                next.as_str()
            );
        }
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        match next {
            RunState::Running => {
                conn.execute(
                    "UPDATE runs SET state = ?1,
                            started_at = COALESCE(started_at, ?2)
                     WHERE run_id = ?3",
                    params![next.as_str(), now, run_id],
                )?;
            }
            s if s.is_terminal() => {
                conn.execute(
                    "UPDATE runs SET state = ?1, finished_at = ?2 WHERE run_id = ?3",
                    params![next.as_str(), now, run_id],
                )?;
            }
            _ => {
                conn.execute(
                    "UPDATE runs SET state = ?1 WHERE run_id = ?2",
                    params![next.as_str(), run_id],
                )?;
            }
        }
        Ok(())
    }

    pub fn get_run(&self, run_id: i64) -> Result<Option<Run>> {
        let conn = self.lock();
        let run = conn
            .query_row(
                "SELECT run_id, public_id, plan_name, plan_ref, queue, priority, state,
                        manifest, variables, created_at, started_at, finished_at
                 FROM runs WHERE run_id = ?1",
                params![run_id],
                row_to_run,
            )
            .optional()?;
        let Some(mut run) = run else {
            return Ok(None);
        };
        run.step_results = query_steps(&conn, run_id)?;
        Ok(Some(run))
    }

    pub fn get_run_by_public_id(&self, public_id: &str) -> Result<Option<Run>> {
        let run_id: Option<i64> = {
            let conn = self.lock();
            conn.query_row(
                "SELECT run_id FROM runs WHERE public_id = ?1",
                params![public_id],
                |r| r.get(0),
            )
            .optional()?
        };
        match run_id {
            Some(id) => self.get_run(id),
            None => Ok(None),
        }
    }

    /// Runs ordered newest-first, optionally filtered by state.
    pub fn list_runs(&self, state: Option<RunState>, limit: usize) -> Result<Vec<Run>> {
        let conn = self.lock();
        let mut out = Vec::new();
        let mut push = |row: &rusqlite::Row<'_>| -> rusqlite::Result<()> {
            out.push(row_to_run(row)?);
            Ok(())
        };
        match state {
            Some(s) => {
                let mut stmt = conn.prepare(
                    "SELECT run_id, public_id, plan_name, plan_ref, queue, priority, state,
                            manifest, variables, created_at, started_at, finished_at
                     FROM runs WHERE state = ?1 ORDER BY run_id DESC LIMIT ?2",
                )?;
                let mut rows = stmt.query(params![s.as_str(), limit as i64])?;
                while let Some(row) = rows.next()? {
                    push(row)?;
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT run_id, public_id, plan_name, plan_ref, queue, priority, state,
                            manifest, variables, created_at, started_at, finished_at
                     FROM runs ORDER BY run_id DESC LIMIT ?1",
                )?;
                let mut rows = stmt.query(params![limit as i64])?;
                while let Some(row) = rows.next()? {
                    push(row)?;
                }
            }
        }
        Ok(out)
    }

    /// Run summaries (no steps) created inside a time window, for metrics.
    pub fn runs_since(&self, since: DateTime<Utc>) -> Result<Vec<Run>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT run_id, public_id, plan_name, plan_ref, queue, priority, state,
                    manifest, variables, created_at, started_at, finished_at
             FROM runs WHERE created_at >= ?1 ORDER BY run_id",
        )?;
        let rows = stmt.query_map(params![since.to_rfc3339()], row_to_run)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -- steps & evidence ---------------------------------------------------

    /// Persist a step's terminal result. Evidence for the step must already
    /// be recorded; the result row carries the evidence refs for reads.
    pub fn record_step(&self, run_id: i64, result: &StepResult) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO steps
                 (run_id, step_index, status, started_at, duration_ms, output, recovery, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run_id,
                result.step_index as i64,
                result.status.as_str(),
                result.started_at.to_rfc3339(),
                result.duration_ms as i64,
                serde_json::to_string(&result.output)?,
                serde_json::to_string(&result.recovery_actions)?,
                match &result.error {
                    Some(e) => Some(serde_json::to_string(e)?),
                    None => None,
                },
            ],
        )?;
        Ok(())
    }

    /// Record an evidence artifact. Write-once: a second write for the same
    /// `{run, step, kind}` is an error.
    pub fn record_evidence(&self, evidence: &EvidenceRef) -> Result<()> {
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO evidence (run_id, step_index, kind, path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                evidence.run_id,
                evidence.step_index as i64,
                evidence.kind.as_str(),
                evidence.path,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            bail!(
                "evidence already recorded for run {} step {} kind {}",
                evidence.run_id,
                evidence.step_index,
                evidence.kind.as_str()
            );
        }
        Ok(())
    }

    pub fn evidence_for(&self, run_id: i64) -> Result<Vec<EvidenceRef>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT run_id, step_index, kind, path FROM evidence
             WHERE run_id = ?1 ORDER BY step_index, kind",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(EvidenceRef {
                run_id: row.get(0)?,
                step_index: row.get::<_, i64>(1)? as usize,
                kind: match row.get::<_, String>(2)?.as_str() {
                    "screenshot" => EvidenceKind::Screenshot,
                    _ => EvidenceKind::DomSchema,
                },
                path: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Step statuses across all runs in a window, for metrics.
    pub fn step_statuses_since(&self, since: DateTime<Utc>) -> Result<Vec<(StepStatus, u64)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT status, duration_ms FROM steps WHERE started_at >= ?1",
        )?;
        let rows = stmt.query_map(params![since.to_rfc3339()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (status, duration) = row?;
            if let Some(parsed) = StepStatus::parse(&status) {
                out.push((parsed, duration));
            }
        }
        Ok(out)
    }

    /// Error codes of failed steps in a window, for failure clustering.
    pub fn error_codes_since(&self, since: DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT error FROM steps WHERE error IS NOT NULL AND started_at >= ?1",
        )?;
        let rows = stmt.query_map(params![since.to_rfc3339()], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            if let Ok(err) = serde_json::from_str::<StepError>(&row?) {
                out.push(err.code.as_str().to_string());
            }
        }
        Ok(out)
    }

    /// Evidence artifacts of one kind recorded inside a window.
    pub fn evidence_count_since(&self, kind: EvidenceKind, since: DateTime<Utc>) -> Result<u64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM evidence WHERE kind = ?1 AND created_at >= ?2",
            params![kind.as_str(), since.to_rfc3339()],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }

    /// Steps in a window whose output JSON contains a marker key.
    pub fn steps_output_like_since(&self, marker: &str, since: DateTime<Utc>) -> Result<u64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM steps WHERE output LIKE ?1 AND started_at >= ?2",
            params![format!("%\"{marker}\"%"), since.to_rfc3339()],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }

    // -- policy decisions ---------------------------------------------------

    pub fn record_policy_decision(&self, run_id: i64, decision: &PolicyDecision) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO policy_decisions (run_id, allowed, checks, decided_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                run_id,
                decision.allowed,
                serde_json::to_string(&decision.checks)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn policy_decisions(&self, run_id: i64) -> Result<Vec<PolicyDecision>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT allowed, checks FROM policy_decisions WHERE run_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((row.get::<_, bool>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (allowed, checks) = row?;
            out.push(PolicyDecision {
                allowed,
                checks: serde_json::from_str(&checks)?,
            });
        }
        Ok(out)
    }

    pub fn policy_blocks_since(&self, since: DateTime<Utc>) -> Result<u64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM policy_decisions WHERE allowed = 0 AND decided_at >= ?1",
            params![since.to_rfc3339()],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }

    // -- deviations ---------------------------------------------------------

    pub fn record_deviation(&self, deviation: &Deviation) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO deviations (run_id, step_index, kind, severity, score, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                deviation.run_id,
                deviation.step_index as i64,
                deviation.kind.as_str(),
                deviation.severity.as_str(),
                deviation.score,
                deviation.reason,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn deviations(&self, run_id: i64) -> Result<Vec<Deviation>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT run_id, step_index, kind, severity, score, reason
             FROM deviations WHERE run_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(Deviation {
                run_id: row.get(0)?,
                step_index: row.get::<_, i64>(1)? as usize,
                kind: DeviationKind::parse(&row.get::<_, String>(2)?)
                    .unwrap_or(DeviationKind::Timing),
                severity: match row.get::<_, String>(3)?.as_str() {
                    "high" => Severity::High,
                    "medium" => Severity::Medium,
                    _ => Severity::Low,
                },
                score: row.get(4)?,
                reason: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -- approvals ----------------------------------------------------------

    pub fn create_approval(
        &self,
        run_id: i64,
        step_index: usize,
        message: &str,
        required_role: Option<&str>,
        timeout_minutes: Option<u64>,
        auto_action: AutoAction,
    ) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO approvals
                 (run_id, step_index, message, required_role, timeout_minutes, auto_action,
                  requested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id,
                step_index as i64,
                message,
                required_role,
                timeout_minutes.map(|t| t as i64),
                match auto_action {
                    AutoAction::Deny => "deny",
                    AutoAction::Approve => "approve",
                },
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Latest undecided approval for a run.
    pub fn pending_approval(&self, run_id: i64) -> Result<Option<ApprovalRecord>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, run_id, step_index, message, required_role, timeout_minutes,
                    auto_action, requested_at, decided_at, decision, approver_role
             FROM approvals WHERE run_id = ?1 AND decided_at IS NULL
             ORDER BY id DESC LIMIT 1",
            params![run_id],
            row_to_approval,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Most recent approval (decided or not) for one step of a run.
    pub fn latest_approval(&self, run_id: i64, step_index: usize) -> Result<Option<ApprovalRecord>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, run_id, step_index, message, required_role, timeout_minutes,
                    auto_action, requested_at, decided_at, decision, approver_role
             FROM approvals WHERE run_id = ?1 AND step_index = ?2
             ORDER BY id DESC LIMIT 1",
            params![run_id, step_index as i64],
            row_to_approval,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn decide_approval(
        &self,
        approval_id: i64,
        decision: &str,
        approver_role: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE approvals SET decided_at = ?1, decision = ?2, approver_role = ?3
             WHERE id = ?4 AND decided_at IS NULL",
            params![Utc::now().to_rfc3339(), decision, approver_role, approval_id],
        )?;
        if updated == 0 {
            bail!("approval {approval_id} already decided or missing");
        }
        Ok(())
    }

    pub fn approvals_since(&self, since: DateTime<Utc>) -> Result<Vec<ApprovalRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, step_index, message, required_role, timeout_minutes,
                    auto_action, requested_at, decided_at, decision, approver_role
             FROM approvals WHERE requested_at >= ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![since.to_rfc3339()], row_to_approval)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -- audit --------------------------------------------------------------

    pub fn append_audit(
        &self,
        run_id: Option<i64>,
        kind: &str,
        details: serde_json::Value,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO audit (run_id, kind, details, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                run_id,
                kind,
                serde_json::to_string(&details)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn audit_recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, kind, details, created_at FROM audit
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_audit)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn audit_count_since(&self, kind: &str, since: DateTime<Utc>) -> Result<u64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM audit WHERE kind = ?1 AND created_at >= ?2",
            params![kind, since.to_rfc3339()],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    public_id   TEXT NOT NULL UNIQUE,
    plan_name   TEXT NOT NULL,
    plan_ref    TEXT NOT NULL,
    plan_yaml   TEXT NOT NULL,
    queue       TEXT NOT NULL,
    priority    INTEGER NOT NULL,
    state       TEXT NOT NULL,
    manifest    TEXT NOT NULL,
    variables   TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    started_at  TEXT,
    finished_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_runs_state ON runs(state);
CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at);

CREATE TABLE IF NOT EXISTS steps (
    run_id      INTEGER NOT NULL,
    step_index  INTEGER NOT NULL,
    status      TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    output      TEXT NOT NULL,
    recovery    TEXT NOT NULL,
    error       TEXT,
    PRIMARY KEY (run_id, step_index)
);
CREATE INDEX IF NOT EXISTS idx_steps_started ON steps(started_at);

CREATE TABLE IF NOT EXISTS evidence (
    run_id      INTEGER NOT NULL,
    step_index  INTEGER NOT NULL,
    kind        TEXT NOT NULL,
    path        TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (run_id, step_index, kind)
);

CREATE TABLE IF NOT EXISTS policy_decisions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id      INTEGER NOT NULL,
    allowed     INTEGER NOT NULL,
    checks      TEXT NOT NULL,
    decided_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_policy_run ON policy_decisions(run_id);

CREATE TABLE IF NOT EXISTS deviations (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id      INTEGER NOT NULL,
    step_index  INTEGER NOT NULL,
    kind        TEXT NOT NULL,
    severity    TEXT NOT NULL,
    score       INTEGER NOT NULL,
    reason      TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_deviations_run ON deviations(run_id);

CREATE TABLE IF NOT EXISTS approvals (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id          INTEGER NOT NULL,
    step_index      INTEGER NOT NULL,
    message         TEXT NOT NULL,
    required_role   TEXT,
    timeout_minutes INTEGER,
    auto_action     TEXT NOT NULL,
    requested_at    TEXT NOT NULL,
    decided_at      TEXT,
    decision        TEXT,
    approver_role   TEXT
);
CREATE INDEX IF NOT EXISTS idx_approvals_run ON approvals(run_id);

CREATE TABLE IF NOT EXISTS audit (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id      INTEGER,
    kind        TEXT NOT NULL,
    details     TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_kind ON audit(kind);
"#;

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let manifest: String = row.get(7)?;
    let variables: String = row.get(8)?;
    let state: String = row.get(6)?;
    Ok(Run {
        run_id: row.get(0)?,
        public_id: row.get(1)?,
        plan_name: row.get(2)?,
        plan_ref: row.get(3)?,
        queue: row.get(4)?,
        priority: row.get::<_, i64>(5)? as u8,
        state: RunState::parse(&state).unwrap_or(RunState::Failed),
        manifest: serde_json::from_str(&manifest).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?,
        variables_resolved: serde_json::from_str(&variables).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
        })?,
        created_at: parse_ts(row.get(9)?),
        started_at: row.get::<_, Option<String>>(10)?.map(parse_ts),
        finished_at: row.get::<_, Option<String>>(11)?.map(parse_ts),
        step_results: Vec::new(),
    })
}

fn query_steps(conn: &Connection, run_id: i64) -> Result<Vec<StepResult>> {
    let mut stmt = conn.prepare(
        "SELECT step_index, status, started_at, duration_ms, output, recovery, error
         FROM steps WHERE run_id = ?1 ORDER BY step_index",
    )?;
    let evidence = {
        let mut estmt = conn.prepare(
            "SELECT step_index, kind, path FROM evidence WHERE run_id = ?1",
        )?;
        let rows = estmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, i64>(0)? as usize,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut map: BTreeMap<usize, Vec<EvidenceRef>> = BTreeMap::new();
        for row in rows {
            let (step_index, kind, path) = row?;
            map.entry(step_index).or_default().push(EvidenceRef {
                run_id,
                step_index,
                kind: if kind == "screenshot" {
                    EvidenceKind::Screenshot
                } else {
                    EvidenceKind::DomSchema
                },
                path,
            });
        }
        map
    };
    let rows = stmt.query_map(params![run_id], |row| {
        Ok((
            row.get::<_, i64>(0)? as usize,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)? as u64,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, Option<String>>(6)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (step_index, status, started_at, duration_ms, output, recovery, error) = row?;
        out.push(StepResult {
            step_index,
            status: StepStatus::parse(&status).unwrap_or(StepStatus::Fail),
            started_at: parse_ts(started_at),
            duration_ms,
            output: serde_json::from_str(&output)?,
            recovery_actions: serde_json::from_str(&recovery)?,
            evidence: evidence.get(&step_index).cloned().unwrap_or_default(),
            error: match error {
                Some(e) => Some(serde_json::from_str(&e)?),
                None => None,
            },
        });
    }
    Ok(out)
}

fn row_to_approval(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApprovalRecord> {
    Ok(ApprovalRecord {
        id: row.get(0)?,
        run_id: row.get(1)?,
        step_index: row.get::<_, i64>(2)? as usize,
        message: row.get(3)?,
        required_role: row.get(4)?,
        timeout_minutes: row.get::<_, Option<i64>>(5)?.map(|t| t as u64),
        auto_action: if row.get::<_, String>(6)? == "approve" {
            AutoAction::Approve
        } else {
            AutoAction::Deny
        },
        requested_at: parse_ts(row.get(7)?),
        decided_at: row.get::<_, Option<String>>(8)?.map(parse_ts),
        decision: row.get(9)?,
        approver_role: row.get(10)?,
    })
}

fn row_to_audit(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let details: String = row.get(3)?;
    Ok(AuditEntry {
        id: row.get(0)?,
        run_id: row.get(1)?,
        kind: row.get(2)?,
        details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
        created_at: parse_ts(row.get(4)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use crate::plan::Plan;
    use chrono::Duration;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, RunStore) {
        let dir = TempDir::new().unwrap();
        let store = RunStore::open_at(dir.path().join("runs.db")).unwrap();
        (dir, store)
    }

    fn sample_manifest() -> Manifest {
        let plan = Plan::from_yaml_str(
            "dsl_version: \"1.1\"\nname: s\nsteps:\n  - find_files:\n      query: \"*\"\n      roots: [\".\"]\n",
        )
        .unwrap();
        Manifest::derive(&plan)
    }

    fn create(store: &RunStore) -> Run {
        store
            .create_run(
                "s",
                "plans/s.yaml",
                "dsl_version: \"1.1\"\nname: s\nsteps: []\n",
                &sample_manifest(),
                &BTreeMap::new(),
                "default",
                5,
            )
            .unwrap()
    }

    #[test]
    fn test_create_and_get_run() {
        let (_dir, store) = test_store();
        let run = create(&store);
        assert_eq!(run.state, RunState::Queued);
        let loaded = store.get_run(run.run_id).unwrap().unwrap();
        assert_eq!(loaded.public_id, run.public_id);
        assert_eq!(loaded.queue, "default");
        let by_public = store.get_run_by_public_id(&run.public_id).unwrap().unwrap();
        assert_eq!(by_public.run_id, run.run_id);
    }

    #[test]
    fn test_run_ids_monotonic() {
        let (_dir, store) = test_store();
        let a = create(&store);
        let b = create(&store);
        assert!(b.run_id > a.run_id);
    }

    #[test]
    fn test_transition_enforces_state_machine() {
        let (_dir, store) = test_store();
        let run = create(&store);
        store.transition(run.run_id, RunState::Running).unwrap();
        assert!(store.transition(run.run_id, RunState::Queued).is_err());
        store.transition(run.run_id, RunState::Completed).unwrap();
        assert!(store.transition(run.run_id, RunState::Running).is_err());
        let loaded = store.get_run(run.run_id).unwrap().unwrap();
        assert!(loaded.started_at.is_some());
        assert!(loaded.finished_at.is_some());
    }

    #[test]
    fn test_record_step_and_read_back() {
        let (_dir, store) = test_store();
        let run = create(&store);
        let result = StepResult {
            step_index: 0,
            status: StepStatus::Pass,
            started_at: Utc::now(),
            duration_ms: 42,
            output: serde_json::json!({"found": 2, "paths": ["a", "b"]}),
            recovery_actions: vec![],
            evidence: vec![],
            error: None,
        };
        store.record_step(run.run_id, &result).unwrap();
        let loaded = store.get_run(run.run_id).unwrap().unwrap();
        assert_eq!(loaded.step_results.len(), 1);
        assert_eq!(loaded.step_results[0].output["found"], 2);
    }

    #[test]
    fn test_evidence_write_once() {
        let (_dir, store) = test_store();
        let run = create(&store);
        let ev = EvidenceRef {
            run_id: run.run_id,
            step_index: 1,
            kind: EvidenceKind::Screenshot,
            path: "artifacts/screenshots/1_step_1.png".to_string(),
        };
        store.record_evidence(&ev).unwrap();
        assert!(store.record_evidence(&ev).is_err());
        assert_eq!(store.evidence_for(run.run_id).unwrap().len(), 1);
    }

    #[test]
    fn test_policy_decision_roundtrip_and_block_count() {
        let (_dir, store) = test_store();
        let run = create(&store);
        let decision = PolicyDecision {
            allowed: false,
            checks: vec![crate::policy::PolicyCheck {
                check: crate::policy::CheckKind::Domain,
                allowed: false,
                reason_code: "DOMAIN_NOT_ALLOWED".to_string(),
                detail: "evil.example.com".to_string(),
            }],
        };
        store.record_policy_decision(run.run_id, &decision).unwrap();
        let loaded = store.policy_decisions(run.run_id).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(!loaded[0].allowed);
        let since = Utc::now() - Duration::hours(24);
        assert_eq!(store.policy_blocks_since(since).unwrap(), 1);
    }

    #[test]
    fn test_approval_lifecycle() {
        let (_dir, store) = test_store();
        let run = create(&store);
        let id = store
            .create_approval(run.run_id, 2, "Deploy?", Some("Editor"), Some(1), AutoAction::Deny)
            .unwrap();
        let pending = store.pending_approval(run.run_id).unwrap().unwrap();
        assert_eq!(pending.id, id);
        assert_eq!(pending.required_role.as_deref(), Some("Editor"));
        store.decide_approval(id, "approve", Some("Editor")).unwrap();
        assert!(store.pending_approval(run.run_id).unwrap().is_none());
        // Double decision is rejected.
        assert!(store.decide_approval(id, "deny", None).is_err());
    }

    #[test]
    fn test_deviations_roundtrip() {
        let (_dir, store) = test_store();
        let run = create(&store);
        store
            .record_deviation(&Deviation {
                run_id: run.run_id,
                step_index: 3,
                kind: DeviationKind::UnexpectedElement,
                severity: Severity::Medium,
                score: 2,
                reason: "modal dialog appeared".to_string(),
            })
            .unwrap();
        let devs = store.deviations(run.run_id).unwrap();
        assert_eq!(devs.len(), 1);
        assert_eq!(devs[0].kind, DeviationKind::UnexpectedElement);
    }

    #[test]
    fn test_audit_and_counts() {
        let (_dir, store) = test_store();
        let run = create(&store);
        store
            .append_audit(Some(run.run_id), "patch_adopted", serde_json::json!({"kind": "replace_text"}))
            .unwrap();
        store.append_audit(None, "daemon_start", serde_json::json!({})).unwrap();
        let recent = store.audit_recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        let since = Utc::now() - Duration::hours(1);
        assert_eq!(store.audit_count_since("patch_adopted", since).unwrap(), 1);
    }

    #[test]
    fn test_list_runs_filtered() {
        let (_dir, store) = test_store();
        let a = create(&store);
        let _b = create(&store);
        store.transition(a.run_id, RunState::Running).unwrap();
        store.transition(a.run_id, RunState::Completed).unwrap();
        let completed = store.list_runs(Some(RunState::Completed), 10).unwrap();
        assert_eq!(completed.len(), 1);
        let all = store.list_runs(None, 10).unwrap();
        assert_eq!(all.len(), 2);
        // Newest first.
        assert!(all[0].run_id > all[1].run_id);
    }
}
