//! Policy audit log.
//!
//! Append-only JSON-lines file at `logs/policy_audit.log`, one entry per
//! policy decision, approval, safe-fail or patch event. The run store keeps
//! the queryable copy; this file is the tamper-evident operator trail.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Maximum log size before rotation (10 MB).
const MAX_LOG_SIZE: u64 = 10_485_760;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyAuditEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<i64>,
    pub details: serde_json::Value,
}

/// Append-only JSON-lines audit log with size-based rotation.
#[derive(Debug, Clone)]
pub struct PolicyAuditLog {
    path: PathBuf,
}

impl PolicyAuditLog {
    /// `root` is the data directory; the log lands at
    /// `<root>/logs/policy_audit.log`.
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join("logs/policy_audit.log"),
        }
    }

    pub fn append(&self, kind: &str, run_id: Option<i64>, details: serde_json::Value) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.rotate_if_needed()?;
        let entry = PolicyAuditEntry {
            timestamp: Utc::now(),
            kind: kind.to_string(),
            run_id,
            details,
        };
        let json = serde_json::to_string(&entry)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        writeln!(file, "{json}")?;
        Ok(())
    }

    /// Most recent entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<PolicyAuditEntry> {
        let Ok(content) = fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        content
            .lines()
            .rev()
            .take(limit)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Entries for one run, oldest first.
    pub fn for_run(&self, run_id: i64) -> Vec<PolicyAuditEntry> {
        let Ok(content) = fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        content
            .lines()
            .filter_map(|line| serde_json::from_str::<PolicyAuditEntry>(line).ok())
            .filter(|e| e.run_id == Some(run_id))
            .collect()
    }

    fn rotate_if_needed(&self) -> Result<()> {
        let Ok(meta) = fs::metadata(&self.path) else {
            return Ok(());
        };
        if meta.len() < MAX_LOG_SIZE {
            return Ok(());
        }
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let archived = self.path.with_file_name(format!("policy_audit_{stamp}.log"));
        fs::rename(&self.path, archived)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let log = PolicyAuditLog::new(dir.path());
        log.append("policy_decision", Some(1), serde_json::json!({"allowed": false}))
            .unwrap();
        log.append("patch_adopted", Some(1), serde_json::json!({"kind": "replace_text"}))
            .unwrap();
        log.append("daemon_start", None, serde_json::json!({})).unwrap();

        let recent = log.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].kind, "daemon_start");

        let for_run = log.for_run(1);
        assert_eq!(for_run.len(), 2);
        assert_eq!(for_run[0].kind, "policy_decision");
    }

    #[test]
    fn test_lines_are_json() {
        let dir = TempDir::new().unwrap();
        let log = PolicyAuditLog::new(dir.path());
        log.append("x", None, serde_json::json!({"n": 1})).unwrap();
        let content =
            std::fs::read_to_string(dir.path().join("logs/policy_audit.log")).unwrap();
        for line in content.lines() {
            serde_json::from_str::<serde_json::Value>(line).unwrap();
        }
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let log = PolicyAuditLog::new(dir.path());
        assert!(log.recent(5).is_empty());
        assert!(log.for_run(1).is_empty());
    }
}
