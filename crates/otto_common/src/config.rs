//! Configuration surfaces.
//!
//! Each surface is one TOML file in the config directory: `web_engine.toml`,
//! `policy.toml`, `schedules.toml`, `trust_store.toml`, `orchestrator.toml`.
//! Missing files fall back to defaults so a bare data directory is a valid
//! deployment.

use crate::plan::{RetrySpec, WebEngineKind};
use crate::policy::PolicyConfig;
use crate::queue::QueueConfig;
use crate::signing::TrustStore;
use crate::triggers::ScheduleSpec;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// `web_engine.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebEngineConfig {
    pub engine: WebEngineKind,
    pub timeout_ms: u64,
    pub enable_debugger_upload: bool,
    pub fallback_engine: Option<WebEngineKind>,
}

impl Default for WebEngineConfig {
    fn default() -> Self {
        Self {
            engine: WebEngineKind::Extension,
            timeout_ms: 10_000,
            enable_debugger_upload: false,
            fallback_engine: Some(WebEngineKind::Playwright),
        }
    }
}

/// Per-queue tuning in `orchestrator.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueTuning {
    pub max_concurrent: Option<usize>,
    pub max_pending: Option<usize>,
    pub retry: Option<RetrySpec>,
}

/// What evidence the executor captures per step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceSettings {
    pub screenshots: bool,
    pub schemas: bool,
}

impl Default for EvidenceSettings {
    fn default() -> Self {
        Self {
            screenshots: true,
            schemas: true,
        }
    }
}

/// `orchestrator.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub queues: BTreeMap<String, QueueTuning>,
    pub workers: usize,
    /// Checkpoint every N completed steps on long runs.
    pub checkpoint_every: usize,
    pub evidence: EvidenceSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queues: BTreeMap::new(),
            workers: 2,
            checkpoint_every: 5,
            evidence: EvidenceSettings::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Queue configs for the scheduler.
    pub fn queue_configs(&self) -> BTreeMap<String, QueueConfig> {
        self.queues
            .iter()
            .map(|(name, tuning)| {
                let defaults = QueueConfig::default();
                (
                    name.clone(),
                    QueueConfig {
                        max_concurrent: tuning.max_concurrent.unwrap_or(defaults.max_concurrent),
                        max_pending: tuning.max_pending.unwrap_or(defaults.max_pending),
                    },
                )
            })
            .collect()
    }

    /// Retry override for a queue, when configured.
    pub fn retry_for(&self, queue: &str) -> Option<RetrySpec> {
        self.queues.get(queue).and_then(|t| t.retry)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SchedulesFile {
    #[serde(default)]
    schedules: Vec<ScheduleSpec>,
}

/// All loaded configuration plus the data directory layout.
#[derive(Debug, Clone)]
pub struct ConfigSet {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub web_engine: WebEngineConfig,
    pub policy: PolicyConfig,
    pub schedules: Vec<ScheduleSpec>,
    pub trust_store: TrustStore,
    pub orchestrator: OrchestratorConfig,
}

impl ConfigSet {
    /// Load every surface from `config_dir`, defaulting missing files.
    pub fn load(config_dir: &Path, data_dir: &Path) -> Result<ConfigSet> {
        Ok(ConfigSet {
            config_dir: config_dir.to_path_buf(),
            data_dir: data_dir.to_path_buf(),
            web_engine: load_or_default(&config_dir.join("web_engine.toml"))?,
            policy: load_or_default(&config_dir.join("policy.toml"))?,
            schedules: load_or_default::<SchedulesFile>(&config_dir.join("schedules.toml"))?
                .schedules,
            trust_store: load_or_default(&config_dir.join("trust_store.toml"))?,
            orchestrator: load_or_default(&config_dir.join("orchestrator.toml"))?,
        })
    }

    /// Defaults rooted at a directory, for tests and `policy test` dry runs.
    pub fn defaults_at(dir: &Path) -> ConfigSet {
        ConfigSet {
            config_dir: dir.to_path_buf(),
            data_dir: dir.to_path_buf(),
            web_engine: WebEngineConfig::default(),
            policy: PolicyConfig::default(),
            schedules: Vec::new(),
            trust_store: TrustStore::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }

    pub fn run_store_path(&self) -> PathBuf {
        self.data_dir.join("runs.db")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }
}

/// When true, missing OS permissions block execution instead of warning.
pub fn permissions_strict() -> bool {
    std::env::var("PERMISSIONS_STRICT")
        .map(|v| {
            let v = v.trim().to_lowercase();
            v == "1" || v == "true" || v == "yes"
        })
        .unwrap_or(false)
}

fn load_or_default<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_files_default() {
        let dir = TempDir::new().unwrap();
        let config = ConfigSet::load(dir.path(), dir.path()).unwrap();
        assert!(!config.policy.autopilot);
        assert_eq!(config.orchestrator.checkpoint_every, 5);
        assert!(config.schedules.is_empty());
        assert!(config.trust_store.keys.is_empty());
    }

    #[test]
    fn test_policy_toml_parses() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("policy.toml"),
            r#"
autopilot = true
allow_domains = ["*.partner.example.com"]
allow_risks = ["fs", "pdf", "webx"]
require_signed_templates = true
deviation_threshold = 4

[window]
days = ["mon", "tue", "wed", "thu", "fri"]
start = "09:00"
end = "18:00"
tz = "Asia/Tokyo"

[adopt_policy]
low_risk_auto = true
min_confidence = 0.9
max_auto_changes = 1
"#,
        )
        .unwrap();
        let config = ConfigSet::load(dir.path(), dir.path()).unwrap();
        assert!(config.policy.autopilot);
        assert_eq!(config.policy.allow_domains.len(), 1);
        assert_eq!(config.policy.deviation_threshold, 4);
        assert_eq!(config.policy.adopt_policy.min_confidence, 0.9);
        assert_eq!(config.policy.window.as_ref().unwrap().tz, "Asia/Tokyo");
    }

    #[test]
    fn test_orchestrator_queue_configs() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("orchestrator.toml"),
            r#"
workers = 4

[queues.reports]
max_concurrent = 2

[queues.reports.retry]
max_attempts = 3
backoff_ms = 100

[queues.bulk]
max_concurrent = 1
max_pending = 16
"#,
        )
        .unwrap();
        let config = ConfigSet::load(dir.path(), dir.path()).unwrap();
        let queues = config.orchestrator.queue_configs();
        assert_eq!(queues["reports"].max_concurrent, 2);
        assert_eq!(queues["bulk"].max_pending, 16);
        assert_eq!(config.orchestrator.retry_for("reports").unwrap().max_attempts, 3);
        assert!(config.orchestrator.retry_for("bulk").is_none());
    }

    #[test]
    fn test_schedules_toml() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("schedules.toml"),
            r#"
[[schedules]]
id = "weekly-report"
cron = "0 9 * * 1"
tz = "Asia/Tokyo"
template = "plans/weekly.yaml"
queue = "reports"
priority = 3

[schedules.variables]
inbox = "./sample_data"

[[schedules]]
id = "inbox-watch"
template = "plans/intake.yaml"

[schedules.watch]
path = "./inbox"
pattern = "*.pdf"
debounce_ms = 2000
"#,
        )
        .unwrap();
        let config = ConfigSet::load(dir.path(), dir.path()).unwrap();
        assert_eq!(config.schedules.len(), 2);
        assert_eq!(config.schedules[0].cron.as_deref(), Some("0 9 * * 1"));
        assert_eq!(
            config.schedules[1].watch.as_ref().unwrap().debounce_ms,
            2000
        );
    }

    #[test]
    fn test_permissions_strict_env() {
        std::env::set_var("PERMISSIONS_STRICT", "true");
        assert!(permissions_strict());
        std::env::set_var("PERMISSIONS_STRICT", "0");
        assert!(!permissions_strict());
        std::env::remove_var("PERMISSIONS_STRICT");
        assert!(!permissions_strict());
    }
}
