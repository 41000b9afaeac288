//! Run checkpoints.
//!
//! A checkpoint captures everything needed to resume a run at a step
//! boundary: the next step index, resolved variables, prior step outputs and
//! any engine contexts. Checkpoints are written with the
//! write-temp-fsync-rename pattern so a reader only ever sees a complete
//! file, and are invalidated on successful completion.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Resumable snapshot of a run in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: i64,
    pub next_step_index: usize,
    pub variables: BTreeMap<String, serde_json::Value>,
    pub step_outputs: BTreeMap<usize, serde_json::Value>,
    #[serde(default)]
    pub engine_contexts: BTreeMap<String, String>,
    pub written_at: DateTime<Utc>,
}

/// Checkpoint files live under `<root>/checkpoints/run_<id>.json`.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, run_id: i64) -> PathBuf {
        self.root.join(format!("run_{run_id}.json"))
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.path_for(checkpoint.run_id);
        let json = serde_json::to_string_pretty(checkpoint)?;
        atomic_write(&path, json.as_bytes())
            .with_context(|| format!("writing checkpoint {}", path.display()))
    }

    pub fn load(&self, run_id: i64) -> Result<Option<Checkpoint>> {
        let path = self.path_for(run_id);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading checkpoint {}", path.display()))?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// Remove the checkpoint after a run reaches a terminal state.
    pub fn invalidate(&self, run_id: i64) -> Result<()> {
        let path = self.path_for(run_id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

/// Atomic write: temp file in the same directory, fsync, rename over the
/// target, fsync the directory.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let dir = path.parent().unwrap_or(Path::new("."));
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("checkpoint");
    let temp_path = dir.join(format!(".{}.tmp.{}", filename, std::process::id()));

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    fs::rename(&temp_path, path)?;

    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample(run_id: i64) -> Checkpoint {
        Checkpoint {
            run_id,
            next_step_index: 3,
            variables: [("inbox".to_string(), json!("./in"))].into(),
            step_outputs: [(0usize, json!({"found": 2, "paths": ["a", "b"]}))].into(),
            engine_contexts: [("web".to_string(), "ctx-1".to_string())].into(),
            written_at: Utc::now(),
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let cp = sample(7);
        store.save(&cp).unwrap();
        let loaded = store.load(7).unwrap().unwrap();
        assert_eq!(loaded, cp);
    }

    #[test]
    fn test_missing_checkpoint_is_none() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.load(99).unwrap().is_none());
    }

    #[test]
    fn test_overwrite_keeps_latest() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut cp = sample(1);
        store.save(&cp).unwrap();
        cp.next_step_index = 5;
        store.save(&cp).unwrap();
        assert_eq!(store.load(1).unwrap().unwrap().next_step_index, 5);
    }

    #[test]
    fn test_invalidate_removes_file() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(&sample(2)).unwrap();
        store.invalidate(2).unwrap();
        assert!(store.load(2).unwrap().is_none());
        // Idempotent.
        store.invalidate(2).unwrap();
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(&sample(3)).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }
}
