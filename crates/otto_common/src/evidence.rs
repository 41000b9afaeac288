//! Evidence artifacts.
//!
//! Screenshots and DOM schemas are content-addressed by
//! `{run_id, step_index, kind}` and written once, before the step's terminal
//! status is recorded. On-disk layout:
//!
//! - `artifacts/screenshots/{run_id}_step_{i}.png`
//! - `artifacts/schemas/{run_id}_step_{i}.json`

use crate::error::{ErrorCode, StepError};
use crate::run::{EvidenceKind, EvidenceRef};
use crate::web_engine::DomSchema;
use std::path::{Path, PathBuf};

/// Resolves artifact paths under a data root and enforces write-once.
#[derive(Debug, Clone)]
pub struct EvidenceVault {
    root: PathBuf,
}

impl EvidenceVault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn screenshot_path(&self, run_id: i64, step_index: usize) -> PathBuf {
        self.root
            .join("artifacts/screenshots")
            .join(format!("{run_id}_step_{step_index}.png"))
    }

    pub fn schema_path(&self, run_id: i64, step_index: usize) -> PathBuf {
        self.root
            .join("artifacts/schemas")
            .join(format!("{run_id}_step_{step_index}.json"))
    }

    pub fn path_for(&self, run_id: i64, step_index: usize, kind: EvidenceKind) -> PathBuf {
        match kind {
            EvidenceKind::Screenshot => self.screenshot_path(run_id, step_index),
            EvidenceKind::DomSchema => self.schema_path(run_id, step_index),
        }
    }

    /// Write a DOM schema artifact. Write-once: an existing artifact for the
    /// same key is an error.
    pub fn write_schema(
        &self,
        run_id: i64,
        step_index: usize,
        schema: &DomSchema,
    ) -> Result<EvidenceRef, StepError> {
        let path = self.schema_path(run_id, step_index);
        self.ensure_fresh(&path)?;
        let json = serde_json::to_string_pretty(schema)
            .map_err(|e| StepError::new(ErrorCode::Internal, format!("schema encode: {e}")))?;
        std::fs::write(&path, json)
            .map_err(|e| crate::error::io_step_error(&e, "write schema artifact"))?;
        Ok(EvidenceRef {
            run_id,
            step_index,
            kind: EvidenceKind::DomSchema,
            path: path.to_string_lossy().to_string(),
        })
    }

    /// Reserve a screenshot path (the OS adapter writes the bytes).
    pub fn reserve_screenshot(
        &self,
        run_id: i64,
        step_index: usize,
    ) -> Result<(PathBuf, EvidenceRef), StepError> {
        let path = self.screenshot_path(run_id, step_index);
        self.ensure_fresh(&path)?;
        Ok((
            path.clone(),
            EvidenceRef {
                run_id,
                step_index,
                kind: EvidenceKind::Screenshot,
                path: path.to_string_lossy().to_string(),
            },
        ))
    }

    fn ensure_fresh(&self, path: &Path) -> Result<(), StepError> {
        if path.exists() {
            return Err(StepError::new(
                ErrorCode::Internal,
                format!("evidence artifact {} already exists", path.display()),
            ));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::error::io_step_error(&e, "create artifact dir"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths_follow_layout() {
        let vault = EvidenceVault::new("/data");
        assert_eq!(
            vault.screenshot_path(12, 3),
            PathBuf::from("/data/artifacts/screenshots/12_step_3.png")
        );
        assert_eq!(
            vault.schema_path(12, 3),
            PathBuf::from("/data/artifacts/schemas/12_step_3.json")
        );
    }

    #[test]
    fn test_schema_write_once() {
        let dir = TempDir::new().unwrap();
        let vault = EvidenceVault::new(dir.path());
        let schema = DomSchema::default();
        let evref = vault.write_schema(1, 0, &schema).unwrap();
        assert!(Path::new(&evref.path).exists());
        let err = vault.write_schema(1, 0, &schema).unwrap_err();
        assert!(err.message.contains("already exists"));
    }

    #[test]
    fn test_reserve_screenshot_creates_parent() {
        let dir = TempDir::new().unwrap();
        let vault = EvidenceVault::new(dir.path());
        let (path, evref) = vault.reserve_screenshot(2, 5).unwrap();
        assert!(path.parent().unwrap().exists());
        assert_eq!(evref.kind, EvidenceKind::Screenshot);
    }
}
