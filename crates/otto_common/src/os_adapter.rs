//! OS adapter contract.
//!
//! File, PDF, mail-draft and screenshot operations behind one trait. The
//! core ships a local filesystem implementation; PDF and mail are host
//! integrations provided per OS, so the local adapter reports them
//! unavailable and steps fail with OS_CAPABILITY_MISS unless a fallback is
//! declared.

use crate::error::{io_step_error, ErrorCode, StepError};
use crate::manifest::Capability;
use crate::triggers::glob_match;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Availability and concurrency declaration for one capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub available: bool,
    pub concurrency: u32,
}

/// One missing host permission found by `check_permissions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionIssue {
    pub capability: Capability,
    pub detail: String,
}

/// Outcome of a move, including whether the destination directory had to be
/// created by recovery.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveOutcome {
    pub path: PathBuf,
    pub created_dir: bool,
}

/// Outcome of a PDF operation.
#[derive(Debug, Clone, PartialEq)]
pub struct PdfOutcome {
    pub path: PathBuf,
    pub page_count: u64,
}

/// Host operations the executor dispatches file/PDF/mail steps to.
pub trait OsAdapter: Send + Sync {
    fn capabilities(&self) -> BTreeMap<Capability, CapabilityDescriptor>;

    /// Missing host permissions. Under PERMISSIONS_STRICT these block
    /// execution; otherwise they are logged as warnings.
    fn check_permissions(&self) -> Vec<PermissionIssue>;

    fn find_files(
        &self,
        query: &str,
        roots: &[PathBuf],
        limit: usize,
    ) -> Result<Vec<PathBuf>, StepError>;

    fn rename(&self, path: &Path, pattern: &str) -> Result<PathBuf, StepError>;

    fn move_to(&self, path: &Path, dest: &Path, overwrite: bool) -> Result<MoveOutcome, StepError>;

    fn create_dir(&self, path: &Path) -> Result<(), StepError>;

    fn pdf_merge(&self, inputs: &[PathBuf], output: &Path) -> Result<PdfOutcome, StepError>;

    fn pdf_extract_pages(
        &self,
        path: &Path,
        ranges: &str,
        output: &Path,
    ) -> Result<PdfOutcome, StepError>;

    fn pdf_page_count(&self, path: &Path) -> Result<u64, StepError>;

    fn compose_mail(&self, to: &[String], subject: &str, body: &str) -> Result<String, StepError>;

    fn attach_files(&self, draft_id: &str, files: &[PathBuf]) -> Result<(), StepError>;

    fn save_draft(&self, draft_id: &str) -> Result<String, StepError>;

    fn take_screenshot(&self, path: &Path) -> Result<(), StepError>;
}

fn capability_miss(capability: Capability) -> StepError {
    StepError::new(
        ErrorCode::OsCapabilityMiss,
        format!("capability '{}' is not available on this host", capability.as_str()),
    )
    .with_hint("install the host integration or run on a supported OS")
}

/// Local filesystem adapter: real file operations, no PDF/mail/screenshot
/// integrations.
#[derive(Debug, Default)]
pub struct LocalOsAdapter;

impl OsAdapter for LocalOsAdapter {
    fn capabilities(&self) -> BTreeMap<Capability, CapabilityDescriptor> {
        [
            (
                Capability::Fs,
                CapabilityDescriptor {
                    available: true,
                    concurrency: 4,
                },
            ),
            (
                Capability::Pdf,
                CapabilityDescriptor {
                    available: false,
                    concurrency: 0,
                },
            ),
            (
                Capability::MailDraft,
                CapabilityDescriptor {
                    available: false,
                    concurrency: 0,
                },
            ),
            (
                Capability::Screenshot,
                CapabilityDescriptor {
                    available: false,
                    concurrency: 0,
                },
            ),
        ]
        .into()
    }

    fn check_permissions(&self) -> Vec<PermissionIssue> {
        Vec::new()
    }

    fn find_files(
        &self,
        query: &str,
        roots: &[PathBuf],
        limit: usize,
    ) -> Result<Vec<PathBuf>, StepError> {
        let mut found = Vec::new();
        for root in roots {
            if !root.exists() {
                continue;
            }
            for entry in walkdir::WalkDir::new(root)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if glob_match(query, &name) {
                    found.push(entry.path().to_path_buf());
                    if found.len() >= limit {
                        return Ok(found);
                    }
                }
            }
        }
        Ok(found)
    }

    fn rename(&self, path: &Path, pattern: &str) -> Result<PathBuf, StepError> {
        if !path.exists() {
            return Err(StepError::new(
                ErrorCode::FileNotFound,
                format!("{} does not exist", path.display()),
            ));
        }
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let ext = path
            .extension()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let new_name = pattern.replace("{name}", &stem).replace("{ext}", &ext);
        let new_path = path.with_file_name(new_name);
        std::fs::rename(path, &new_path).map_err(|e| io_step_error(&e, "rename"))?;
        Ok(new_path)
    }

    fn move_to(&self, path: &Path, dest: &Path, overwrite: bool) -> Result<MoveOutcome, StepError> {
        if !path.exists() {
            return Err(StepError::new(
                ErrorCode::FileNotFound,
                format!("{} does not exist", path.display()),
            ));
        }
        let target = if dest.is_dir() || dest.to_string_lossy().ends_with('/') {
            match path.file_name() {
                Some(name) => dest.join(name),
                None => dest.to_path_buf(),
            }
        } else {
            dest.to_path_buf()
        };
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(StepError::new(
                    ErrorCode::FileNotFound,
                    format!("destination directory {} does not exist", parent.display()),
                )
                .with_hint("create the destination directory"));
            }
        }
        if target.exists() && !overwrite {
            return Err(StepError::new(
                ErrorCode::Internal,
                format!("{} already exists and overwrite_if_exists is false", target.display()),
            ));
        }
        std::fs::rename(path, &target).map_err(|e| io_step_error(&e, "move"))?;
        Ok(MoveOutcome {
            path: target,
            created_dir: false,
        })
    }

    fn create_dir(&self, path: &Path) -> Result<(), StepError> {
        std::fs::create_dir_all(path).map_err(|e| io_step_error(&e, "create_dir"))
    }

    fn pdf_merge(&self, _inputs: &[PathBuf], _output: &Path) -> Result<PdfOutcome, StepError> {
        Err(capability_miss(Capability::Pdf))
    }

    fn pdf_extract_pages(
        &self,
        _path: &Path,
        _ranges: &str,
        _output: &Path,
    ) -> Result<PdfOutcome, StepError> {
        Err(capability_miss(Capability::Pdf))
    }

    fn pdf_page_count(&self, _path: &Path) -> Result<u64, StepError> {
        Err(capability_miss(Capability::Pdf))
    }

    fn compose_mail(
        &self,
        _to: &[String],
        _subject: &str,
        _body: &str,
    ) -> Result<String, StepError> {
        Err(capability_miss(Capability::MailDraft))
    }

    fn attach_files(&self, _draft_id: &str, _files: &[PathBuf]) -> Result<(), StepError> {
        Err(capability_miss(Capability::MailDraft))
    }

    fn save_draft(&self, _draft_id: &str) -> Result<String, StepError> {
        Err(capability_miss(Capability::MailDraft))
    }

    fn take_screenshot(&self, _path: &Path) -> Result<(), StepError> {
        Err(capability_miss(Capability::Screenshot))
    }
}

/// Parse a page-range expression like `1-3,7` into 1-based page numbers.
pub fn parse_ranges(ranges: &str) -> Result<Vec<u64>, StepError> {
    let mut pages = Vec::new();
    for part in ranges.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((a, b)) => {
                let start: u64 = a.trim().parse().map_err(|_| bad_range(ranges))?;
                let end: u64 = b.trim().parse().map_err(|_| bad_range(ranges))?;
                if start == 0 || end < start {
                    return Err(bad_range(ranges));
                }
                pages.extend(start..=end);
            }
            None => {
                let page: u64 = part.parse().map_err(|_| bad_range(ranges))?;
                if page == 0 {
                    return Err(bad_range(ranges));
                }
                pages.push(page);
            }
        }
    }
    if pages.is_empty() {
        return Err(bad_range(ranges));
    }
    Ok(pages)
}

fn bad_range(ranges: &str) -> StepError {
    StepError::new(
        ErrorCode::PdfParseError,
        format!("invalid page ranges '{ranges}'"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_find_files_glob_and_limit() {
        let dir = TempDir::new().unwrap();
        for name in ["a.pdf", "b.pdf", "c.txt"] {
            std::fs::write(dir.path().join(name), "x").unwrap();
        }
        let adapter = LocalOsAdapter;
        let found = adapter
            .find_files("*.pdf", &[dir.path().to_path_buf()], 10)
            .unwrap();
        assert_eq!(found.len(), 2);
        let limited = adapter
            .find_files("*.pdf", &[dir.path().to_path_buf()], 1)
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_find_files_missing_root_is_empty_not_error() {
        let adapter = LocalOsAdapter;
        let found = adapter
            .find_files("*", &[PathBuf::from("/nonexistent/otto")], 5)
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_rename_with_placeholders() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.pdf");
        std::fs::write(&path, "x").unwrap();
        let adapter = LocalOsAdapter;
        let renamed = adapter.rename(&path, "archived_{name}.{ext}").unwrap();
        assert_eq!(
            renamed.file_name().unwrap().to_string_lossy(),
            "archived_report.pdf"
        );
        assert!(renamed.exists());
    }

    #[test]
    fn test_move_to_missing_dir_reports_file_not_found() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.txt");
        std::fs::write(&src, "x").unwrap();
        let adapter = LocalOsAdapter;
        let err = adapter
            .move_to(&src, &dir.path().join("missing/a.txt"), false)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::FileNotFound);
        // After creating the directory the move succeeds.
        adapter.create_dir(&dir.path().join("missing")).unwrap();
        let outcome = adapter
            .move_to(&src, &dir.path().join("missing/a.txt"), false)
            .unwrap();
        assert!(outcome.path.exists());
    }

    #[test]
    fn test_pdf_unavailable_on_local_adapter() {
        let adapter = LocalOsAdapter;
        let err = adapter.pdf_page_count(Path::new("x.pdf")).unwrap_err();
        assert_eq!(err.code, ErrorCode::OsCapabilityMiss);
        let caps = adapter.capabilities();
        assert!(!caps[&Capability::Pdf].available);
        assert!(caps[&Capability::Fs].available);
    }

    #[test]
    fn test_parse_ranges() {
        assert_eq!(parse_ranges("1-3,7").unwrap(), vec![1, 2, 3, 7]);
        assert_eq!(parse_ranges("2").unwrap(), vec![2]);
        assert!(parse_ranges("0-3").is_err());
        assert!(parse_ranges("3-1").is_err());
        assert!(parse_ranges("x").is_err());
        assert!(parse_ranges("").is_err());
    }
}
