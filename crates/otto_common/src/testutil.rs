//! Deterministic fake adapters for tests.
//!
//! Tests substitute these for the OS and web engines instead of patching
//! globals. The fakes are scriptable: pages, delayed elements, downloads,
//! injected failures. PDF files are simulated as text files carrying a page
//! count marker so merge/extract/count stay consistent.

use crate::error::{ErrorCode, StepError};
use crate::manifest::Capability;
use crate::os_adapter::{
    parse_ranges, CapabilityDescriptor, MoveOutcome, OsAdapter, PdfOutcome, PermissionIssue,
};
use crate::web_engine::{DomElement, DomSchema, Target, WebBatch, WebEngine, WebOp};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const FAKE_PDF_MARKER: &str = "FAKEPDF pages=";

/// Build a schema from `(role, text)` pairs.
pub fn fake_page(elements: &[(&str, &str)]) -> DomSchema {
    DomSchema {
        url: String::new(),
        title: "fake".to_string(),
        elements: elements
            .iter()
            .map(|(role, text)| DomElement {
                role: Some(role.to_string()),
                text: Some(text.to_string()),
                ..Default::default()
            })
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// Fake OS adapter
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeOsState {
    drafts: HashMap<String, (Vec<String>, String, String, Vec<PathBuf>)>,
    saved_drafts: Vec<String>,
    fail_injections: HashMap<String, (u32, ErrorCode)>,
}

/// Fake OS adapter: real filesystem for file ops (under test temp dirs),
/// simulated PDF and mail.
pub struct FakeOsAdapter {
    state: Mutex<FakeOsState>,
    draft_seq: AtomicU64,
}

impl Default for FakeOsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeOsAdapter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeOsState::default()),
            draft_seq: AtomicU64::new(1),
        }
    }

    /// Write a fake PDF with the given page count.
    pub fn write_pdf(&self, path: &Path, pages: u64) {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::write(path, format!("{FAKE_PDF_MARKER}{pages}\n")).unwrap();
    }

    /// Make the next `times` calls to `method` fail with `code`.
    pub fn fail_times(&self, method: &str, times: u32, code: ErrorCode) {
        self.lock()
            .fail_injections
            .insert(method.to_string(), (times, code));
    }

    pub fn saved_drafts(&self) -> Vec<String> {
        self.lock().saved_drafts.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeOsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_injection(&self, method: &str) -> Result<(), StepError> {
        let mut state = self.lock();
        if let Some((times, code)) = state.fail_injections.get_mut(method) {
            if *times > 0 {
                *times -= 1;
                let code = *code;
                return Err(StepError::new(code, format!("injected {method} failure")));
            }
        }
        Ok(())
    }

    fn read_pages(&self, path: &Path) -> Result<u64, StepError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| crate::error::io_step_error(&e, "read pdf"))?;
        text.lines()
            .find_map(|l| l.strip_prefix(FAKE_PDF_MARKER))
            .and_then(|n| n.trim().parse().ok())
            .ok_or_else(|| {
                StepError::new(
                    ErrorCode::PdfParseError,
                    format!("{} is not a fake pdf", path.display()),
                )
            })
    }
}

impl OsAdapter for FakeOsAdapter {
    fn capabilities(&self) -> BTreeMap<Capability, CapabilityDescriptor> {
        [
            Capability::Fs,
            Capability::Pdf,
            Capability::MailDraft,
            Capability::Webx,
            Capability::Screenshot,
        ]
        .into_iter()
        .map(|c| {
            (
                c,
                CapabilityDescriptor {
                    available: true,
                    concurrency: 2,
                },
            )
        })
        .collect()
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
        self.check_injection("find_files")?;
        crate::os_adapter::LocalOsAdapter.find_files(query, roots, limit)
    }

    fn rename(&self, path: &Path, pattern: &str) -> Result<PathBuf, StepError> {
        self.check_injection("rename")?;
        crate::os_adapter::LocalOsAdapter.rename(path, pattern)
    }

    fn move_to(&self, path: &Path, dest: &Path, overwrite: bool) -> Result<MoveOutcome, StepError> {
        self.check_injection("move_to")?;
        crate::os_adapter::LocalOsAdapter.move_to(path, dest, overwrite)
    }

    fn create_dir(&self, path: &Path) -> Result<(), StepError> {
        crate::os_adapter::LocalOsAdapter.create_dir(path)
    }

    fn pdf_merge(&self, inputs: &[PathBuf], output: &Path) -> Result<PdfOutcome, StepError> {
        self.check_injection("pdf_merge")?;
        let mut total = 0;
        for input in inputs {
            total += self.read_pages(input)?;
        }
        self.write_pdf(output, total);
        Ok(PdfOutcome {
            path: output.to_path_buf(),
            page_count: total,
        })
    }

    fn pdf_extract_pages(
        &self,
        path: &Path,
        ranges: &str,
        output: &Path,
    ) -> Result<PdfOutcome, StepError> {
        self.check_injection("pdf_extract_pages")?;
        let available = self.read_pages(path)?;
        let pages = parse_ranges(ranges)?;
        if pages.iter().any(|p| *p > available) {
            return Err(StepError::new(
                ErrorCode::PdfParseError,
                format!("range '{ranges}' exceeds {available} pages"),
            ));
        }
        self.write_pdf(output, pages.len() as u64);
        Ok(PdfOutcome {
            path: output.to_path_buf(),
            page_count: pages.len() as u64,
        })
    }

    fn pdf_page_count(&self, path: &Path) -> Result<u64, StepError> {
        self.check_injection("pdf_page_count")?;
        self.read_pages(path)
    }

    fn compose_mail(&self, to: &[String], subject: &str, body: &str) -> Result<String, StepError> {
        self.check_injection("compose_mail")?;
        let draft_id = format!("draft-{}", self.draft_seq.fetch_add(1, Ordering::Relaxed));
        self.lock().drafts.insert(
            draft_id.clone(),
            (to.to_vec(), subject.to_string(), body.to_string(), Vec::new()),
        );
        Ok(draft_id)
    }

    fn attach_files(&self, draft_id: &str, files: &[PathBuf]) -> Result<(), StepError> {
        self.check_injection("attach_files")?;
        let mut state = self.lock();
        let draft = state.drafts.get_mut(draft_id).ok_or_else(|| {
            StepError::new(ErrorCode::Internal, format!("unknown draft '{draft_id}'"))
        })?;
        draft.3.extend(files.iter().cloned());
        Ok(())
    }

    fn save_draft(&self, draft_id: &str) -> Result<String, StepError> {
        self.check_injection("save_draft")?;
        let mut state = self.lock();
        if !state.drafts.contains_key(draft_id) {
            return Err(StepError::new(
                ErrorCode::Internal,
                format!("unknown draft '{draft_id}'"),
            ));
        }
        state.saved_drafts.push(draft_id.to_string());
        Ok(draft_id.to_string())
    }

    fn take_screenshot(&self, path: &Path) -> Result<(), StepError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::write(path, b"\x89PNG fake").map_err(|e| crate::error::io_step_error(&e, "screenshot"))
    }
}

// ---------------------------------------------------------------------------
// Fake web engine
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeWebState {
    pages: HashMap<String, DomSchema>,
    current: Option<String>,
    delayed: Vec<(String, Instant)>,
    downloads: HashMap<String, (String, Instant)>,
    click_transitions: HashMap<String, String>,
    redirects: HashMap<String, String>,
    unexpected_remaining: u32,
}

/// Scriptable fake web engine.
#[derive(Default)]
pub struct FakeWebEngine {
    state: Mutex<FakeWebState>,
}

impl FakeWebEngine {
    pub fn set_page(&self, url: &str, mut schema: DomSchema) {
        schema.url = url.to_string();
        let mut state = self.lock();
        if state.current.is_none() {
            state.current = Some(url.to_string());
        }
        state.pages.insert(url.to_string(), schema);
    }

    /// Hide an element (by exact text) until `delay` has elapsed from now.
    pub fn delay_element(&self, text: &str, delay: Duration) {
        self.lock()
            .delayed
            .push((text.to_string(), Instant::now() + delay));
    }

    /// Script a download: the file appears at `to` with `content` once
    /// `delay` has elapsed from now.
    pub fn script_download(&self, to: &str, content: &str, delay: Duration) {
        self.lock()
            .downloads
            .insert(to.to_string(), (content.to_string(), Instant::now() + delay));
    }

    /// Clicking the element with `text` navigates to `url`.
    pub fn on_click_goto(&self, text: &str, url: &str) {
        self.lock()
            .click_transitions
            .insert(text.to_string(), url.to_string());
    }

    /// Opening `from` lands on `to` instead (cross-domain drift).
    pub fn redirect(&self, from: &str, to: &str) {
        self.lock()
            .redirects
            .insert(from.to_string(), to.to_string());
    }

    /// The next `n` op results carry `unexpected_element: true`.
    pub fn inject_unexpected(&self, n: u32) {
        self.lock().unexpected_remaining = n;
    }

    pub fn current_url(&self) -> Option<String> {
        self.lock().current.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeWebState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn visible_schema(state: &FakeWebState) -> DomSchema {
        let url = state.current.clone().unwrap_or_default();
        let mut schema = state.pages.get(&url).cloned().unwrap_or(DomSchema {
            url: url.clone(),
            ..Default::default()
        });
        let now = Instant::now();
        schema.elements.retain(|e| {
            !state
                .delayed
                .iter()
                .any(|(text, ready)| e.text.as_deref() == Some(text) && now < *ready)
        });
        schema
    }

    fn annotate(state: &mut FakeWebState, mut value: serde_json::Value) -> serde_json::Value {
        if state.unexpected_remaining > 0 {
            state.unexpected_remaining -= 1;
            if let Some(obj) = value.as_object_mut() {
                obj.insert("unexpected_element".to_string(), serde_json::json!(true));
            }
        }
        value
    }
}

fn target_text(target: &Target) -> &str {
    match target {
        Target::Label(s) | Target::Selector(s) | Target::Text(s) => s,
    }
}

impl WebEngine for FakeWebEngine {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn execute(&self, batch: &WebBatch) -> Result<Vec<serde_json::Value>, StepError> {
        let mut results = Vec::with_capacity(batch.ops.len());
        for op in &batch.ops {
            let mut state = self.lock();
            let result = match op {
                WebOp::Open { url, .. } => {
                    let landed = state.redirects.get(url).cloned().unwrap_or_else(|| url.clone());
                    state.current = Some(landed.clone());
                    serde_json::json!({"url": landed, "opened": true})
                }
                WebOp::Click { target, broaden, .. } => {
                    let schema = Self::visible_schema(&state);
                    let text = target_text(target);
                    let hit = if *broaden {
                        schema.find_broadened(text).cloned()
                    } else {
                        schema.find_by_text(text).cloned()
                    };
                    match hit {
                        Some(el) => {
                            let clicked = el.text.clone().unwrap_or_default();
                            if let Some(next) = state.click_transitions.get(&clicked).cloned() {
                                state.current = Some(next);
                            }
                            serde_json::json!({"clicked": clicked, "found": true,
                                               "url": state.current.clone().unwrap_or_default()})
                        }
                        None => {
                            return Err(StepError::new(
                                ErrorCode::WebElementNotFound,
                                format!("no element with text '{text}'"),
                            ))
                        }
                    }
                }
                WebOp::Fill { target, text, .. } => {
                    let schema = Self::visible_schema(&state);
                    let label = target_text(target);
                    let found = schema.elements.iter().any(|e| {
                        e.label.as_deref() == Some(label)
                            || e.placeholder.as_deref() == Some(label)
                            || e.aria_label.as_deref() == Some(label)
                    });
                    if !found {
                        return Err(StepError::new(
                            ErrorCode::WebElementNotFound,
                            format!("no field labelled '{label}'"),
                        ));
                    }
                    serde_json::json!({"filled": label, "chars": text.len()})
                }
                WebOp::Upload { path, .. } => {
                    if Path::new(path).exists() {
                        serde_json::json!({"uploaded": path})
                    } else {
                        return Err(StepError::new(
                            ErrorCode::WebUploadFailed,
                            format!("file '{path}' not found for upload"),
                        ));
                    }
                }
                WebOp::WaitForDownload { to, timeout_ms } => {
                    let deadline = Instant::now() + Duration::from_millis(*timeout_ms);
                    let scripted = state.downloads.get(to).cloned();
                    match scripted {
                        Some((content, ready)) => {
                            drop(state);
                            if ready > deadline {
                                return Err(StepError::new(
                                    ErrorCode::DownloadTimeout,
                                    format!("download to '{to}' not complete in {timeout_ms}ms"),
                                ));
                            }
                            let wait = ready.saturating_duration_since(Instant::now());
                            std::thread::sleep(wait);
                            if let Some(parent) = Path::new(to).parent() {
                                let _ = std::fs::create_dir_all(parent);
                            }
                            std::fs::write(to, content)
                                .map_err(|e| crate::error::io_step_error(&e, "download"))?;
                            state = self.lock();
                            serde_json::json!({"path": to, "complete": true})
                        }
                        None => {
                            return Err(StepError::new(
                                ErrorCode::DownloadTimeout,
                                format!("no download scripted for '{to}'"),
                            ))
                        }
                    }
                }
                WebOp::CaptureDomSchema { .. } => {
                    let schema = Self::visible_schema(&state);
                    serde_json::json!({"schema": schema})
                }
                WebOp::CookiesGet => serde_json::json!({"cookies": []}),
                WebOp::CookiesSet { .. } => serde_json::json!({"ok": true}),
                WebOp::FrameSelect { frame } => serde_json::json!({"frame": frame}),
                WebOp::FrameClear => serde_json::json!({"ok": true}),
                WebOp::PierceShadow { selector } => serde_json::json!({"pierced": selector}),
            };
            let annotated = Self::annotate(&mut state, result);
            results.push(annotated);
        }
        Ok(results)
    }

    fn context_snapshot(&self) -> Option<String> {
        self.current_url()
    }
}
