//! Plan DSL model.
//!
//! A plan is an ordered-mapping YAML document: `dsl_version`, `name`,
//! optional `variables` and `execution` blocks, then `steps` as a sequence of
//! single-key mappings from action name to params. Reserved keys inside a
//! step's params (`when`, `engine`, `timeout_ms`, `required_role`) are lifted
//! onto the step itself at load time.
//!
//! Plans are immutable once loaded; Planner-L2 patches produce a new
//! in-memory plan, never a rewrite of the template file.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// The only DSL version this engine accepts.
pub const DSL_VERSION: &str = "1.1";

/// Step params keys that belong to the step, not the action.
const RESERVED_STEP_KEYS: &[&str] = &["when", "engine", "timeout_ms", "required_role"];

/// Web engine selection for a plan or a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebEngineKind {
    Extension,
    Playwright,
}

/// Retry policy for retryable step failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySpec {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff_ms: 500,
        }
    }
}

/// Optional `execution` block of a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_engine: Option<WebEngineKind>,
}

/// A field that accepts either one string (possibly a whole-value template
/// like `{{steps[0].paths}}`) or an explicit list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringList {
    One(String),
    Many(Vec<String>),
}

impl StringList {
    pub fn iter(&self) -> impl Iterator<Item = &String> {
        match self {
            StringList::One(s) => std::slice::from_ref(s).iter(),
            StringList::Many(v) => v.iter(),
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut String> {
        match self {
            StringList::One(s) => std::slice::from_mut(s).iter_mut(),
            StringList::Many(v) => v.iter_mut(),
        }
    }
}

/// What an approval step does when `timeout_minutes` elapses undecided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoAction {
    Deny,
    Approve,
}

impl Default for AutoAction {
    fn default() -> Self {
        AutoAction::Deny
    }
}

// ---------------------------------------------------------------------------
// Per-action params
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FindFilesParams {
    pub query: String,
    pub roots: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenameParams {
    pub path: String,
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MoveToParams {
    pub path: String,
    pub dest: String,
    #[serde(default)]
    pub overwrite_if_exists: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PdfMergeParams {
    pub inputs: StringList,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PdfExtractPagesParams {
    pub path: String,
    pub ranges: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComposeMailParams {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttachFilesParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_id: Option<String>,
    pub files: StringList,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SaveDraftParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenBrowserParams {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FillByLabelParams {
    pub label: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClickByTextParams {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadFileParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DownloadFileParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub click_text: Option<String>,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaitForDownloadParams {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaptureScreenSchemaParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaitForElementParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssertElementParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count_gte: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssertTextParams {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssertFileExistsParams {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssertPdfPagesParams {
    pub path: String,
    pub expected_pages: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HumanConfirmParams {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u64>,
    #[serde(default)]
    pub auto_action: AutoAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyGuardParams {}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// The closed action set. Externally tagged, so the serialized form is the
/// single-key mapping the plan file uses: `find_files: {query: ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    FindFiles(FindFilesParams),
    Rename(RenameParams),
    MoveTo(MoveToParams),
    PdfMerge(PdfMergeParams),
    PdfExtractPages(PdfExtractPagesParams),
    ComposeMail(ComposeMailParams),
    AttachFiles(AttachFilesParams),
    SaveDraft(SaveDraftParams),
    OpenBrowser(OpenBrowserParams),
    FillByLabel(FillByLabelParams),
    ClickByText(ClickByTextParams),
    UploadFile(UploadFileParams),
    DownloadFile(DownloadFileParams),
    WaitForDownload(WaitForDownloadParams),
    CaptureScreenSchema(CaptureScreenSchemaParams),
    WaitForElement(WaitForElementParams),
    AssertElement(AssertElementParams),
    AssertText(AssertTextParams),
    AssertFileExists(AssertFileExistsParams),
    AssertPdfPages(AssertPdfPagesParams),
    HumanConfirm(HumanConfirmParams),
    PolicyGuard(PolicyGuardParams),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::FindFiles(_) => "find_files",
            Action::Rename(_) => "rename",
            Action::MoveTo(_) => "move_to",
            Action::PdfMerge(_) => "pdf_merge",
            Action::PdfExtractPages(_) => "pdf_extract_pages",
            Action::ComposeMail(_) => "compose_mail",
            Action::AttachFiles(_) => "attach_files",
            Action::SaveDraft(_) => "save_draft",
            Action::OpenBrowser(_) => "open_browser",
            Action::FillByLabel(_) => "fill_by_label",
            Action::ClickByText(_) => "click_by_text",
            Action::UploadFile(_) => "upload_file",
            Action::DownloadFile(_) => "download_file",
            Action::WaitForDownload(_) => "wait_for_download",
            Action::CaptureScreenSchema(_) => "capture_screen_schema",
            Action::WaitForElement(_) => "wait_for_element",
            Action::AssertElement(_) => "assert_element",
            Action::AssertText(_) => "assert_text",
            Action::AssertFileExists(_) => "assert_file_exists",
            Action::AssertPdfPages(_) => "assert_pdf_pages",
            Action::HumanConfirm(_) => "human_confirm",
            Action::PolicyGuard(_) => "policy_guard",
        }
    }

    /// Verification actions are routed through the verifier and get its
    /// one-shot auto-retry instead of the normal retry policy.
    pub fn is_assertion(&self) -> bool {
        matches!(
            self,
            Action::WaitForElement(_)
                | Action::AssertElement(_)
                | Action::AssertText(_)
                | Action::AssertFileExists(_)
                | Action::AssertPdfPages(_)
        )
    }

    /// Actions whose execution reaches the web engine.
    pub fn is_web(&self) -> bool {
        matches!(
            self,
            Action::OpenBrowser(_)
                | Action::FillByLabel(_)
                | Action::ClickByText(_)
                | Action::UploadFile(_)
                | Action::DownloadFile(_)
                | Action::WaitForDownload(_)
                | Action::CaptureScreenSchema(_)
                | Action::WaitForElement(_)
                | Action::AssertElement(_)
                | Action::AssertText(_)
        )
    }

    /// Visit every templatable string field.
    pub fn visit_strings<'a>(&'a self, f: &mut dyn FnMut(&'a str)) {
        // The mutable visitor below is the single source of truth for which
        // fields are templatable; this clone-free variant must stay in sync.
        match self {
            Action::FindFiles(p) => {
                f(&p.query);
                p.roots.iter().for_each(|s| f(s));
            }
            Action::Rename(p) => {
                f(&p.path);
                f(&p.pattern);
            }
            Action::MoveTo(p) => {
                f(&p.path);
                f(&p.dest);
            }
            Action::PdfMerge(p) => {
                p.inputs.iter().for_each(|s| f(s));
                if let Some(o) = &p.output {
                    f(o);
                }
            }
            Action::PdfExtractPages(p) => {
                f(&p.path);
                f(&p.ranges);
                if let Some(o) = &p.output {
                    f(o);
                }
            }
            Action::ComposeMail(p) => {
                p.to.iter().for_each(|s| f(s));
                f(&p.subject);
                f(&p.body);
            }
            Action::AttachFiles(p) => {
                if let Some(d) = &p.draft_id {
                    f(d);
                }
                p.files.iter().for_each(|s| f(s));
            }
            Action::SaveDraft(p) => {
                if let Some(d) = &p.draft_id {
                    f(d);
                }
            }
            Action::OpenBrowser(p) => {
                f(&p.url);
                if let Some(c) = &p.context {
                    f(c);
                }
            }
            Action::FillByLabel(p) => {
                f(&p.label);
                f(&p.text);
            }
            Action::ClickByText(p) => f(&p.text),
            Action::UploadFile(p) => {
                if let Some(s) = &p.selector {
                    f(s);
                }
                if let Some(l) = &p.label {
                    f(l);
                }
                f(&p.path);
            }
            Action::DownloadFile(p) => {
                if let Some(u) = &p.url {
                    f(u);
                }
                if let Some(c) = &p.click_text {
                    f(c);
                }
                f(&p.to);
            }
            Action::WaitForDownload(p) => f(&p.to),
            Action::CaptureScreenSchema(p) => {
                if let Some(t) = &p.target {
                    f(t);
                }
            }
            Action::WaitForElement(p) => {
                if let Some(t) = &p.text {
                    f(t);
                }
                if let Some(s) = &p.selector {
                    f(s);
                }
            }
            Action::AssertElement(p) => {
                if let Some(t) = &p.text {
                    f(t);
                }
                if let Some(s) = &p.selector {
                    f(s);
                }
            }
            Action::AssertText(p) => f(&p.text),
            Action::AssertFileExists(p) => f(&p.path),
            Action::AssertPdfPages(p) => f(&p.path),
            Action::HumanConfirm(p) => f(&p.message),
            Action::PolicyGuard(_) => {}
        }
    }

    /// Visit every templatable string field mutably. Used by the executor for
    /// substitution at step-start.
    pub fn visit_strings_mut(&mut self, f: &mut dyn FnMut(&mut String)) {
        match self {
            Action::FindFiles(p) => {
                f(&mut p.query);
                p.roots.iter_mut().for_each(|s| f(s));
            }
            Action::Rename(p) => {
                f(&mut p.path);
                f(&mut p.pattern);
            }
            Action::MoveTo(p) => {
                f(&mut p.path);
                f(&mut p.dest);
            }
            Action::PdfMerge(p) => {
                p.inputs.iter_mut().for_each(|s| f(s));
                if let Some(o) = &mut p.output {
                    f(o);
                }
            }
            Action::PdfExtractPages(p) => {
                f(&mut p.path);
                f(&mut p.ranges);
                if let Some(o) = &mut p.output {
                    f(o);
                }
            }
            Action::ComposeMail(p) => {
                p.to.iter_mut().for_each(|s| f(s));
                f(&mut p.subject);
                f(&mut p.body);
            }
            Action::AttachFiles(p) => {
                if let Some(d) = &mut p.draft_id {
                    f(d);
                }
                p.files.iter_mut().for_each(|s| f(s));
            }
            Action::SaveDraft(p) => {
                if let Some(d) = &mut p.draft_id {
                    f(d);
                }
            }
            Action::OpenBrowser(p) => {
                f(&mut p.url);
                if let Some(c) = &mut p.context {
                    f(c);
                }
            }
            Action::FillByLabel(p) => {
                f(&mut p.label);
                f(&mut p.text);
            }
            Action::ClickByText(p) => f(&mut p.text),
            Action::UploadFile(p) => {
                if let Some(s) = &mut p.selector {
                    f(s);
                }
                if let Some(l) = &mut p.label {
                    f(l);
                }
                f(&mut p.path);
            }
            Action::DownloadFile(p) => {
                if let Some(u) = &mut p.url {
                    f(u);
                }
                if let Some(c) = &mut p.click_text {
                    f(c);
                }
                f(&mut p.to);
            }
            Action::WaitForDownload(p) => f(&mut p.to),
            Action::CaptureScreenSchema(p) => {
                if let Some(t) = &mut p.target {
                    f(t);
                }
            }
            Action::WaitForElement(p) => {
                if let Some(t) = &mut p.text {
                    f(t);
                }
                if let Some(s) = &mut p.selector {
                    f(s);
                }
            }
            Action::AssertElement(p) => {
                if let Some(t) = &mut p.text {
                    f(t);
                }
                if let Some(s) = &mut p.selector {
                    f(s);
                }
            }
            Action::AssertText(p) => f(&mut p.text),
            Action::AssertFileExists(p) => f(&mut p.path),
            Action::AssertPdfPages(p) => f(&mut p.path),
            Action::HumanConfirm(p) => f(&mut p.message),
            Action::PolicyGuard(_) => {}
        }
    }

    /// URLs named directly in params, for target-domain derivation.
    pub fn urls(&self) -> Vec<&str> {
        match self {
            Action::OpenBrowser(p) => vec![p.url.as_str()],
            Action::DownloadFile(p) => p.url.as_deref().into_iter().collect(),
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Step and Plan
// ---------------------------------------------------------------------------

/// One ordered step of a plan. `index` is the 0-based stable id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<WebEngineKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_role: Option<String>,
}

/// Signature block stored alongside a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureBlock {
    pub algo: String,
    pub key_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub sig: String,
}

/// A loaded, immutable plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub dsl_version: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionSpec>,
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureBlock>,
}

impl Plan {
    /// Parse a plan from YAML text. Structural errors (unknown action,
    /// malformed params, non-single-key step) are reported with the step
    /// index; semantic checks live in the validator.
    pub fn from_yaml_str(text: &str) -> Result<Plan> {
        let doc: serde_yaml::Value =
            serde_yaml::from_str(text).context("plan is not valid YAML")?;
        let map = doc
            .as_mapping()
            .ok_or_else(|| anyhow!("plan root must be a mapping"))?;

        let dsl_version = match map.get(&serde_yaml::Value::String("dsl_version".to_string())) {
            Some(serde_yaml::Value::String(s)) => s.clone(),
            // Operators write `dsl_version: 1.1`, which YAML reads as a number.
            Some(serde_yaml::Value::Number(n)) => n.to_string(),
            Some(_) => bail!("dsl_version must be a string"),
            None => bail!("plan is missing dsl_version"),
        };

        let name = map
            .get(&serde_yaml::Value::String("name".to_string()))
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("plan is missing name"))?
            .to_string();

        let variables: BTreeMap<String, serde_json::Value> = match map
            .get(&serde_yaml::Value::String("variables".to_string()))
        {
            Some(v) => serde_yaml::from_value(v.clone()).context("invalid variables block")?,
            None => BTreeMap::new(),
        };

        let execution: Option<ExecutionSpec> = match map
            .get(&serde_yaml::Value::String("execution".to_string()))
        {
            Some(v) => Some(serde_yaml::from_value(v.clone()).context("invalid execution block")?),
            None => None,
        };

        let signature: Option<SignatureBlock> = match map
            .get(&serde_yaml::Value::String("signature".to_string()))
        {
            Some(v) => Some(serde_yaml::from_value(v.clone()).context("invalid signature block")?),
            None => None,
        };

        let raw_steps = map
            .get(&serde_yaml::Value::String("steps".to_string()))
            .and_then(|v| v.as_sequence())
            .ok_or_else(|| anyhow!("plan is missing steps sequence"))?;

        let mut steps = Vec::with_capacity(raw_steps.len());
        for (index, raw) in raw_steps.iter().enumerate() {
            steps.push(
                parse_step(index, raw)
                    .with_context(|| format!("steps[{index}]"))?,
            );
        }

        Ok(Plan {
            dsl_version,
            name,
            variables,
            execution,
            steps,
            signature,
        })
    }

    pub fn from_file(path: &Path) -> Result<Plan> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading plan {}", path.display()))?;
        Self::from_yaml_str(&text)
    }

    /// Serialize back to the on-disk YAML shape (steps as single-key maps).
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.to_yaml_value()?).context("serializing plan")
    }

    fn to_yaml_value(&self) -> Result<serde_yaml::Value> {
        let mut root = serde_yaml::Mapping::new();
        root.insert("dsl_version".into(), self.dsl_version.clone().into());
        root.insert("name".into(), self.name.clone().into());
        if !self.variables.is_empty() {
            root.insert("variables".into(), serde_yaml::to_value(&self.variables)?);
        }
        if let Some(exec) = &self.execution {
            root.insert("execution".into(), serde_yaml::to_value(exec)?);
        }
        let mut steps = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            steps.push(step_to_yaml(step)?);
        }
        root.insert("steps".into(), serde_yaml::Value::Sequence(steps));
        if let Some(sig) = &self.signature {
            root.insert("signature".into(), serde_yaml::to_value(sig)?);
        }
        Ok(serde_yaml::Value::Mapping(root))
    }

    /// Effective retry policy for the plan.
    pub fn retry_spec(&self) -> RetrySpec {
        self.execution
            .as_ref()
            .and_then(|e| e.retry)
            .unwrap_or_default()
    }

    pub fn queue(&self) -> &str {
        self.execution
            .as_ref()
            .and_then(|e| e.queue.as_deref())
            .unwrap_or("default")
    }

    pub fn priority(&self) -> u8 {
        self.execution
            .as_ref()
            .and_then(|e| e.priority)
            .unwrap_or(5)
            .clamp(1, 9)
    }
}

fn parse_step(index: usize, raw: &serde_yaml::Value) -> Result<Step> {
    let map = raw
        .as_mapping()
        .ok_or_else(|| anyhow!("step must be a single-key mapping"))?;
    if map.len() != 1 {
        bail!(
            "step must have exactly one action key, found {}",
            map.len()
        );
    }
    let (key, value) = map.iter().next().ok_or_else(|| anyhow!("empty step"))?;
    let action_name = key
        .as_str()
        .ok_or_else(|| anyhow!("action name must be a string"))?
        .to_string();

    // Null params (`- save_draft:`) normalize to an empty mapping.
    let mut params = match value {
        serde_yaml::Value::Null => serde_yaml::Mapping::new(),
        serde_yaml::Value::Mapping(m) => m.clone(),
        _ => bail!("params for '{action_name}' must be a mapping"),
    };

    let mut when = None;
    let mut engine = None;
    let mut timeout_ms = None;
    let mut required_role = None;
    for reserved in RESERVED_STEP_KEYS {
        let k = serde_yaml::Value::String((*reserved).to_string());
        if let Some(v) = params.remove(&k) {
            match *reserved {
                "when" => {
                    when = Some(
                        v.as_str()
                            .ok_or_else(|| anyhow!("when must be a string"))?
                            .to_string(),
                    )
                }
                "engine" => engine = Some(serde_yaml::from_value(v).context("invalid engine")?),
                "timeout_ms" => {
                    timeout_ms =
                        Some(v.as_u64().ok_or_else(|| anyhow!("timeout_ms must be an integer"))?)
                }
                "required_role" => {
                    required_role = Some(
                        v.as_str()
                            .ok_or_else(|| anyhow!("required_role must be a string"))?
                            .to_string(),
                    )
                }
                _ => unreachable!(),
            }
        }
    }

    let mut tagged = serde_yaml::Mapping::new();
    tagged.insert(
        serde_yaml::Value::String(action_name.clone()),
        serde_yaml::Value::Mapping(params),
    );
    let action: Action = serde_yaml::from_value(serde_yaml::Value::Mapping(tagged))
        .with_context(|| format!("unknown action or invalid params for '{action_name}'"))?;

    Ok(Step {
        index,
        action,
        when,
        engine,
        timeout_ms,
        required_role,
    })
}

fn step_to_yaml(step: &Step) -> Result<serde_yaml::Value> {
    // Action serializes externally tagged; fold the reserved keys back into
    // the params mapping.
    let tagged = serde_yaml::to_value(&step.action)?;
    let mut map = tagged
        .as_mapping()
        .cloned()
        .ok_or_else(|| anyhow!("action did not serialize to a mapping"))?;
    let (key, value) = map
        .iter_mut()
        .next()
        .ok_or_else(|| anyhow!("action serialized empty"))?;
    let mut params = match value {
        serde_yaml::Value::Mapping(m) => m.clone(),
        serde_yaml::Value::Null => serde_yaml::Mapping::new(),
        other => bail!("unexpected action params shape: {other:?}"),
    };
    if let Some(when) = &step.when {
        params.insert("when".into(), when.clone().into());
    }
    if let Some(engine) = &step.engine {
        params.insert("engine".into(), serde_yaml::to_value(engine)?);
    }
    if let Some(t) = step.timeout_ms {
        params.insert("timeout_ms".into(), t.into());
    }
    if let Some(role) = &step.required_role {
        params.insert("required_role".into(), role.clone().into());
    }
    let mut out = serde_yaml::Mapping::new();
    out.insert(key.clone(), serde_yaml::Value::Mapping(params));
    Ok(serde_yaml::Value::Mapping(out))
}
