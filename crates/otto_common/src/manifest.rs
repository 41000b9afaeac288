//! Manifest derivation and risk analysis.
//!
//! Walks a plan and derives target domains, required capabilities and risk
//! flags. The analyzer is deterministic and side-effect-free: given the same
//! plan it produces byte-identical manifests.

use crate::plan::{Action, Plan};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Capability an action needs from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Fs,
    Pdf,
    MailDraft,
    Webx,
    Screenshot,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Fs => "fs",
            Capability::Pdf => "pdf",
            Capability::MailDraft => "mail_draft",
            Capability::Webx => "webx",
            Capability::Screenshot => "screenshot",
        }
    }
}

/// Risk flag raised by the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFlag {
    Sends,
    Deletes,
    Overwrites,
    Webx,
    Fs,
    Pdf,
    MailDraft,
}

impl RiskFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskFlag::Sends => "sends",
            RiskFlag::Deletes => "deletes",
            RiskFlag::Overwrites => "overwrites",
            RiskFlag::Webx => "webx",
            RiskFlag::Fs => "fs",
            RiskFlag::Pdf => "pdf",
            RiskFlag::MailDraft => "mail_draft",
        }
    }

    /// Flags that gate Planner-L2 patch application.
    pub fn is_destructive(&self) -> bool {
        matches!(self, RiskFlag::Sends | RiskFlag::Deletes | RiskFlag::Overwrites)
    }
}

/// Destructive vocabulary in several written languages. A parameter string
/// containing one of these tokens raises the paired flag even when the
/// action itself is benign (e.g. clicking a "送信" button sends something).
const SEND_TOKENS: &[&str] = &[
    "send", "submit", "送信", "提出", "enviar", "senden", "envoyer", "invia",
];
const DELETE_TOKENS: &[&str] = &[
    "delete", "remove", "削除", "eliminar", "borrar", "löschen", "supprimer", "elimina",
];
const OVERWRITE_TOKENS: &[&str] = &[
    "overwrite", "replace", "上書き", "sobrescribir", "überschreiben", "écraser",
];

/// Derived description of a plan: capabilities, risks, target domains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub plan_name: String,
    pub capabilities: BTreeSet<Capability>,
    pub required_capabilities: BTreeSet<Capability>,
    pub risk_flags: BTreeSet<RiskFlag>,
    /// Ordered, deduplicated list of hosts named by URL parameters.
    pub target_domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_info: Option<crate::plan::SignatureBlock>,
}

impl Manifest {
    /// Derive the manifest for a plan.
    pub fn derive(plan: &Plan) -> Manifest {
        let mut capabilities = BTreeSet::new();
        let mut risk_flags = BTreeSet::new();
        let mut target_domains: Vec<String> = Vec::new();

        for step in &plan.steps {
            let action = &step.action;
            if let Some(cap) = action_capability(action) {
                capabilities.insert(cap);
                risk_flags.insert(capability_flag(cap));
            }

            match action {
                Action::ComposeMail(_) | Action::SaveDraft(_) => {
                    risk_flags.insert(RiskFlag::Sends);
                }
                Action::MoveTo(p) if p.overwrite_if_exists => {
                    risk_flags.insert(RiskFlag::Overwrites);
                }
                _ => {}
            }

            action.visit_strings(&mut |s| {
                scan_vocabulary(s, &mut risk_flags);
            });

            for url in action.urls() {
                if let Some(host) = host_of(url) {
                    if !target_domains.iter().any(|d| d == &host) {
                        target_domains.push(host);
                    }
                }
            }
        }

        Manifest {
            plan_name: plan.name.clone(),
            // Every derived capability is required; optional capabilities
            // would come from step-level fallback declarations, which the
            // DSL does not carry today.
            required_capabilities: capabilities.clone(),
            capabilities,
            risk_flags,
            target_domains,
            signature_info: plan.signature.clone(),
        }
    }

    pub fn has_risk(&self, flag: RiskFlag) -> bool {
        self.risk_flags.contains(&flag)
    }

    /// Risk flags that matter for patch-safety comparisons.
    pub fn destructive_risks(&self) -> BTreeSet<RiskFlag> {
        self.risk_flags
            .iter()
            .copied()
            .filter(RiskFlag::is_destructive)
            .collect()
    }
}

fn action_capability(action: &Action) -> Option<Capability> {
    match action {
        Action::FindFiles(_) | Action::Rename(_) | Action::MoveTo(_) | Action::AssertFileExists(_) => {
            Some(Capability::Fs)
        }
        Action::PdfMerge(_) | Action::PdfExtractPages(_) | Action::AssertPdfPages(_) => {
            Some(Capability::Pdf)
        }
        Action::ComposeMail(_) | Action::AttachFiles(_) | Action::SaveDraft(_) => {
            Some(Capability::MailDraft)
        }
        Action::OpenBrowser(_)
        | Action::FillByLabel(_)
        | Action::ClickByText(_)
        | Action::UploadFile(_)
        | Action::DownloadFile(_)
        | Action::WaitForDownload(_)
        | Action::CaptureScreenSchema(_)
        | Action::WaitForElement(_)
        | Action::AssertElement(_)
        | Action::AssertText(_) => Some(Capability::Webx),
        Action::HumanConfirm(_) | Action::PolicyGuard(_) => None,
    }
}

fn capability_flag(cap: Capability) -> RiskFlag {
    match cap {
        Capability::Fs => RiskFlag::Fs,
        Capability::Pdf => RiskFlag::Pdf,
        Capability::MailDraft => RiskFlag::MailDraft,
        Capability::Webx | Capability::Screenshot => RiskFlag::Webx,
    }
}

fn scan_vocabulary(s: &str, flags: &mut BTreeSet<RiskFlag>) {
    let lower = s.to_lowercase();
    if SEND_TOKENS.iter().any(|t| lower.contains(t)) {
        flags.insert(RiskFlag::Sends);
    }
    if DELETE_TOKENS.iter().any(|t| lower.contains(t)) {
        flags.insert(RiskFlag::Deletes);
    }
    if OVERWRITE_TOKENS.iter().any(|t| lower.contains(t)) {
        flags.insert(RiskFlag::Overwrites);
    }
}

/// Host part of a URL, without a URL-parsing dependency. Templated URLs
/// (host still contains `{{`) contribute no domain until substitution.
pub fn host_of(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.split('@').next_back()?;
    let host = host.split(':').next()?;
    if host.is_empty() || host.contains("{{") {
        None
    } else {
        Some(host.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Plan;

    fn plan(text: &str) -> Plan {
        Plan::from_yaml_str(text).unwrap()
    }

    #[test]
    fn test_manifest_is_deterministic() {
        let p = plan(
            r#"
dsl_version: "1.1"
name: det
steps:
  - open_browser:
      url: "https://portal.example.com/login"
  - click_by_text:
      text: "送信"
  - find_files:
      query: "*.pdf"
      roots: ["."]
"#,
        );
        let a = serde_json::to_vec(&Manifest::derive(&p)).unwrap();
        let b = serde_json::to_vec(&Manifest::derive(&p)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_capabilities_from_actions() {
        let p = plan(
            r#"
dsl_version: "1.1"
name: caps
steps:
  - find_files:
      query: "*.pdf"
      roots: ["."]
  - pdf_merge:
      inputs: "{{steps[0].paths}}"
  - compose_mail:
      to: ["a@b"]
      subject: s
      body: b
"#,
        );
        let m = Manifest::derive(&p);
        assert!(m.capabilities.contains(&Capability::Fs));
        assert!(m.capabilities.contains(&Capability::Pdf));
        assert!(m.capabilities.contains(&Capability::MailDraft));
        assert!(!m.capabilities.contains(&Capability::Webx));
        assert_eq!(m.required_capabilities, m.capabilities);
    }

    #[test]
    fn test_destructive_vocabulary_multilingual() {
        let p = plan(
            r#"
dsl_version: "1.1"
name: vocab
steps:
  - click_by_text:
      text: "送信"
  - click_by_text:
      text: "Eliminar archivo"
"#,
        );
        let m = Manifest::derive(&p);
        assert!(m.has_risk(RiskFlag::Sends));
        assert!(m.has_risk(RiskFlag::Deletes));
    }

    #[test]
    fn test_overwrite_param_raises_flag() {
        let p = plan(
            r#"
dsl_version: "1.1"
name: mv
steps:
  - move_to:
      path: "a.txt"
      dest: "out/a.txt"
      overwrite_if_exists: true
"#,
        );
        assert!(Manifest::derive(&p).has_risk(RiskFlag::Overwrites));
    }

    #[test]
    fn test_mail_raises_sends() {
        let p = plan(
            r#"
dsl_version: "1.1"
name: mail
steps:
  - compose_mail:
      to: ["a@b"]
      subject: "Weekly"
      body: "hello"
"#,
        );
        let m = Manifest::derive(&p);
        assert!(m.has_risk(RiskFlag::Sends));
        assert!(m.has_risk(RiskFlag::MailDraft));
    }

    #[test]
    fn test_target_domains_ordered_dedup() {
        let p = plan(
            r#"
dsl_version: "1.1"
name: dom
steps:
  - open_browser:
      url: "https://b.example.com/x"
  - open_browser:
      url: "https://a.example.com/y"
  - download_file:
      url: "https://b.example.com/file.pdf"
      to: "./dl"
"#,
        );
        let m = Manifest::derive(&p);
        assert_eq!(m.target_domains, vec!["b.example.com", "a.example.com"]);
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("https://a.example.com/x"), Some("a.example.com".into()));
        assert_eq!(host_of("https://a.example.com:8443/x"), Some("a.example.com".into()));
        assert_eq!(host_of("http://user@host.test/p"), Some("host.test".into()));
        assert_eq!(host_of("https://{{portal}}/login"), None);
    }

    #[test]
    fn test_benign_plan_has_no_destructive_risk() {
        let p = plan(
            r#"
dsl_version: "1.1"
name: benign
steps:
  - find_files:
      query: "*.txt"
      roots: ["."]
"#,
        );
        let m = Manifest::derive(&p);
        assert!(m.destructive_risks().is_empty());
        assert!(m.has_risk(RiskFlag::Fs));
    }
}
