//! Web engine contract.
//!
//! The core never touches the DOM. It issues batched JSON-RPC operations to
//! an external engine (browser extension or playwright bridge) behind the
//! [`WebEngine`] trait, and validates the host allowlist before issuing any
//! batch containing network-observable operations.

use crate::error::{ErrorCode, StepError};
use crate::manifest::host_of;
use crate::policy::domain_matches;
use serde::{Deserialize, Serialize};

/// One element of a captured DOM/screen schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomElement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aria_label: Option<String>,
}

impl DomElement {
    /// All text-ish facets of the element, for broadened searches.
    pub fn facets(&self) -> impl Iterator<Item = &str> {
        [
            self.text.as_deref(),
            self.label.as_deref(),
            self.placeholder.as_deref(),
            self.aria_label.as_deref(),
        ]
        .into_iter()
        .flatten()
    }
}

/// Captured page schema: the verifier and Planner-L2 both consume this.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomSchema {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub elements: Vec<DomElement>,
}

impl DomSchema {
    /// Exact text match against the primary text facet.
    pub fn find_by_text(&self, text: &str) -> Option<&DomElement> {
        self.elements
            .iter()
            .find(|e| e.text.as_deref() == Some(text))
    }

    /// Broadened search: case-insensitive substring across all facets.
    pub fn find_broadened(&self, text: &str) -> Option<&DomElement> {
        let needle = text.to_lowercase();
        self.elements.iter().find(|e| {
            e.facets()
                .any(|f| f.to_lowercase().contains(&needle))
        })
    }

    pub fn count_matching(&self, text: Option<&str>, selector: Option<&str>) -> usize {
        self.elements
            .iter()
            .filter(|e| match (text, selector) {
                (Some(t), _) => e.text.as_deref() == Some(t),
                (None, Some(s)) => e.role.as_deref() == Some(s),
                (None, None) => true,
            })
            .count()
    }

    pub fn page_text(&self) -> String {
        let mut out = String::new();
        for e in &self.elements {
            for f in e.facets() {
                out.push_str(f);
                out.push('\n');
            }
        }
        out
    }
}

/// Element target: by label text or CSS selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Label(String),
    Selector(String),
    Text(String),
}

/// Operations of the narrow engine surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WebOp {
    Open {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
    },
    Fill {
        target: Target,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        frame: Option<String>,
    },
    Click {
        target: Target,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        frame: Option<String>,
        /// Broadened matching for verifier/recovery retries.
        #[serde(default)]
        broaden: bool,
    },
    Upload {
        target: Target,
        path: String,
    },
    WaitForDownload {
        to: String,
        timeout_ms: u64,
    },
    CaptureDomSchema {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    CookiesGet,
    CookiesSet {
        cookies: serde_json::Value,
    },
    FrameSelect {
        frame: String,
    },
    FrameClear,
    PierceShadow {
        selector: String,
    },
}

impl WebOp {
    fn method(&self) -> &'static str {
        match self {
            WebOp::Open { .. } => "open",
            WebOp::Fill { .. } => "fill",
            WebOp::Click { .. } => "click",
            WebOp::Upload { .. } => "upload",
            WebOp::WaitForDownload { .. } => "wait_for_download",
            WebOp::CaptureDomSchema { .. } => "capture_dom_schema",
            WebOp::CookiesGet => "cookies_get",
            WebOp::CookiesSet { .. } => "cookies_set",
            WebOp::FrameSelect { .. } => "frame_select",
            WebOp::FrameClear => "frame_clear",
            WebOp::PierceShadow { .. } => "pierce_shadow",
        }
    }

    /// Whether the operation can be observed by the remote site.
    pub fn network_observable(&self) -> bool {
        matches!(
            self,
            WebOp::Open { .. }
                | WebOp::Fill { .. }
                | WebOp::Click { .. }
                | WebOp::Upload { .. }
                | WebOp::WaitForDownload { .. }
        )
    }
}

/// An ordered batch of operations, sent as one JSON-RPC array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebBatch {
    pub ops: Vec<WebOp>,
}

impl WebBatch {
    pub fn one(op: WebOp) -> Self {
        Self { ops: vec![op] }
    }

    pub fn network_observable(&self) -> bool {
        self.ops.iter().any(WebOp::network_observable)
    }

    /// Enforce the host allowlist before a network-observable batch goes
    /// out. Only `open` names a host; everything else acts on the already
    /// validated page.
    pub fn check_hosts(&self, allowlist: &[String]) -> Result<(), StepError> {
        if !self.network_observable() {
            return Ok(());
        }
        for op in &self.ops {
            if let WebOp::Open { url, .. } = op {
                let host = host_of(url).ok_or_else(|| {
                    StepError::new(
                        ErrorCode::PolicyBlocked,
                        format!("cannot determine host of '{url}'"),
                    )
                })?;
                if !allowlist.iter().any(|p| domain_matches(&host, p)) {
                    return Err(StepError::new(
                        ErrorCode::PolicyBlocked,
                        format!("host '{host}' is not in the declared allowlist"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Serialize as a JSON-RPC 2.0 batch, ids starting at `first_id`.
    pub fn to_json_rpc(&self, first_id: u64) -> serde_json::Value {
        let calls: Vec<serde_json::Value> = self
            .ops
            .iter()
            .enumerate()
            .map(|(i, op)| {
                let mut params = serde_json::to_value(op).unwrap_or_default();
                if let Some(obj) = params.as_object_mut() {
                    obj.remove("op");
                }
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": first_id + i as u64,
                    "method": op.method(),
                    "params": params,
                })
            })
            .collect();
        serde_json::Value::Array(calls)
    }
}

/// Result of one executed operation: action-defined JSON fields such as
/// `found`, `url`, `path`, `schema`, `unexpected_element`.
pub type WebOpResult = serde_json::Value;

/// The engine surface the executor drives. Implementations transport the
/// batch (native messaging, WebSocket bridge, playwright) and return one
/// result per op.
pub trait WebEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Declared concurrency of the engine singleton.
    fn concurrency(&self) -> u32 {
        1
    }

    fn execute(&self, batch: &WebBatch) -> Result<Vec<WebOpResult>, StepError>;

    /// Opaque session context for checkpoints, when the engine has one.
    fn context_snapshot(&self) -> Option<String> {
        None
    }
}

/// Placeholder engine used when no transport is connected. Web steps fail
/// cleanly with UNSUPPORTED instead of hanging.
#[derive(Debug, Default)]
pub struct DisconnectedWebEngine;

impl WebEngine for DisconnectedWebEngine {
    fn name(&self) -> &'static str {
        "disconnected"
    }

    fn execute(&self, _batch: &WebBatch) -> Result<Vec<WebOpResult>, StepError> {
        Err(StepError::new(
            ErrorCode::Unsupported,
            "no web engine transport is connected",
        )
        .with_hint("start the browser extension host or the playwright bridge"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> DomSchema {
        DomSchema {
            url: "https://portal.example.com/form".to_string(),
            title: "Form".to_string(),
            elements: vec![
                DomElement {
                    role: Some("button".into()),
                    text: Some("確定".into()),
                    ..Default::default()
                },
                DomElement {
                    role: Some("textbox".into()),
                    label: Some("Invoice number".into()),
                    placeholder: Some("INV-0000".into()),
                    ..Default::default()
                },
            ],
        }
    }

    #[test]
    fn test_find_by_text_exact_vs_broadened() {
        let s = schema();
        assert!(s.find_by_text("確定").is_some());
        assert!(s.find_by_text("invoice").is_none());
        assert!(s.find_broadened("invoice").is_some());
        assert!(s.find_broadened("inv-0").is_some());
    }

    #[test]
    fn test_batch_json_rpc_shape() {
        let batch = WebBatch {
            ops: vec![
                WebOp::Open {
                    url: "https://a.example.com".into(),
                    context: None,
                },
                WebOp::Click {
                    target: Target::Text("送信".into()),
                    role: Some("button".into()),
                    frame: None,
                    broaden: false,
                },
            ],
        };
        let rpc = batch.to_json_rpc(10);
        let calls = rpc.as_array().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0]["jsonrpc"], "2.0");
        assert_eq!(calls[0]["id"], 10);
        assert_eq!(calls[0]["method"], "open");
        assert_eq!(calls[1]["id"], 11);
        assert_eq!(calls[1]["method"], "click");
        assert!(calls[1]["params"].get("op").is_none());
    }

    #[test]
    fn test_host_allowlist_blocks_unlisted_open() {
        let batch = WebBatch::one(WebOp::Open {
            url: "https://evil.example.com/x".into(),
            context: None,
        });
        let err = batch
            .check_hosts(&["partner.example.com".to_string()])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PolicyBlocked);
        assert!(batch
            .check_hosts(&["*.example.com".to_string()])
            .is_ok());
    }

    #[test]
    fn test_non_observable_batch_skips_allowlist() {
        let batch = WebBatch::one(WebOp::CaptureDomSchema { target: None });
        assert!(!batch.network_observable());
        assert!(batch.check_hosts(&[]).is_ok());
    }

    #[test]
    fn test_disconnected_engine_fails_cleanly() {
        let engine = DisconnectedWebEngine;
        let err = engine
            .execute(&WebBatch::one(WebOp::CookiesGet))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Unsupported);
    }

    #[test]
    fn test_observable_classification() {
        assert!(WebOp::Open {
            url: "https://x".into(),
            context: None
        }
        .network_observable());
        assert!(WebOp::Upload {
            target: Target::Selector("#f".into()),
            path: "/tmp/a".into()
        }
        .network_observable());
        assert!(!WebOp::CookiesGet.network_observable());
        assert!(!WebOp::FrameClear.network_observable());
    }
}
