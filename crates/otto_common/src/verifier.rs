//! Step verifier.
//!
//! Each assertion evaluates once; on failure it performs exactly one
//! auto-retry with extended timing and, for element-level asserts, a
//! broadened text search. Outcomes: PASS (first try), RETRY (second try
//! succeeded), FAIL (both failed). A FAIL aborts the run.

use crate::error::{ErrorCode, StepError};
use crate::os_adapter::OsAdapter;
use crate::plan::Action;
use crate::web_engine::{DomSchema, WebBatch, WebEngine, WebOp};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};

/// Poll interval for wait-style assertions.
const POLL_INTERVAL_MS: u64 = 50;
/// Default timeout when the step declares none.
const DEFAULT_TIMEOUT_MS: u64 = 5_000;
/// Extended-timing multiplier for the auto-retry.
const RETRY_TIMING_FACTOR: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerifierOutcome {
    Pass,
    Retry,
    Fail,
}

/// Result of one verifier evaluation.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub outcome: VerifierOutcome,
    pub detail: String,
    pub error: Option<StepError>,
}

impl Verdict {
    fn pass(detail: impl Into<String>) -> Self {
        Self {
            outcome: VerifierOutcome::Pass,
            detail: detail.into(),
            error: None,
        }
    }

    fn retry(detail: impl Into<String>) -> Self {
        Self {
            outcome: VerifierOutcome::Retry,
            detail: detail.into(),
            error: None,
        }
    }

    fn fail(error: StepError) -> Self {
        Self {
            outcome: VerifierOutcome::Fail,
            detail: error.message.clone(),
            error: Some(error),
        }
    }
}

/// Evaluate a verification action. Non-assertion actions are a programming
/// error and fail immediately.
pub fn verify(
    action: &Action,
    timeout_ms: Option<u64>,
    web: &dyn WebEngine,
    os: &dyn OsAdapter,
) -> Verdict {
    match action {
        Action::WaitForElement(p) => {
            let timeout = p.timeout_ms.or(timeout_ms).unwrap_or(DEFAULT_TIMEOUT_MS);
            two_attempts(
                |broaden, extended| {
                    wait_for_element(
                        web,
                        p.text.as_deref(),
                        p.selector.as_deref(),
                        if extended { timeout * RETRY_TIMING_FACTOR } else { timeout },
                        broaden,
                    )
                },
                true,
            )
        }
        Action::AssertElement(p) => two_attempts(
            |broaden, _| {
                let schema = capture(web)?;
                let want = p.count_gte.unwrap_or(1) as usize;
                let found = match (&p.text, broaden) {
                    (Some(text), false) => schema.count_matching(Some(text), p.selector.as_deref()),
                    (Some(text), true) => {
                        if schema.find_broadened(text).is_some() {
                            want
                        } else {
                            0
                        }
                    }
                    (None, _) => schema.count_matching(None, p.selector.as_deref()),
                };
                if found >= want {
                    Ok(format!("{found} matching element(s)"))
                } else {
                    Err(StepError::new(
                        ErrorCode::VerifierFail,
                        format!("expected >= {want} element(s), found {found}"),
                    ))
                }
            },
            true,
        ),
        Action::AssertText(p) => two_attempts(
            |broaden, _| {
                let schema = capture(web)?;
                let page = schema.page_text();
                let hit = if broaden {
                    page.to_lowercase().contains(&p.text.to_lowercase())
                } else {
                    page.contains(&p.text)
                };
                if hit {
                    Ok(format!("text '{}' present", p.text))
                } else {
                    Err(StepError::new(
                        ErrorCode::VerifierFail,
                        format!("text '{}' not found on page", p.text),
                    ))
                }
            },
            true,
        ),
        Action::AssertFileExists(p) => two_attempts(
            |_, _| {
                if Path::new(&p.path).exists() {
                    Ok(format!("{} exists", p.path))
                } else {
                    Err(StepError::new(
                        ErrorCode::VerifierFail,
                        format!("{} does not exist", p.path),
                    ))
                }
            },
            false,
        ),
        Action::AssertPdfPages(p) => two_attempts(
            |_, _| {
                let count = os.pdf_page_count(Path::new(&p.path))?;
                if count == p.expected_pages {
                    Ok(format!("{} has {count} pages", p.path))
                } else {
                    Err(StepError::new(
                        ErrorCode::VerifierFail,
                        format!(
                            "{} has {count} pages, expected {}",
                            p.path, p.expected_pages
                        ),
                    ))
                }
            },
            false,
        ),
        other => Verdict::fail(StepError::new(
            ErrorCode::Internal,
            format!("'{}' is not a verification action", other.name()),
        )),
    }
}

/// Run the attempt closure once, then exactly once more on failure. The
/// closure receives (broaden, extended_timing).
fn two_attempts<F>(mut attempt: F, broaden_on_retry: bool) -> Verdict
where
    F: FnMut(bool, bool) -> Result<String, StepError>,
{
    match attempt(false, false) {
        Ok(detail) => Verdict::pass(detail),
        Err(first) => match attempt(broaden_on_retry, true) {
            Ok(detail) => Verdict::retry(detail),
            Err(_second) => Verdict::fail(first),
        },
    }
}

fn capture(web: &dyn WebEngine) -> Result<DomSchema, StepError> {
    let results = web.execute(&WebBatch::one(WebOp::CaptureDomSchema { target: None }))?;
    let value = results.into_iter().next().ok_or_else(|| {
        StepError::new(ErrorCode::Internal, "engine returned no schema result")
    })?;
    let schema = value.get("schema").cloned().unwrap_or(value);
    serde_json::from_value(schema)
        .map_err(|e| StepError::new(ErrorCode::Internal, format!("bad schema payload: {e}")))
}

fn wait_for_element(
    web: &dyn WebEngine,
    text: Option<&str>,
    selector: Option<&str>,
    timeout_ms: u64,
    broaden: bool,
) -> Result<String, StepError> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let schema = capture(web)?;
        let hit = match (text, selector) {
            (Some(t), _) => {
                if broaden {
                    schema.find_broadened(t).is_some()
                } else {
                    schema.find_by_text(t).is_some()
                }
            }
            (None, Some(s)) => schema.count_matching(None, Some(s)) > 0,
            (None, None) => false,
        };
        if hit {
            return Ok(format!(
                "element '{}' appeared",
                text.or(selector).unwrap_or("?")
            ));
        }
        if Instant::now() >= deadline {
            return Err(StepError::new(
                ErrorCode::VerifierTimeout,
                format!(
                    "element '{}' did not appear within {timeout_ms}ms",
                    text.or(selector).unwrap_or("?")
                ),
            ));
        }
        std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_two_attempts_outcomes_exhaustive() {
        // PASS: first try succeeds, second never runs.
        let mut calls = 0;
        let v = two_attempts(
            |_, _| {
                calls += 1;
                Ok("ok".into())
            },
            true,
        );
        assert_eq!(v.outcome, VerifierOutcome::Pass);
        assert_eq!(calls, 1);

        // RETRY: first fails, second succeeds.
        let mut calls = 0;
        let v = two_attempts(
            |broaden, extended| {
                calls += 1;
                if calls == 1 {
                    assert!(!broaden && !extended);
                    Err(StepError::new(ErrorCode::VerifierFail, "miss"))
                } else {
                    assert!(broaden && extended);
                    Ok("hit".into())
                }
            },
            true,
        );
        assert_eq!(v.outcome, VerifierOutcome::Retry);
        assert_eq!(calls, 2);

        // FAIL: both fail, exactly two attempts.
        let mut calls = 0;
        let v = two_attempts(
            |_, _| {
                calls += 1;
                Err(StepError::new(ErrorCode::VerifierFail, "miss"))
            },
            true,
        );
        assert_eq!(v.outcome, VerifierOutcome::Fail);
        assert_eq!(calls, 2);
        assert_eq!(v.error.as_ref().unwrap().code, ErrorCode::VerifierFail);
    }

    #[test]
    fn test_assert_file_exists() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.pdf");
        std::fs::write(&path, "x").unwrap();
        let action = Action::AssertFileExists(crate::plan::AssertFileExistsParams {
            path: path.to_string_lossy().to_string(),
        });
        let web = crate::testutil::FakeWebEngine::default();
        let os = crate::testutil::FakeOsAdapter::new();
        let v = verify(&action, None, &web, &os);
        assert_eq!(v.outcome, VerifierOutcome::Pass);

        let missing = Action::AssertFileExists(crate::plan::AssertFileExistsParams {
            path: dir.path().join("missing.pdf").to_string_lossy().to_string(),
        });
        let v = verify(&missing, None, &web, &os);
        assert_eq!(v.outcome, VerifierOutcome::Fail);
    }

    #[test]
    fn test_assert_pdf_pages_against_fake_adapter() {
        let dir = tempfile::TempDir::new().unwrap();
        let os = crate::testutil::FakeOsAdapter::new();
        let merged = dir.path().join("merged.pdf");
        os.write_pdf(&merged, 10);
        let web = crate::testutil::FakeWebEngine::default();
        let action = Action::AssertPdfPages(crate::plan::AssertPdfPagesParams {
            path: merged.to_string_lossy().to_string(),
            expected_pages: 10,
        });
        assert_eq!(verify(&action, None, &web, &os).outcome, VerifierOutcome::Pass);
        let wrong = Action::AssertPdfPages(crate::plan::AssertPdfPagesParams {
            path: merged.to_string_lossy().to_string(),
            expected_pages: 3,
        });
        assert_eq!(verify(&wrong, None, &web, &os).outcome, VerifierOutcome::Fail);
    }

    #[test]
    fn test_wait_for_element_retry_when_element_is_late() {
        // Element appears ~700ms in; first attempt times out at 500ms, the
        // extended retry (1000ms) sees it: outcome RETRY.
        let web = crate::testutil::FakeWebEngine::default();
        web.set_page(
            "https://portal.example.com",
            crate::testutil::fake_page(&[("button", "送信")]),
        );
        web.delay_element("送信", std::time::Duration::from_millis(700));
        let os = crate::testutil::FakeOsAdapter::new();
        let action = Action::WaitForElement(crate::plan::WaitForElementParams {
            text: Some("送信".into()),
            selector: None,
            timeout_ms: Some(500),
        });
        let v = verify(&action, None, &web, &os);
        assert_eq!(v.outcome, VerifierOutcome::Retry);
    }

    #[test]
    fn test_assert_element_broadened_on_retry() {
        let web = crate::testutil::FakeWebEngine::default();
        web.set_page(
            "https://portal.example.com",
            crate::testutil::fake_page(&[("button", "Send Invoice")]),
        );
        let os = crate::testutil::FakeOsAdapter::new();
        // Exact match misses, broadened retry hits the substring.
        let action = Action::AssertElement(crate::plan::AssertElementParams {
            text: Some("send".into()),
            selector: None,
            count_gte: None,
        });
        let v = verify(&action, None, &web, &os);
        assert_eq!(v.outcome, VerifierOutcome::Retry);
    }
}
