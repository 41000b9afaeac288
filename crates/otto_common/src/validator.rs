//! Static plan validation.
//!
//! Pure checks over a parsed plan: DSL version, expression well-formedness,
//! forward references, undefined variables, and per-action shape rules that
//! the serde layer cannot express. Validation never executes anything and
//! never contacts external systems.

use crate::error::ErrorCode;
use crate::expr::{self, ExprRef, WhenExpr};
use crate::plan::{Action, Plan, DSL_VERSION};
use serde::{Deserialize, Serialize};

/// One validation finding. `pointer` is a human-readable location such as
/// `steps[2].when` or `steps[0].find_files`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub step_index: Option<usize>,
    pub pointer: String,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.pointer, self.message)
    }
}

/// Validation failure: the stable code plus every issue found.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {} issue(s)", issues.len())]
pub struct ValidationError {
    pub code: ErrorCode,
    pub issues: Vec<ValidationIssue>,
}

/// Validate a plan. Collects all issues rather than stopping at the first.
pub fn validate(plan: &Plan) -> Result<(), ValidationError> {
    let mut issues = Vec::new();

    if plan.dsl_version != DSL_VERSION {
        issues.push(ValidationIssue {
            step_index: None,
            pointer: "dsl_version".to_string(),
            message: format!(
                "unsupported dsl_version '{}', expected '{}'",
                plan.dsl_version, DSL_VERSION
            ),
        });
    }

    if plan.name.trim().is_empty() {
        issues.push(ValidationIssue {
            step_index: None,
            pointer: "name".to_string(),
            message: "plan name must not be empty".to_string(),
        });
    }

    if plan.steps.is_empty() {
        issues.push(ValidationIssue {
            step_index: None,
            pointer: "steps".to_string(),
            message: "plan has no steps".to_string(),
        });
    }

    for step in &plan.steps {
        let base = format!("steps[{}].{}", step.index, step.action.name());

        // Templated fields: well-formed refs, no forward references, no
        // undefined variables.
        let mut field_errors: Vec<String> = Vec::new();
        step.action.visit_strings(&mut |s| {
            match expr::find_refs(s) {
                Ok(refs) => {
                    for r in refs {
                        if let Some(msg) = check_ref(&r, step.index, plan) {
                            field_errors.push(msg);
                        }
                    }
                }
                Err(e) => field_errors.push(format!("invalid expression in '{s}': {e}")),
            }
        });
        for message in field_errors {
            issues.push(ValidationIssue {
                step_index: Some(step.index),
                pointer: base.clone(),
                message,
            });
        }

        if let Some(when) = &step.when {
            match WhenExpr::parse(when) {
                Ok(parsed) => {
                    for r in parsed.refs() {
                        if let Some(msg) = check_ref(r, step.index, plan) {
                            issues.push(ValidationIssue {
                                step_index: Some(step.index),
                                pointer: format!("steps[{}].when", step.index),
                                message: msg,
                            });
                        }
                    }
                }
                Err(e) => issues.push(ValidationIssue {
                    step_index: Some(step.index),
                    pointer: format!("steps[{}].when", step.index),
                    message: e.to_string(),
                }),
            }
        }

        if let Some(msg) = check_action_shape(&step.action) {
            issues.push(ValidationIssue {
                step_index: Some(step.index),
                pointer: base,
                message: msg,
            });
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationError {
            code: ErrorCode::ValidationFailed,
            issues,
        })
    }
}

fn check_ref(r: &ExprRef, step_index: usize, plan: &Plan) -> Option<String> {
    match r {
        ExprRef::Var(name) => {
            if plan.variables.contains_key(name) {
                None
            } else {
                Some(format!("reference to undefined variable '{name}'"))
            }
        }
        ExprRef::StepField { index, .. } => {
            if *index >= step_index {
                Some(format!(
                    "forward reference to steps[{index}] from step {step_index}"
                ))
            } else {
                None
            }
        }
        // Secret existence is a runtime concern.
        ExprRef::Secret { .. } => None,
    }
}

/// Shape rules serde defaults would otherwise let through.
fn check_action_shape(action: &Action) -> Option<String> {
    match action {
        Action::FindFiles(p) if p.roots.is_empty() => {
            Some("find_files requires at least one root".to_string())
        }
        Action::ComposeMail(p) if p.to.is_empty() => {
            Some("compose_mail requires at least one recipient".to_string())
        }
        Action::UploadFile(p) if p.selector.is_none() && p.label.is_none() => {
            Some("upload_file requires selector or label".to_string())
        }
        Action::DownloadFile(p) if p.url.is_none() && p.click_text.is_none() => {
            Some("download_file requires url or click_text".to_string())
        }
        Action::WaitForElement(p) if p.text.is_none() && p.selector.is_none() => {
            Some("wait_for_element requires text or selector".to_string())
        }
        Action::AssertElement(p) if p.text.is_none() && p.selector.is_none() => {
            Some("assert_element requires text or selector".to_string())
        }
        _ => None,
    }
}
