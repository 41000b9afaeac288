//! Plan expressions.
//!
//! Three forms are recognized inside string fields:
//!
//! - `{{var}}`                     top-level plan variable
//! - `{{steps[i].field}}`         output field of an earlier step
//! - `{{secrets://[service/]key}}` secret reference, resolved last
//!
//! `when:` expressions compile to a total boolean grammar,
//! `term [op term]` with `==  !=  >  >=  <  <=`, integer/string literals and
//! reference terms. No function calls, no arbitrary code.

use anyhow::{anyhow, bail, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn template_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").unwrap())
}

fn step_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^steps\[(\d+)\]\.([A-Za-z0-9_][A-Za-z0-9_\.]*)$").unwrap())
}

/// One parsed reference inside a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprRef {
    Var(String),
    StepField { index: usize, field: String },
    Secret { service: Option<String>, key: String },
}

impl ExprRef {
    /// Parse the inside of one `{{ ... }}`.
    pub fn parse(inner: &str) -> Result<ExprRef> {
        if let Some(rest) = inner.strip_prefix("secrets://") {
            if rest.is_empty() {
                bail!("empty secret reference");
            }
            return Ok(match rest.split_once('/') {
                Some((service, key)) if !service.is_empty() && !key.is_empty() => ExprRef::Secret {
                    service: Some(service.to_string()),
                    key: key.to_string(),
                },
                Some(_) => bail!("malformed secret reference 'secrets://{rest}'"),
                None => ExprRef::Secret {
                    service: None,
                    key: rest.to_string(),
                },
            });
        }
        if let Some(caps) = step_ref_re().captures(inner) {
            let index: usize = caps[1].parse()?;
            return Ok(ExprRef::StepField {
                index,
                field: caps[2].to_string(),
            });
        }
        if inner.starts_with("steps[") {
            bail!("malformed step reference '{{{{{inner}}}}}'");
        }
        if inner.is_empty() || !inner.chars().all(|c| c.is_alphanumeric() || c == '_') {
            bail!("invalid expression '{{{{{inner}}}}}'");
        }
        Ok(ExprRef::Var(inner.to_string()))
    }
}

/// All references found in a string field.
pub fn find_refs(s: &str) -> Result<Vec<ExprRef>> {
    let mut refs = Vec::new();
    for caps in template_re().captures_iter(s) {
        refs.push(ExprRef::parse(&caps[1])?);
    }
    Ok(refs)
}

/// Substitution context. Secrets resolve through a callback so the resolver
/// and its masking stay out of this module.
pub struct ExprContext<'a> {
    pub variables: &'a BTreeMap<String, serde_json::Value>,
    pub step_outputs: &'a BTreeMap<usize, serde_json::Value>,
    pub secrets: &'a mut dyn FnMut(Option<&str>, &str) -> Result<String>,
}

impl ExprContext<'_> {
    fn lookup(&mut self, r: &ExprRef) -> Result<serde_json::Value> {
        match r {
            ExprRef::Var(name) => self
                .variables
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("undefined variable '{name}'")),
            ExprRef::StepField { index, field } => {
                let output = self
                    .step_outputs
                    .get(index)
                    .ok_or_else(|| anyhow!("no output recorded for steps[{index}]"))?;
                lookup_path(output, field)
                    .ok_or_else(|| anyhow!("steps[{index}] has no output field '{field}'"))
            }
            ExprRef::Secret { service, key } => {
                let value = (self.secrets)(service.as_deref(), key)?;
                Ok(serde_json::Value::String(value))
            }
        }
    }
}

fn lookup_path<'v>(value: &'v serde_json::Value, path: &str) -> Option<serde_json::Value> {
    let mut cur = value;
    for part in path.split('.') {
        cur = cur.get(part)?;
    }
    Some(cur.clone())
}

fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Substitute a string field, producing a JSON value.
///
/// When the whole trimmed string is a single expression, the referenced value
/// is returned as-is, so `inputs: "{{steps[0].paths}}"` yields the array. Any
/// other shape interpolates scalars into a string.
pub fn substitute_value(s: &str, ctx: &mut ExprContext<'_>) -> Result<serde_json::Value> {
    let trimmed = s.trim();
    if let Some(caps) = template_re().captures(trimmed) {
        if caps.get(0).map(|m| m.as_str()) == Some(trimmed) {
            let r = ExprRef::parse(&caps[1])?;
            return ctx.lookup(&r);
        }
    }
    Ok(serde_json::Value::String(substitute_string(s, ctx)?))
}

/// Substitute a string field, interpolating every expression as a scalar.
pub fn substitute_string(s: &str, ctx: &mut ExprContext<'_>) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in template_re().captures_iter(s) {
        let whole = caps.get(0).unwrap();
        out.push_str(&s[last..whole.start()]);
        let r = ExprRef::parse(&caps[1])?;
        out.push_str(&scalar_to_string(&ctx.lookup(&r)?));
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(out)
}

// ---------------------------------------------------------------------------
// `when` grammar
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Int(i64),
    Str(String),
    Ref(ExprRef),
}

/// A parsed `when:` expression: a single term (truthiness) or a comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct WhenExpr {
    pub left: Term,
    pub cmp: Option<(CmpOp, Term)>,
}

impl WhenExpr {
    pub fn parse(src: &str) -> Result<WhenExpr> {
        let tokens = tokenize(src)?;
        match tokens.as_slice() {
            [left] => Ok(WhenExpr {
                left: parse_term(left)?,
                cmp: None,
            }),
            [left, op, right] => Ok(WhenExpr {
                left: parse_term(left)?,
                cmp: Some((parse_op(op)?, parse_term(right)?)),
            }),
            _ => bail!("when expression must be 'term' or 'term OP term': '{src}'"),
        }
    }

    /// References used by this expression, for forward-reference validation.
    pub fn refs(&self) -> Vec<&ExprRef> {
        let mut refs = Vec::new();
        if let Term::Ref(r) = &self.left {
            refs.push(r);
        }
        if let Some((_, Term::Ref(r))) = &self.cmp {
            refs.push(r);
        }
        refs
    }

    pub fn eval(&self, ctx: &mut ExprContext<'_>) -> Result<bool> {
        let left = eval_term(&self.left, ctx)?;
        match &self.cmp {
            None => Ok(truthy(&left)),
            Some((op, right_term)) => {
                let right = eval_term(right_term, ctx)?;
                Ok(compare(&left, *op, &right))
            }
        }
    }
}

fn tokenize(src: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut rest = src.trim();
    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix("{{") {
            let end = stripped
                .find("}}")
                .ok_or_else(|| anyhow!("unterminated expression in '{src}'"))?;
            tokens.push(format!("{{{{{}}}}}", &stripped[..end]));
            rest = stripped[end + 2..].trim_start();
        } else if rest.starts_with('\'') || rest.starts_with('"') {
            let quote = rest.chars().next().unwrap();
            let end = rest[1..]
                .find(quote)
                .ok_or_else(|| anyhow!("unterminated string literal in '{src}'"))?;
            tokens.push(rest[..end + 2].to_string());
            rest = rest[end + 2..].trim_start();
        } else {
            let end = rest
                .find(char::is_whitespace)
                .unwrap_or(rest.len());
            tokens.push(rest[..end].to_string());
            rest = rest[end..].trim_start();
        }
    }
    Ok(tokens)
}

fn parse_term(token: &str) -> Result<Term> {
    if let Some(inner) = token.strip_prefix("{{").and_then(|t| t.strip_suffix("}}")) {
        return Ok(Term::Ref(ExprRef::parse(inner.trim())?));
    }
    if (token.starts_with('\'') && token.ends_with('\'') && token.len() >= 2)
        || (token.starts_with('"') && token.ends_with('"') && token.len() >= 2)
    {
        return Ok(Term::Str(token[1..token.len() - 1].to_string()));
    }
    if let Ok(n) = token.parse::<i64>() {
        return Ok(Term::Int(n));
    }
    bail!("invalid term '{token}' in when expression");
}

fn parse_op(token: &str) -> Result<CmpOp> {
    Ok(match token {
        "==" => CmpOp::Eq,
        "!=" => CmpOp::Ne,
        ">" => CmpOp::Gt,
        ">=" => CmpOp::Ge,
        "<" => CmpOp::Lt,
        "<=" => CmpOp::Le,
        other => bail!("unknown operator '{other}' in when expression"),
    })
}

fn eval_term(term: &Term, ctx: &mut ExprContext<'_>) -> Result<serde_json::Value> {
    Ok(match term {
        Term::Int(n) => serde_json::Value::from(*n),
        Term::Str(s) => serde_json::Value::String(s.clone()),
        Term::Ref(r) => ctx.lookup(r)?,
    })
}

fn truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(_) => true,
    }
}

fn as_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::Bool(b) => Some(*b as i64),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn compare(left: &serde_json::Value, op: CmpOp, right: &serde_json::Value) -> bool {
    // Numeric when both sides read as integers, lexicographic otherwise.
    let ord = match (as_i64(left), as_i64(right)) {
        (Some(l), Some(r)) => l.cmp(&r),
        _ => scalar_to_string(left).cmp(&scalar_to_string(right)),
    };
    match op {
        CmpOp::Eq => ord.is_eq(),
        CmpOp::Ne => !ord.is_eq(),
        CmpOp::Gt => ord.is_gt(),
        CmpOp::Ge => ord.is_ge(),
        CmpOp::Lt => ord.is_lt(),
        CmpOp::Le => ord.is_le(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx<'a>(
        variables: &'a BTreeMap<String, serde_json::Value>,
        step_outputs: &'a BTreeMap<usize, serde_json::Value>,
        secrets: &'a mut dyn FnMut(Option<&str>, &str) -> Result<String>,
    ) -> ExprContext<'a> {
        ExprContext {
            variables,
            step_outputs,
            secrets,
        }
    }

    fn no_secrets(_: Option<&str>, _: &str) -> Result<String> {
        bail!("no secrets in this test")
    }

    #[test]
    fn test_parse_ref_forms() {
        assert_eq!(ExprRef::parse("inbox").unwrap(), ExprRef::Var("inbox".into()));
        assert_eq!(
            ExprRef::parse("steps[2].paths").unwrap(),
            ExprRef::StepField {
                index: 2,
                field: "paths".into()
            }
        );
        assert_eq!(
            ExprRef::parse("secrets://mail/password").unwrap(),
            ExprRef::Secret {
                service: Some("mail".into()),
                key: "password".into()
            }
        );
        assert_eq!(
            ExprRef::parse("secrets://api_token").unwrap(),
            ExprRef::Secret {
                service: None,
                key: "api_token".into()
            }
        );
    }

    #[test]
    fn test_malformed_refs_rejected() {
        assert!(ExprRef::parse("steps[x].field").is_err());
        assert!(ExprRef::parse("steps[1]").is_err());
        assert!(ExprRef::parse("secrets://").is_err());
        assert!(ExprRef::parse("a b").is_err());
    }

    #[test]
    fn test_interpolation() {
        let vars: BTreeMap<_, _> = [("inbox".to_string(), json!("./sample_data"))].into();
        let outputs = BTreeMap::new();
        let mut secrets = no_secrets;
        let mut c = ctx(&vars, &outputs, &mut secrets);
        let out = substitute_string("root is {{inbox}}/in", &mut c).unwrap();
        assert_eq!(out, "root is ./sample_data/in");
    }

    #[test]
    fn test_whole_value_expression_keeps_shape() {
        let vars = BTreeMap::new();
        let outputs: BTreeMap<usize, serde_json::Value> =
            [(0usize, json!({"found": 2, "paths": ["a.pdf", "b.pdf"]}))].into();
        let mut secrets = no_secrets;
        let mut c = ctx(&vars, &outputs, &mut secrets);
        let v = substitute_value("{{steps[0].paths}}", &mut c).unwrap();
        assert_eq!(v, json!(["a.pdf", "b.pdf"]));
        // Embedded in a larger string it interpolates instead.
        let s = substitute_value("got {{steps[0].found}} files", &mut c).unwrap();
        assert_eq!(s, json!("got 2 files"));
    }

    #[test]
    fn test_undefined_variable_is_error() {
        let vars = BTreeMap::new();
        let outputs = BTreeMap::new();
        let mut secrets = no_secrets;
        let mut c = ctx(&vars, &outputs, &mut secrets);
        assert!(substitute_string("{{missing}}", &mut c).is_err());
    }

    #[test]
    fn test_secret_resolution_goes_through_callback() {
        let vars = BTreeMap::new();
        let outputs = BTreeMap::new();
        let mut secrets = |service: Option<&str>, key: &str| {
            assert_eq!(service, Some("mail"));
            assert_eq!(key, "password");
            Ok("hunter2".to_string())
        };
        let mut c = ctx(&vars, &outputs, &mut secrets);
        let out = substitute_string("pw={{secrets://mail/password}}", &mut c).unwrap();
        assert_eq!(out, "pw=hunter2");
    }

    #[test]
    fn test_when_single_term_truthiness() {
        let vars = BTreeMap::new();
        let outputs: BTreeMap<usize, serde_json::Value> =
            [(0usize, json!({"found": 0}))].into();
        let mut secrets = no_secrets;
        let mut c = ctx(&vars, &outputs, &mut secrets);
        let expr = WhenExpr::parse("{{steps[0].found}}").unwrap();
        assert!(!expr.eval(&mut c).unwrap());
    }

    #[test]
    fn test_when_numeric_comparison() {
        let vars = BTreeMap::new();
        let outputs: BTreeMap<usize, serde_json::Value> =
            [(0usize, json!({"found": 7}))].into();
        let mut secrets = no_secrets;
        let mut c = ctx(&vars, &outputs, &mut secrets);
        assert!(WhenExpr::parse("{{steps[0].found}} > 0")
            .unwrap()
            .eval(&mut c)
            .unwrap());
        assert!(WhenExpr::parse("{{steps[0].found}} <= 7")
            .unwrap()
            .eval(&mut c)
            .unwrap());
        assert!(!WhenExpr::parse("{{steps[0].found}} == 8")
            .unwrap()
            .eval(&mut c)
            .unwrap());
    }

    #[test]
    fn test_when_string_comparison() {
        let vars: BTreeMap<_, _> = [("mode".to_string(), json!("dry"))].into();
        let outputs = BTreeMap::new();
        let mut secrets = no_secrets;
        let mut c = ctx(&vars, &outputs, &mut secrets);
        assert!(WhenExpr::parse("{{mode}} == 'dry'").unwrap().eval(&mut c).unwrap());
        assert!(WhenExpr::parse("{{mode}} != \"wet\"").unwrap().eval(&mut c).unwrap());
    }

    #[test]
    fn test_when_rejects_function_calls() {
        assert!(WhenExpr::parse("len({{steps[0].paths}}) > 0").is_err());
        assert!(WhenExpr::parse("a == b == c").is_err());
    }

    #[test]
    fn test_when_refs_listed() {
        let expr = WhenExpr::parse("{{steps[3].found}} > {{limit}}").unwrap();
        let refs = expr.refs();
        assert_eq!(refs.len(), 2);
        assert!(matches!(refs[0], ExprRef::StepField { index: 3, .. }));
    }
}
