//! Policy engine.
//!
//! Gates a run on domain, time window, risk, signature and capability
//! checks. Evaluation is total: every check runs and reports, never a
//! short-circuit, so a blocked run shows the full reason list. Autopilot
//! (L4) additionally requires `autopilot = true` and an all-green decision.

use crate::manifest::{Capability, Manifest, RiskFlag};
use crate::signing::{SignatureError, SignatureVerdict};
use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Execution window: days of week plus an HH:MM range in an IANA timezone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSpec {
    /// Lowercase three-letter day names, e.g. `["mon", "tue", "fri"]`.
    pub days: Vec<String>,
    /// Inclusive start, "HH:MM".
    pub start: String,
    /// Exclusive end, "HH:MM".
    pub end: String,
    /// IANA timezone name, e.g. "Asia/Tokyo".
    pub tz: String,
}

/// Patch adoption policy for Planner-L2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdoptPolicy {
    pub low_risk_auto: bool,
    pub min_confidence: f64,
    pub max_auto_changes: u32,
}

impl Default for AdoptPolicy {
    fn default() -> Self {
        Self {
            low_risk_auto: true,
            min_confidence: 0.85,
            max_auto_changes: 2,
        }
    }
}

/// Deviation scoring weights for the L4 monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PenaltyWeights {
    pub verifier_fail: u32,
    pub unexpected_element: u32,
    pub timing: u32,
    pub domain_drift: u32,
    pub download_fail: u32,
    pub retry_cap: u32,
}

impl Default for PenaltyWeights {
    fn default() -> Self {
        Self {
            verifier_fail: 2,
            unexpected_element: 2,
            timing: 1,
            domain_drift: 3,
            download_fail: 3,
            retry_cap: 1,
        }
    }
}

/// Policy configuration (`policy.toml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub autopilot: bool,
    /// Suffix-match globs; empty means any domain.
    pub allow_domains: Vec<String>,
    /// Allowed risk flags; empty means any risk.
    pub allow_risks: Vec<RiskFlag>,
    pub window: Option<WindowSpec>,
    pub require_signed_templates: bool,
    pub require_capabilities: Vec<Capability>,
    pub min_trust_level: crate::signing::TrustLevel,
    pub adopt_policy: AdoptPolicy,
    pub deviation_threshold: u32,
    pub penalties: PenaltyWeights,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            autopilot: false,
            allow_domains: Vec::new(),
            allow_risks: Vec::new(),
            window: None,
            require_signed_templates: false,
            require_capabilities: Vec::new(),
            min_trust_level: crate::signing::TrustLevel::Community,
            adopt_policy: AdoptPolicy::default(),
            deviation_threshold: 3,
            penalties: PenaltyWeights::default(),
        }
    }
}

/// Check identifiers, stable for storage and the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Domain,
    TimeWindow,
    Risk,
    Signature,
    Capabilities,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Domain => "domain",
            CheckKind::TimeWindow => "time_window",
            CheckKind::Risk => "risk",
            CheckKind::Signature => "signature",
            CheckKind::Capabilities => "capabilities",
        }
    }
}

/// One check result with a stable reason code when blocked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyCheck {
    pub check: CheckKind,
    pub allowed: bool,
    /// Stable machine code, e.g. `DOMAIN_NOT_ALLOWED`; "OK" when allowed.
    pub reason_code: String,
    pub detail: String,
}

/// Full decision: allowed iff every check is allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub checks: Vec<PolicyCheck>,
}

impl PolicyDecision {
    pub fn blocked_reasons(&self) -> Vec<&PolicyCheck> {
        self.checks.iter().filter(|c| !c.allowed).collect()
    }

    pub fn check(&self, kind: CheckKind) -> Option<&PolicyCheck> {
        self.checks.iter().find(|c| c.check == kind)
    }
}

/// Signature input to policy evaluation.
pub enum SignatureStatus<'a> {
    NotSigned,
    Verified(&'a SignatureVerdict),
    Failed(&'a SignatureError),
}

/// Evaluate the policy against a manifest. All five checks always run.
pub fn evaluate(
    config: &PolicyConfig,
    manifest: &Manifest,
    signature: SignatureStatus<'_>,
    available_capabilities: &BTreeMap<Capability, bool>,
    now: DateTime<Utc>,
) -> PolicyDecision {
    let checks = vec![
        check_domains(config, manifest),
        check_window(config, now),
        check_risks(config, manifest),
        check_signature(config, signature),
        check_capabilities(config, manifest, available_capabilities),
    ];
    PolicyDecision {
        allowed: checks.iter().all(|c| c.allowed),
        checks,
    }
}

/// L4 autopilot is permitted only with `autopilot = true` and a fully
/// allowed decision.
pub fn autopilot_permitted(config: &PolicyConfig, decision: &PolicyDecision) -> bool {
    config.autopilot && decision.allowed
}

fn ok(check: CheckKind, detail: impl Into<String>) -> PolicyCheck {
    PolicyCheck {
        check,
        allowed: true,
        reason_code: "OK".to_string(),
        detail: detail.into(),
    }
}

fn blocked(check: CheckKind, reason_code: &str, detail: impl Into<String>) -> PolicyCheck {
    PolicyCheck {
        check,
        allowed: false,
        reason_code: reason_code.to_string(),
        detail: detail.into(),
    }
}

fn check_domains(config: &PolicyConfig, manifest: &Manifest) -> PolicyCheck {
    if config.allow_domains.is_empty() || manifest.target_domains.is_empty() {
        return ok(CheckKind::Domain, "no domain restriction applies");
    }
    let denied: Vec<&String> = manifest
        .target_domains
        .iter()
        .filter(|d| !config.allow_domains.iter().any(|p| domain_matches(d, p)))
        .collect();
    if denied.is_empty() {
        ok(CheckKind::Domain, "all target domains allowed")
    } else {
        blocked(
            CheckKind::Domain,
            "DOMAIN_NOT_ALLOWED",
            format!(
                "domain(s) not in allow list: {}",
                denied
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        )
    }
}

/// Suffix-match glob: `*.example.com` matches any subdomain, a bare
/// `example.com` matches itself and subdomains.
pub fn domain_matches(domain: &str, pattern: &str) -> bool {
    let domain = domain.to_lowercase();
    let pattern = pattern.to_lowercase();
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return domain == suffix || domain.ends_with(&format!(".{suffix}"));
    }
    domain == pattern || domain.ends_with(&format!(".{pattern}"))
}

fn check_window(config: &PolicyConfig, now: DateTime<Utc>) -> PolicyCheck {
    let Some(window) = &config.window else {
        return ok(CheckKind::TimeWindow, "no execution window configured");
    };
    match in_window(window, now) {
        Ok(true) => ok(CheckKind::TimeWindow, "inside execution window"),
        Ok(false) => blocked(
            CheckKind::TimeWindow,
            "OUTSIDE_WINDOW",
            format!(
                "outside window {}-{} ({}) on {:?}",
                window.start, window.end, window.tz, window.days
            ),
        ),
        Err(e) => blocked(
            CheckKind::TimeWindow,
            "WINDOW_CONFIG_INVALID",
            format!("window config unusable: {e}"),
        ),
    }
}

/// Whether `now` falls inside the window, evaluated in the window's zone.
pub fn in_window(window: &WindowSpec, now: DateTime<Utc>) -> anyhow::Result<bool> {
    let tz: Tz = window
        .tz
        .parse()
        .map_err(|_| anyhow::anyhow!("unknown timezone '{}'", window.tz))?;
    let local = now.with_timezone(&tz);
    let day_ok = window
        .days
        .iter()
        .map(|d| parse_day(d))
        .collect::<anyhow::Result<Vec<Weekday>>>()?
        .contains(&local.weekday());
    if !day_ok {
        return Ok(false);
    }
    let start = parse_hhmm(&window.start)?;
    let end = parse_hhmm(&window.end)?;
    let t = local.time();
    // Overnight windows (22:00-06:00) wrap.
    Ok(if start <= end {
        t >= start && t < end
    } else {
        t >= start || t < end
    })
}

fn parse_day(s: &str) -> anyhow::Result<Weekday> {
    Ok(match s.to_lowercase().as_str() {
        "mon" | "monday" => Weekday::Mon,
        "tue" | "tuesday" => Weekday::Tue,
        "wed" | "wednesday" => Weekday::Wed,
        "thu" | "thursday" => Weekday::Thu,
        "fri" | "friday" => Weekday::Fri,
        "sat" | "saturday" => Weekday::Sat,
        "sun" | "sunday" => Weekday::Sun,
        other => anyhow::bail!("unknown day '{other}'"),
    })
}

fn parse_hhmm(s: &str) -> anyhow::Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|_| anyhow::anyhow!("bad time '{s}'"))
}

fn check_risks(config: &PolicyConfig, manifest: &Manifest) -> PolicyCheck {
    if config.allow_risks.is_empty() {
        return ok(CheckKind::Risk, "no risk restriction applies");
    }
    let denied: Vec<&str> = manifest
        .risk_flags
        .iter()
        .filter(|f| !config.allow_risks.contains(f))
        .map(|f| f.as_str())
        .collect();
    if denied.is_empty() {
        ok(CheckKind::Risk, "all risk flags allowed")
    } else {
        blocked(
            CheckKind::Risk,
            "RISK_NOT_ALLOWED",
            format!("risk flag(s) not allowed: {}", denied.join(", ")),
        )
    }
}

fn check_signature(config: &PolicyConfig, signature: SignatureStatus<'_>) -> PolicyCheck {
    match (config.require_signed_templates, signature) {
        (false, _) => ok(CheckKind::Signature, "signature not required"),
        (true, SignatureStatus::Verified(v)) => ok(
            CheckKind::Signature,
            format!("signed by '{}' ({})", v.key_id, v.trust_level.as_str()),
        ),
        (true, SignatureStatus::NotSigned) => blocked(
            CheckKind::Signature,
            "SIGNATURE_REQUIRED",
            "policy requires signed templates",
        ),
        (true, SignatureStatus::Failed(e)) => {
            blocked(CheckKind::Signature, e.code.as_str(), e.message.clone())
        }
    }
}

fn check_capabilities(
    config: &PolicyConfig,
    manifest: &Manifest,
    available: &BTreeMap<Capability, bool>,
) -> PolicyCheck {
    let mut missing: Vec<&str> = Vec::new();
    for cap in manifest
        .required_capabilities
        .iter()
        .chain(config.require_capabilities.iter())
    {
        if !available.get(cap).copied().unwrap_or(false) {
            let name = cap.as_str();
            if !missing.contains(&name) {
                missing.push(name);
            }
        }
    }
    if missing.is_empty() {
        ok(CheckKind::Capabilities, "all required capabilities available")
    } else {
        blocked(
            CheckKind::Capabilities,
            "CAPABILITY_MISSING",
            format!("missing capabilities: {}", missing.join(", ")),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use crate::plan::Plan;
    use chrono::TimeZone;

    fn manifest_for(text: &str) -> Manifest {
        Manifest::derive(&Plan::from_yaml_str(text).unwrap())
    }

    fn all_capabilities() -> BTreeMap<Capability, bool> {
        [
            (Capability::Fs, true),
            (Capability::Pdf, true),
            (Capability::MailDraft, true),
            (Capability::Webx, true),
            (Capability::Screenshot, true),
        ]
        .into()
    }

    const WEB_PLAN: &str = r#"
dsl_version: "1.1"
name: web
steps:
  - open_browser:
      url: "https://evil.example.com/x"
"#;

    #[test]
    fn test_every_check_reported() {
        let m = manifest_for(WEB_PLAN);
        let decision = evaluate(
            &PolicyConfig::default(),
            &m,
            SignatureStatus::NotSigned,
            &all_capabilities(),
            Utc::now(),
        );
        assert_eq!(decision.checks.len(), 5);
        assert!(decision.allowed);
    }

    #[test]
    fn test_domain_block_s2() {
        let m = manifest_for(WEB_PLAN);
        let config = PolicyConfig {
            allow_domains: vec!["partner.example.com".to_string()],
            ..Default::default()
        };
        let decision = evaluate(
            &config,
            &m,
            SignatureStatus::NotSigned,
            &all_capabilities(),
            Utc::now(),
        );
        assert!(!decision.allowed);
        let domain = decision.check(CheckKind::Domain).unwrap();
        assert!(!domain.allowed);
        assert_eq!(domain.reason_code, "DOMAIN_NOT_ALLOWED");
        // Totality: the other checks still reported.
        assert_eq!(decision.checks.len(), 5);
    }

    #[test]
    fn test_domain_suffix_glob() {
        assert!(domain_matches("app.partner.example.com", "*.example.com"));
        assert!(domain_matches("example.com", "*.example.com"));
        assert!(domain_matches("partner.example.com", "partner.example.com"));
        assert!(!domain_matches("evil.example.org", "*.example.com"));
        assert!(!domain_matches("notexample.com", "example.com"));
    }

    #[test]
    fn test_risk_check() {
        let m = manifest_for(
            r#"
dsl_version: "1.1"
name: risky
steps:
  - compose_mail:
      to: ["a@b"]
      subject: s
      body: b
"#,
        );
        let config = PolicyConfig {
            allow_risks: vec![RiskFlag::Fs, RiskFlag::Pdf],
            ..Default::default()
        };
        let decision = evaluate(
            &config,
            &m,
            SignatureStatus::NotSigned,
            &all_capabilities(),
            Utc::now(),
        );
        let risk = decision.check(CheckKind::Risk).unwrap();
        assert!(!risk.allowed);
        assert_eq!(risk.reason_code, "RISK_NOT_ALLOWED");
    }

    #[test]
    fn test_window_inside_and_outside() {
        let window = WindowSpec {
            days: vec!["mon".into(), "tue".into(), "wed".into(), "thu".into(), "fri".into()],
            start: "09:00".into(),
            end: "18:00".into(),
            tz: "Asia/Tokyo".into(),
        };
        // 2026-01-05 is a Monday; 03:00 UTC is 12:00 JST.
        let inside = Utc.with_ymd_and_hms(2026, 1, 5, 3, 0, 0).unwrap();
        assert!(in_window(&window, inside).unwrap());
        // 15:00 UTC is 00:00 JST Tuesday: inside days but outside hours.
        let outside = Utc.with_ymd_and_hms(2026, 1, 5, 15, 0, 0).unwrap();
        assert!(!in_window(&window, outside).unwrap());
    }

    #[test]
    fn test_overnight_window_wraps() {
        let window = WindowSpec {
            days: vec!["mon".into()],
            start: "22:00".into(),
            end: "06:00".into(),
            tz: "UTC".into(),
        };
        let late = Utc.with_ymd_and_hms(2026, 1, 5, 23, 0, 0).unwrap();
        assert!(in_window(&window, late).unwrap());
        let noon = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();
        assert!(!in_window(&window, noon).unwrap());
    }

    #[test]
    fn test_signature_required() {
        let m = manifest_for(WEB_PLAN);
        let config = PolicyConfig {
            require_signed_templates: true,
            ..Default::default()
        };
        let decision = evaluate(
            &config,
            &m,
            SignatureStatus::NotSigned,
            &all_capabilities(),
            Utc::now(),
        );
        let sig = decision.check(CheckKind::Signature).unwrap();
        assert!(!sig.allowed);
        assert_eq!(sig.reason_code, "SIGNATURE_REQUIRED");
    }

    #[test]
    fn test_capability_missing() {
        let m = manifest_for(WEB_PLAN);
        let mut caps = all_capabilities();
        caps.insert(Capability::Webx, false);
        let decision = evaluate(
            &PolicyConfig::default(),
            &m,
            SignatureStatus::NotSigned,
            &caps,
            Utc::now(),
        );
        let cap = decision.check(CheckKind::Capabilities).unwrap();
        assert!(!cap.allowed);
        assert_eq!(cap.reason_code, "CAPABILITY_MISSING");
    }

    #[test]
    fn test_autopilot_needs_flag_and_green_decision() {
        let m = manifest_for(WEB_PLAN);
        let mut config = PolicyConfig::default();
        let decision = evaluate(
            &config,
            &m,
            SignatureStatus::NotSigned,
            &all_capabilities(),
            Utc::now(),
        );
        assert!(!autopilot_permitted(&config, &decision));
        config.autopilot = true;
        assert!(autopilot_permitted(&config, &decision));
        config.allow_domains = vec!["partner.example.com".into()];
        let blocked = evaluate(
            &config,
            &m,
            SignatureStatus::NotSigned,
            &all_capabilities(),
            Utc::now(),
        );
        assert!(!autopilot_permitted(&config, &blocked));
    }
}
