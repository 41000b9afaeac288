//! Trigger primitives: cron schedules, folder-watch debouncing and webhook
//! validation.
//!
//! The daemon owns the event loops (timers, notify watcher, HTTP endpoint);
//! everything testable lives here: next-fire computation, debounce collapse
//! and HMAC/replay checks.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::str::FromStr;

type HmacSha256 = Hmac<Sha256>;

/// One entry of `schedules.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub id: String,
    /// 5-field crontab.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// IANA timezone for cron evaluation; UTC when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
    /// Folder watch trigger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch: Option<WatchSpec>,
    /// Webhook trigger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookSpec>,
    /// Template file to run when the trigger fires.
    pub template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub variables: std::collections::BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSpec {
    pub path: String,
    /// Filename glob, `*` and `?` wildcards.
    pub pattern: String,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    1500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSpec {
    /// Secret reference (`secrets://...`) or literal for HMAC validation.
    pub secret: String,
    #[serde(default = "default_replay_window_secs")]
    pub replay_window_secs: i64,
}

fn default_replay_window_secs() -> i64 {
    600
}

// ---------------------------------------------------------------------------
// Cron
// ---------------------------------------------------------------------------

/// Compute the next fire time of a 5-field crontab after `after`, evaluated
/// in `tz`. The `cron` crate wants 6/7 fields, so a seconds field is
/// prepended.
pub fn next_cron_fire(expr: &str, tz_name: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        anyhow::bail!("cron expression must have 5 fields: '{expr}'");
    }
    let with_seconds = format!("0 {expr}");
    let schedule =
        Schedule::from_str(&with_seconds).with_context(|| format!("invalid cron '{expr}'"))?;
    let tz: Tz = tz_name
        .parse()
        .map_err(|_| anyhow!("unknown timezone '{tz_name}'"))?;
    let local_after = after.with_timezone(&tz);
    schedule
        .after(&local_after)
        .next()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| anyhow!("cron '{expr}' never fires"))
}

// ---------------------------------------------------------------------------
// Folder watch debounce
// ---------------------------------------------------------------------------

/// Collapses bursts of file events into one firing per quiet period.
/// Multiple matching events within the window produce a single run carrying
/// the last matching path.
#[derive(Debug)]
pub struct Debouncer {
    debounce: Duration,
    pattern: String,
    last_path: Option<PathBuf>,
    last_event_at: Option<DateTime<Utc>>,
}

impl Debouncer {
    pub fn new(pattern: &str, debounce_ms: u64) -> Self {
        Self {
            debounce: Duration::milliseconds(debounce_ms as i64),
            pattern: pattern.to_string(),
            last_path: None,
            last_event_at: None,
        }
    }

    /// Feed one create/modify event. Non-matching paths are ignored.
    pub fn record(&mut self, path: &Path, at: DateTime<Utc>) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if !glob_match(&self.pattern, &name) {
            return;
        }
        self.last_path = Some(path.to_path_buf());
        self.last_event_at = Some(at);
    }

    /// Fire when the quiet period has elapsed. Resets on fire.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Option<PathBuf> {
        let last = self.last_event_at?;
        if now - last >= self.debounce {
            self.last_event_at = None;
            return self.last_path.take();
        }
        None
    }
}

/// Filename glob with `*` and `?`.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[char], n: &[char]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..]))
            }
            (Some('?'), Some(_)) => inner(&p[1..], &n[1..]),
            (Some(pc), Some(nc)) if pc == nc => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    inner(&p, &n)
}

// ---------------------------------------------------------------------------
// Webhook validation
// ---------------------------------------------------------------------------

/// HMAC-SHA256 webhook validator with sliding-window replay suppression.
pub struct WebhookValidator {
    secret: Vec<u8>,
    replay_window: Duration,
    seen: VecDeque<(String, DateTime<Utc>)>,
}

/// Validation failure reasons, stable for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookReject {
    BadSignature,
    DuplicateEvent,
}

impl WebhookValidator {
    pub fn new(secret: &[u8], replay_window_secs: i64) -> Self {
        Self {
            secret: secret.to_vec(),
            replay_window: Duration::seconds(replay_window_secs),
            seen: VecDeque::new(),
        }
    }

    /// Hex HMAC-SHA256 over the raw body, for senders.
    pub fn sign(&self, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Validate one delivery. Signature first, then replay suppression by
    /// `event_id` within the sliding window.
    pub fn validate(
        &mut self,
        body: &[u8],
        signature_hex: &str,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), WebhookReject> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(body);
        let sig_bytes = hex::decode(signature_hex).map_err(|_| WebhookReject::BadSignature)?;
        // Constant-time comparison via the Mac verifier.
        mac.verify_slice(&sig_bytes)
            .map_err(|_| WebhookReject::BadSignature)?;

        let cutoff = now - self.replay_window;
        while matches!(self.seen.front(), Some((_, at)) if *at < cutoff) {
            self.seen.pop_front();
        }
        if self.seen.iter().any(|(id, _)| id == event_id) {
            return Err(WebhookReject::DuplicateEvent);
        }
        self.seen.push_back((event_id.to_string(), now));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cron_next_fire_in_timezone() {
        // Weekdays 09:00 Tokyo.
        let after = Utc.with_ymd_and_hms(2026, 1, 5, 0, 30, 0).unwrap(); // Mon 09:30 JST
        let next = next_cron_fire("0 9 * * 1-5", "Asia/Tokyo", after).unwrap();
        // Next fire is Tuesday 09:00 JST = Tuesday 00:00 UTC.
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 6, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_cron_rejects_wrong_field_count() {
        assert!(next_cron_fire("* * * *", "UTC", Utc::now()).is_err());
        assert!(next_cron_fire("0 0 * * * *", "UTC", Utc::now()).is_err());
    }

    #[test]
    fn test_debounce_collapses_to_last_path() {
        let mut d = Debouncer::new("*.pdf", 1000);
        let t0 = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();
        d.record(Path::new("/in/a.pdf"), t0);
        d.record(Path::new("/in/b.pdf"), t0 + Duration::milliseconds(300));
        // Still within the quiet window.
        assert!(d.poll(t0 + Duration::milliseconds(900)).is_none());
        // After the window: one firing, last matching path.
        let fired = d.poll(t0 + Duration::milliseconds(1400)).unwrap();
        assert_eq!(fired, PathBuf::from("/in/b.pdf"));
        // No second firing.
        assert!(d.poll(t0 + Duration::seconds(10)).is_none());
    }

    #[test]
    fn test_debounce_ignores_non_matching() {
        let mut d = Debouncer::new("*.pdf", 100);
        let t0 = Utc::now();
        d.record(Path::new("/in/notes.txt"), t0);
        assert!(d.poll(t0 + Duration::seconds(5)).is_none());
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*.pdf", "report.pdf"));
        assert!(glob_match("report-?.pdf", "report-1.pdf"));
        assert!(!glob_match("*.pdf", "report.txt"));
        assert!(glob_match("*", "anything"));
        assert!(!glob_match("report-?.pdf", "report-10.pdf"));
    }

    #[test]
    fn test_webhook_accepts_valid_signature() {
        let mut v = WebhookValidator::new(b"shared-secret", 600);
        let body = br#"{"event":"invoice"}"#;
        let sig = v.sign(body);
        assert!(v.validate(body, &sig, "evt-1", Utc::now()).is_ok());
    }

    #[test]
    fn test_webhook_rejects_bad_signature() {
        let mut v = WebhookValidator::new(b"shared-secret", 600);
        let body = b"payload";
        let mut sig = v.sign(body);
        sig.replace_range(0..2, "00");
        let result = v.validate(body, &sig, "evt-1", Utc::now());
        // Either the flip changed the mac or it collided with "00" already;
        // tampering with the body definitely fails.
        let sig2 = v.sign(b"payload");
        assert_eq!(
            v.validate(b"tampered", &sig2, "evt-2", Utc::now()),
            Err(WebhookReject::BadSignature)
        );
        let _ = result;
    }

    #[test]
    fn test_webhook_drops_duplicate_event_id() {
        let mut v = WebhookValidator::new(b"s", 600);
        let body = b"x";
        let sig = v.sign(body);
        let now = Utc::now();
        assert!(v.validate(body, &sig, "evt-9", now).is_ok());
        assert_eq!(
            v.validate(body, &sig, "evt-9", now + Duration::seconds(5)),
            Err(WebhookReject::DuplicateEvent)
        );
    }

    #[test]
    fn test_webhook_replay_window_slides() {
        let mut v = WebhookValidator::new(b"s", 60);
        let body = b"x";
        let sig = v.sign(body);
        let now = Utc::now();
        assert!(v.validate(body, &sig, "evt-1", now).is_ok());
        // Outside the window the same id is accepted again.
        assert!(v
            .validate(body, &sig, "evt-1", now + Duration::seconds(120))
            .is_ok());
    }
}
