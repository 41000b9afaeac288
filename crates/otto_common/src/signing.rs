//! Template signing and the trust store.
//!
//! Signatures are Ed25519 over the SHA-256 of canonical plan bytes. The
//! canonical form is the plan body (signature block excluded) serialized to
//! JSON with lexicographically ordered object keys, so signing is stable
//! across YAML formatting differences.
//!
//! The trust store maps `key_id` to a public key, a trust level and a
//! validity window. Verification failures map onto the stable error codes
//! SIGNATURE_INVALID, SIGNATURE_EXPIRED, KEY_UNKNOWN and TRUST_TOO_LOW.

use crate::error::ErrorCode;
use crate::plan::{Plan, SignatureBlock};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

/// Signature algorithm identifier stored in plans.
pub const SIGNATURE_ALGO: &str = "ed25519";

/// Ranked authority of a signing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Unknown,
    Community,
    Development,
    Commercial,
    System,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Unknown => "unknown",
            TrustLevel::Community => "community",
            TrustLevel::Development => "development",
            TrustLevel::Commercial => "commercial",
            TrustLevel::System => "system",
        }
    }
}

/// One trusted key entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedKey {
    /// Hex-encoded Ed25519 public key (32 bytes).
    pub public_key: String,
    pub trust_level: TrustLevel,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

/// Ordered mapping `key_id -> TrustedKey`, loaded from `trust_store.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustStore {
    #[serde(default)]
    pub keys: BTreeMap<String, TrustedKey>,
}

impl TrustStore {
    pub fn load(path: &Path) -> Result<TrustStore> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading trust store {}", path.display()))?;
        toml::from_str(&text).context("invalid trust store")
    }

    pub fn get(&self, key_id: &str) -> Option<&TrustedKey> {
        self.keys.get(key_id)
    }
}

/// Outcome of a successful signature verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureVerdict {
    pub key_id: String,
    pub trust_level: TrustLevel,
}

/// Verification failure with its stable code.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct SignatureError {
    pub code: ErrorCode,
    pub message: String,
}

fn sig_err(code: ErrorCode, message: impl Into<String>) -> SignatureError {
    SignatureError {
        code,
        message: message.into(),
    }
}

/// Canonical bytes of the plan body: signature block stripped, JSON with
/// sorted object keys. serde_json maps are BTreeMap-backed here, so a
/// Value round-trip yields sorted keys.
pub fn canonical_bytes(plan: &Plan) -> Result<Vec<u8>> {
    let mut body = plan.clone();
    body.signature = None;
    let value = serde_json::to_value(&body).context("canonicalizing plan")?;
    Ok(serde_json::to_vec(&value)?)
}

/// SHA-256 of the canonical plan bytes.
pub fn canonical_digest(plan: &Plan) -> Result<[u8; 32]> {
    let bytes = canonical_bytes(plan)?;
    Ok(Sha256::digest(&bytes).into())
}

/// Sign a plan, returning the plan with its signature block attached.
pub fn sign_plan(plan: &Plan, key_id: &str, signing_key: &SigningKey) -> Result<Plan> {
    let digest = canonical_digest(plan)?;
    let sig = signing_key.sign(&digest);
    let mut signed = plan.clone();
    signed.signature = Some(SignatureBlock {
        algo: SIGNATURE_ALGO.to_string(),
        key_id: key_id.to_string(),
        created_at: Utc::now(),
        sig: hex::encode(sig.to_bytes()),
    });
    Ok(signed)
}

/// Load a 32-byte hex signing key from a file.
pub fn load_signing_key(path: &Path) -> Result<SigningKey> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading signing key {}", path.display()))?;
    let bytes = hex::decode(text.trim()).context("signing key is not hex")?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow!("signing key must be 32 bytes"))?;
    Ok(SigningKey::from_bytes(&bytes))
}

/// Verify a signed plan against the trust store.
///
/// `min_level` is the lowest acceptable trust level; below it verification
/// fails with TRUST_TOO_LOW even when the signature bytes check out.
pub fn verify_plan(
    plan: &Plan,
    store: &TrustStore,
    min_level: TrustLevel,
    now: DateTime<Utc>,
) -> Result<SignatureVerdict, SignatureError> {
    let block = plan
        .signature
        .as_ref()
        .ok_or_else(|| sig_err(ErrorCode::SignatureInvalid, "plan carries no signature"))?;

    if block.algo != SIGNATURE_ALGO {
        return Err(sig_err(
            ErrorCode::SignatureInvalid,
            format!("unsupported signature algorithm '{}'", block.algo),
        ));
    }

    let entry = store.get(&block.key_id).ok_or_else(|| {
        sig_err(
            ErrorCode::KeyUnknown,
            format!("key '{}' not in trust store", block.key_id),
        )
    })?;

    if now < entry.valid_from || now > entry.valid_until {
        return Err(sig_err(
            ErrorCode::SignatureExpired,
            format!("key '{}' outside its validity window", block.key_id),
        ));
    }

    let pk_bytes = hex::decode(&entry.public_key)
        .ok()
        .and_then(|b| <[u8; 32]>::try_from(b).ok())
        .ok_or_else(|| sig_err(ErrorCode::KeyUnknown, "malformed public key in trust store"))?;
    let verifying = VerifyingKey::from_bytes(&pk_bytes)
        .map_err(|e| sig_err(ErrorCode::KeyUnknown, format!("bad public key: {e}")))?;

    let sig_bytes = hex::decode(&block.sig)
        .ok()
        .and_then(|b| <[u8; 64]>::try_from(b).ok())
        .ok_or_else(|| sig_err(ErrorCode::SignatureInvalid, "malformed signature bytes"))?;
    let signature = Signature::from_bytes(&sig_bytes);

    let digest = canonical_digest(plan)
        .map_err(|e| sig_err(ErrorCode::SignatureInvalid, e.to_string()))?;
    verifying
        .verify(&digest, &signature)
        .map_err(|_| sig_err(ErrorCode::SignatureInvalid, "signature does not match plan"))?;

    if entry.trust_level < min_level {
        return Err(sig_err(
            ErrorCode::TrustTooLow,
            format!(
                "key '{}' has trust '{}', need at least '{}'",
                block.key_id,
                entry.trust_level.as_str(),
                min_level.as_str()
            ),
        ));
    }

    Ok(SignatureVerdict {
        key_id: block.key_id.clone(),
        trust_level: entry.trust_level,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Plan;
    use chrono::Duration;

    fn sample_plan() -> Plan {
        Plan::from_yaml_str(
            r#"
dsl_version: "1.1"
name: signed-sample
steps:
  - find_files:
      query: "*.pdf"
      roots: ["."]
"#,
        )
        .unwrap()
    }

    fn keypair() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    fn store_with(key: &SigningKey, level: TrustLevel) -> TrustStore {
        let mut keys = BTreeMap::new();
        keys.insert(
            "test-key".to_string(),
            TrustedKey {
                public_key: hex::encode(key.verifying_key().to_bytes()),
                trust_level: level,
                valid_from: Utc::now() - Duration::days(1),
                valid_until: Utc::now() + Duration::days(1),
            },
        );
        TrustStore { keys }
    }

    #[test]
    fn test_canonical_bytes_deterministic() {
        let plan = sample_plan();
        assert_eq!(canonical_bytes(&plan).unwrap(), canonical_bytes(&plan).unwrap());
    }

    #[test]
    fn test_canonical_bytes_ignore_signature_block() {
        let plan = sample_plan();
        let signed = sign_plan(&plan, "test-key", &keypair()).unwrap();
        assert_eq!(canonical_bytes(&plan).unwrap(), canonical_bytes(&signed).unwrap());
    }

    #[test]
    fn test_sign_and_verify() {
        let key = keypair();
        let signed = sign_plan(&sample_plan(), "test-key", &key).unwrap();
        let store = store_with(&key, TrustLevel::Development);
        let verdict = verify_plan(&signed, &store, TrustLevel::Community, Utc::now()).unwrap();
        assert_eq!(verdict.key_id, "test-key");
        assert_eq!(verdict.trust_level, TrustLevel::Development);
    }

    #[test]
    fn test_tampered_plan_fails() {
        let key = keypair();
        let mut signed = sign_plan(&sample_plan(), "test-key", &key).unwrap();
        signed.name = "renamed".to_string();
        let store = store_with(&key, TrustLevel::Development);
        let err = verify_plan(&signed, &store, TrustLevel::Unknown, Utc::now()).unwrap_err();
        assert_eq!(err.code, ErrorCode::SignatureInvalid);
    }

    #[test]
    fn test_unknown_key() {
        let key = keypair();
        let signed = sign_plan(&sample_plan(), "other-key", &key).unwrap();
        let store = store_with(&key, TrustLevel::Development);
        let err = verify_plan(&signed, &store, TrustLevel::Unknown, Utc::now()).unwrap_err();
        assert_eq!(err.code, ErrorCode::KeyUnknown);
    }

    #[test]
    fn test_expired_key() {
        let key = keypair();
        let signed = sign_plan(&sample_plan(), "test-key", &key).unwrap();
        let store = store_with(&key, TrustLevel::Development);
        let future = Utc::now() + Duration::days(30);
        let err = verify_plan(&signed, &store, TrustLevel::Unknown, future).unwrap_err();
        assert_eq!(err.code, ErrorCode::SignatureExpired);
    }

    #[test]
    fn test_trust_too_low() {
        let key = keypair();
        let signed = sign_plan(&sample_plan(), "test-key", &key).unwrap();
        let store = store_with(&key, TrustLevel::Community);
        let err = verify_plan(&signed, &store, TrustLevel::Commercial, Utc::now()).unwrap_err();
        assert_eq!(err.code, ErrorCode::TrustTooLow);
    }

    #[test]
    fn test_trust_level_ordering() {
        assert!(TrustLevel::System > TrustLevel::Commercial);
        assert!(TrustLevel::Commercial > TrustLevel::Development);
        assert!(TrustLevel::Development > TrustLevel::Community);
        assert!(TrustLevel::Community > TrustLevel::Unknown);
    }
}
