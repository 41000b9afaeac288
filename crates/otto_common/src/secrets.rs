//! Secrets resolution and masking.
//!
//! Lookup form is `[service/]key`, resolved through an ordered backend
//! chain: OS keychain, encrypted file, environment. Resolved values are
//! wrapped in [`Secret`] (never Debug-printed raw) and every resolution is
//! registered with a [`Masker`] so outputs and logs can be scrubbed before
//! persistence.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment prefix for env-backed secrets.
pub const ENV_SECRET_PREFIX: &str = "DESKTOP_AGENT_SECRET_";

const NONCE_SIZE: usize = 12;

/// A resolved sensitive value. Debug and Display never show the content.
#[derive(Clone)]
pub struct Secret {
    key: String,
    value: String,
}

impl Secret {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// The raw value. Callers must mask any output derived from it.
    pub fn expose(&self) -> &str {
        &self.value
    }

    /// Stable placeholder written wherever the value would otherwise appear.
    pub fn placeholder(&self) -> String {
        format!("[secret:{}]", self.key)
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret({})", self.placeholder())
    }
}

/// Replaces resolved secret values with their placeholders in any text that
/// is about to be persisted or logged.
#[derive(Debug, Default, Clone)]
pub struct Masker {
    // value -> placeholder; BTreeMap so longer values are not shadowed by
    // identical shorter ones and iteration is deterministic.
    entries: BTreeMap<String, String>,
}

impl Masker {
    pub fn register(&mut self, secret: &Secret) {
        if !secret.value.is_empty() {
            self.entries
                .insert(secret.value.clone(), secret.placeholder());
        }
    }

    pub fn mask(&self, text: &str) -> String {
        let mut out = text.to_string();
        // Longest values first, so a value that is a substring of another
        // cannot corrupt the longer one's replacement.
        let mut entries: Vec<(&String, &String)> = self.entries.iter().collect();
        entries.sort_by_key(|(value, _)| std::cmp::Reverse(value.len()));
        for (value, placeholder) in entries {
            if out.contains(value.as_str()) {
                out = out.replace(value.as_str(), placeholder);
            }
        }
        out
    }

    /// Mask every string inside a JSON value.
    pub fn mask_json(&self, value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::String(s) => serde_json::Value::String(self.mask(s)),
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(|v| self.mask_json(v)).collect())
            }
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.mask_json(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One secrets backend. Backends return `Ok(None)` on a clean miss so the
/// chain can continue.
pub trait SecretsBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn lookup(&self, service: Option<&str>, key: &str) -> Result<Option<String>>;
}

/// Environment backend: `DESKTOP_AGENT_SECRET_[SERVICE_]KEY`, uppercased,
/// non-alphanumerics folded to underscores.
pub struct EnvBackend;

fn env_component(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl SecretsBackend for EnvBackend {
    fn name(&self) -> &'static str {
        "env"
    }

    fn lookup(&self, service: Option<&str>, key: &str) -> Result<Option<String>> {
        let var = match service {
            Some(svc) => format!("{ENV_SECRET_PREFIX}{}_{}", env_component(svc), env_component(key)),
            None => format!("{ENV_SECRET_PREFIX}{}", env_component(key)),
        };
        Ok(std::env::var(var).ok())
    }
}

/// Encrypted-file backend: AES-256-GCM over a TOML document of
/// `[service] key = "value"` tables plus a top-level table for serviceless
/// keys. The data file holds `base64(nonce || ciphertext)`.
pub struct FileBackend {
    data_path: PathBuf,
    key_path: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SecretsDocument {
    #[serde(default)]
    keys: BTreeMap<String, String>,
    #[serde(default)]
    services: BTreeMap<String, BTreeMap<String, String>>,
}

impl FileBackend {
    pub fn new(data_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
            key_path: key_path.into(),
        }
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        let text = std::fs::read_to_string(&self.key_path)
            .with_context(|| format!("reading secrets key {}", self.key_path.display()))?;
        let bytes = hex::decode(text.trim()).context("secrets key is not hex")?;
        if bytes.len() != 32 {
            bail!("secrets key must be 32 bytes");
        }
        Aes256Gcm::new_from_slice(&bytes).map_err(|e| anyhow!("bad secrets key: {e}"))
    }

    fn load(&self) -> Result<SecretsDocument> {
        if !self.data_path.exists() {
            return Ok(SecretsDocument::default());
        }
        let encoded = std::fs::read_to_string(&self.data_path)?;
        let blob = BASE64
            .decode(encoded.trim())
            .context("secrets file is not base64")?;
        if blob.len() < NONCE_SIZE {
            bail!("secrets file truncated");
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("secrets file failed to decrypt"))?;
        toml::from_str(std::str::from_utf8(&plaintext)?).context("secrets document invalid")
    }

    /// Write a key, creating the key file on first use.
    pub fn store(&self, service: Option<&str>, key: &str, value: &str) -> Result<()> {
        if !self.key_path.exists() {
            let mut key_bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut key_bytes);
            if let Some(parent) = self.key_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&self.key_path, hex::encode(key_bytes))?;
        }
        let mut doc = self.load()?;
        match service {
            Some(svc) => {
                doc.services
                    .entry(svc.to_string())
                    .or_default()
                    .insert(key.to_string(), value.to_string());
            }
            None => {
                doc.keys.insert(key.to_string(), value.to_string());
            }
        }
        let plaintext = toml::to_string(&doc)?;
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| anyhow!("secrets encryption failed"))?;
        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&ciphertext);
        if let Some(parent) = self.data_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.data_path, BASE64.encode(blob))?;
        Ok(())
    }
}

impl SecretsBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn lookup(&self, service: Option<&str>, key: &str) -> Result<Option<String>> {
        if !self.data_path.exists() {
            return Ok(None);
        }
        let doc = self.load()?;
        Ok(match service {
            Some(svc) => doc.services.get(svc).and_then(|m| m.get(key)).cloned(),
            None => doc.keys.get(key).cloned(),
        })
    }
}

/// OS keychain backend. Shells out to `secret-tool` when present; a missing
/// tool is a clean miss, not an error, so the chain falls through.
pub struct KeychainBackend {
    tool: String,
}

impl Default for KeychainBackend {
    fn default() -> Self {
        Self {
            tool: "secret-tool".to_string(),
        }
    }
}

impl SecretsBackend for KeychainBackend {
    fn name(&self) -> &'static str {
        "keychain"
    }

    fn lookup(&self, service: Option<&str>, key: &str) -> Result<Option<String>> {
        let output = std::process::Command::new(&self.tool)
            .arg("lookup")
            .arg("service")
            .arg(service.unwrap_or("desktop-agent"))
            .arg("key")
            .arg(key)
            .output();
        match output {
            Ok(out) if out.status.success() => {
                let value = String::from_utf8_lossy(&out.stdout).trim_end().to_string();
                Ok((!value.is_empty()).then_some(value))
            }
            _ => Ok(None),
        }
    }
}

/// Ordered backend chain with masking registry.
pub struct SecretsResolver {
    backends: Vec<Box<dyn SecretsBackend>>,
}

impl SecretsResolver {
    pub fn new(backends: Vec<Box<dyn SecretsBackend>>) -> Self {
        Self { backends }
    }

    /// Default chain: keychain, encrypted file under `dir`, environment.
    pub fn standard(dir: &Path) -> Self {
        Self::new(vec![
            Box::new(KeychainBackend::default()),
            Box::new(FileBackend::new(
                dir.join("secrets.enc"),
                dir.join("secrets.key"),
            )),
            Box::new(EnvBackend),
        ])
    }

    /// Resolve `[service/]key`, registering the value with the masker.
    pub fn resolve(
        &self,
        service: Option<&str>,
        key: &str,
        masker: &mut Masker,
    ) -> Result<Secret> {
        for backend in &self.backends {
            if let Some(value) = backend.lookup(service, key)? {
                tracing::debug!(backend = backend.name(), key, "secret resolved");
                let label = match service {
                    Some(svc) => format!("{svc}/{key}"),
                    None => key.to_string(),
                };
                let secret = Secret::new(label, value);
                masker.register(&secret);
                return Ok(secret);
            }
        }
        bail!(
            "secret '{}{key}' not found in any backend",
            service.map(|s| format!("{s}/")).unwrap_or_default()
        )
    }
}
