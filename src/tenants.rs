//! Tenant registry.
//!
//! One record per onboarded repository, persisted as a JSON file:
//!
//! ```json
//! {
//!   "acme_widgets": {
//!     "tenant_id": "acme_widgets",
//!     "repo_full_name": "acme/widgets",
//!     "encrypted_token": "Z2hwX...",
//!     "model": null,
//!     "created_at": "2025-01-31T14:02:11Z",
//!     "rotated_at": null
//!   }
//! }
//! ```
//!
//! Lookups by repository go through an in-memory index and never touch
//! disk. Records are immutable after registration except for credential
//! rotation. Every mutation rewrites the file through a temp file and a
//! rename.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::LlmConfig;

/// Encodes token material at rest. Real encryption is supplied by the
/// deployment; [`Base64Codec`] only keeps tokens out of plain sight.
pub trait CredentialCodec: Send + Sync {
    fn encode(&self, plaintext: &str) -> Result<String>;
    fn decode(&self, stored: &str) -> Result<String>;
}

pub struct Base64Codec;

impl CredentialCodec for Base64Codec {
    fn encode(&self, plaintext: &str) -> Result<String> {
        Ok(STANDARD.encode(plaintext.as_bytes()))
    }

    fn decode(&self, stored: &str) -> Result<String> {
        let bytes = STANDARD
            .decode(stored)
            .context("stored credential is not valid base64")?;
        Ok(String::from_utf8(bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub tenant_id: String,
    pub repo_full_name: String,
    pub encrypted_token: String,
    /// Per-tenant language model; `None` uses the process default.
    #[serde(default)]
    pub model: Option<LlmConfig>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub rotated_at: Option<DateTime<Utc>>,
}

/// `owner/name` → `owner_name`.
pub fn tenant_id_for(repo_full_name: &str) -> String {
    repo_full_name.replace('/', "_")
}

pub struct TenantRegistry {
    path: PathBuf,
    records: BTreeMap<String, TenantRecord>,
    by_repo: HashMap<String, String>,
    codec: Arc<dyn CredentialCodec>,
}

impl TenantRegistry {
    /// Open the registry at `path`. A missing file is an empty registry.
    pub fn open(path: &Path, codec: Arc<dyn CredentialCodec>) -> Result<Self> {
        let records: BTreeMap<String, TenantRecord> = match std::fs::read_to_string(path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse tenant registry: {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read tenant registry: {}", path.display()))
            }
        };

        let by_repo = records
            .values()
            .map(|r| (r.repo_full_name.clone(), r.tenant_id.clone()))
            .collect();

        Ok(Self {
            path: path.to_path_buf(),
            records,
            by_repo,
            codec,
        })
    }

    pub fn register(
        &mut self,
        repo_full_name: &str,
        token: &str,
        model: Option<LlmConfig>,
    ) -> Result<TenantRecord> {
        if !repo_full_name.contains('/') {
            bail!("repository must be 'owner/name', got '{}'", repo_full_name);
        }
        if self.by_repo.contains_key(repo_full_name) {
            bail!("repository '{}' is already registered", repo_full_name);
        }

        let record = TenantRecord {
            tenant_id: tenant_id_for(repo_full_name),
            repo_full_name: repo_full_name.to_string(),
            encrypted_token: self.codec.encode(token)?,
            model,
            created_at: Utc::now(),
            rotated_at: None,
        };
        self.by_repo
            .insert(record.repo_full_name.clone(), record.tenant_id.clone());
        self.records.insert(record.tenant_id.clone(), record.clone());
        self.save()?;
        Ok(record)
    }

    pub fn lookup(&self, repo_full_name: &str) -> Option<&TenantRecord> {
        self.by_repo
            .get(repo_full_name)
            .and_then(|id| self.records.get(id))
    }

    pub fn get(&self, tenant_id: &str) -> Option<&TenantRecord> {
        self.records.get(tenant_id)
    }

    pub fn list(&self) -> impl Iterator<Item = &TenantRecord> {
        self.records.values()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Decoded access token for `record`.
    pub fn token(&self, record: &TenantRecord) -> Result<String> {
        self.codec.decode(&record.encrypted_token)
    }

    pub fn rotate_credentials(&mut self, tenant_id: &str, token: &str) -> Result<()> {
        let encoded = self.codec.encode(token)?;
        let Some(record) = self.records.get_mut(tenant_id) else {
            bail!("unknown tenant '{}'", tenant_id);
        };
        record.encrypted_token = encoded;
        record.rotated_at = Some(Utc::now());
        self.save()
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.records)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to write tenant registry: {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(path: &Path) -> TenantRegistry {
        TenantRegistry::open(path, Arc::new(Base64Codec)).unwrap()
    }

    #[test]
    fn test_register_lookup_and_persist() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tenants.json");
        let mut registry = open(&path);
        assert!(registry.is_empty());

        let record = registry.register("acme/widgets", "ghp_secret", None).unwrap();
        assert_eq!(record.tenant_id, "acme_widgets");
        assert_ne!(record.encrypted_token, "ghp_secret");

        let reopened = open(&path);
        let found = reopened.lookup("acme/widgets").unwrap();
        assert_eq!(found, &record);
        assert_eq!(reopened.token(found).unwrap(), "ghp_secret");
        assert!(reopened.lookup("acme/other").is_none());
        assert!(!tmp.path().join("tenants.json.tmp").exists());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut registry = open(&tmp.path().join("tenants.json"));
        registry.register("acme/widgets", "a", None).unwrap();
        assert!(registry.register("acme/widgets", "b", None).is_err());
        assert!(registry.register("no-slash", "b", None).is_err());
    }

    #[test]
    fn test_rotate_credentials() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tenants.json");
        let mut registry = open(&path);
        registry.register("acme/widgets", "old", None).unwrap();
        registry.rotate_credentials("acme_widgets", "new").unwrap();

        let reopened = open(&path);
        let record = reopened.get("acme_widgets").unwrap();
        assert_eq!(reopened.token(record).unwrap(), "new");
        assert!(record.rotated_at.is_some());
        assert!(registry.rotate_credentials("missing", "x").is_err());
    }

    #[test]
    fn test_model_override_roundtrips() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tenants.json");
        let model = LlmConfig {
            provider: "ollama".to_string(),
            model: "llama3".to_string(),
            url: None,
            api_key_env: "LLM_API_KEY".to_string(),
            temperature: 0.1,
            max_retries: 2,
            timeout_secs: 60,
        };
        open(&path)
            .register("acme/widgets", "t", Some(model.clone()))
            .unwrap();
        assert_eq!(open(&path).get("acme_widgets").unwrap().model, Some(model));
    }
}
