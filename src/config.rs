use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub tenants: TenantsConfig,
}

/// Where the knowledge base lives locally and how it maps into the
/// published repository.
#[derive(Debug, Deserialize, Clone)]
pub struct KnowledgeConfig {
    /// Local directory holding the markdown documents that get indexed.
    pub docs_root: PathBuf,
    /// Path prefix of `docs_root` inside the published repository
    /// (e.g. `"docs/"`). Joined with each file's relative path to form
    /// its canonical `source_path`.
    #[serde(default)]
    pub repo_prefix: String,
    /// Local ledger file. Generated entries are appended here.
    pub ledger_path: PathBuf,
    /// Repository path of the ledger file; the fallback target for
    /// CREATE decisions.
    #[serde(default = "default_ledger_source")]
    pub ledger_source: String,
    /// SQLite file backing the knowledge index.
    pub index_path: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_ledger_source() -> String {
    "docs/DOC_LEDGER.md".to_string()
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    1000
}
fn default_overlap_chars() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Minimum best-chunk score required to revise existing docs instead
    /// of authoring a new ledger section.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// When false, a below-threshold (but non-empty) retrieval ends the
    /// run as skipped instead of falling back to CREATE.
    #[serde(default = "default_true")]
    pub create_on_low_confidence: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            confidence_threshold: default_confidence_threshold(),
            create_on_low_confidence: true,
        }
    }
}

fn default_top_k() -> usize {
    3
}
fn default_confidence_threshold() -> f64 {
    0.5
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for HTTP providers (Ollama, OpenAI-compatible gateways).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            api_key_env: default_api_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// Text generation capability used by the classifier and the generator.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_llm_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_llm_key_env() -> String {
    "LLM_API_KEY".to_string()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_llm_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct PublishConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Prefix of every branch this service creates. Pushes to branches
    /// with this prefix never trigger a run.
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token_env: default_token_env(),
            branch_prefix: default_branch_prefix(),
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}
fn default_token_env() -> String {
    "GITHUB_API_TOKEN".to_string()
}
fn default_branch_prefix() -> String {
    "ai-docs-fix-pr-".to_string()
}
fn default_user_agent() -> String {
    format!("docsync/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            secret_env: default_secret_env(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_secret_env() -> String {
    "GITHUB_SECRET_TOKEN".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProgressConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Directory for per-tenant progress logs. Disabled when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            log_dir: None,
        }
    }
}

fn default_channel_capacity() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TenantsConfig {
    #[serde(default)]
    pub registry_path: Option<PathBuf>,
    /// Root for per-tenant indexes and ledgers. Defaults to `tenants/`
    /// next to `knowledge.index_path`.
    #[serde(default)]
    pub knowledge_dir: Option<PathBuf>,
}

impl TenantsConfig {
    pub fn knowledge_root(&self, knowledge: &KnowledgeConfig) -> PathBuf {
        match &self.knowledge_dir {
            Some(dir) => dir.clone(),
            None => knowledge
                .index_path
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .join("tenants"),
        }
    }
}

const EMBEDDING_PROVIDERS: &[&str] = &["hash", "openai", "ollama", "local"];
const LLM_PROVIDERS: &[&str] = &["openai", "gemini", "ollama"];

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.max_chars {
        anyhow::bail!("chunking.overlap_chars must be smaller than chunking.max_chars");
    }

    // Validate retrieval
    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.confidence_threshold) {
        anyhow::bail!("retrieval.confidence_threshold must be in [0.0, 1.0]");
    }

    // Validate embedding
    let provider = config.embedding.provider.as_str();
    if !EMBEDDING_PROVIDERS.contains(&provider) {
        anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be one of: {}.",
            provider,
            EMBEDDING_PROVIDERS.join(", ")
        );
    }
    if matches!(provider, "openai" | "ollama") {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!("embedding.dims must be > 0 when provider is '{}'", provider);
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                provider
            );
        }
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    // Validate llm
    if !LLM_PROVIDERS.contains(&config.llm.provider.as_str()) {
        anyhow::bail!(
            "Unknown llm provider: '{}'. Must be one of: {}.",
            config.llm.provider,
            LLM_PROVIDERS.join(", ")
        );
    }
    if config.llm.model.trim().is_empty() {
        anyhow::bail!("llm.model must not be empty");
    }

    // Validate publish
    if config.publish.branch_prefix.trim().is_empty() {
        anyhow::bail!("publish.branch_prefix must not be empty");
    }

    if config.progress.channel_capacity == 0 {
        anyhow::bail!("progress.channel_capacity must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[knowledge]
docs_root = "data/docs"
repo_prefix = "docs/"
ledger_path = "data/docs/DOC_LEDGER.md"
index_path = "data/index.sqlite"

[llm]
provider = "gemini"
model = "gemini-2.5-flash-lite"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.chunking.max_chars, 1000);
        assert_eq!(config.chunking.overlap_chars, 100);
        assert_eq!(config.retrieval.top_k, 3);
        assert!((config.retrieval.confidence_threshold - 0.5).abs() < f64::EPSILON);
        assert!(config.retrieval.create_on_low_confidence);
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.publish.branch_prefix, "ai-docs-fix-pr-");
        assert_eq!(config.knowledge.ledger_source, "docs/DOC_LEDGER.md");
    }

    #[test]
    fn test_tenant_knowledge_root_defaults_next_to_index() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(
            config.tenants.knowledge_root(&config.knowledge),
            PathBuf::from("data/tenants")
        );
        config.tenants.knowledge_dir = Some(PathBuf::from("/srv/docsync/tenants"));
        assert_eq!(
            config.tenants.knowledge_root(&config.knowledge),
            PathBuf::from("/srv/docsync/tenants")
        );
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.retrieval.confidence_threshold = 1.5;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("confidence_threshold"));
    }

    #[test]
    fn test_overlap_must_be_smaller_than_window() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.chunking.overlap_chars = 1000;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_openai_embedding_requires_dims_and_model() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.embedding.provider = "openai".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));

        config.embedding.dims = Some(1536);
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
    }

    #[test]
    fn test_unknown_llm_provider_rejected() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.llm.provider = "mystery".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("Unknown llm provider"));
    }
}
