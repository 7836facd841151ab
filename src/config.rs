//! TOML configuration parsing and validation.
//!
//! The whole process is configured by one file (default
//! `./config/askdocs.toml`). Credentials never live in the file: each
//! provider names the environment variable holding its key (`api_key_env`),
//! which [`load_config`] resolves once at startup. A `.env` file in the
//! working directory is honoured by the binary before loading.
//!
//! A missing key is fatal for the index and the primary tiers. A secondary
//! tier whose key does not resolve is dropped with a warning, so a
//! single-provider deployment can keep the secondary sections in its file.
//! Commands that never reach a provider (`ingest --dry-run`, `usage`) load
//! through [`load_config_offline`], which skips credential checks entirely.
//!
//! ```toml
//! [index]
//! kind = "pinecone"
//! host = "https://hr-abc123.svc.us-east-1.pinecone.io"
//! api_key_env = "PINECONE_API_KEY"
//! namespace = "hr"
//! dims = 768
//!
//! [chunking]
//! max_chars = 1200
//! overlap_chars = 200
//!
//! [embedding.primary]
//! provider = "gemini"
//! model = "gemini-embedding-001"
//! api_key_env = "GEMINI_API_KEY"
//!
//! [embedding.secondary]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! api_key_env = "OPENAI_API_KEY"
//!
//! [generation.primary]
//! provider = "gemini"
//! model = "gemini-2.0-flash"
//! api_key_env = "GEMINI_API_KEY"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    pub generation: GenerationConfig,
    #[serde(default)]
    pub documents: DocumentsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// `"pinecone"` or `"memory"`.
    #[serde(default = "default_index_kind")]
    pub kind: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_index_key_env")]
    pub api_key_env: String,
    #[serde(skip)]
    pub api_key: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Embedding dimension shared by ingestion and retrieval.
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_index_kind() -> String {
    "pinecone".to_string()
}
fn default_index_key_env() -> String {
    "PINECONE_API_KEY".to_string()
}
fn default_namespace() -> String {
    "default".to_string()
}
fn default_dims() -> usize {
    768
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
    1200
}
fn default_overlap_chars() -> usize {
    200
}

/// One provider tier: which backend, which model, and where its key lives.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// `"gemini"`, `"openai"` or `"ollama"` (embedding only).
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(skip)]
    pub api_key: Option<String>,
    /// Override the provider's default API base URL.
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ProviderConfig {
    fn needs_key(&self) -> bool {
        self.provider != "ollama"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    pub primary: ProviderConfig,
    #[serde(default)]
    pub secondary: Option<ProviderConfig>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_batch_size() -> usize {
    64
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_context_chars: default_max_context_chars(),
        }
    }
}

fn default_top_k() -> usize {
    3
}
fn default_max_context_chars() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    pub primary: ProviderConfig,
    #[serde(default)]
    pub secondary: Option<ProviderConfig>,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_system_prompt_path")]
    pub system_prompt_path: PathBuf,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_input_chars() -> usize {
    200
}
fn default_max_output_tokens() -> u32 {
    400
}
fn default_temperature() -> f32 {
    0.2
}
fn default_system_prompt_path() -> PathBuf {
    PathBuf::from("system_prompt.txt")
}
fn default_generation_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocumentsConfig {
    #[serde(default = "default_documents_root")]
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Base URL documents are published under, used to build citation links.
    #[serde(default)]
    pub citation_base_url: Option<String>,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            root: default_documents_root(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            citation_base_url: None,
        }
    }
}

fn default_documents_root() -> PathBuf {
    PathBuf::from("documents")
}
fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.md".to_string(),
        "**/*.txt".to_string(),
        "**/*.pdf".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Environment variable holding the usage-reset secret. Reset is
    /// disabled when unset.
    #[serde(default)]
    pub admin_secret_env: Option<String>,
    #[serde(skip)]
    pub admin_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            admin_secret_env: None,
            admin_secret: None,
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

/// Read, parse, resolve secrets and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    parse_config(&read_config_file(path)?)
}

/// Like [`load_config`], but without requiring any provider or index
/// credentials.
pub fn load_config_offline(path: &Path) -> Result<Config> {
    parse_config_offline(&read_config_file(path)?)
}

fn read_config_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))
}

/// Parse configuration text, resolve secrets from the environment, and validate.
pub fn parse_config(content: &str) -> Result<Config> {
    let mut config = parse_config_offline(content)?;
    require_credentials(&mut config)?;
    Ok(config)
}

/// Parse and validate configuration text without checking credentials.
pub fn parse_config_offline(content: &str) -> Result<Config> {
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;
    resolve_secrets(&mut config);
    validate(&config)?;
    Ok(config)
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn resolve_provider_key(provider: &mut ProviderConfig) {
    if provider.api_key.is_none() {
        provider.api_key = provider.api_key_env.as_deref().and_then(read_env);
    }
}

fn resolve_secrets(config: &mut Config) {
    if config.index.api_key.is_none() {
        config.index.api_key = read_env(&config.index.api_key_env);
    }
    resolve_provider_key(&mut config.embedding.primary);
    if let Some(p) = config.embedding.secondary.as_mut() {
        resolve_provider_key(p);
    }
    resolve_provider_key(&mut config.generation.primary);
    if let Some(p) = config.generation.secondary.as_mut() {
        resolve_provider_key(p);
    }
    if config.server.admin_secret.is_none() {
        config.server.admin_secret = config.server.admin_secret_env.as_deref().and_then(read_env);
    }
}

fn validate_provider(section: &str, provider: &ProviderConfig, kinds: &[&str]) -> Result<()> {
    if !kinds.contains(&provider.provider.as_str()) {
        bail!(
            "Unknown provider '{}' in [{}]. Must be one of: {}",
            provider.provider,
            section,
            kinds.join(", ")
        );
    }
    if provider.model.trim().is_empty() {
        bail!("{}.model must not be empty", section);
    }
    Ok(())
}

fn has_key(provider: &ProviderConfig) -> bool {
    !provider.needs_key() || provider.api_key.is_some()
}

fn require_key(section: &str, provider: &ProviderConfig) -> Result<()> {
    if !has_key(provider) {
        bail!(
            "{}: API key not found (set the environment variable named by api_key_env{})",
            section,
            provider
                .api_key_env
                .as_deref()
                .map(|v| format!(", currently '{}'", v))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn drop_keyless_secondary(section: &str, secondary: &mut Option<ProviderConfig>) {
    if let Some(p) = secondary {
        if !has_key(p) {
            warn!(
                "{}: API key not found in '{}'; continuing without a secondary provider",
                section,
                p.api_key_env.as_deref().unwrap_or("")
            );
            *secondary = None;
        }
    }
}

/// Check that every provider the process will call has its credentials.
/// Called by [`parse_config`]; secondaries without a key are dropped.
pub fn require_credentials(config: &mut Config) -> Result<()> {
    if config.index.kind == "pinecone" && config.index.api_key.is_none() {
        bail!(
            "index: API key not found in environment variable '{}'",
            config.index.api_key_env
        );
    }
    require_key("embedding.primary", &config.embedding.primary)?;
    drop_keyless_secondary("embedding.secondary", &mut config.embedding.secondary);
    require_key("generation.primary", &config.generation.primary)?;
    drop_keyless_secondary("generation.secondary", &mut config.generation.secondary);
    Ok(())
}

/// Validate a parsed configuration's structure. Credentials are checked
/// separately by [`require_credentials`].
pub fn validate(config: &Config) -> Result<()> {
    // Index
    match config.index.kind.as_str() {
        "pinecone" => {
            if config.index.host.as_deref().unwrap_or("").is_empty() {
                bail!("index.host is required when index.kind = 'pinecone'");
            }
        }
        "memory" => {}
        other => bail!(
            "Unknown index kind: '{}'. Must be pinecone or memory.",
            other
        ),
    }
    if config.index.dims == 0 {
        bail!("index.dims must be > 0");
    }
    if config.index.namespace.trim().is_empty() {
        bail!("index.namespace must not be empty");
    }

    // Chunking
    if config.chunking.max_chars == 0 {
        bail!("chunking.max_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.max_chars {
        bail!("chunking.overlap_chars must be smaller than chunking.max_chars");
    }

    // Embedding
    let embed_kinds = ["gemini", "openai", "ollama"];
    validate_provider("embedding.primary", &config.embedding.primary, &embed_kinds)?;
    if let Some(p) = &config.embedding.secondary {
        validate_provider("embedding.secondary", p, &embed_kinds)?;
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    // Retrieval
    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.max_context_chars == 0 {
        bail!("retrieval.max_context_chars must be > 0");
    }

    // Generation
    let gen_kinds = ["gemini", "openai"];
    validate_provider("generation.primary", &config.generation.primary, &gen_kinds)?;
    if let Some(p) = &config.generation.secondary {
        validate_provider("generation.secondary", p, &gen_kinds)?;
    }
    if config.generation.max_input_chars == 0 {
        bail!("generation.max_input_chars must be > 0");
    }
    if config.generation.max_output_tokens == 0 {
        bail!("generation.max_output_tokens must be > 0");
    }

    Ok(())
}
