//! TOML configuration.
//!
//! One file configures both halves of docqa: the backend server (`[db]`,
//! `[server]`, `[chunking]`, `[retrieval]`, `[embedding]`, `[generation]`)
//! and the client-side load cache (`[cache]`, `[backend]`). Every field has a
//! default, so an empty file is a valid local setup.
//!
//! ```toml
//! [db]
//! path = "./data/docqa.sqlite"
//!
//! [cache]
//! path = "./data/cache.sqlite"
//! ttl_secs = 1800
//!
//! [backend]
//! url = "http://127.0.0.1:7331"
//!
//! [embedding]
//! provider = "hash"
//! dims = 384
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use docqa_core::chunk::ChunkParams;
use docqa_core::query::TopKParams;
use docqa_core::search::FusionParams;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}

impl Config {
    /// All defaults, with both databases placed under `data_dir`.
    pub fn with_data_dir(data_dir: &Path) -> Self {
        let mut config = Config::default();
        config.db.path = data_dir.join("docqa.sqlite");
        config.cache.path = data_dir.join("cache.sqlite");
        config
    }
}

/// Backend passage database.
#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/docqa.sqlite")
}

/// Client-side document load cache.
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
    /// Entries older than this are treated as absent.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("./data/cache.sqlite")
}
fn default_ttl_secs() -> u64 {
    30 * 60
}
fn default_sweep_interval_secs() -> u64 {
    5 * 60
}

/// Where the client finds the backend.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_backend_url")]
    pub url: String,
    /// Ceiling for health and existence probes.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Ceiling for uploads.
    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            probe_timeout_secs: default_probe_timeout_secs(),
            upload_timeout_secs: default_upload_timeout_secs(),
        }
    }
}

fn default_backend_url() -> String {
    "http://127.0.0.1:7331".to_string()
}
fn default_probe_timeout_secs() -> u64 {
    5
}
fn default_upload_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Largest accepted upload, in megabytes.
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_mb: default_max_upload_mb(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7331".to_string()
}
fn default_max_upload_mb() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_fine_tokens")]
    pub fine_tokens: usize,
    #[serde(default = "default_medium_tokens")]
    pub medium_tokens: usize,
    #[serde(default = "default_large_tokens")]
    pub large_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            fine_tokens: default_fine_tokens(),
            medium_tokens: default_medium_tokens(),
            large_tokens: default_large_tokens(),
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkParams {
        ChunkParams {
            fine_tokens: self.fine_tokens,
            medium_tokens: self.medium_tokens,
            large_tokens: self.large_tokens,
        }
    }
}

fn default_fine_tokens() -> usize {
    120
}
fn default_medium_tokens() -> usize {
    350
}
fn default_large_tokens() -> usize {
    900
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_base_top_k")]
    pub base_top_k: usize,
    #[serde(default = "default_per_sub_question")]
    pub per_sub_question: usize,
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
    #[serde(default = "default_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_weight")]
    pub lexical_weight: f64,
    #[serde(default = "default_weight")]
    pub entity_weight: f64,
    /// `capitalized` or `none`.
    #[serde(default = "default_entity_detector")]
    pub entity_detector: String,
    /// Token budget for passages handed to the generator.
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            base_top_k: default_base_top_k(),
            per_sub_question: default_per_sub_question(),
            max_top_k: default_max_top_k(),
            semantic_weight: default_weight(),
            lexical_weight: default_weight(),
            entity_weight: default_weight(),
            entity_detector: default_entity_detector(),
            max_context_tokens: default_max_context_tokens(),
        }
    }
}

impl RetrievalConfig {
    pub fn top_k_params(&self) -> TopKParams {
        TopKParams {
            base: self.base_top_k,
            per_sub_question: self.per_sub_question,
            max: self.max_top_k,
        }
    }

    pub fn fusion_params(&self) -> FusionParams {
        FusionParams {
            semantic_weight: self.semantic_weight,
            lexical_weight: self.lexical_weight,
            entity_weight: self.entity_weight,
        }
    }
}

fn default_base_top_k() -> usize {
    25
}
fn default_per_sub_question() -> usize {
    20
}
fn default_max_top_k() -> usize {
    100
}
fn default_weight() -> f64 {
    1.0
}
fn default_entity_detector() -> String {
    "capitalized".to_string()
}
fn default_max_context_tokens() -> usize {
    12_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `hash`, `openai`, or `disabled`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
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
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "hash".to_string()
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

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `extractive` or `openai`.
    #[serde(default = "default_generator")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL of an OpenAI-compatible API.
    #[serde(default = "default_generation_url")]
    pub url: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Hard ceiling for one answer stream.
    #[serde(default = "default_stream_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generator(),
            model: None,
            url: default_generation_url(),
            temperature: default_temperature(),
            timeout_secs: default_stream_timeout_secs(),
        }
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_generator() -> String {
    "extractive".to_string()
}
fn default_generation_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_temperature() -> f32 {
    0.1
}
fn default_stream_timeout_secs() -> u64 {
    600
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let c = &config.chunking;
    if c.fine_tokens == 0 || c.medium_tokens == 0 || c.large_tokens == 0 {
        anyhow::bail!("chunking token limits must be > 0");
    }
    if !(c.fine_tokens <= c.medium_tokens && c.medium_tokens <= c.large_tokens) {
        anyhow::bail!("chunking limits must satisfy fine_tokens <= medium_tokens <= large_tokens");
    }

    let r = &config.retrieval;
    if r.base_top_k == 0 {
        anyhow::bail!("retrieval.base_top_k must be >= 1");
    }
    if r.max_top_k < r.base_top_k {
        anyhow::bail!("retrieval.max_top_k must be >= retrieval.base_top_k");
    }
    for (name, w) in [
        ("semantic_weight", r.semantic_weight),
        ("lexical_weight", r.lexical_weight),
        ("entity_weight", r.entity_weight),
    ] {
        if !w.is_finite() || w < 0.0 {
            anyhow::bail!("retrieval.{} must be a non-negative number", name);
        }
    }
    match r.entity_detector.as_str() {
        "capitalized" | "none" => {}
        other => anyhow::bail!(
            "Unknown entity detector: '{}'. Must be capitalized or none.",
            other
        ),
    }
    if r.max_context_tokens == 0 {
        anyhow::bail!("retrieval.max_context_tokens must be > 0");
    }

    if config.cache.ttl_secs == 0 {
        anyhow::bail!("cache.ttl_secs must be > 0");
    }
    if config.cache.sweep_interval_secs == 0 {
        anyhow::bail!("cache.sweep_interval_secs must be > 0");
    }
    if config.backend.probe_timeout_secs == 0 {
        anyhow::bail!("backend.probe_timeout_secs must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hash" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                anyhow::bail!("embedding.model must be specified when provider is 'openai'");
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                anyhow::bail!("embedding.dims must be > 0 when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, or openai.",
            other
        ),
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0");
    }

    match config.generation.provider.as_str() {
        "extractive" => {}
        "openai" => {
            if config.generation.model.is_none() {
                anyhow::bail!("generation.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be extractive or openai.",
            other
        ),
    }
    if config.generation.timeout_secs == 0 {
        anyhow::bail!("generation.timeout_secs must be > 0");
    }

    Ok(())
}
