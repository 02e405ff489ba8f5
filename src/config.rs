//! TOML configuration.
//!
//! Every section carries serde defaults, so a partial file (or
//! [`Config::default`]) is a working configuration. Secrets are read from
//! the environment, never from the file.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HMAC secret for bearer tokens. `DOCQA_AUTH_SECRET` takes precedence.
    #[serde(default)]
    pub auth_secret: Option<String>,
    /// Allowed CORS origins; empty means any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            auth_secret: None,
            cors_origins: Vec::new(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl ServerConfig {
    pub fn resolved_auth_secret(&self) -> Option<String> {
        std::env::var("DOCQA_AUTH_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .or_else(|| self.auth_secret.clone())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    #[serde(default = "default_max_concurrent_ingestions")]
    pub max_concurrent_ingestions: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: default_max_upload_bytes(),
            temp_dir: default_temp_dir(),
            max_concurrent_ingestions: default_max_concurrent_ingestions(),
        }
    }
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_temp_dir() -> PathBuf {
    PathBuf::from("./data/tmp")
}
fn default_max_concurrent_ingestions() -> usize {
    4
}

/// One adaptive sizing band. A document whose length is `< below` uses
/// this band; `below = None` marks the catch-all last band.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ChunkBand {
    pub name: String,
    #[serde(default)]
    pub below: Option<usize>,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Documents shorter than this (in characters) are not split.
    #[serde(default = "default_min_split_length")]
    pub min_split_length: usize,
    #[serde(default = "default_bands")]
    pub bands: Vec<ChunkBand>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_split_length: default_min_split_length(),
            bands: default_bands(),
        }
    }
}

fn default_min_split_length() -> usize {
    100
}

fn default_bands() -> Vec<ChunkBand> {
    vec![
        ChunkBand {
            name: "small".to_string(),
            below: Some(5_000),
            chunk_size: 500,
            chunk_overlap: 100,
        },
        ChunkBand {
            name: "medium".to_string(),
            below: Some(50_000),
            chunk_size: 1000,
            chunk_overlap: 200,
        },
        ChunkBand {
            name: "large".to_string(),
            below: None,
            chunk_size: 1500,
            chunk_overlap: 300,
        },
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub default_k: usize,
    #[serde(default = "default_max_k")]
    pub max_k: usize,
    #[serde(default = "default_fetch_k_multiplier")]
    pub fetch_k_multiplier: usize,
    /// MMR trade-off: 1.0 is pure relevance, 0.0 is pure diversity.
    #[serde(default = "default_diversity_weight")]
    pub diversity_weight: f32,
    #[serde(default = "default_use_mmr")]
    pub use_mmr: bool,
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            max_k: default_max_k(),
            fetch_k_multiplier: default_fetch_k_multiplier(),
            diversity_weight: default_diversity_weight(),
            use_mmr: default_use_mmr(),
            preview_chars: default_preview_chars(),
        }
    }
}

fn default_k() -> usize {
    5
}
fn default_max_k() -> usize {
    20
}
fn default_fetch_k_multiplier() -> usize {
    4
}
fn default_diversity_weight() -> f32 {
    0.5
}
fn default_use_mmr() -> bool {
    true
}
fn default_preview_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            base_url: None,
            max_batch_size: default_max_batch_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_max_batch_size() -> usize {
    100
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: default_llm_model(),
            base_url: None,
            timeout_secs: default_timeout_secs(),
            temperature: None,
            max_tokens: None,
        }
    }
}

fn default_llm_model() -> String {
    "gemini-2.5-flash".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetadataConfig {
    #[serde(default = "default_metadata_backend")]
    pub backend: String,
    #[serde(default = "default_metadata_path")]
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            backend: default_metadata_backend(),
            path: default_metadata_path(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_metadata_backend() -> String {
    "memory".to_string()
}
fn default_metadata_path() -> PathBuf {
    PathBuf::from("./data/docqa.sqlite")
}
fn default_max_connections() -> u32 {
    5
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        // Chunking
        let bands = &self.chunking.bands;
        if bands.is_empty() {
            bail!("chunking.bands must not be empty");
        }
        let mut previous: Option<usize> = None;
        for (i, band) in bands.iter().enumerate() {
            if band.chunk_size == 0 {
                bail!("chunking band '{}': chunk_size must be > 0", band.name);
            }
            if band.chunk_overlap * 4 > band.chunk_size {
                bail!(
                    "chunking band '{}': chunk_overlap ({}) must not exceed a quarter of chunk_size ({})",
                    band.name,
                    band.chunk_overlap,
                    band.chunk_size
                );
            }
            let is_last = i + 1 == bands.len();
            match (band.below, is_last) {
                (None, false) => bail!(
                    "chunking band '{}': only the last band may omit `below`",
                    band.name
                ),
                (Some(limit), _) => {
                    if previous.is_some_and(|p| limit <= p) {
                        bail!("chunking bands must be strictly ascending by `below`");
                    }
                    previous = Some(limit);
                }
                (None, true) => {}
            }
        }

        // Retrieval
        let r = &self.retrieval;
        if r.max_k == 0 {
            bail!("retrieval.max_k must be >= 1");
        }
        if r.default_k == 0 || r.default_k > r.max_k {
            bail!("retrieval.default_k must be in [1, {}]", r.max_k);
        }
        if r.fetch_k_multiplier == 0 {
            bail!("retrieval.fetch_k_multiplier must be >= 1");
        }
        if !(0.0..=1.0).contains(&r.diversity_weight) {
            bail!("retrieval.diversity_weight must be in [0.0, 1.0]");
        }

        // Upload
        if self.upload.max_upload_bytes == 0 {
            bail!("upload.max_upload_bytes must be > 0");
        }
        if self.upload.max_concurrent_ingestions == 0 {
            bail!("upload.max_concurrent_ingestions must be >= 1");
        }

        // Embedding
        if self.embedding.max_batch_size == 0 {
            bail!("embedding.max_batch_size must be >= 1");
        }
        match self.embedding.provider.as_str() {
            "disabled" | "gemini" | "openai" => {}
            "hashing" => {
                if self.embedding.dims.unwrap_or(0) == 0 {
                    bail!("embedding.dims must be > 0 when provider is 'hashing'");
                }
            }
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, gemini, openai, or hashing.",
                other
            ),
        }

        match self.llm.provider.as_str() {
            "disabled" | "gemini" | "openai" => {}
            other => bail!(
                "Unknown llm provider: '{}'. Must be disabled, gemini, or openai.",
                other
            ),
        }

        match self.metadata.backend.as_str() {
            "memory" | "sqlite" => {}
            other => bail!(
                "Unknown metadata backend: '{}'. Must be memory or sqlite.",
                other
            ),
        }

        Ok(())
    }
}
