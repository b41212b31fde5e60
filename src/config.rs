use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub websearch: WebSearchConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_chars: default_chunk_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_chunk_chars() -> usize {
    1000
}
fn default_overlap_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Number of chunks retrieved per query.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Char budget for the document-excerpt section of the prompt.
    #[serde(default = "default_document_chars")]
    pub document_chars: usize,
    /// Char budget for the web-snippet section of the prompt.
    #[serde(default = "default_web_chars")]
    pub web_chars: usize,
    /// Cap on the whole assembled system prompt. When exceeded, web
    /// snippets are dropped before document excerpts, tail excerpts
    /// before head excerpts.
    #[serde(default = "default_total_chars")]
    pub total_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            document_chars: default_document_chars(),
            web_chars: default_web_chars(),
            total_chars: default_total_chars(),
        }
    }
}

fn default_top_k() -> usize {
    4
}
fn default_document_chars() -> usize {
    6000
}
fn default_web_chars() -> usize {
    2000
}
fn default_total_chars() -> usize {
    9000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
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
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
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
pub struct CompletionConfig {
    #[serde(default = "default_completion_base_url")]
    pub base_url: String,
    #[serde(default = "default_completion_model")]
    pub model: String,
    #[serde(default = "default_completion_timeout")]
    pub timeout_secs: u64,
    /// Bounded retry before the first streamed token. Completions carry
    /// no idempotent-retry contract, so the default is 0.
    #[serde(default)]
    pub max_retries: u32,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: default_completion_base_url(),
            model: default_completion_model(),
            timeout_secs: default_completion_timeout(),
            max_retries: 0,
        }
    }
}

fn default_completion_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_completion_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_completion_timeout() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebSearchConfig {
    #[serde(default = "default_websearch_provider")]
    pub provider: String,
    #[serde(default = "default_websearch_url")]
    pub url: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_websearch_timeout")]
    pub timeout_secs: u64,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            url: default_websearch_url(),
            max_results: default_max_results(),
            timeout_secs: default_websearch_timeout(),
        }
    }
}

impl WebSearchConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_websearch_provider() -> String {
    "disabled".to_string()
}
fn default_websearch_url() -> String {
    "https://api.tavily.com/search".to_string()
}
fn default_max_results() -> usize {
    3
}
fn default_websearch_timeout() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Sliding window of turns sent to the model per request. The full
    /// transcript is still persisted.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
        }
    }
}

fn default_history_window() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssistantConfig {
    #[serde(default = "default_persona")]
    pub persona: String,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            persona: default_persona(),
        }
    }
}

fn default_persona() -> String {
    "You are a careful assistant that answers questions about the user's \
     documents. Ground your answers in the supplied material when it is \
     relevant, and cite the source name and page of any excerpt you rely on."
        .to_string()
}

/// Load configuration from a TOML file. A missing file yields the
/// defaults; a present-but-invalid file is an error.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_chars == 0 {
        anyhow::bail!("chunking.chunk_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.chunk_chars {
        anyhow::bail!("chunking.overlap_chars must be < chunking.chunk_chars");
    }

    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.document_chars == 0 || config.retrieval.total_chars == 0 {
        anyhow::bail!("retrieval char budgets must be > 0");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    match config.websearch.provider.as_str() {
        "disabled" | "tavily" => {}
        other => anyhow::bail!(
            "Unknown websearch provider: '{}'. Must be disabled or tavily.",
            other
        ),
    }

    if config.session.history_window == 0 {
        anyhow::bail!("session.history_window must be >= 1");
    }

    Ok(())
}

/// Starter config written by `nexus init`.
pub fn starter_config_toml() -> &'static str {
    r#"[storage]
data_dir = "./data"

[chunking]
chunk_chars = 1000
overlap_chars = 200

[retrieval]
top_k = 4
document_chars = 6000
web_chars = 2000
total_chars = 9000

[embedding]
# provider: disabled | openai | ollama
provider = "openai"
model = "text-embedding-3-small"
dims = 1536

[completion]
base_url = "https://api.openai.com/v1"
model = "gpt-4o-mini"
timeout_secs = 120
max_retries = 0

[websearch]
# provider: disabled | tavily
provider = "disabled"
max_results = 3

[session]
history_window = 20
"#
}
