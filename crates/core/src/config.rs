use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub chunking: ChunkingOptions,
    pub retrieval: RetrievalOptions,
    pub summarizer: SummarizerOptions,
    pub parser: ParserOptions,
    pub generation: GenerationConfig,
    pub embedding: EmbeddingConfig,
    pub history_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingOptions::default(),
            retrieval: RetrievalOptions::default(),
            summarizer: SummarizerOptions::default(),
            parser: ParserOptions::default(),
            generation: GenerationConfig::default(),
            embedding: EmbeddingConfig::default(),
            history_dir: PathBuf::from("./history"),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ChunkingOptions {
    /// Words per chunk.
    pub chunk_size: usize,
    /// Words repeated from the end of the previous chunk.
    pub overlap: usize,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            overlap: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetrievalOptions {
    pub top_k: usize,
    pub context_token_budget: usize,
    pub history_window: usize,
    pub snippet_chars: usize,
    pub max_stored_turns: usize,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            context_token_budget: 2_000,
            history_window: 10,
            snippet_chars: 200,
            max_stored_turns: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SummarizerOptions {
    pub max_content_chars: usize,
    pub structure_preview_chars: usize,
    pub keyword_preview_chars: usize,
}

impl Default for SummarizerOptions {
    fn default() -> Self {
        Self {
            max_content_chars: 30_000,
            structure_preview_chars: 8_000,
            keyword_preview_chars: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ParserOptions {
    pub max_file_bytes: usize,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            max_file_bytes: 50 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryOptions {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(16));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub retry: RetryOptions,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.deepseek.com/v1".to_string(),
            api_key: None,
            model: "deepseek-chat".to_string(),
            temperature: 0.7,
            max_tokens: 4_096,
            timeout_secs: 60,
            retry: RetryOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    Local,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub dimensions: usize,
    pub timeout_secs: u64,
    pub retry: RetryOptions,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Local,
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "text-embedding-3-small".to_string(),
            dimensions: 384,
            timeout_secs: 30,
            retry: RetryOptions::default(),
        }
    }
}
