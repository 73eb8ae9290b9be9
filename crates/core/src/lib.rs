pub mod chunking;
pub mod config;
pub mod coordinator;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod generation;
pub mod index;
pub mod models;
pub mod parser;
pub mod prompts;
pub mod qa;
pub mod retry;
pub mod stores;
pub mod summarizer;
pub mod traits;

pub use chunking::{estimate_tokens, normalize_whitespace, split, split_text, ChunkingConfig, TextChunk};
pub use config::{
    ChunkingOptions, EmbeddingConfig, EmbeddingProviderKind, GenerationConfig, ParserOptions,
    PipelineConfig, RetrievalOptions, RetryOptions, SummarizerOptions,
};
pub use coordinator::{Coordinator, FailureReport, Phase, Providers, StreamingAnswer};
pub use embeddings::{
    cosine_similarity, CharacterNgramEmbedder, Embedder, HttpEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{ErrorKind, PipelineError, ProviderError};
pub use extractor::{extractor_for, ExtractedText, PageText, TextExtractor};
pub use generation::{ChatCompletionsGenerator, ChatMessage, GenerationRequest, Generator, TextStream};
pub use index::EmbeddingIndex;
pub use models::{
    AnalysisReport, AnswerResult, Chunk, ConversationTurn, Document, DocumentFormat, HistoryRecord,
    HistorySummary, ReportSection, Role, ScoredChunk, Section, SourceSnippet,
};
pub use parser::ParserAgent;
pub use qa::{assemble_context, AnswerStream, AssembledContext, QaAgent, QuestionContext};
pub use retry::retry_with_backoff;
pub use stores::{InMemoryHistoryStore, InMemoryVectorStore, JsonHistoryStore, QdrantStore};
pub use summarizer::SummarizerAgent;
pub use traits::{HistoryStore, VectorIndex};
