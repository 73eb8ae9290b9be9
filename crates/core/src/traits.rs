use crate::error::{PipelineError, ProviderError};
use crate::models::{Chunk, HistoryRecord, HistorySummary, ScoredChunk};
use async_trait::async_trait;

/// Vector storage scoped per document. Each call only sees the vectors of `document_id`.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Replaces every stored vector of `document_id` with `chunks`.
    async fn replace_document(&self, document_id: &str, chunks: Vec<Chunk>)
        -> Result<(), ProviderError>;

    async fn search_document(
        &self,
        document_id: &str,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredChunk>, ProviderError>;

    async fn drop_document(&self, document_id: &str) -> Result<(), ProviderError>;

    async fn chunk_count(&self, document_id: &str) -> Result<usize, ProviderError>;
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Inserts or wholly replaces the record with the same id.
    async fn save(&self, record: &HistoryRecord) -> Result<(), PipelineError>;

    async fn get(&self, id: &str) -> Result<Option<HistoryRecord>, PipelineError>;

    /// Summaries ordered by analysis timestamp, most recent first.
    async fn list(&self) -> Result<Vec<HistorySummary>, PipelineError>;

    /// Returns whether a record was removed.
    async fn delete(&self, id: &str) -> Result<bool, PipelineError>;
}
