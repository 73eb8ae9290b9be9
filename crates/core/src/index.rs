use crate::chunking::TextChunk;
use crate::embeddings::Embedder;
use crate::error::PipelineError;
use crate::models::{Chunk, ScoredChunk};
use crate::traits::VectorIndex;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Embeds chunks with an injected [`Embedder`] and keeps them per document in a [`VectorIndex`].
#[derive(Clone)]
pub struct EmbeddingIndex {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorIndex>,
}

impl EmbeddingIndex {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorIndex>) -> Self {
        Self { embedder, store }
    }

    pub fn dimensions(&self) -> usize {
        self.embedder.dimensions()
    }

    /// Embeds every chunk, then swaps the document's stored vectors in one call.
    /// Nothing is written when any embedding fails.
    pub async fn add(&self, document_id: &str, chunks: &[TextChunk]) -> Result<usize, PipelineError> {
        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let vectors = self
            .embedder
            .embed_batch(&texts)
            .await
            .map_err(|error| PipelineError::Embedding(error.to_string()))?;

        if vectors.len() != chunks.len() {
            return Err(PipelineError::Embedding(format!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }

        let expected = self.embedder.dimensions();
        let mut stored = Vec::with_capacity(chunks.len());
        for (chunk, embedding) in chunks.iter().zip(vectors) {
            check_dimensions(expected, embedding.len())?;
            stored.push(Chunk {
                chunk_id: Uuid::new_v4().to_string(),
                document_id: document_id.to_string(),
                position: chunk.position,
                text: chunk.text.clone(),
                start_word: chunk.start_word,
                end_word: chunk.end_word,
                embedding,
            });
        }

        let count = stored.len();
        self.store
            .replace_document(document_id, stored)
            .await
            .map_err(|error| PipelineError::Embedding(error.to_string()))?;
        Ok(count)
    }

    /// Top `k` chunks of `document_id`, score-descending, ties by ascending position.
    pub async fn search(
        &self,
        document_id: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredChunk>, PipelineError> {
        if k == 0 || self.chunk_count(document_id).await? == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self
            .embedder
            .embed(query)
            .await
            .map_err(|error| PipelineError::Embedding(error.to_string()))?;
        check_dimensions(self.embedder.dimensions(), query_vector.len())?;

        let mut hits = self
            .store
            .search_document(document_id, &query_vector, k)
            .await
            .map_err(|error| PipelineError::Embedding(error.to_string()))?;

        hits.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then(left.chunk.position.cmp(&right.chunk.position))
        });
        hits.truncate(k);

        debug!(
            document_id,
            k,
            scores = ?hits.iter().map(|hit| hit.score).collect::<Vec<_>>(),
            "retrieved chunks"
        );
        Ok(hits)
    }

    pub async fn drop(&self, document_id: &str) -> Result<(), PipelineError> {
        self.store
            .drop_document(document_id)
            .await
            .map_err(|error| PipelineError::Embedding(error.to_string()))
    }

    pub async fn chunk_count(&self, document_id: &str) -> Result<usize, PipelineError> {
        self.store
            .chunk_count(document_id)
            .await
            .map_err(|error| PipelineError::Embedding(error.to_string()))
    }

    pub async fn contains(&self, document_id: &str) -> Result<bool, PipelineError> {
        Ok(self.chunk_count(document_id).await? > 0)
    }
}

fn check_dimensions(expected: usize, actual: usize) -> Result<(), PipelineError> {
    if expected != actual {
        return Err(PipelineError::Embedding(format!(
            "embedding dimension {actual} does not match index dimension {expected}"
        )));
    }
    Ok(())
}
