use crate::embeddings::cosine_similarity;
use crate::error::ProviderError;
use crate::models::{Chunk, ScoredChunk};
use crate::traits::VectorIndex;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Brute-force cosine search over vectors kept in process memory.
#[derive(Default)]
pub struct InMemoryVectorStore {
    documents: RwLock<HashMap<String, Vec<Chunk>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorStore {
    async fn replace_document(
        &self,
        document_id: &str,
        chunks: Vec<Chunk>,
    ) -> Result<(), ProviderError> {
        self.documents
            .write()
            .await
            .insert(document_id.to_string(), chunks);
        Ok(())
    }

    async fn search_document(
        &self,
        document_id: &str,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredChunk>, ProviderError> {
        let documents = self.documents.read().await;
        let Some(chunks) = documents.get(document_id) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<ScoredChunk> = chunks
            .iter()
            .map(|chunk| ScoredChunk {
                score: cosine_similarity(&chunk.embedding, query_vector),
                chunk: chunk.clone(),
            })
            .collect();

        scored.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then(left.chunk.position.cmp(&right.chunk.position))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn drop_document(&self, document_id: &str) -> Result<(), ProviderError> {
        self.documents.write().await.remove(document_id);
        Ok(())
    }

    async fn chunk_count(&self, document_id: &str) -> Result<usize, ProviderError> {
        Ok(self
            .documents
            .read()
            .await
            .get(document_id)
            .map_or(0, Vec::len))
    }
}
