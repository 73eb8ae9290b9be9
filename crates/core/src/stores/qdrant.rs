use crate::error::ProviderError;
use crate::models::{Chunk, ScoredChunk};
use crate::traits::VectorIndex;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

/// Qdrant collection shared by all documents; every point carries a `document_id` payload used as a filter.
pub struct QdrantStore {
    endpoint: String,
    collection: String,
    client: Client,
    vector_size: usize,
    timeout_secs: u64,
}

impl QdrantStore {
    /// Every request is bounded by `timeout_secs`.
    pub fn new(
        endpoint: impl Into<String>,
        collection: impl Into<String>,
        vector_size: usize,
        timeout_secs: u64,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
            client,
            vector_size,
            timeout_secs,
        })
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ProviderError> {
        request.send().await.map_err(|error| {
            if error.is_timeout() {
                ProviderError::Timeout(self.timeout_secs)
            } else {
                ProviderError::Http(error)
            }
        })
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.endpoint, self.collection)
    }

    pub async fn ensure_collection(&self) -> Result<(), ProviderError> {
        let response = self.send(self.client.get(self.collection_url())).await?;
        if response.status().is_success() {
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            return Err(status_error(response).await);
        }

        let request = self.client.put(self.collection_url()).json(&json!({
            "vectors": { "size": self.vector_size, "distance": "Cosine" }
        }));
        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(())
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, ProviderError> {
        let request = self
            .client
            .post(format!("{}/{}", self.collection_url(), path))
            .json(&body);
        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(response.json().await?)
    }
}

fn document_filter(document_id: &str) -> Value {
    json!({ "must": [{ "key": "document_id", "match": { "value": document_id } }] })
}

async fn status_error(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    ProviderError::Status { status, body }
}

fn point_to_chunk(point: &Value) -> Option<ScoredChunk> {
    let payload = point.pointer("/payload")?;
    let text = |key: &str| {
        payload
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let number = |key: &str| payload.get(key).and_then(Value::as_u64).unwrap_or(0) as usize;

    Some(ScoredChunk {
        chunk: Chunk {
            chunk_id: text("chunk_id"),
            document_id: text("document_id"),
            position: number("position"),
            text: text("text"),
            start_word: number("start_word"),
            end_word: number("end_word"),
            embedding: Vec::new(),
        },
        score: point.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0) as f32,
    })
}

#[async_trait]
impl VectorIndex for QdrantStore {
    async fn replace_document(
        &self,
        document_id: &str,
        chunks: Vec<Chunk>,
    ) -> Result<(), ProviderError> {
        let points = chunks
            .iter()
            .map(|chunk| {
                if chunk.embedding.len() != self.vector_size {
                    return Err(ProviderError::Malformed(format!(
                        "embedding dimension {} != {}",
                        chunk.embedding.len(),
                        self.vector_size
                    )));
                }

                Ok(json!({
                    "id": chunk.chunk_id,
                    "vector": chunk.embedding,
                    "payload": {
                        "chunk_id": chunk.chunk_id,
                        "document_id": chunk.document_id,
                        "position": chunk.position,
                        "start_word": chunk.start_word,
                        "end_word": chunk.end_word,
                        "text": chunk.text,
                    },
                }))
            })
            .collect::<Result<Vec<_>, ProviderError>>()?;

        self.drop_document(document_id).await?;
        if points.is_empty() {
            return Ok(());
        }

        let request = self
            .client
            .put(format!("{}/points?wait=true", self.collection_url()))
            .json(&json!({ "points": points }));
        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(())
    }

    async fn search_document(
        &self,
        document_id: &str,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredChunk>, ProviderError> {
        if query_vector.len() != self.vector_size {
            return Err(ProviderError::Malformed(format!(
                "query vector dim {} is not {}",
                query_vector.len(),
                self.vector_size
            )));
        }

        let parsed = self
            .post(
                "points/search",
                json!({
                    "vector": query_vector,
                    "limit": limit,
                    "filter": document_filter(document_id),
                    "with_payload": true,
                }),
            )
            .await?;

        Ok(parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .map(|hits| hits.iter().filter_map(point_to_chunk).collect())
            .unwrap_or_default())
    }

    async fn drop_document(&self, document_id: &str) -> Result<(), ProviderError> {
        self.post(
            "points/delete?wait=true",
            json!({ "filter": document_filter(document_id) }),
        )
        .await
        .map(|_| ())
    }

    async fn chunk_count(&self, document_id: &str) -> Result<usize, ProviderError> {
        let parsed = self
            .post(
                "points/count",
                json!({ "filter": document_filter(document_id), "exact": true }),
            )
            .await?;
        Ok(parsed
            .pointer("/result/count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize)
    }
}
