use crate::config::GenerationConfig;
use crate::error::ProviderError;
use crate::models::Role;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;
use url::Url;

/// Finite, non-restartable sequence of text fragments in generation order.
pub type TextStream = BoxStream<'static, Result<String, ProviderError>>;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub system: String,
    /// Prior conversation, oldest first.
    pub history: Vec<ChatMessage>,
    pub prompt: String,
}

impl GenerationRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            history: Vec::new(),
            prompt: prompt.into(),
        }
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError>;

    /// Backends without native streaming deliver the whole answer as one fragment.
    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream, ProviderError> {
        let text = self.generate(request).await?;
        Ok(stream::once(async move { Ok(text) }).boxed())
    }
}

/// OpenAI-compatible `POST {base}/chat/completions` client (DeepSeek, OpenAI, vLLM, ...).
pub struct ChatCompletionsGenerator {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

impl ChatCompletionsGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self, ProviderError> {
        let base = format!("{}/", config.api_base.trim_end_matches('/'));
        let endpoint = Url::parse(&base)?.join("chat/completions")?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout_secs: config.timeout_secs,
        })
    }

    fn body(&self, request: &GenerationRequest, stream: bool) -> Value {
        let mut messages = Vec::with_capacity(request.history.len() + 2);
        if !request.system.is_empty() {
            messages.push(json!({ "role": "system", "content": request.system }));
        }
        for message in &request.history {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            messages.push(json!({ "role": role, "content": message.content }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": stream,
        })
    }

    async fn send(&self, body: Value) -> Result<reqwest::Response, ProviderError> {
        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|error| {
            if error.is_timeout() {
                ProviderError::Timeout(self.timeout_secs)
            } else {
                ProviderError::Http(error)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Generator for ChatCompletionsGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let response = self.send(self.body(request, false)).await?;
        let parsed: CompletionResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::Malformed("completion has no content".to_string()))
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream, ProviderError> {
        let response = self.send(self.body(request, true)).await?;
        let timeout_secs = self.timeout_secs;
        let bytes = response
            .bytes_stream()
            .map(move |chunk| {
                chunk.map(|bytes| bytes.to_vec()).map_err(|error| {
                    if error.is_timeout() {
                        ProviderError::Timeout(timeout_secs)
                    } else {
                        ProviderError::Http(error)
                    }
                })
            })
            .boxed();
        Ok(sse_fragments(bytes))
    }
}

struct SseState {
    bytes: BoxStream<'static, Result<Vec<u8>, ProviderError>>,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    finished: bool,
}

impl SseState {
    /// Consumes every complete line in the buffer.
    fn drain_lines(&mut self) -> Result<(), ProviderError> {
        while let Some(newline) = self.buffer.iter().position(|&byte| byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let Some(payload) = line.trim().strip_prefix("data:") else {
                continue;
            };

            let payload = payload.trim();
            if payload == "[DONE]" {
                self.finished = true;
                self.buffer.clear();
                return Ok(());
            }

            let chunk: StreamChunk = serde_json::from_str(payload)
                .map_err(|error| ProviderError::Malformed(format!("stream chunk: {error}")))?;
            for choice in chunk.choices {
                if let Some(content) = choice.delta.content.filter(|content| !content.is_empty()) {
                    self.pending.push_back(content);
                }
            }
        }
        Ok(())
    }
}

/// Turns a server-sent-events byte stream into content fragments. The stream ends at
/// `data: [DONE]`, at end of body, or after the first error.
pub fn sse_fragments(bytes: BoxStream<'static, Result<Vec<u8>, ProviderError>>) -> TextStream {
    let state = SseState {
        bytes,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(fragment) = state.pending.pop_front() {
                return Some((Ok(fragment), state));
            }
            if state.finished {
                return None;
            }

            let step = match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(&chunk);
                    state.drain_lines()
                }
                Some(Err(error)) => Err(error),
                None => {
                    state.buffer.push(b'\n');
                    let flushed = state.drain_lines();
                    state.finished = true;
                    flushed
                }
            };

            if let Err(error) = step {
                state.finished = true;
                state.pending.clear();
                return Some((Err(error), state));
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_stream(parts: Vec<&'static str>) -> BoxStream<'static, Result<Vec<u8>, ProviderError>> {
        stream::iter(parts.into_iter().map(|part| Ok(part.as_bytes().to_vec()))).boxed()
    }

    #[tokio::test]
    async fn fragments_arrive_in_order_across_split_reads() {
        let parts = vec![
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"The \"}}]}\n\ndata: {\"choi",
            "ces\":[{\"delta\":{\"content\":\"method\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        ];

        let fragments: Vec<String> = sse_fragments(byte_stream(parts))
            .map(|fragment| fragment.expect("valid fragment"))
            .collect()
            .await;
        assert_eq!(fragments, vec!["The ", "method"]);
    }

    #[tokio::test]
    async fn body_without_trailing_newline_is_flushed() {
        let parts = vec!["data: {\"choices\":[{\"delta\":{\"content\":\"end\"}}]}"];
        let fragments: Vec<_> = sse_fragments(byte_stream(parts)).collect().await;
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].as_deref().ok(), Some("end"));
    }

    #[tokio::test]
    async fn malformed_chunk_ends_the_stream_with_an_error() {
        let parts = vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n",
            "data: not json\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"never\"}}]}\n",
        ];
        let fragments: Vec<_> = sse_fragments(byte_stream(parts)).collect().await;
        assert_eq!(fragments.len(), 2);
        assert!(fragments[0].is_ok());
        assert!(matches!(fragments[1], Err(ProviderError::Malformed(_))));
    }

    #[test]
    fn request_body_places_history_between_system_and_prompt() {
        let generator = ChatCompletionsGenerator::new(&GenerationConfig::default()).expect("client");
        let request = GenerationRequest::new("be precise", "what method?").with_history(vec![
            ChatMessage {
                role: Role::User,
                content: "hi".to_string(),
            },
            ChatMessage {
                role: Role::Assistant,
                content: "hello".to_string(),
            },
        ]);

        let body = generator.body(&request, true);
        let roles: Vec<&str> = body["messages"]
            .as_array()
            .expect("messages array")
            .iter()
            .filter_map(|message| message["role"].as_str())
            .collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["model"], json!("deepseek-chat"));
    }
}
