use crate::chunking::estimate_tokens;
use crate::config::RetrievalOptions;
use crate::error::PipelineError;
use crate::generation::{ChatMessage, GenerationRequest, Generator};
use crate::index::EmbeddingIndex;
use crate::models::{
    AnalysisReport, AnswerResult, ConversationTurn, Document, Role, ScoredChunk, SourceSnippet,
};
use crate::prompts;
use futures::stream::{BoxStream, Stream};
use futures::StreamExt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::debug;

/// What the agent needs to know about the session it answers for.
#[derive(Clone, Copy)]
pub struct QuestionContext<'a> {
    pub document: &'a Document,
    pub report: Option<&'a AnalysisReport>,
    pub history: &'a [ConversationTurn],
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssembledContext {
    pub text: String,
    /// Positions of the chunks that made it into the context, in inclusion order.
    pub included_positions: Vec<usize>,
    pub tokens: usize,
}

/// Concatenates hits in the given (score-descending) order. A chunk that would push the total past
/// `token_budget` is skipped whole; later, smaller chunks may still fit.
pub fn assemble_context(hits: &[ScoredChunk], token_budget: usize) -> AssembledContext {
    let mut parts = Vec::new();
    let mut included_positions = Vec::new();
    let mut tokens = 0;

    for hit in hits {
        let cost = estimate_tokens(&hit.chunk.text);
        if tokens + cost > token_budget {
            debug!(position = hit.chunk.position, cost, tokens, token_budget, "chunk skipped, over budget");
            continue;
        }
        tokens += cost;
        included_positions.push(hit.chunk.position);
        parts.push(format!("[Passage {}]\n{}", parts.len() + 1, hit.chunk.text));
    }

    AssembledContext {
        text: parts.join("\n\n"),
        included_positions,
        tokens,
    }
}

pub fn snippet(text: &str, max_chars: usize) -> String {
    let mut characters = text.chars();
    let head: String = characters.by_ref().take(max_chars).collect();
    if characters.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// Incremental answer. Fragments arrive in generation order; `sources` is known up front.
pub struct AnswerStream {
    pub sources: Vec<SourceSnippet>,
    pub context_tokens: usize,
    fragments: BoxStream<'static, Result<String, PipelineError>>,
}

impl Stream for AnswerStream {
    type Item = Result<String, PipelineError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.fragments.poll_next_unpin(cx)
    }
}

struct PreparedAnswer {
    request: GenerationRequest,
    sources: Vec<SourceSnippet>,
    context_tokens: usize,
}

#[derive(Clone)]
pub struct QaAgent {
    index: EmbeddingIndex,
    generator: Arc<dyn Generator>,
    options: RetrievalOptions,
}

impl QaAgent {
    pub fn new(index: EmbeddingIndex, generator: Arc<dyn Generator>, options: RetrievalOptions) -> Self {
        Self {
            index,
            generator,
            options,
        }
    }

    pub fn options(&self) -> &RetrievalOptions {
        &self.options
    }

    /// Retrieval, then context assembly, then one generation call. Generation is not retried.
    pub async fn answer(
        &self,
        context: QuestionContext<'_>,
        question: &str,
        k: Option<usize>,
    ) -> Result<AnswerResult, PipelineError> {
        let prepared = self.prepare(context, question, k).await?;
        let answer = self
            .generator
            .generate(&prepared.request)
            .await
            .map_err(|error| PipelineError::Generation(error.to_string()))?;

        Ok(AnswerResult {
            answer,
            sources: prepared.sources,
            context_tokens: prepared.context_tokens,
        })
    }

    /// Like [`QaAgent::answer`], but the text arrives as a stream. Fragments already yielded are
    /// never retracted; a mid-stream failure ends the stream with a `Generation` error.
    pub async fn answer_stream(
        &self,
        context: QuestionContext<'_>,
        question: &str,
        k: Option<usize>,
    ) -> Result<AnswerStream, PipelineError> {
        let prepared = self.prepare(context, question, k).await?;
        let fragments = self
            .generator
            .generate_stream(&prepared.request)
            .await
            .map_err(|error| PipelineError::Generation(error.to_string()))?
            .map(|fragment| fragment.map_err(|error| PipelineError::Generation(error.to_string())))
            .boxed();

        Ok(AnswerStream {
            sources: prepared.sources,
            context_tokens: prepared.context_tokens,
            fragments,
        })
    }

    async fn prepare(
        &self,
        context: QuestionContext<'_>,
        question: &str,
        k: Option<usize>,
    ) -> Result<PreparedAnswer, PipelineError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(PipelineError::InvalidArgument("question is empty".to_string()));
        }

        let k = k.unwrap_or(self.options.top_k);
        let hits = self
            .index
            .search(&context.document.document_id, question, k)
            .await?;
        let assembled = assemble_context(&hits, self.options.context_token_budget);
        debug!(
            document_id = %context.document.document_id,
            retrieved = hits.len(),
            included = assembled.included_positions.len(),
            tokens = assembled.tokens,
            "assembled context"
        );

        let prompt = if assembled.included_positions.is_empty() {
            prompts::question_without_evidence(question)
        } else {
            prompts::question_with_context(&assembled.text, question)
        };
        let summary = context.report.map(|report| report.summary.as_str()).unwrap_or_default();
        let request = GenerationRequest::new(prompts::chat_system(&context.document.title, summary), prompt)
            .with_history(self.history_window(context.history));

        let sources = hits
            .iter()
            .map(|hit| SourceSnippet {
                chunk_id: hit.chunk.chunk_id.clone(),
                position: hit.chunk.position,
                score: hit.score,
                text: snippet(&hit.chunk.text, self.options.snippet_chars),
            })
            .collect();

        Ok(PreparedAnswer {
            request,
            sources,
            context_tokens: assembled.tokens,
        })
    }

    /// At most `history_window` of the most recent turns, oldest first, starting on a user turn.
    fn history_window(&self, turns: &[ConversationTurn]) -> Vec<ChatMessage> {
        let mut skip = turns.len().saturating_sub(self.options.history_window);
        if turns.get(skip).is_some_and(|turn| turn.role == Role::Assistant) {
            skip += 1;
        }
        turns[skip..]
            .iter()
            .map(|turn| ChatMessage {
                role: turn.role,
                content: turn.content.clone(),
            })
            .collect()
    }
}
