use crate::chunking::{split_text, ChunkingConfig};
use crate::config::PipelineConfig;
use crate::embeddings::Embedder;
use crate::error::{ErrorKind, PipelineError};
use crate::generation::Generator;
use crate::index::EmbeddingIndex;
use crate::models::{
    AnalysisReport, AnswerResult, ConversationTurn, Document, HistoryRecord, HistorySummary, Role,
    SourceSnippet,
};
use crate::parser::ParserAgent;
use crate::prompts::SUGGESTED_QUESTIONS;
use crate::qa::{AnswerStream, QaAgent, QuestionContext};
use crate::summarizer::SummarizerAgent;
use crate::traits::{HistoryStore, VectorIndex};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, Stream};
use futures::StreamExt;
use serde::Serialize;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Empty,
    Parsing,
    Indexing,
    Summarizing,
    Ready,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Empty => "empty",
            Self::Parsing => "parsing",
            Self::Indexing => "indexing",
            Self::Summarizing => "summarizing",
            Self::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Last analysis that ended in the failed state.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub stage: Phase,
    pub kind: ErrorKind,
    pub message: String,
    pub document_id: Option<String>,
    pub failed_at: DateTime<Utc>,
}

#[derive(Clone)]
struct ActiveDocument {
    history_id: String,
    document: Arc<Document>,
    report: Arc<AnalysisReport>,
    turns: Vec<ConversationTurn>,
    analyzed_at: DateTime<Utc>,
}

impl ActiveDocument {
    fn from_record(record: HistoryRecord) -> Self {
        Self {
            history_id: record.id,
            document: Arc::new(record.document),
            report: Arc::new(record.report),
            turns: record.turns,
            analyzed_at: record.analyzed_at,
        }
    }

    fn document_id(&self) -> &str {
        &self.document.document_id
    }

    fn to_record(&self) -> HistoryRecord {
        HistoryRecord {
            id: self.history_id.clone(),
            document: (*self.document).clone(),
            report: (*self.report).clone(),
            turns: self.turns.clone(),
            analyzed_at: self.analyzed_at,
        }
    }
}

/// In-flight states carry the document that was active before the analysis started. It stays
/// queryable until the new one is Ready, and is restored if the analysis fails.
enum SessionState {
    Empty,
    Parsing {
        previous: Option<ActiveDocument>,
    },
    Indexing {
        previous: Option<ActiveDocument>,
        document_id: String,
    },
    Summarizing {
        previous: Option<ActiveDocument>,
        document_id: String,
    },
    Ready(ActiveDocument),
}

impl SessionState {
    fn phase(&self) -> Phase {
        match self {
            Self::Empty => Phase::Empty,
            Self::Parsing { .. } => Phase::Parsing,
            Self::Indexing { .. } => Phase::Indexing,
            Self::Summarizing { .. } => Phase::Summarizing,
            Self::Ready(_) => Phase::Ready,
        }
    }

    fn is_settled(&self) -> bool {
        matches!(self, Self::Empty | Self::Ready(_))
    }

    fn in_flight_document(&self) -> Option<&str> {
        match self {
            Self::Indexing { document_id, .. } | Self::Summarizing { document_id, .. } => {
                Some(document_id)
            }
            Self::Empty | Self::Parsing { .. } | Self::Ready(_) => None,
        }
    }

    fn active(&self) -> Option<&ActiveDocument> {
        match self {
            Self::Empty => None,
            Self::Ready(active) => Some(active),
            Self::Parsing { previous }
            | Self::Indexing { previous, .. }
            | Self::Summarizing { previous, .. } => previous.as_ref(),
        }
    }

    fn active_mut(&mut self) -> Option<&mut ActiveDocument> {
        match self {
            Self::Empty => None,
            Self::Ready(active) => Some(active),
            Self::Parsing { previous }
            | Self::Indexing { previous, .. }
            | Self::Summarizing { previous, .. } => previous.as_mut(),
        }
    }

    /// Leaves `Empty` behind and hands out whatever document was active.
    fn take_active(&mut self) -> Option<ActiveDocument> {
        match std::mem::replace(self, Self::Empty) {
            Self::Empty => None,
            Self::Ready(active) => Some(active),
            Self::Parsing { previous }
            | Self::Indexing { previous, .. }
            | Self::Summarizing { previous, .. } => previous,
        }
    }
}

struct Session {
    state: SessionState,
    last_failure: Option<FailureReport>,
}

struct Shared {
    session: Mutex<Session>,
    history: Arc<dyn HistoryStore>,
    max_stored_turns: usize,
}

impl Shared {
    /// Appends one user/assistant pair if `document_id` is still the active document. The record
    /// is saved before the session is released, so a concurrent delete or clear always lands last.
    async fn record_exchange(
        &self,
        document_id: &str,
        question: &str,
        answer: &str,
        sources: Vec<SourceSnippet>,
    ) {
        let mut session = self.session.lock().await;
        let Some(active) = session
            .state
            .active_mut()
            .filter(|active| active.document_id() == document_id)
        else {
            debug!(document_id, "active document changed during ask, exchange not recorded");
            return;
        };

        let ordinal = active.turns.last().map_or(0, |turn| turn.ordinal + 1);
        let timestamp = Utc::now();
        active.turns.push(ConversationTurn {
            role: Role::User,
            content: question.to_string(),
            sources: Vec::new(),
            ordinal,
            timestamp,
        });
        active.turns.push(ConversationTurn {
            role: Role::Assistant,
            content: answer.to_string(),
            sources,
            ordinal: ordinal + 1,
            timestamp,
        });
        trim_turns(&mut active.turns, self.max_stored_turns);
        let record = active.to_record();
        self.persist(&record).await;
    }

    /// Callers hold the session lock.
    async fn persist(&self, record: &HistoryRecord) {
        if let Err(error) = self.history.save(record).await {
            warn!(history_id = %record.id, error = %error, "failed to persist history record");
        }
    }
}

/// Keeps at most `cap` turns, dropping whole exchanges from the front.
fn trim_turns(turns: &mut Vec<ConversationTurn>, cap: usize) {
    let mut excess = turns.len().saturating_sub(cap);
    if excess == 0 {
        return;
    }
    if turns.get(excess).is_some_and(|turn| turn.role == Role::Assistant) {
        excess += 1;
    }
    turns.drain(..excess.min(turns.len()));
}

/// Backends a [`Coordinator`] runs on.
pub struct Providers {
    pub embedder: Arc<dyn Embedder>,
    pub vectors: Arc<dyn VectorIndex>,
    pub generator: Arc<dyn Generator>,
    pub history: Arc<dyn HistoryStore>,
}

/// One session: at most one active document, its index scope and its conversation.
pub struct Coordinator {
    parser: ParserAgent,
    chunking: ChunkingConfig,
    index: EmbeddingIndex,
    summarizer: SummarizerAgent,
    qa: QaAgent,
    shared: Arc<Shared>,
    ask_lock: Arc<Mutex<()>>,
}

/// Streamed answer bound to the session. The exchange is recorded only when the stream runs to
/// its end without error; dropping it early records nothing. Until then other asks wait.
pub struct StreamingAnswer {
    pub sources: Vec<SourceSnippet>,
    pub context_tokens: usize,
    fragments: BoxStream<'static, Result<String, PipelineError>>,
}

impl Stream for StreamingAnswer {
    type Item = Result<String, PipelineError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.fragments.poll_next_unpin(cx)
    }
}

struct StreamProgress {
    inner: AnswerStream,
    answer: String,
    question: String,
    document_id: String,
    sources: Vec<SourceSnippet>,
    shared: Arc<Shared>,
    _turn: OwnedMutexGuard<()>,
}

impl Coordinator {
    pub fn new(config: &PipelineConfig, providers: Providers) -> Result<Self, PipelineError> {
        let chunking = ChunkingConfig::try_from(config.chunking)?;
        let index = EmbeddingIndex::new(providers.embedder, providers.vectors);
        let summarizer = SummarizerAgent::new(
            providers.generator.clone(),
            config.summarizer,
            config.generation.retry,
        );
        let qa = QaAgent::new(index.clone(), providers.generator, config.retrieval);

        Ok(Self {
            parser: ParserAgent::new(config.parser),
            chunking,
            index,
            summarizer,
            qa,
            shared: Arc::new(Shared {
                session: Mutex::new(Session {
                    state: SessionState::Empty,
                    last_failure: None,
                }),
                history: providers.history,
                max_stored_turns: config.retrieval.max_stored_turns,
            }),
            ask_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn index(&self) -> &EmbeddingIndex {
        &self.index
    }

    /// Parsing → Indexing → Summarizing → Ready. On failure the previously active document (or
    /// none) is restored and the originating error returned.
    pub async fn analyze(
        &self,
        bytes: Vec<u8>,
        declared_format: &str,
    ) -> Result<AnalysisReport, PipelineError> {
        {
            let mut session = self.shared.session.lock().await;
            if !session.state.is_settled() {
                return Err(PipelineError::AnalysisInProgress(session.state.phase().to_string()));
            }
            let previous = session.state.take_active();
            session.state = SessionState::Parsing { previous };
        }
        info!(phase = %Phase::Parsing, bytes = bytes.len(), "analysis started");
        let analysis_started = Instant::now();

        let started = Instant::now();
        let parser = self.parser;
        let declared = declared_format.to_string();
        let parsed = tokio::task::spawn_blocking(move || parser.parse(&bytes, &declared))
            .await
            .map_err(|error| PipelineError::Parse(format!("parser task failed: {error}")))
            .and_then(|parsed| parsed);
        let document = match parsed {
            Ok(document) => document,
            Err(error) => return Err(self.fail(Phase::Parsing, None, error).await),
        };
        let parse_ms = started.elapsed().as_millis() as u64;
        let document_id = document.document_id.clone();

        self.advance(|previous| SessionState::Indexing {
            previous,
            document_id: document_id.clone(),
        })
        .await;
        let started = Instant::now();
        let chunks = split_text(&document.text, &self.chunking);
        if let Err(error) = self.index.add(&document_id, &chunks).await {
            return Err(self.fail(Phase::Indexing, Some(&document_id), error).await);
        }
        let index_ms = started.elapsed().as_millis() as u64;

        self.advance(|previous| SessionState::Summarizing {
            previous,
            document_id: document_id.clone(),
        })
        .await;
        let started = Instant::now();
        let mut report = match self.summarizer.summarize(&document).await {
            Ok(report) => report,
            Err(error) => return Err(self.fail(Phase::Summarizing, Some(&document_id), error).await),
        };
        report.stage_timings_ms.insert("parse".to_string(), parse_ms);
        report.stage_timings_ms.insert("index".to_string(), index_ms);
        report
            .stage_timings_ms
            .insert("summarize".to_string(), started.elapsed().as_millis() as u64);

        let active = ActiveDocument {
            history_id: HistoryRecord::record_id_for(&document_id),
            document: Arc::new(document),
            report: Arc::new(report.clone()),
            turns: Vec::new(),
            analyzed_at: Utc::now(),
        };
        let record = active.to_record();
        let previous = {
            let mut session = self.shared.session.lock().await;
            let previous = session.state.take_active();
            session.state = SessionState::Ready(active);
            self.shared.persist(&record).await;
            previous
        };
        info!(
            document_id = %document_id,
            phase = %Phase::Ready,
            chunks = chunks.len(),
            elapsed_ms = analysis_started.elapsed().as_millis() as u64,
            "analysis finished"
        );

        if let Some(previous) = previous.filter(|previous| previous.document_id() != document_id) {
            self.release_index(previous.document_id()).await;
        }
        Ok(report)
    }

    async fn advance(&self, next: impl FnOnce(Option<ActiveDocument>) -> SessionState) {
        let mut session = self.shared.session.lock().await;
        let previous = session.state.take_active();
        session.state = next(previous);
        info!(
            document_id = session.state.in_flight_document().unwrap_or_default(),
            phase = %session.state.phase(),
            "session transition"
        );
    }

    async fn fail(&self, stage: Phase, attempted: Option<&str>, error: PipelineError) -> PipelineError {
        let restored = {
            let mut session = self.shared.session.lock().await;
            let previous = session.state.take_active();
            let restored = previous.as_ref().map(|active| active.document_id().to_string());
            session.state = match previous {
                Some(active) => SessionState::Ready(active),
                None => SessionState::Empty,
            };
            session.last_failure = Some(FailureReport {
                stage,
                kind: error.kind(),
                message: error.to_string(),
                document_id: attempted.map(str::to_string),
                failed_at: Utc::now(),
            });
            restored
        };
        warn!(
            stage = %stage,
            kind = ?error.kind(),
            error = %error,
            restored_document = restored.as_deref().unwrap_or_default(),
            "analysis failed, session restored"
        );

        if let Some(attempted) = attempted.filter(|id| restored.as_deref() != Some(*id)) {
            self.release_index(attempted).await;
        }
        error
    }

    async fn release_index(&self, document_id: &str) {
        if let Err(error) = self.index.drop(document_id).await {
            warn!(document_id, error = %error, "failed to drop index scope");
        }
    }

    async fn snapshot(&self) -> Result<ActiveDocument, PipelineError> {
        let session = self.shared.session.lock().await;
        session
            .state
            .active()
            .cloned()
            .ok_or(PipelineError::NoActiveDocument)
    }

    /// Answers against the active document and appends the exchange to its conversation.
    /// Concurrent asks run one at a time, in lock acquisition order.
    pub async fn ask(&self, question: &str, k: Option<usize>) -> Result<AnswerResult, PipelineError> {
        let _turn = self.ask_lock.lock().await;
        let active = self.snapshot().await?;
        let result = self
            .qa
            .answer(
                QuestionContext {
                    document: &active.document,
                    report: Some(&active.report),
                    history: &active.turns,
                },
                question,
                k,
            )
            .await?;

        self.shared
            .record_exchange(
                active.document_id(),
                question.trim(),
                &result.answer,
                result.sources.clone(),
            )
            .await;
        Ok(result)
    }

    pub async fn ask_stream(
        &self,
        question: &str,
        k: Option<usize>,
    ) -> Result<StreamingAnswer, PipelineError> {
        let turn = self.ask_lock.clone().lock_owned().await;
        let active = self.snapshot().await?;
        let inner = self
            .qa
            .answer_stream(
                QuestionContext {
                    document: &active.document,
                    report: Some(&active.report),
                    history: &active.turns,
                },
                question,
                k,
            )
            .await?;

        let sources = inner.sources.clone();
        let context_tokens = inner.context_tokens;
        let progress = StreamProgress {
            inner,
            answer: String::new(),
            question: question.trim().to_string(),
            document_id: active.document_id().to_string(),
            sources: sources.clone(),
            shared: self.shared.clone(),
            _turn: turn,
        };

        let fragments = stream::unfold(Some(progress), |progress| async move {
            let mut progress = progress?;
            match progress.inner.next().await {
                Some(Ok(fragment)) => {
                    progress.answer.push_str(&fragment);
                    Some((Ok(fragment), Some(progress)))
                }
                Some(Err(error)) => {
                    warn!(document_id = %progress.document_id, error = %error, "answer stream failed, exchange discarded");
                    Some((Err(error), None))
                }
                None => {
                    progress
                        .shared
                        .record_exchange(
                            &progress.document_id,
                            &progress.question,
                            &progress.answer,
                            std::mem::take(&mut progress.sources),
                        )
                        .await;
                    None
                }
            }
        })
        .boxed();

        Ok(StreamingAnswer {
            sources,
            context_tokens,
            fragments,
        })
    }

    /// Ready → Empty: drops the document, its vectors and its conversation.
    pub async fn clear(&self) -> Result<(), PipelineError> {
        let cleared = {
            let mut session = self.shared.session.lock().await;
            if !session.state.is_settled() {
                return Err(PipelineError::AnalysisInProgress(session.state.phase().to_string()));
            }
            session.state.take_active()
        };

        if let Some(active) = cleared {
            self.release_index(active.document_id()).await;
            info!(document_id = %active.document_id(), phase = %Phase::Empty, "session cleared");
        }
        Ok(())
    }

    /// Drops the conversation but keeps the document and its index.
    pub async fn clear_conversation(&self) -> Result<(), PipelineError> {
        let mut session = self.shared.session.lock().await;
        let active = session
            .state
            .active_mut()
            .ok_or(PipelineError::NoActiveDocument)?;
        active.turns.clear();
        let record = active.to_record();
        self.shared.persist(&record).await;
        Ok(())
    }

    /// Makes a stored record the active document, re-embedding its text when the index no longer
    /// holds it.
    pub async fn load_history(&self, id: &str) -> Result<(), PipelineError> {
        {
            let session = self.shared.session.lock().await;
            if !session.state.is_settled() {
                return Err(PipelineError::AnalysisInProgress(session.state.phase().to_string()));
            }
        }

        let record = self
            .shared
            .history
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::HistoryNotFound(id.to_string()))?;
        let document_id = record.document.document_id.clone();

        let reindexed = !self.index.contains(&document_id).await?;
        if reindexed {
            let chunks = split_text(&record.document.text, &self.chunking);
            self.index.add(&document_id, &chunks).await?;
            debug!(document_id = %document_id, chunks = chunks.len(), "re-indexed history record");
        }

        let previous = {
            let mut session = self.shared.session.lock().await;
            if !session.state.is_settled() {
                // An analysis started while re-indexing. Its own scope is left alone.
                let owned = session.state.in_flight_document() == Some(document_id.as_str())
                    || session
                        .state
                        .active()
                        .is_some_and(|active| active.document_id() == document_id);
                if reindexed && !owned {
                    self.release_index(&document_id).await;
                }
                return Err(PipelineError::AnalysisInProgress(session.state.phase().to_string()));
            }
            let previous = session.state.take_active();
            session.state = SessionState::Ready(ActiveDocument::from_record(record));
            previous
        };
        info!(document_id = %document_id, history_id = id, phase = %Phase::Ready, "history loaded");

        if let Some(previous) = previous.filter(|previous| previous.document_id() != document_id) {
            self.release_index(previous.document_id()).await;
        }
        Ok(())
    }

    /// Removes a record and its vectors. Deleting the active record empties the session.
    pub async fn delete_history(&self, id: &str) -> Result<(), PipelineError> {
        let record = self
            .shared
            .history
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::HistoryNotFound(id.to_string()))?;
        let document_id = record.document.document_id;

        let was_active = {
            let mut session = self.shared.session.lock().await;
            let active_id = session.state.active().map(|active| active.history_id.clone());
            let is_active = active_id.as_deref() == Some(id);
            if is_active && !session.state.is_settled() {
                return Err(PipelineError::AnalysisInProgress(session.state.phase().to_string()));
            }
            if session.state.in_flight_document() == Some(document_id.as_str()) {
                return Err(PipelineError::AnalysisInProgress(session.state.phase().to_string()));
            }
            if !self.shared.history.delete(id).await? {
                return Err(PipelineError::HistoryNotFound(id.to_string()));
            }
            if is_active {
                session.state = SessionState::Empty;
            }
            is_active
        };

        self.release_index(&document_id).await;
        info!(history_id = id, document_id = %document_id, was_active, "history deleted");
        Ok(())
    }

    pub async fn phase(&self) -> Phase {
        self.shared.session.lock().await.state.phase()
    }

    pub async fn get_active_document(&self) -> Option<Arc<Document>> {
        let session = self.shared.session.lock().await;
        session.state.active().map(|active| active.document.clone())
    }

    pub async fn get_active_report(&self) -> Option<Arc<AnalysisReport>> {
        let session = self.shared.session.lock().await;
        session.state.active().map(|active| active.report.clone())
    }

    pub async fn conversation(&self) -> Vec<ConversationTurn> {
        let session = self.shared.session.lock().await;
        session
            .state
            .active()
            .map(|active| active.turns.clone())
            .unwrap_or_default()
    }

    pub async fn last_failure(&self) -> Option<FailureReport> {
        self.shared.session.lock().await.last_failure.clone()
    }

    pub async fn list_history(&self) -> Result<Vec<HistorySummary>, PipelineError> {
        self.shared.history.list().await
    }

    pub async fn get_history(&self, id: &str) -> Result<HistoryRecord, PipelineError> {
        self.shared
            .history
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::HistoryNotFound(id.to_string()))
    }

    pub async fn suggested_questions(&self) -> Vec<String> {
        if self.get_active_document().await.is_none() {
            return Vec::new();
        }
        SUGGESTED_QUESTIONS.iter().map(|question| question.to_string()).collect()
    }
}
