use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use paper_reader_core::prompts::ANALYST_SYSTEM;
use paper_reader_core::{
    split, CharacterNgramEmbedder, Coordinator, Embedder, ErrorKind, GenerationRequest, Generator,
    HistoryRecord, HistoryStore, HistorySummary, InMemoryHistoryStore, InMemoryVectorStore,
    ParserAgent, Phase, PipelineConfig, PipelineError, ProviderError, Providers, ReportSection, Role,
    TextStream,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Answers summarizer prompts with a complete report and questions with `answer about <question>`.
#[derive(Default)]
struct FakeGenerator {
    fail_summaries: AtomicBool,
    break_streams: AtomicBool,
    summary_gate: Option<Arc<Semaphore>>,
}

impl FakeGenerator {
    fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            summary_gate: Some(gate),
            ..Self::default()
        }
    }

    fn answer_for(request: &GenerationRequest) -> String {
        let question = request
            .prompt
            .lines()
            .find_map(|line| line.strip_prefix("Question: "))
            .unwrap_or("?");
        format!("answer about {question}")
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        if request.system == ANALYST_SYSTEM {
            if let Some(gate) = &self.summary_gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            if self.fail_summaries.load(Ordering::SeqCst) {
                return Err(ProviderError::Status {
                    status: 401,
                    body: "invalid api key".to_string(),
                });
            }
            return Ok(ReportSection::ALL
                .iter()
                .map(|section| format!("## {}\nCovered.", section.heading()))
                .collect::<Vec<_>>()
                .join("\n"));
        }

        tokio::time::sleep(Duration::from_millis(2)).await;
        Ok(Self::answer_for(request))
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream, ProviderError> {
        let mut words: Vec<Result<String, ProviderError>> = Self::answer_for(request)
            .split_inclusive(' ')
            .map(|word| Ok(word.to_string()))
            .collect();
        if self.break_streams.load(Ordering::SeqCst) {
            words.truncate(1);
            words.push(Err(ProviderError::Timeout(60)));
        }
        Ok(stream::iter(words).boxed())
    }
}

/// Character-trigram embedder that can be switched to fail, or held at a gate per batch.
#[derive(Default)]
struct FakeEmbedder {
    inner: CharacterNgramEmbedder,
    fail: AtomicBool,
    gate: Option<Arc<Semaphore>>,
    batches_started: AtomicUsize,
}

#[async_trait]
impl Embedder for FakeEmbedder {
    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.inner.embed(text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.batches_started.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProviderError::Status {
                status: 400,
                body: "input rejected".to_string(),
            });
        }
        self.inner.embed_batch(texts).await
    }
}

/// History store whose saves can be held back until the test releases them.
struct GatedHistory {
    inner: InMemoryHistoryStore,
    holding: AtomicBool,
    gate: Semaphore,
    saves_waiting: AtomicUsize,
}

impl GatedHistory {
    fn new() -> Self {
        Self {
            inner: InMemoryHistoryStore::new(),
            holding: AtomicBool::new(false),
            gate: Semaphore::new(0),
            saves_waiting: AtomicUsize::new(0),
        }
    }

    fn hold_saves(&self) {
        self.holding.store(true, Ordering::SeqCst);
    }

    fn release_saves(&self) {
        self.holding.store(false, Ordering::SeqCst);
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

#[async_trait]
impl HistoryStore for GatedHistory {
    async fn save(&self, record: &HistoryRecord) -> Result<(), PipelineError> {
        if self.holding.load(Ordering::SeqCst) {
            self.saves_waiting.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }
        self.inner.save(record).await
    }

    async fn get(&self, id: &str) -> Result<Option<HistoryRecord>, PipelineError> {
        self.inner.get(id).await
    }

    async fn list(&self) -> Result<Vec<HistorySummary>, PipelineError> {
        self.inner.list().await
    }

    async fn delete(&self, id: &str) -> Result<bool, PipelineError> {
        self.inner.delete(id).await
    }
}

struct Harness {
    coordinator: Arc<Coordinator>,
    generator: Arc<FakeGenerator>,
    history: Arc<InMemoryHistoryStore>,
}

fn coordinator_on(
    config: &PipelineConfig,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    history: Arc<dyn HistoryStore>,
) -> Arc<Coordinator> {
    let coordinator = Coordinator::new(
        config,
        Providers {
            embedder,
            vectors: Arc::new(InMemoryVectorStore::new()),
            generator,
            history,
        },
    )
    .expect("valid config");
    Arc::new(coordinator)
}

fn harness_with(config: PipelineConfig, generator: FakeGenerator, history: Arc<InMemoryHistoryStore>) -> Harness {
    let generator = Arc::new(generator);
    let coordinator = coordinator_on(
        &config,
        Arc::new(CharacterNgramEmbedder::default()),
        generator.clone(),
        history.clone(),
    );

    Harness {
        coordinator,
        generator,
        history,
    }
}

fn small_chunks() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.chunking.chunk_size = 50;
    config.chunking.overlap = 10;
    config
}

fn harness() -> Harness {
    harness_with(
        small_chunks(),
        FakeGenerator::default(),
        Arc::new(InMemoryHistoryStore::new()),
    )
}

fn paper(topic: &str) -> Vec<u8> {
    format!(
        "A Study of {topic}\n\nAbstract\nWe study {topic} in depth.\n\n1 Introduction\n{}\n\n\
         2 Method\nOur method for {topic} uses contrastive training.\n\n3 Experiments\n{}",
        format!("{topic} matters for retrieval. ").repeat(40),
        format!("Experiments on {topic} show gains. ").repeat(40),
    )
    .into_bytes()
}

fn document_id_of(bytes: &[u8], name: &str) -> String {
    ParserAgent::default()
        .parse(bytes, name)
        .expect("fixture parses")
        .document_id
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    while !done() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test]
async fn two_page_thousand_word_text_makes_three_overlapping_chunks() {
    let mut config = PipelineConfig::default();
    config.chunking.chunk_size = 500;
    config.chunking.overlap = 50;
    let h = harness_with(config, FakeGenerator::default(), Arc::new(InMemoryHistoryStore::new()));

    let words: Vec<String> = (0..1000).map(|index| format!("w{index}")).collect();
    let text = format!("{}\x0c{}", words[..500].join(" "), words[500..].join(" "));

    let report = h
        .coordinator
        .analyze(text.into_bytes(), "two-pages.txt")
        .await
        .expect("analysis succeeds");

    let document = h.coordinator.get_active_document().await.expect("active");
    assert_eq!(document.page_count, 2);
    assert_eq!(document.word_count, 1000);
    assert_eq!(h.coordinator.index().chunk_count(&report.document_id).await.unwrap(), 3);

    let chunks = split(&document.text, 500, 50).unwrap();
    assert_eq!(chunks.len(), 3);
    let first: Vec<&str> = chunks[0].text.split_whitespace().collect();
    let second: Vec<&str> = chunks[1].text.split_whitespace().collect();
    assert_eq!(&second[..50], &first[first.len() - 50..]);
}

#[tokio::test]
async fn successful_analysis_is_ready_and_saved() {
    let h = harness();
    let report = h.coordinator.analyze(paper("retrieval"), "retrieval.md").await.unwrap();

    assert_eq!(h.coordinator.phase().await, Phase::Ready);
    assert!(report.missing_sections.is_empty());
    for stage in ["parse", "index", "summarize", "structure", "report", "keywords"] {
        assert!(report.stage_timings_ms.contains_key(stage), "missing timing {stage}");
    }

    let listed = h.coordinator.list_history().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, HistoryRecord::record_id_for(&report.document_id));
    assert_eq!(h.coordinator.suggested_questions().await.len(), 6);
}

#[tokio::test]
async fn failed_analysis_keeps_the_previous_document() {
    let h = harness();
    let report_a = h.coordinator.analyze(paper("alpha"), "alpha.txt").await.unwrap();
    let chunks_a = h.coordinator.index().chunk_count(&report_a.document_id).await.unwrap();

    h.generator.fail_summaries.store(true, Ordering::SeqCst);
    let bytes_b = paper("beta");
    let id_b = document_id_of(&bytes_b, "beta.txt");
    let error = h.coordinator.analyze(bytes_b, "beta.txt").await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Generation);

    let active = h.coordinator.get_active_document().await.expect("A still active");
    assert_eq!(active.document_id, report_a.document_id);
    assert_eq!(h.coordinator.phase().await, Phase::Ready);
    assert_eq!(
        h.coordinator.index().chunk_count(&report_a.document_id).await.unwrap(),
        chunks_a
    );
    assert_eq!(h.coordinator.index().chunk_count(&id_b).await.unwrap(), 0);

    let failure = h.coordinator.last_failure().await.expect("failure recorded");
    assert_eq!(failure.stage, Phase::Summarizing);
    assert_eq!(failure.kind, ErrorKind::Generation);
    assert_eq!(failure.document_id.as_deref(), Some(id_b.as_str()));

    h.generator.fail_summaries.store(false, Ordering::SeqCst);
    assert!(h.coordinator.ask("what method?", None).await.is_ok());
}

#[tokio::test]
async fn failed_parse_from_empty_stays_empty() {
    let h = harness();
    let error = h.coordinator.analyze(b"binary".to_vec(), "figure.png").await.unwrap_err();

    assert_eq!(error.kind(), ErrorKind::UnsupportedFormat);
    assert_eq!(h.coordinator.phase().await, Phase::Empty);
    assert_eq!(
        h.coordinator.last_failure().await.map(|failure| failure.stage),
        Some(Phase::Parsing)
    );
    assert!(h.coordinator.suggested_questions().await.is_empty());
}

#[tokio::test]
async fn ask_on_empty_session_fails_without_turns() {
    let h = harness();
    let error = h.coordinator.ask("what method?", None).await.unwrap_err();

    assert_eq!(error.kind(), ErrorKind::NoActiveDocument);
    assert!(h.coordinator.conversation().await.is_empty());
    assert!(h.coordinator.ask_stream("what method?", None).await.is_err());
}

#[tokio::test]
async fn ask_appends_both_turns_and_resaves_the_record() {
    let h = harness();
    let report = h.coordinator.analyze(paper("graphs"), "graphs.txt").await.unwrap();

    let result = h.coordinator.ask("what method?", Some(3)).await.unwrap();
    assert_eq!(result.answer, "answer about what method?");
    assert_eq!(result.sources.len(), 3);

    let turns = h.coordinator.conversation().await;
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, Role::User);
    assert_eq!(turns[1].role, Role::Assistant);
    assert_eq!(turns[1].sources, result.sources);

    let stored = h
        .history
        .get(&HistoryRecord::record_id_for(&report.document_id))
        .await
        .unwrap()
        .expect("record saved");
    assert_eq!(stored.turns.len(), 2);

    h.coordinator.clear_conversation().await.unwrap();
    assert!(h.coordinator.conversation().await.is_empty());
    assert!(h.coordinator.get_active_document().await.is_some());
}

#[tokio::test]
async fn concurrent_asks_produce_a_serial_conversation() {
    let h = harness();
    h.coordinator.analyze(paper("vision"), "vision.txt").await.unwrap();

    let questions: Vec<String> = (0..6).map(|index| format!("question {index}?")).collect();
    let results = join_all(questions.iter().map(|question| h.coordinator.ask(question, None))).await;
    assert!(results.iter().all(Result::is_ok));

    let turns = h.coordinator.conversation().await;
    assert_eq!(turns.len(), 12);
    for (index, pair) in turns.chunks(2).enumerate() {
        assert_eq!(pair[0].role, Role::User);
        assert_eq!(pair[1].role, Role::Assistant);
        assert_eq!(pair[1].content, format!("answer about {}", pair[0].content));
        assert_eq!(pair[0].ordinal, 2 * index as u64);
        assert_eq!(pair[1].ordinal, 2 * index as u64 + 1);
    }
}

#[tokio::test]
async fn abandoned_stream_records_nothing_and_releases_the_session() {
    let h = harness();
    h.coordinator.analyze(paper("speech"), "speech.txt").await.unwrap();

    let mut answer = h.coordinator.ask_stream("what method?", None).await.unwrap();
    let first = answer.next().await.expect("one fragment").unwrap();
    assert_eq!(first, "answer ");
    drop(answer);
    assert!(h.coordinator.conversation().await.is_empty());

    let completed = h.coordinator.ask_stream("what data?", None).await.unwrap();
    let sources = completed.sources.clone();
    let text: Vec<String> = completed.map(|fragment| fragment.unwrap()).collect().await;
    assert_eq!(text.concat(), "answer about what data?");

    let turns = h.coordinator.conversation().await;
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].content, "what data?");
    assert_eq!(turns[1].content, "answer about what data?");
    assert_eq!(turns[1].sources, sources);
}

#[tokio::test]
async fn loading_history_then_clearing_leaves_no_chunks() {
    let history = Arc::new(InMemoryHistoryStore::new());
    let first = harness_with(small_chunks(), FakeGenerator::default(), history.clone());
    let report = first.coordinator.analyze(paper("robotics"), "robotics.txt").await.unwrap();
    first.coordinator.ask("what method?", None).await.unwrap();

    // Fresh process: same history, empty vector store.
    let second = harness_with(small_chunks(), FakeGenerator::default(), history);
    let id = HistoryRecord::record_id_for(&report.document_id);
    second.coordinator.load_history(&id).await.unwrap();

    assert_eq!(second.coordinator.phase().await, Phase::Ready);
    assert_eq!(second.coordinator.conversation().await.len(), 2);
    assert!(second.coordinator.index().contains(&report.document_id).await.unwrap());

    second.coordinator.clear().await.unwrap();
    assert_eq!(second.coordinator.phase().await, Phase::Empty);
    assert_eq!(second.coordinator.index().chunk_count(&report.document_id).await.unwrap(), 0);
    assert!(second.coordinator.conversation().await.is_empty());
}

#[tokio::test]
async fn loading_a_missing_record_is_history_not_found() {
    let h = harness();
    let error = h.coordinator.load_history("h_missing").await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::HistoryNotFound);
    let error = h.coordinator.delete_history("h_missing").await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::HistoryNotFound);
}

#[tokio::test]
async fn deleting_the_active_record_empties_the_session() {
    let h = harness();
    let report = h.coordinator.analyze(paper("audio"), "audio.txt").await.unwrap();
    let id = HistoryRecord::record_id_for(&report.document_id);

    h.coordinator.delete_history(&id).await.unwrap();
    assert_eq!(h.coordinator.phase().await, Phase::Empty);
    assert_eq!(h.coordinator.index().chunk_count(&report.document_id).await.unwrap(), 0);
    assert!(h.coordinator.list_history().await.unwrap().is_empty());
}

#[tokio::test]
async fn second_analysis_while_in_flight_is_rejected() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness_with(
        small_chunks(),
        FakeGenerator::gated(gate.clone()),
        Arc::new(InMemoryHistoryStore::new()),
    );

    let coordinator = h.coordinator.clone();
    let running = tokio::spawn(async move { coordinator.analyze(paper("optics"), "optics.txt").await });

    while h.coordinator.phase().await != Phase::Summarizing {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let error = h.coordinator.analyze(paper("other"), "other.txt").await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::AnalysisInProgress);
    let error = h.coordinator.ask("anything?", None).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NoActiveDocument);
    assert_eq!(
        h.coordinator.clear().await.unwrap_err().kind(),
        ErrorKind::AnalysisInProgress
    );

    gate.add_permits(3);
    let report = running.await.expect("task joins").expect("analysis succeeds");
    assert_eq!(h.coordinator.phase().await, Phase::Ready);
    assert_eq!(
        h.coordinator.get_active_document().await.map(|document| document.document_id.clone()),
        Some(report.document_id)
    );
}

#[tokio::test]
async fn failed_indexing_keeps_the_previous_document() {
    let embedder = Arc::new(FakeEmbedder::default());
    let coordinator = coordinator_on(
        &small_chunks(),
        embedder.clone(),
        Arc::new(FakeGenerator::default()),
        Arc::new(InMemoryHistoryStore::new()),
    );
    let report_a = coordinator.analyze(paper("alpha"), "alpha.txt").await.unwrap();
    let chunks_a = coordinator.index().chunk_count(&report_a.document_id).await.unwrap();

    embedder.fail.store(true, Ordering::SeqCst);
    let bytes_b = paper("beta");
    let id_b = document_id_of(&bytes_b, "beta.txt");
    let error = coordinator.analyze(bytes_b, "beta.txt").await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Embedding);

    assert_eq!(coordinator.phase().await, Phase::Ready);
    let active = coordinator.get_active_document().await.expect("A still active");
    assert_eq!(active.document_id, report_a.document_id);
    assert_eq!(coordinator.index().chunk_count(&report_a.document_id).await.unwrap(), chunks_a);
    assert_eq!(coordinator.index().chunk_count(&id_b).await.unwrap(), 0);

    let failure = coordinator.last_failure().await.expect("failure recorded");
    assert_eq!(failure.stage, Phase::Indexing);
    assert_eq!(failure.kind, ErrorKind::Embedding);
}

#[tokio::test]
async fn failed_parse_keeps_the_previous_document() {
    let h = harness();
    let report_a = h.coordinator.analyze(paper("alpha"), "alpha.txt").await.unwrap();

    let error = h.coordinator.analyze(b" \n\t ".to_vec(), "blank.txt").await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::EmptyDocument);

    assert_eq!(h.coordinator.phase().await, Phase::Ready);
    assert_eq!(
        h.coordinator.get_active_document().await.map(|document| document.document_id.clone()),
        Some(report_a.document_id)
    );
    assert_eq!(
        h.coordinator.last_failure().await.map(|failure| failure.stage),
        Some(Phase::Parsing)
    );
    assert!(h.coordinator.ask("what method?", None).await.is_ok());
}

#[tokio::test]
async fn ask_during_analysis_answers_against_the_previous_document() {
    let gate = Arc::new(Semaphore::new(3));
    let h = harness_with(
        small_chunks(),
        FakeGenerator::gated(gate.clone()),
        Arc::new(InMemoryHistoryStore::new()),
    );
    let report_a = h.coordinator.analyze(paper("alpha"), "alpha.txt").await.unwrap();

    let coordinator = h.coordinator.clone();
    let running = tokio::spawn(async move { coordinator.analyze(paper("beta"), "beta.txt").await });
    while h.coordinator.phase().await != Phase::Summarizing {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let result = h.coordinator.ask("what method?", None).await.unwrap();
    assert_eq!(result.answer, "answer about what method?");
    assert!(!result.sources.is_empty());
    assert!(result.sources.iter().all(|source| !source.text.contains("beta")));
    assert_eq!(h.coordinator.conversation().await.len(), 2);

    gate.add_permits(3);
    let report_b = running.await.expect("task joins").expect("analysis succeeds");
    assert_eq!(
        h.coordinator.get_active_document().await.map(|document| document.document_id.clone()),
        Some(report_b.document_id)
    );
    assert!(h.coordinator.conversation().await.is_empty());

    let stored_a = h
        .history
        .get(&HistoryRecord::record_id_for(&report_a.document_id))
        .await
        .unwrap()
        .expect("A saved");
    assert_eq!(stored_a.turns.len(), 2);
}

#[tokio::test]
async fn midstream_generation_error_records_nothing() {
    let h = harness();
    h.coordinator.analyze(paper("speech"), "speech.txt").await.unwrap();
    h.generator.break_streams.store(true, Ordering::SeqCst);

    let answer = h.coordinator.ask_stream("what method?", None).await.unwrap();
    let items: Vec<_> = answer.collect().await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_deref().ok(), Some("answer "));
    assert_eq!(items[1].as_ref().unwrap_err().kind(), ErrorKind::Generation);
    assert!(h.coordinator.conversation().await.is_empty());

    h.generator.break_streams.store(false, Ordering::SeqCst);
    h.coordinator.ask("what data?", None).await.unwrap();
    assert_eq!(h.coordinator.conversation().await.len(), 2);
}

#[tokio::test]
async fn delete_during_a_pending_save_stays_deleted() {
    let history = Arc::new(GatedHistory::new());
    let coordinator = coordinator_on(
        &small_chunks(),
        Arc::new(CharacterNgramEmbedder::default()),
        Arc::new(FakeGenerator::default()),
        history.clone(),
    );
    let report = coordinator.analyze(paper("audio"), "audio.txt").await.unwrap();
    let id = HistoryRecord::record_id_for(&report.document_id);

    history.hold_saves();
    let asking = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.ask("what method?", None).await })
    };
    wait_for(|| history.saves_waiting.load(Ordering::SeqCst) == 1).await;

    let deleting = {
        let coordinator = coordinator.clone();
        let id = id.clone();
        tokio::spawn(async move { coordinator.delete_history(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    history.release_saves();

    asking.await.expect("task joins").expect("ask succeeds");
    deleting.await.expect("task joins").expect("delete succeeds");

    assert!(history.get(&id).await.unwrap().is_none());
    assert!(coordinator.list_history().await.unwrap().is_empty());
    assert_eq!(coordinator.phase().await, Phase::Empty);
}

#[tokio::test]
async fn clearing_the_conversation_is_not_overwritten_by_a_pending_save() {
    let history = Arc::new(GatedHistory::new());
    let coordinator = coordinator_on(
        &small_chunks(),
        Arc::new(CharacterNgramEmbedder::default()),
        Arc::new(FakeGenerator::default()),
        history.clone(),
    );
    let report = coordinator.analyze(paper("vision"), "vision.txt").await.unwrap();
    let id = HistoryRecord::record_id_for(&report.document_id);

    history.hold_saves();
    let asking = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.ask("what method?", None).await })
    };
    wait_for(|| history.saves_waiting.load(Ordering::SeqCst) == 1).await;

    let clearing = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.clear_conversation().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    history.release_saves();

    asking.await.expect("task joins").expect("ask succeeds");
    clearing.await.expect("task joins").expect("clear succeeds");

    assert!(coordinator.conversation().await.is_empty());
    let stored = history.get(&id).await.unwrap().expect("record kept");
    assert!(stored.turns.is_empty());
}

#[tokio::test]
async fn interrupted_history_load_leaves_no_orphaned_vectors() {
    let history = Arc::new(InMemoryHistoryStore::new());
    let first = harness_with(small_chunks(), FakeGenerator::default(), history.clone());
    let report = first.coordinator.analyze(paper("robotics"), "robotics.txt").await.unwrap();
    let id = HistoryRecord::record_id_for(&report.document_id);

    let gate = Arc::new(Semaphore::new(0));
    let embedder = Arc::new(FakeEmbedder {
        gate: Some(gate.clone()),
        ..FakeEmbedder::default()
    });
    let coordinator = coordinator_on(
        &small_chunks(),
        embedder.clone(),
        Arc::new(FakeGenerator::default()),
        history,
    );

    let loading = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.load_history(&id).await })
    };
    wait_for(|| embedder.batches_started.load(Ordering::SeqCst) == 1).await;

    let analyzing = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.analyze(paper("optics"), "optics.txt").await })
    };
    wait_for(|| embedder.batches_started.load(Ordering::SeqCst) == 2).await;
    assert_eq!(coordinator.phase().await, Phase::Indexing);

    gate.add_permits(1);
    let error = loading.await.expect("task joins").unwrap_err();
    assert_eq!(error.kind(), ErrorKind::AnalysisInProgress);
    assert_eq!(coordinator.index().chunk_count(&report.document_id).await.unwrap(), 0);

    gate.add_permits(1);
    let optics = analyzing.await.expect("task joins").expect("analysis succeeds");
    assert!(coordinator.index().contains(&optics.document_id).await.unwrap());
}
