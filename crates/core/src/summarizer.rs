use crate::config::{RetryOptions, SummarizerOptions};
use crate::error::PipelineError;
use crate::generation::{GenerationRequest, Generator};
use crate::models::{AnalysisReport, Document, ReportSection};
use crate::prompts;
use crate::retry::retry_with_backoff;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

const ELISION: &str = "\n[...]\n";

/// Runs the fixed structure → report → keywords sequence. Any step failing after its retries
/// aborts the whole report.
#[derive(Clone)]
pub struct SummarizerAgent {
    generator: Arc<dyn Generator>,
    options: SummarizerOptions,
    retry: RetryOptions,
}

impl SummarizerAgent {
    pub fn new(generator: Arc<dyn Generator>, options: SummarizerOptions, retry: RetryOptions) -> Self {
        Self {
            generator,
            options,
            retry,
        }
    }

    pub async fn summarize(&self, document: &Document) -> Result<AnalysisReport, PipelineError> {
        let mut stage_timings_ms = BTreeMap::new();

        let structure_preview = truncate_chars(&document.text, self.options.structure_preview_chars);
        let structure = self
            .step(
                "structure",
                prompts::structure_analysis(&document.title, &structure_preview),
                &mut stage_timings_ms,
            )
            .await?;

        let content = budget_content(document, self.options.max_content_chars);
        let summary = self
            .step(
                "report",
                prompts::detailed_report(&document.title, &structure, &content),
                &mut stage_timings_ms,
            )
            .await?;

        let keyword_preview = truncate_chars(&document.text, self.options.keyword_preview_chars);
        let keywords = self
            .step(
                "keywords",
                prompts::keyword_extraction(&keyword_preview),
                &mut stage_timings_ms,
            )
            .await?;

        let missing_sections = missing_sections(&summary);
        for section in &missing_sections {
            warn!(
                document_id = %document.document_id,
                heading = section.heading(),
                "report is missing a required heading"
            );
        }

        Ok(AnalysisReport {
            document_id: document.document_id.clone(),
            structure: structure.trim().to_string(),
            summary: summary.trim().to_string(),
            keywords: keywords.trim().to_string(),
            missing_sections,
            stage_timings_ms,
            generated_at: Utc::now(),
        })
    }

    async fn step(
        &self,
        name: &'static str,
        prompt: String,
        timings: &mut BTreeMap<String, u64>,
    ) -> Result<String, PipelineError> {
        let started = Instant::now();
        let request = GenerationRequest::new(prompts::ANALYST_SYSTEM, prompt);
        let operation = format!("summarize.{name}");

        let text = retry_with_backoff(&self.retry, &operation, || self.generator.generate(&request))
            .await
            .map_err(|error| PipelineError::Generation(format!("{name} step: {error}")))?;
        if text.trim().is_empty() {
            return Err(PipelineError::Generation(format!("{name} step returned no text")));
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(step = name, elapsed_ms, "summarizer step finished");
        timings.insert(name.to_string(), elapsed_ms);
        Ok(text)
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

fn tail_chars(text: &str, count: usize) -> String {
    let total = text.chars().count();
    text.chars().skip(total.saturating_sub(count)).collect()
}

/// Fits the document into `budget` characters. With detected sections every section keeps an
/// equal share of its opening text; otherwise the front, a middle sample and the end are kept.
pub fn budget_content(document: &Document, budget: usize) -> String {
    if document.text.chars().count() <= budget {
        return document.text.clone();
    }

    if !document.sections.is_empty() {
        let share = budget / document.sections.len();
        return document
            .sections
            .iter()
            .map(|section| {
                let heading = format!("## {}\n", section.title);
                let room = share.saturating_sub(heading.chars().count());
                format!("{heading}{}", truncate_chars(&section.text, room))
            })
            .collect::<Vec<_>>()
            .join("\n\n");
    }

    let front = budget * 2 / 5;
    let back = budget / 5;
    let middle = budget - front - back;
    let total = document.text.chars().count();
    let middle_start = (total / 2).saturating_sub(middle / 2);
    let middle_text: String = document.text.chars().skip(middle_start).take(middle).collect();

    [
        truncate_chars(&document.text, front),
        middle_text,
        tail_chars(&document.text, back),
    ]
    .join(ELISION)
}

pub fn missing_sections(report: &str) -> Vec<ReportSection> {
    let heading_lines: Vec<String> = report
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('#') || line.starts_with("**"))
        .map(str::to_lowercase)
        .collect();

    ReportSection::ALL
        .into_iter()
        .filter(|section| {
            let wanted = section.heading().to_lowercase();
            !heading_lines.iter().any(|line| line.contains(&wanted))
        })
        .collect()
}
