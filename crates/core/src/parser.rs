use crate::chunking::estimate_tokens;
use crate::config::ParserOptions;
use crate::error::PipelineError;
use crate::extractor::{extractor_for, ExtractedText};
use crate::models::{Document, DocumentFormat, Section};
use chrono::Utc;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::time::Instant;
use tracing::info;

const NUMBERED_HEADING: &str = r"^(?:\d{1,2}(?:\.\d{1,2})*\.?|[IVX]{1,5}\.)\s+[A-Z][^.!?]{1,80}$";
const NAMED_HEADING: &str = r"(?i)^(?:abstract|introduction|related work|background|preliminaries|methods?|methodology|approach|experiments?|experimental setup|evaluation|results|discussion|conclusions?|limitations|future work|references|acknowledge?ments?|appendix)\b";
const MAX_HEADING_CHARS: usize = 90;
const MAX_TITLE_CHARS: usize = 200;
const FRONT_MATTER: &str = "Front Matter";

#[derive(Debug, Clone, Copy, Default)]
pub struct ParserAgent {
    options: ParserOptions,
}

impl ParserAgent {
    pub fn new(options: ParserOptions) -> Self {
        Self { options }
    }

    /// Extracts text and sections. `declared_format` is an extension, MIME type or file name;
    /// a file name is kept as the document's filename.
    pub fn parse(&self, bytes: &[u8], declared_format: &str) -> Result<Document, PipelineError> {
        let started = Instant::now();
        let format = resolve_format(declared_format)?;
        if bytes.len() > self.options.max_file_bytes {
            return Err(PipelineError::InvalidArgument(format!(
                "file is {} bytes, limit is {}",
                bytes.len(),
                self.options.max_file_bytes
            )));
        }

        let filename = filename_for(declared_format, format);
        let extracted = extractor_for(format).extract(bytes)?;
        let text = extracted.full_text();
        if text.trim().is_empty() {
            return Err(PipelineError::EmptyDocument(filename));
        }

        let sections = detect_sections(&text, &extracted)?;
        let title = detect_title(&extracted, &text);
        let document = Document {
            document_id: document_id(&filename, &text),
            title,
            format,
            sections,
            page_count: extracted.page_count,
            word_count: estimate_tokens(&text),
            parse_duration_ms: started.elapsed().as_millis() as u64,
            created_at: Utc::now(),
            filename,
            text,
        };

        info!(
            document_id = %document.document_id,
            format = %document.format,
            pages = document.page_count,
            words = document.word_count,
            sections = document.sections.len(),
            elapsed_ms = document.parse_duration_ms,
            "parsed document"
        );
        Ok(document)
    }
}

fn resolve_format(declared: &str) -> Result<DocumentFormat, PipelineError> {
    let lowered = declared.trim().to_ascii_lowercase();
    if lowered == "doc" || lowered.ends_with(".doc") || lowered == "application/msword" {
        return Err(PipelineError::UnsupportedFormat(
            "legacy .doc files are not supported, save the file as .docx".to_string(),
        ));
    }
    DocumentFormat::from_declared(declared)
        .ok_or_else(|| PipelineError::UnsupportedFormat(declared.to_string()))
}

fn filename_for(declared: &str, format: DocumentFormat) -> String {
    let declared = declared.trim();
    let looks_like_name = declared.contains('.')
        && !declared.starts_with('.')
        && !declared.contains('/');
    if looks_like_name {
        return declared.to_string();
    }

    let extension = match format {
        DocumentFormat::Pdf => "pdf",
        DocumentFormat::Docx => "docx",
        DocumentFormat::Text => "txt",
        DocumentFormat::Markdown => "md",
    };
    format!("document.{extension}")
}

/// Stable id: identical file name and content always map to the same document.
pub fn document_id(filename: &str, text: &str) -> String {
    let head: String = text.chars().take(1_000).collect();
    let mut hasher = Sha256::new();
    hasher.update(filename.as_bytes());
    hasher.update(b"_");
    hasher.update(text.chars().count().to_string().as_bytes());
    hasher.update(b"_");
    hasher.update(head.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

fn detect_title(extracted: &ExtractedText, text: &str) -> String {
    if let Some(title) = extracted.metadata_title.as_deref() {
        return title.chars().take(MAX_TITLE_CHARS).collect();
    }

    text.lines()
        .map(str::trim)
        .map(|line| line.trim_start_matches('#').trim())
        .find(|line| line.chars().count() > 5 && !line.starts_with("---"))
        .map(|line| line.chars().take(MAX_TITLE_CHARS).collect())
        .unwrap_or_else(|| "Untitled".to_string())
}

/// Splits the text at heading-like lines. Text before the first heading becomes a
/// "Front Matter" section; a document without headings yields no sections.
fn detect_sections(text: &str, extracted: &ExtractedText) -> Result<Vec<Section>, PipelineError> {
    let numbered = Regex::new(NUMBERED_HEADING).map_err(|error| PipelineError::Parse(error.to_string()))?;
    let named = Regex::new(NAMED_HEADING).map_err(|error| PipelineError::Parse(error.to_string()))?;
    let hinted: HashSet<&str> = extracted.heading_hints.iter().map(String::as_str).collect();

    let is_heading = |line: &str| {
        if line.is_empty() || line.chars().count() > MAX_HEADING_CHARS {
            return false;
        }
        hinted.contains(line)
            || line.starts_with('#')
            || numbered.is_match(line)
            || (named.is_match(line) && line.split_whitespace().count() <= 6)
    };

    let mut sections = Vec::new();
    let mut title = FRONT_MATTER.to_string();
    let mut body: Vec<&str> = Vec::new();
    let mut saw_heading = false;

    for line in text.lines().map(str::trim) {
        if is_heading(line) {
            push_section(&mut sections, &title, &body);
            title = line.trim_start_matches('#').trim().to_string();
            body.clear();
            saw_heading = true;
        } else {
            body.push(line);
        }
    }
    push_section(&mut sections, &title, &body);

    if !saw_heading {
        return Ok(Vec::new());
    }
    Ok(sections)
}

fn push_section(sections: &mut Vec<Section>, title: &str, body: &[&str]) {
    let text = body.join("\n").trim().to_string();
    if text.is_empty() && title == FRONT_MATTER {
        return;
    }
    sections.push(Section {
        title: title.to_string(),
        text,
    });
}
