use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DocumentFormat {
    Pdf,
    Docx,
    Text,
    Markdown,
}

impl DocumentFormat {
    /// Accepts an extension (`pdf`, `.docx`), a MIME type or a file name.
    pub fn from_declared(declared: &str) -> Option<Self> {
        let lowered = declared.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "application/pdf" => return Some(Self::Pdf),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                return Some(Self::Docx)
            }
            "text/plain" => return Some(Self::Text),
            "text/markdown" => return Some(Self::Markdown),
            _ => {}
        }

        let extension = lowered.rsplit('.').next().unwrap_or(lowered.as_str());
        match extension {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "txt" | "text" => Some(Self::Text),
            "md" | "markdown" => Some(Self::Markdown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Text => "text",
            Self::Markdown => "markdown",
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Section {
    pub title: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub filename: String,
    pub title: String,
    pub format: DocumentFormat,
    pub text: String,
    pub sections: Vec<Section>,
    pub page_count: u32,
    pub word_count: usize,
    pub parse_duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub position: usize,
    pub text: String,
    pub start_word: usize,
    pub end_word: usize,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Headings every detailed report is expected to cover.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ReportSection {
    Overview,
    Motivation,
    Method,
    Experiments,
    Contributions,
    Limitations,
    FutureWork,
}

impl ReportSection {
    pub const ALL: [ReportSection; 7] = [
        Self::Overview,
        Self::Motivation,
        Self::Method,
        Self::Experiments,
        Self::Contributions,
        Self::Limitations,
        Self::FutureWork,
    ];

    pub fn heading(&self) -> &'static str {
        match self {
            Self::Overview => "Overview",
            Self::Motivation => "Motivation",
            Self::Method => "Method",
            Self::Experiments => "Experiments",
            Self::Contributions => "Contributions",
            Self::Limitations => "Limitations",
            Self::FutureWork => "Future Work",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub document_id: String,
    pub structure: String,
    pub summary: String,
    pub keywords: String,
    pub missing_sections: Vec<ReportSection>,
    pub stage_timings_ms: BTreeMap<String, u64>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceSnippet {
    pub chunk_id: String,
    pub position: usize,
    pub score: f32,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    pub sources: Vec<SourceSnippet>,
    pub ordinal: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerResult {
    pub answer: String,
    pub sources: Vec<SourceSnippet>,
    /// Word-estimated size of the context that was sent to generation.
    pub context_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    pub document: Document,
    pub report: AnalysisReport,
    pub turns: Vec<ConversationTurn>,
    pub analyzed_at: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn record_id_for(document_id: &str) -> String {
        format!("h_{document_id}")
    }

    pub fn summary(&self) -> HistorySummary {
        HistorySummary {
            id: self.id.clone(),
            document_id: self.document.document_id.clone(),
            filename: self.document.filename.clone(),
            title: self.document.title.clone(),
            format: self.document.format,
            page_count: self.document.page_count,
            word_count: self.document.word_count,
            turn_count: self.turns.len(),
            analyzed_at: self.analyzed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistorySummary {
    pub id: String,
    pub document_id: String,
    pub filename: String,
    pub title: String,
    pub format: DocumentFormat,
    pub page_count: u32,
    pub word_count: usize,
    pub turn_count: usize,
    pub analyzed_at: DateTime<Utc>,
}
