use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error classification exposed to the API layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    UnsupportedFormat,
    EmptyDocument,
    Embedding,
    Generation,
    AnalysisInProgress,
    NoActiveDocument,
    HistoryNotFound,
    InvalidArgument,
    Parse,
    Persistence,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("document has no extractable text: {0}")]
    EmptyDocument(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("an analysis is already in progress ({0})")]
    AnalysisInProgress(String),

    #[error("no active document; analyze or load a paper first")]
    NoActiveDocument,

    #[error("history record not found: {0}")]
    HistoryNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("document parse error: {0}")]
    Parse(String),

    #[error("history persistence failed: {0}")]
    Persistence(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            Self::EmptyDocument(_) => ErrorKind::EmptyDocument,
            Self::Embedding(_) => ErrorKind::Embedding,
            Self::Generation(_) => ErrorKind::Generation,
            Self::AnalysisInProgress(_) => ErrorKind::AnalysisInProgress,
            Self::NoActiveDocument => ErrorKind::NoActiveDocument,
            Self::HistoryNotFound(_) => ErrorKind::HistoryNotFound,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Parse(_) => ErrorKind::Parse,
            Self::Persistence(_) | Self::Io(_) => ErrorKind::Persistence,
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(value: serde_json::Error) -> Self {
        Self::Persistence(value.to_string())
    }
}

/// Transport-level failure talking to an embedding or generation backend.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("malformed backend response: {0}")]
    Malformed(String),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

impl ProviderError {
    /// Timeouts, connection failures, rate limiting and server errors are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(error) => error.is_timeout() || error.is_connect() || error.is_request(),
            Self::Status { status, .. } => *status == 429 || (500..600).contains(status),
            Self::Timeout(_) => true,
            Self::Malformed(_) | Self::Url(_) => false,
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
