use crate::config::ChunkingOptions;
use crate::error::PipelineError;
use unicode_segmentation::UnicodeSegmentation;

/// Longest run of characters counted as one token. Longer runs are cut into pieces of this size.
pub const MAX_TOKEN_CHARS: usize = 24;

/// Token-based chunking parameters.
#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
    /// Share of the chunk (from its end) searched for a paragraph or sentence break, in percent.
    pub boundary_window_percent: usize,
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self, PipelineError> {
        if chunk_size == 0 {
            return Err(PipelineError::InvalidArgument(
                "chunk_size must be positive".to_string(),
            ));
        }
        if overlap >= chunk_size {
            return Err(PipelineError::InvalidArgument(format!(
                "overlap {overlap} must be smaller than chunk_size {chunk_size}"
            )));
        }
        Ok(Self {
            chunk_size,
            overlap,
            boundary_window_percent: 20,
        })
    }
}

impl TryFrom<ChunkingOptions> for ChunkingConfig {
    type Error = PipelineError;

    fn try_from(value: ChunkingOptions) -> Result<Self, Self::Error> {
        Self::new(value.chunk_size, value.overlap)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub position: usize,
    pub text: String,
    /// Index of the first token, inclusive.
    pub start_word: usize,
    /// Index one past the last token.
    pub end_word: usize,
}

pub fn normalize_whitespace(text: &str) -> String {
    text.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Token count used everywhere a size is measured. A token is a whitespace-delimited word; words
/// in scripts written without spaces are split on Unicode word boundaries (one token per
/// ideograph), and any run longer than [`MAX_TOKEN_CHARS`] counts once per started piece.
pub fn estimate_tokens(text: &str) -> usize {
    token_spans(text).len()
}

pub fn split(text: &str, chunk_size: usize, overlap: usize) -> Result<Vec<TextChunk>, PipelineError> {
    let config = ChunkingConfig::new(chunk_size, overlap)?;
    Ok(split_text(text, &config))
}

pub fn split_text(text: &str, config: &ChunkingConfig) -> Vec<TextChunk> {
    let spans = token_spans(text);
    let total = spans.len();
    let mut chunks = Vec::new();
    if total == 0 {
        return chunks;
    }

    let window = (config.chunk_size * config.boundary_window_percent / 100).max(1);
    let mut start = 0;

    loop {
        let hard_end = (start + config.chunk_size).min(total);
        let end = if hard_end == total {
            total
        } else {
            let lowest = (start + config.overlap + 1).max(hard_end.saturating_sub(window));
            find_break(text, &spans, lowest, hard_end).unwrap_or(hard_end)
        };

        chunks.push(TextChunk {
            position: chunks.len(),
            text: text[spans[start].0..spans[end - 1].1].to_string(),
            start_word: start,
            end_word: end,
        });

        if end == total {
            break;
        }
        start = end - config.overlap;
    }

    chunks
}

fn token_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut current: Option<usize> = None;

    for (offset, character) in text.char_indices() {
        if character.is_whitespace() {
            if let Some(begin) = current.take() {
                push_word(&mut spans, begin, &text[begin..offset]);
            }
        } else if current.is_none() {
            current = Some(offset);
        }
    }

    if let Some(begin) = current {
        push_word(&mut spans, begin, &text[begin..]);
    }

    spans
}

fn push_word(spans: &mut Vec<(usize, usize)>, begin: usize, word: &str) {
    if word.chars().any(is_unspaced_script) {
        for (offset, segment) in word.split_word_bound_indices() {
            push_capped(spans, begin + offset, segment);
        }
    } else {
        push_capped(spans, begin, word);
    }
}

fn push_capped(spans: &mut Vec<(usize, usize)>, begin: usize, piece: &str) {
    let mut start = begin;
    let mut count = 0;
    for (offset, _) in piece.char_indices() {
        if count == MAX_TOKEN_CHARS {
            spans.push((start, begin + offset));
            start = begin + offset;
            count = 0;
        }
        count += 1;
    }
    if count > 0 {
        spans.push((start, begin + piece.len()));
    }
}

/// Thai, Lao, Myanmar, Khmer, CJK punctuation, kana, ideographs and fullwidth forms.
fn is_unspaced_script(character: char) -> bool {
    matches!(
        u32::from(character),
        0x0E00..=0x0EFF
            | 0x1000..=0x109F
            | 0x1780..=0x17FF
            | 0x3000..=0x30FF
            | 0x3400..=0x4DBF
            | 0x4E00..=0x9FFF
            | 0xF900..=0xFAFF
            | 0xFF00..=0xFFEF
            | 0x20000..=0x2FA1F
    )
}

/// Latest chunk end in `lowest..=highest` that falls on a paragraph break, else on a sentence end.
fn find_break(text: &str, spans: &[(usize, usize)], lowest: usize, highest: usize) -> Option<usize> {
    let candidates = || (lowest..=highest).rev().filter(|end| *end > 0 && *end < spans.len());

    let paragraph = candidates().find(|end| {
        let gap = &text[spans[end - 1].1..spans[*end].0];
        gap.matches('\n').count() >= 2
    });
    if paragraph.is_some() {
        return paragraph;
    }

    candidates().find(|end| {
        let word = &text[spans[end - 1].0..spans[end - 1].1];
        word.ends_with(['.', '!', '?', ';', '。', '！', '？', '；'])
    })
}
