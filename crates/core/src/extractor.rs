use crate::error::PipelineError;
use crate::models::DocumentFormat;
use lopdf::{Document, Object};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::io::{Cursor, Read};

/// Decompressed size limit for `word/document.xml`, guards against zip bombs.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

/// Raw output of a format backend, before section detection.
#[derive(Debug, Clone, Default)]
pub struct ExtractedText {
    pub pages: Vec<PageText>,
    pub page_count: u32,
    pub metadata_title: Option<String>,
    /// Lines the source format itself marks as headings (DOCX styles, markdown `#`).
    pub heading_hints: Vec<String>,
}

impl ExtractedText {
    pub fn full_text(&self) -> String {
        self.pages
            .iter()
            .map(|page| page.text.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

pub trait TextExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8]) -> Result<ExtractedText, PipelineError>;
}

pub fn extractor_for(format: DocumentFormat) -> Box<dyn TextExtractor> {
    match format {
        DocumentFormat::Pdf => Box::new(LopdfExtractor),
        DocumentFormat::Docx => Box::new(DocxExtractor),
        DocumentFormat::Text => Box::new(PlainTextExtractor { markdown: false }),
        DocumentFormat::Markdown => Box::new(PlainTextExtractor { markdown: true }),
    }
}

#[derive(Default)]
pub struct LopdfExtractor;

impl TextExtractor for LopdfExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<ExtractedText, PipelineError> {
        let document =
            Document::load_mem(bytes).map_err(|error| PipelineError::Parse(error.to_string()))?;

        let page_numbers: Vec<u32> = document.get_pages().keys().copied().collect();
        let mut pages = Vec::new();
        for page_no in &page_numbers {
            let text = document
                .extract_text(&[*page_no])
                .map_err(|error| PipelineError::Parse(error.to_string()))?;

            if !text.trim().is_empty() {
                pages.push(PageText {
                    number: *page_no,
                    text,
                });
            }
        }

        Ok(ExtractedText {
            pages,
            page_count: page_numbers.len() as u32,
            metadata_title: pdf_info_title(&document),
            heading_hints: Vec::new(),
        })
    }
}

fn pdf_info_title(document: &Document) -> Option<String> {
    let info = match document.trailer.get(b"Info").ok()? {
        Object::Reference(id) => document.get_dictionary(*id).ok()?,
        Object::Dictionary(dictionary) => dictionary,
        _ => return None,
    };
    let raw = info.get(b"Title").ok()?.as_str().ok()?;
    let title = decode_pdf_string(raw);
    let title = title.trim();
    (!title.is_empty()).then(|| title.to_string())
}

fn decode_pdf_string(raw: &[u8]) -> String {
    if let Some(utf16) = raw.strip_prefix(&[0xFE, 0xFF]) {
        let units = utf16
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]));
        return char::decode_utf16(units)
            .map(|unit| unit.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect();
    }
    String::from_utf8_lossy(raw).into_owned()
}

#[derive(Default)]
pub struct DocxExtractor;

impl TextExtractor for DocxExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<ExtractedText, PipelineError> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
            .map_err(|error| PipelineError::Parse(error.to_string()))?;
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|error| PipelineError::Parse(format!("word/document.xml: {error}")))?;

        let mut xml = Vec::new();
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut xml)
            .map_err(|error| PipelineError::Parse(format!("word/document.xml: {error}")))?;
        if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(PipelineError::Parse(
                "word/document.xml exceeds size limit".to_string(),
            ));
        }

        parse_document_xml(&xml)
    }
}

fn attribute_value(element: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attribute| attribute.key.local_name().as_ref() == key)
        .and_then(|attribute| attribute.unescape_value().ok().map(|value| value.into_owned()))
}

fn is_heading_style(style: &str) -> bool {
    let lowered = style.to_ascii_lowercase();
    lowered.starts_with("heading") || lowered == "title"
}

fn parse_document_xml(xml: &[u8]) -> Result<ExtractedText, PipelineError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut pages: Vec<Vec<String>> = vec![Vec::new()];
    let mut heading_hints = Vec::new();
    let mut paragraph = String::new();
    let mut style: Option<String> = None;
    let mut in_text = false;
    let mut page_break_pending = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(element)) => match element.local_name().as_ref() {
                b"p" => {
                    paragraph.clear();
                    style = None;
                }
                b"t" => in_text = true,
                b"pStyle" => style = attribute_value(&element, b"val"),
                _ => {}
            },
            Ok(Event::Empty(element)) => match element.local_name().as_ref() {
                b"pStyle" => style = attribute_value(&element, b"val"),
                b"br" if attribute_value(&element, b"type").as_deref() == Some("page") => {
                    page_break_pending = true;
                }
                b"tab" => paragraph.push(' '),
                _ => {}
            },
            Ok(Event::Text(text)) if in_text => {
                let unescaped = text
                    .unescape()
                    .map_err(|error| PipelineError::Parse(error.to_string()))?;
                paragraph.push_str(&unescaped);
            }
            Ok(Event::End(element)) => match element.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let text = paragraph.trim().to_string();
                    if !text.is_empty() {
                        if style.as_deref().is_some_and(is_heading_style) {
                            heading_hints.push(text.clone());
                        }
                        if let Some(current) = pages.last_mut() {
                            current.push(text);
                        }
                    }
                    if page_break_pending {
                        pages.push(Vec::new());
                        page_break_pending = false;
                    }
                    paragraph.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(error) => return Err(PipelineError::Parse(error.to_string())),
            _ => {}
        }
        buf.clear();
    }

    let page_count = pages.len() as u32;
    let pages = pages
        .into_iter()
        .enumerate()
        .filter(|(_, paragraphs)| !paragraphs.is_empty())
        .map(|(index, paragraphs)| PageText {
            number: index as u32 + 1,
            text: paragraphs.join("\n\n"),
        })
        .collect();

    Ok(ExtractedText {
        pages,
        page_count,
        metadata_title: None,
        heading_hints,
    })
}

/// UTF-8 text; a form feed separates pages.
pub struct PlainTextExtractor {
    pub markdown: bool,
}

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<ExtractedText, PipelineError> {
        let raw = String::from_utf8_lossy(bytes);
        let raw = raw.strip_prefix('\u{feff}').unwrap_or(&raw);
        let split: Vec<&str> = raw.split('\u{000c}').collect();

        let pages = split
            .iter()
            .enumerate()
            .filter_map(|(index, chunk)| {
                let normalized = chunk.trim().to_string();
                if normalized.is_empty() {
                    None
                } else {
                    Some(PageText {
                        number: (index + 1) as u32,
                        text: normalized,
                    })
                }
            })
            .collect::<Vec<_>>();

        let heading_hints = if self.markdown {
            raw.lines()
                .filter_map(|line| {
                    let trimmed = line.trim_start();
                    trimmed
                        .starts_with('#')
                        .then(|| trimmed.trim_start_matches('#').trim().to_string())
                })
                .filter(|heading| !heading.is_empty())
                .collect()
        } else {
            Vec::new()
        };

        Ok(ExtractedText {
            page_count: split.len() as u32,
            pages,
            metadata_title: None,
            heading_hints,
        })
    }
}
