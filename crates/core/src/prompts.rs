//! Prompt templates. Each builder returns the finished user message for one generation call.

use crate::models::ReportSection;

/// Characters of the report summary carried into the chat system prompt.
const SYSTEM_SUMMARY_CHARS: usize = 1_000;

pub const ANALYST_SYSTEM: &str = "You are a careful reader of academic papers. Report only what the \
paper states; when something is not covered, say so instead of guessing.";

pub fn structure_analysis(title: &str, content: &str) -> String {
    format!(
        "Analyze the structure of the paper \"{title}\".\n\
         List its main sections in order and, for each, one sentence on what it covers. \
         Then name the research problem, the approach and the kind of evaluation used.\n\n\
         Paper content:\n{content}"
    )
}

pub fn detailed_report(title: &str, structure: &str, content: &str) -> String {
    let headings = ReportSection::ALL
        .iter()
        .map(|section| format!("## {}", section.heading()))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Write a detailed analysis of the paper \"{title}\".\n\
         Use exactly these markdown headings, in this order:\n{headings}\n\n\
         Leave a heading's body as \"Not covered in the paper.\" when the paper says nothing about it.\n\n\
         Structural overview from a previous pass:\n{structure}\n\n\
         Paper content:\n{content}"
    )
}

pub fn keyword_extraction(content: &str) -> String {
    format!(
        "Extract 5 to 10 technical keywords or key phrases from the paper below. \
         Answer with a single comma-separated line and nothing else.\n\n\
         Paper content:\n{content}"
    )
}

pub fn chat_system(title: &str, summary: &str) -> String {
    let title = if title.trim().is_empty() {
        "Unknown title"
    } else {
        title
    };
    let summary = if summary.trim().is_empty() {
        "No summary available.".to_string()
    } else {
        summary.chars().take(SYSTEM_SUMMARY_CHARS).collect()
    };

    format!(
        "You answer questions about the academic paper \"{title}\".\n\
         Paper summary:\n{summary}\n\n\
         Ground every answer in the provided passages. Cite passages as [Passage N]. \
         If the passages do not contain the answer, say that the paper does not appear to cover it."
    )
}

pub fn question_with_context(context: &str, question: &str) -> String {
    format!(
        "Passages retrieved from the paper:\n{context}\n\n\
         Question: {question}\n\n\
         Answer using the passages above."
    )
}

pub fn question_without_evidence(question: &str) -> String {
    format!(
        "No passages of the paper matched this question, so there is no supporting evidence.\n\
         Question: {question}\n\n\
         Say that no supporting evidence was found in the paper, then give whatever general \
         guidance you can, clearly marked as not coming from the paper."
    )
}

pub const SUGGESTED_QUESTIONS: [&str; 6] = [
    "What research problem does this paper address?",
    "What method does the paper use to solve it?",
    "What do the experiments show?",
    "What are the main contributions?",
    "What limitations does the paper have?",
    "Which future research directions do the authors propose?",
];
