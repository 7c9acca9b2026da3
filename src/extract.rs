use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::review::{ReviewResult, strip_markdown_fences};
use crate::scan::balanced_objects;
use crate::stream::{ContentBlock, StreamEvent, parse_line};

pub const RESULT_OPEN_TAG: &str = "<review_result>";
pub const RESULT_CLOSE_TAG: &str = "</review_result>";

const PREVIEW_CHARS: usize = 500;

static TAGGED_RESULT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<review_result>(.*?)</review_result>").unwrap());

/// Extract the structured review from everything the subprocess printed.
///
/// Tries, in order: wrapper tags in the reassembled text, wrapper tags in the
/// raw output, bare JSON in the reassembled text, bare JSON on each raw line.
/// The first candidate with a numeric score wins.
pub fn extract(raw_output: &str) -> ReviewResult {
    let text = reassemble_text(raw_output);

    if let Some(result) = from_tagged(&text) {
        debug!(stage = "tagged_text", score = result.score, "extracted review result");
        return result;
    }
    if let Some(result) = from_tagged(raw_output) {
        debug!(stage = "tagged_raw", score = result.score, "extracted review result");
        return result;
    }
    if text.contains("\"score\"")
        && let Some(result) = from_bare_json(&text)
    {
        debug!(stage = "bare_text", score = result.score, "extracted review result");
        return result;
    }
    if let Some(result) = raw_output.lines().find_map(from_bare_json) {
        debug!(stage = "bare_line", score = result.score, "extracted review result");
        return result;
    }

    warn!(
        raw_len = raw_output.len(),
        raw_preview = %preview(raw_output),
        text_preview = %preview(&text),
        "could not parse review result from output"
    );
    ReviewResult::unparseable()
}

/// Concatenate assistant text blocks and the final result payload, in stream
/// order, from every line that decodes as JSON. Fragments are joined as-is so
/// a result split across events stays intact.
pub fn reassemble_text(raw_output: &str) -> String {
    let mut text = String::new();
    for event in raw_output.lines().filter_map(parse_line) {
        match event {
            StreamEvent::Assistant(blocks) => {
                for block in blocks {
                    if let ContentBlock::Text(fragment) = block {
                        text.push_str(&fragment);
                    }
                }
            }
            StreamEvent::Result {
                result: Some(result),
                ..
            } => text.push_str(&result),
            _ => {}
        }
    }
    text
}

fn from_tagged(text: &str) -> Option<ReviewResult> {
    TAGGED_RESULT
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .find_map(|inner| parse_payload(inner.as_str()))
}

fn parse_payload(inner: &str) -> Option<ReviewResult> {
    let body = strip_markdown_fences(inner);
    if let Some(result) = parse_object(body) {
        return Some(result);
    }

    // Tags found in raw NDJSON sit inside a JSON string, so the payload is
    // still escaped (`\"`, `\n`).
    if let Ok(unescaped) = serde_json::from_str::<String>(&format!("\"{body}\""))
        && let Some(result) = parse_object(strip_markdown_fences(&unescaped))
            .or_else(|| from_bare_json(&unescaped))
    {
        return Some(result);
    }

    from_bare_json(body)
}

fn parse_object(candidate: &str) -> Option<ReviewResult> {
    let value: Value = serde_json::from_str(candidate).ok()?;
    ReviewResult::from_value(&value)
}

/// First balanced object mentioning `"score"` that carries a numeric score.
fn from_bare_json(text: &str) -> Option<ReviewResult> {
    balanced_objects(text)
        .filter(|candidate| candidate.contains("\"score\""))
        .find_map(parse_object)
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(PREVIEW_CHARS).collect();
    if text.chars().count() > PREVIEW_CHARS {
        out.push_str("...");
    }
    out
}
